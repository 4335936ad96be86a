//! Positioned chunk I/O over cached descriptors.

use crate::fd_cache::{FdCache, FdCacheConfig};
use crate::flags::OpenFlags;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

#[derive(Clone, Copy, Debug)]
pub struct IoOptions {
    pub max_open_files: usize,
    /// fsync after every write.
    pub sync_on_write: bool,
}

impl Default for IoOptions {
    fn default() -> Self {
        IoOptions {
            max_open_files: 128,
            sync_on_write: false,
        }
    }
}

/// errno-style result: `bytes < 0` means failure, `errno` says why.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoResult {
    pub bytes: i64,
    pub errno: i32,
}

impl IoResult {
    fn ok(bytes: u64) -> Self {
        IoResult {
            bytes: bytes as i64,
            errno: 0,
        }
    }

    fn err(err: &std::io::Error) -> Self {
        IoResult {
            bytes: -1,
            errno: err.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.bytes >= 0 && self.errno == 0
    }
}

pub struct IoEngine {
    options: IoOptions,
    fds: Arc<FdCache>,
}

impl IoEngine {
    pub fn new(options: IoOptions) -> Self {
        IoEngine {
            fds: FdCache::new(FdCacheConfig {
                max_open_files: options.max_open_files,
                sync_on_write: options.sync_on_write,
            }),
            options,
        }
    }

    pub fn fd_cache(&self) -> &Arc<FdCache> {
        &self.fds
    }

    /// pwrite at `offset`; fsyncs when configured.
    pub fn write(
        &self,
        path: &Path,
        flags: OpenFlags,
        mode: u32,
        offset: u64,
        data: &[u8],
    ) -> IoResult {
        let create = flags.contains(OpenFlags::CREAT);
        let guard = match self.fds.acquire(path, flags, create, mode) {
            Ok(guard) => guard,
            Err(err) => return IoResult::err(&err),
        };
        if let Err(err) = guard.file().write_all_at(data, offset) {
            return IoResult::err(&err);
        }
        if self.options.sync_on_write {
            if let Err(err) = guard.file().sync_data() {
                return IoResult::err(&err);
            }
        }
        IoResult::ok(data.len() as u64)
    }

    /// pread at `offset`; short reads at EOF shrink the buffer.
    pub fn read(&self, path: &Path, flags: OpenFlags, offset: u64, length: u64) -> (IoResult, Vec<u8>) {
        let guard = match self.fds.acquire(path, flags, false, 0o644) {
            Ok(guard) => guard,
            Err(err) => return (IoResult::err(&err), Vec::new()),
        };
        let mut buf = vec![0u8; length as usize];
        let mut filled = 0usize;
        while filled < buf.len() {
            match guard.file().read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return (IoResult::err(&err), Vec::new()),
            }
        }
        buf.truncate(filled);
        (IoResult::ok(filled as u64), buf)
    }

    /// ftruncate to `size`.
    pub fn truncate(&self, path: &Path, flags: OpenFlags, mode: u32, size: u64) -> IoResult {
        let create = flags.contains(OpenFlags::CREAT);
        let guard = match self.fds.acquire(path, flags, create, mode) {
            Ok(guard) => guard,
            Err(err) => return IoResult::err(&err),
        };
        match guard.file().set_len(size) {
            Ok(()) => IoResult::ok(0),
            Err(err) => IoResult::err(&err),
        }
    }
}
