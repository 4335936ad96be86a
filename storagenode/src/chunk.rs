//! Chunk service: request validation, manifest resolution and the hop
//! into positioned I/O.

use crate::flags::OpenFlags;
use crate::io_engine::{IoEngine, IoOptions};
use crate::manifest::ManifestLog;
use common::{Status, StatusCode};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

pub struct ChunkService {
    manifest: Arc<ManifestLog>,
    io: IoEngine,
}

impl ChunkService {
    pub fn new(manifest: Arc<ManifestLog>, options: IoOptions) -> Self {
        ChunkService {
            manifest,
            io: IoEngine::new(options),
        }
    }

    pub fn manifest(&self) -> &Arc<ManifestLog> {
        &self.manifest
    }

    fn io_status(errno: i32, fallback: &str) -> Status {
        if errno != 0 {
            Status::from_errno(errno, "")
        } else {
            Status::error(StatusCode::IoError, fallback)
        }
    }

    /// Validates the payload checksum, binds the chunk path (allocating
    /// on first write) and writes at the requested offset.
    pub fn write(
        &self,
        chunk_id: u64,
        offset: u64,
        data: &[u8],
        checksum: u32,
        flags: i32,
        mode: u32,
    ) -> (Status, u64) {
        if checksum != 0 && crc32c::crc32c(data) != checksum {
            return (
                Status::error(StatusCode::InvalidArgument, "payload checksum mismatch"),
                0,
            );
        }
        let path = match self.manifest.alloc(chunk_id) {
            Ok(path) => path,
            Err(err) => return (Status::from(err), 0),
        };
        let flags = Self::normalize_write_flags(flags);
        let mode = if mode == 0 { 0o644 } else { mode };
        let res = self.io.write(&path, flags, mode, offset, data);
        if !res.is_ok() {
            return (Self::io_status(res.errno, "write failed"), 0);
        }
        debug!(chunk_id, offset, bytes = data.len(), "chunk write");
        (Status::ok(), res.bytes as u64)
    }

    /// Reads at the requested offset. The reply checksum is CRC32C of
    /// the returned payload.
    pub fn read(
        &self,
        chunk_id: u64,
        offset: u64,
        length: u64,
        flags: i32,
    ) -> (Status, Vec<u8>, u32) {
        let Some(path) = self.manifest.get(chunk_id) else {
            return (
                Status::error(StatusCode::NodeNotFound, format!("unknown chunk {chunk_id}")),
                Vec::new(),
                0,
            );
        };
        let flags = OpenFlags(flags).normalize_for_read();
        let (res, data) = self.io.read(&path, flags, offset, length);
        if !res.is_ok() {
            return (Self::io_status(res.errno, "read failed"), Vec::new(), 0);
        }
        let checksum = crc32c::crc32c(&data);
        (Status::ok(), data, checksum)
    }

    /// Sets the chunk file length, creating the chunk if it never saw a
    /// write.
    pub fn truncate(&self, chunk_id: u64, size: u64) -> Status {
        let path = match self.manifest.alloc(chunk_id) {
            Ok(path) => path,
            Err(err) => return Status::from(err),
        };
        let flags = OpenFlags::write_default();
        let res = self.io.truncate(&path, flags, 0o644, size);
        if !res.is_ok() {
            return Self::io_status(res.errno, "truncate failed");
        }
        Status::ok()
    }

    /// Explicit chunk removal: unbind the manifest entry and delete the
    /// data file (best effort).
    pub fn unlink(&self, chunk_id: u64) -> Status {
        let path = self.manifest.get(chunk_id);
        if let Err(err) = self.manifest.delete(chunk_id) {
            return Status::from(err);
        }
        if let Some(path) = path {
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    debug!(chunk_id, "chunk data removal failed: {err}");
                }
            }
        }
        Status::ok()
    }

    fn normalize_write_flags(raw: i32) -> OpenFlags {
        if raw == 0 {
            OpenFlags::write_default()
        } else {
            // The chunk file is created lazily on first write, so CREAT
            // is always in effect.
            OpenFlags(raw).union(OpenFlags::CREAT)
        }
    }

    pub fn chunk_path(&self, chunk_id: u64) -> Option<PathBuf> {
        self.manifest.get(chunk_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(dir: &std::path::Path) -> ChunkService {
        let manifest = Arc::new(ManifestLog::open(vec![dir.to_path_buf()], None).unwrap());
        ChunkService::new(manifest, IoOptions::default())
    }

    #[test]
    fn write_read_round_trip_with_checksums() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());

        let payload = b"the quick brown fox";
        let (st, written) = svc.write(42, 0, payload, crc32c::crc32c(payload), 0, 0o644);
        assert!(st.is_ok());
        assert_eq!(written, payload.len() as u64);

        let (st, data, checksum) = svc.read(42, 0, payload.len() as u64, 0);
        assert!(st.is_ok());
        assert_eq!(data, payload);
        assert_eq!(checksum, crc32c::crc32c(payload));
    }

    #[test]
    fn checksum_mismatch_is_rejected_before_io() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());

        let (st, written) = svc.write(7, 0, b"data", 0xDEAD_BEEF, 0, 0o644);
        assert_eq!(st.code, StatusCode::InvalidArgument);
        assert_eq!(st.message, "payload checksum mismatch");
        assert_eq!(written, 0);
        // Nothing was bound or written.
        assert!(svc.chunk_path(7).is_none());
    }

    #[test]
    fn zero_checksum_skips_validation() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let (st, _) = svc.write(8, 0, b"unverified", 0, 0, 0o644);
        assert!(st.is_ok());
    }

    #[test]
    fn read_of_unbound_chunk_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let (st, data, _) = svc.read(999, 0, 16, 0);
        assert_eq!(st.code, StatusCode::NodeNotFound);
        assert!(data.is_empty());
    }

    #[test]
    fn truncate_creates_and_resizes() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());

        assert!(svc.truncate(5, 1024).is_ok());
        let path = svc.chunk_path(5).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1024);

        assert!(svc.truncate(5, 10).is_ok());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 10);
    }

    #[test]
    fn unlink_removes_binding_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        svc.write(3, 0, b"x", 0, 0, 0o644);
        let path = svc.chunk_path(3).unwrap();
        assert!(path.exists());

        assert!(svc.unlink(3).is_ok());
        assert!(svc.chunk_path(3).is_none());
        assert!(!path.exists());
    }

    #[test]
    fn concurrent_writes_at_disjoint_offsets_do_not_tear() {
        let dir = tempfile::tempdir().unwrap();
        let svc = Arc::new(service(dir.path()));
        svc.truncate(1, 0);

        let mut handles = Vec::new();
        for i in 0..8u64 {
            let svc = svc.clone();
            handles.push(std::thread::spawn(move || {
                let block = vec![i as u8 + 1; 4096];
                let (st, _) = svc.write(1, i * 4096, &block, 0, 0, 0o644);
                assert!(st.is_ok());
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        for i in 0..8u64 {
            let (st, data, _) = svc.read(1, i * 4096, 4096, 0);
            assert!(st.is_ok());
            assert!(data.iter().all(|&b| b == i as u8 + 1));
        }
    }
}
