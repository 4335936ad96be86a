//! Bounded cache of open file descriptors.
//!
//! Keyed by (path, flags-without-create) with a per-entry refcount. The
//! cap is soft: eviction runs after each release and skips descriptors
//! still referenced, so a burst of concurrent handles can exceed it
//! temporarily. Close errors die with the dropped descriptor and are not
//! propagated to releasers.

use crate::flags::OpenFlags;
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Clone, Copy, Debug)]
pub struct FdCacheConfig {
    pub max_open_files: usize,
    /// Adds O_DSYNC to writable descriptors at open.
    pub sync_on_write: bool,
}

impl Default for FdCacheConfig {
    fn default() -> Self {
        FdCacheConfig {
            max_open_files: 128,
            sync_on_write: false,
        }
    }
}

type Key = (PathBuf, OpenFlags);

struct Entry {
    file: Arc<File>,
    refcount: u32,
}

struct CacheState {
    entries: HashMap<Key, Entry>,
    // Front = most recently used.
    lru: VecDeque<Key>,
}

pub struct FdCache {
    config: FdCacheConfig,
    state: Mutex<CacheState>,
}

/// Refcounted descriptor lease; dropping it releases the cache slot.
pub struct FdGuard {
    cache: Arc<FdCache>,
    key: Key,
    file: Arc<File>,
}

impl std::fmt::Debug for FdGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdGuard").field("key", &self.key).finish()
    }
}

impl FdGuard {
    pub fn file(&self) -> &File {
        &self.file
    }
}

impl Drop for FdGuard {
    fn drop(&mut self) {
        self.cache.release(&self.key);
    }
}

impl FdCache {
    pub fn new(config: FdCacheConfig) -> Arc<Self> {
        Arc::new(FdCache {
            config,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                lru: VecDeque::new(),
            }),
        })
    }

    /// Returns a leased descriptor for (path, flags). A hit touches the
    /// LRU and bumps the refcount; a miss opens the file with the
    /// computed flags.
    pub fn acquire(
        self: &Arc<Self>,
        path: &Path,
        flags: OpenFlags,
        create_if_missing: bool,
        mode: u32,
    ) -> std::io::Result<FdGuard> {
        let key = (path.to_path_buf(), flags.without_create());

        {
            let mut state = self.state.lock().expect("fd cache poisoned");
            if let Some(entry) = state.entries.get_mut(&key) {
                entry.refcount += 1;
                let file = entry.file.clone();
                Self::touch(&mut state.lru, &key);
                return Ok(FdGuard {
                    cache: self.clone(),
                    key,
                    file,
                });
            }
        }

        // Open outside the lock; a racing acquire for the same key may
        // open twice, the loser's descriptor just lives one lease.
        let file = Arc::new(self.open(path, flags, create_if_missing, mode)?);

        let mut state = self.state.lock().expect("fd cache poisoned");
        let entry = state.entries.entry(key.clone()).or_insert_with(|| Entry {
            file: file.clone(),
            refcount: 0,
        });
        entry.refcount += 1;
        let file = entry.file.clone();
        Self::touch(&mut state.lru, &key);
        Ok(FdGuard {
            cache: self.clone(),
            key,
            file,
        })
    }

    fn open(
        &self,
        path: &Path,
        flags: OpenFlags,
        create_if_missing: bool,
        mode: u32,
    ) -> std::io::Result<File> {
        let mut effective = flags;
        if self.config.sync_on_write && flags.is_writable() {
            effective = effective.union(OpenFlags::DSYNC);
        }
        let custom = effective.bits()
            & !(libc::O_RDONLY | libc::O_WRONLY | libc::O_RDWR | libc::O_CREAT);
        std::fs::OpenOptions::new()
            .read(effective.is_readable())
            .write(effective.is_writable())
            .create(create_if_missing)
            .custom_flags(custom)
            .mode(mode)
            .open(path)
    }

    fn release(&self, key: &Key) {
        let mut state = self.state.lock().expect("fd cache poisoned");
        if let Some(entry) = state.entries.get_mut(key) {
            entry.refcount = entry.refcount.saturating_sub(1);
        }
        self.evict_locked(&mut state);
    }

    /// Drops idle descriptors from the cold end until the cap holds or
    /// only referenced entries remain (soft cap).
    fn evict_locked(&self, state: &mut CacheState) {
        let mut skipped: Vec<Key> = Vec::new();
        while state.entries.len() > self.config.max_open_files {
            let Some(key) = state.lru.pop_back() else {
                break;
            };
            match state.entries.get(&key) {
                Some(entry) if entry.refcount == 0 => {
                    debug!(path = %key.0.display(), "evicting idle descriptor");
                    state.entries.remove(&key);
                }
                Some(_) => skipped.push(key),
                None => {}
            }
        }
        // Referenced entries go back where they were, coldest last.
        for key in skipped.into_iter().rev() {
            state.lru.push_back(key);
        }
    }

    fn touch(lru: &mut VecDeque<Key>, key: &Key) {
        if let Some(pos) = lru.iter().position(|k| k == key) {
            lru.remove(pos);
        }
        lru.push_front(key.clone());
    }

    /// Open descriptors currently cached.
    pub fn open_count(&self) -> usize {
        self.state.lock().expect("fd cache poisoned").entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max: usize) -> Arc<FdCache> {
        FdCache::new(FdCacheConfig {
            max_open_files: max,
            sync_on_write: false,
        })
    }

    fn touch_file(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"x").unwrap();
        path
    }

    #[test]
    fn hit_shares_the_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = touch_file(dir.path(), "f");
        let cache = cache(8);

        let a = cache.acquire(&path, OpenFlags::RDONLY, false, 0o644).unwrap();
        let b = cache.acquire(&path, OpenFlags::RDONLY, false, 0o644).unwrap();
        assert_eq!(cache.open_count(), 1);
        drop(a);
        drop(b);
    }

    #[test]
    fn create_flag_does_not_split_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("new_file");
        let cache = cache(8);

        let creat = OpenFlags::WRONLY.union(OpenFlags::CREAT);
        let a = cache.acquire(&path, creat, true, 0o644).unwrap();
        let b = cache.acquire(&path, OpenFlags::WRONLY, false, 0o644).unwrap();
        assert_eq!(cache.open_count(), 1);
        drop(a);
        drop(b);
    }

    #[test]
    fn eviction_respects_refcounts() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(2);

        let paths: Vec<_> = (0..4)
            .map(|i| touch_file(dir.path(), &format!("f{i}")))
            .collect();

        // Hold all four: the cap is softly violated.
        let guards: Vec<_> = paths
            .iter()
            .map(|p| cache.acquire(p, OpenFlags::RDONLY, false, 0o644).unwrap())
            .collect();
        assert_eq!(cache.open_count(), 4);

        // Releasing shrinks back to the cap.
        drop(guards);
        assert!(cache.open_count() <= 2);
    }

    #[test]
    fn released_entries_can_be_rehit() {
        let dir = tempfile::tempdir().unwrap();
        let path = touch_file(dir.path(), "f");
        let cache = cache(4);

        drop(cache.acquire(&path, OpenFlags::RDONLY, false, 0o644).unwrap());
        // Still cached (under cap), so this is a hit.
        let again = cache.acquire(&path, OpenFlags::RDONLY, false, 0o644).unwrap();
        assert_eq!(cache.open_count(), 1);
        drop(again);
    }

    #[test]
    fn missing_file_without_create_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(4);
        let err = cache
            .acquire(&dir.path().join("ghost"), OpenFlags::RDONLY, false, 0o644)
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
