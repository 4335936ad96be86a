//! Per-directory reader/writer locks with deadlock-free multi-acquisition.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Scoped lock on one directory inode; releases on drop.
pub enum DirLockGuard {
    Shared(OwnedRwLockReadGuard<()>),
    Exclusive(OwnedRwLockWriteGuard<()>),
}

#[derive(Default)]
pub struct DirLockTable {
    locks: Mutex<HashMap<u64, Arc<RwLock<()>>>>,
}

impl DirLockTable {
    fn handle(&self, ino: u64) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().expect("dir lock table poisoned");
        locks.entry(ino).or_default().clone()
    }

    pub async fn lock(&self, ino: u64, mode: LockMode) -> DirLockGuard {
        let lock = self.handle(ino);
        match mode {
            LockMode::Shared => DirLockGuard::Shared(lock.read_owned().await),
            LockMode::Exclusive => DirLockGuard::Exclusive(lock.write_owned().await),
        }
    }

    /// Acquires several directory locks without deadlocking: requests are
    /// sorted by inode ascending, duplicates collapse to one lock and
    /// escalate to Exclusive if any request for that inode was Exclusive.
    /// Compound namespace operations (rmdir takes parent and target) must
    /// go through here.
    pub async fn lock_many(&self, requests: &[(u64, LockMode)]) -> Vec<DirLockGuard> {
        let mut ordered: Vec<(u64, LockMode)> = requests.to_vec();
        ordered.sort_by_key(|(ino, mode)| (*ino, *mode));
        ordered.dedup_by(|next, kept| {
            if next.0 == kept.0 {
                if next.1 == LockMode::Exclusive {
                    kept.1 = LockMode::Exclusive;
                }
                true
            } else {
                false
            }
        });

        let mut guards = Vec::with_capacity(ordered.len());
        for (ino, mode) in ordered {
            guards.push(self.lock(ino, mode).await);
        }
        guards
    }
}
