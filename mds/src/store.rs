//! Slotted inode file: one 512-byte slot per inode number.

use crate::error::MdsError;
use common::inode::{Inode, SLOT_BYTES};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Fixed-slot inode file. All access goes through one store-wide mutex;
/// positioned reads and writes never move a shared cursor.
pub struct InodeStore {
    file: Mutex<File>,
    path: PathBuf,
}

impl InodeStore {
    pub fn open(path: impl AsRef<Path>, create_new: bool) -> Result<Self, MdsError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(create_new)
            .open(&path)?;
        Ok(InodeStore {
            file: Mutex::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads and decodes the slot at `ino`. A slot beyond the end of the
    /// file is a short read, not silent zeros.
    pub fn read(&self, ino: u64) -> Result<Inode, MdsError> {
        let mut slot = vec![0u8; SLOT_BYTES];
        {
            let file = self.file.lock().expect("inode store lock poisoned");
            let offset = ino * SLOT_BYTES as u64;
            match file.read_exact_at(&mut slot, offset) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(MdsError::ShortRead(ino));
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(Inode::decode_slot(&slot)?)
    }

    /// Serializes `inode`, zero-pads to one slot and writes it in place.
    pub fn write(&self, ino: u64, inode: &Inode) -> Result<(), MdsError> {
        let slot = inode.encode_slot()?;
        let file = self.file.lock().expect("inode store lock poisoned");
        file.write_all_at(&slot, ino * SLOT_BYTES as u64)?;
        Ok(())
    }

    /// Grows the backing file to hold at least `new_slots` slots.
    pub fn expand(&self, new_slots: u64) -> Result<(), MdsError> {
        let file = self.file.lock().expect("inode store lock poisoned");
        let want = new_slots * SLOT_BYTES as u64;
        if file.metadata()?.len() < want {
            file.set_len(want)?;
        }
        Ok(())
    }

    /// Current capacity in slots.
    pub fn len_slots(&self) -> Result<u64, MdsError> {
        let file = self.file.lock().expect("inode store lock poisoned");
        Ok(file.metadata()?.len() / SLOT_BYTES as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::inode::FileKind;

    fn store() -> (tempfile::TempDir, InodeStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = InodeStore::open(dir.path().join("inodes.dat"), true).unwrap();
        (dir, store)
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_dir, store) = store();
        store.expand(8).unwrap();

        let mut ino = Inode {
            ino: 5,
            kind: FileKind::Regular,
            ..Inode::default()
        };
        ino.set_filename("/a/b").unwrap();
        store.write(5, &ino).unwrap();

        let got = store.read(5).unwrap();
        assert_eq!(got, ino);
    }

    #[test]
    fn reading_past_end_is_a_short_read() {
        let (_dir, store) = store();
        store.expand(2).unwrap();
        assert!(matches!(store.read(9), Err(MdsError::ShortRead(9))));
    }

    #[test]
    fn expand_never_shrinks() {
        let (_dir, store) = store();
        store.expand(16).unwrap();
        store.expand(4).unwrap();
        assert_eq!(store.len_slots().unwrap(), 16);
    }
}
