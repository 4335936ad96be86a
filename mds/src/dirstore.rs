//! On-disk directory pages: one entry file per directory inode.
//!
//! Records are `name_len u8, name, child_ino u64 le, kind u8` in insertion
//! order. Callers serialize mutations through the directory lock table;
//! this layer only guarantees each operation is individually consistent.

use crate::error::MdsError;
use common::inode::{FileKind, NAME_MAX};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub ino: u64,
    pub kind: FileKind,
}

impl DirEntry {
    pub fn new(name: impl Into<String>, ino: u64, kind: FileKind) -> Self {
        DirEntry {
            name: name.into(),
            ino,
            kind,
        }
    }
}

pub struct DirStore {
    base: PathBuf,
}

impl DirStore {
    pub fn open(base: impl AsRef<Path>) -> Result<Self, MdsError> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base)?;
        Ok(DirStore { base })
    }

    fn page_path(&self, dir_ino: u64) -> PathBuf {
        self.base.join(format!("dir_{dir_ino}.ent"))
    }

    /// Appends an entry; duplicate names are rejected.
    pub fn add(&self, dir_ino: u64, entry: &DirEntry) -> Result<(), MdsError> {
        if entry.name.is_empty() || entry.name.len() > NAME_MAX {
            return Err(MdsError::InvalidPath(entry.name.clone()));
        }
        let mut entries = self.read(dir_ino)?;
        if entries.iter().any(|e| e.name == entry.name) {
            return Err(MdsError::AlreadyExists(entry.name.clone()));
        }
        entries.push(entry.clone());
        self.write_page(dir_ino, &entries)
    }

    /// Removes the entry named `name`; absent names are an error.
    pub fn remove(&self, dir_ino: u64, name: &str) -> Result<(), MdsError> {
        let mut entries = self.read(dir_ino)?;
        let before = entries.len();
        entries.retain(|e| e.name != name);
        if entries.len() == before {
            return Err(MdsError::NotFound(name.to_string()));
        }
        self.write_page(dir_ino, &entries)
    }

    /// Reads the page in insertion order. A missing page reads as empty.
    pub fn read(&self, dir_ino: u64) -> Result<Vec<DirEntry>, MdsError> {
        let data = match fs::read(self.page_path(dir_ino)) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut entries = Vec::new();
        let mut pos = 0usize;
        while pos < data.len() {
            let name_len = data[pos] as usize;
            pos += 1;
            if pos + name_len + 9 > data.len() {
                // Torn tail record; everything before it is intact.
                break;
            }
            let name = String::from_utf8_lossy(&data[pos..pos + name_len]).into_owned();
            pos += name_len;
            let ino = u64::from_le_bytes(data[pos..pos + 8].try_into().expect("8 bytes"));
            pos += 8;
            let kind = FileKind::from_bits(data[pos]);
            pos += 1;
            entries.push(DirEntry { name, ino, kind });
        }
        Ok(entries)
    }

    /// Empties the page (the directory is being destroyed).
    pub fn reset(&self, dir_ino: u64) -> Result<(), MdsError> {
        match fs::remove_file(self.page_path(dir_ino)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn write_page(&self, dir_ino: u64, entries: &[DirEntry]) -> Result<(), MdsError> {
        let mut buf = Vec::new();
        for entry in entries {
            buf.push(entry.name.len() as u8);
            buf.extend_from_slice(entry.name.as_bytes());
            buf.extend_from_slice(&entry.ino.to_le_bytes());
            buf.push(entry.kind.as_bits());
        }
        fs::write(self.page_path(dir_ino), buf)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, DirStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn add_read_remove_cycle() {
        let (_dir, store) = store();
        store.add(1, &DirEntry::new(".", 1, FileKind::Directory)).unwrap();
        store.add(1, &DirEntry::new("..", 1, FileKind::Directory)).unwrap();
        store.add(1, &DirEntry::new("f", 9, FileKind::Regular)).unwrap();

        let entries = store.read(1).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2], DirEntry::new("f", 9, FileKind::Regular));

        store.remove(1, "f").unwrap();
        assert_eq!(store.read(1).unwrap().len(), 2);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let (_dir, store) = store();
        store.add(3, &DirEntry::new("x", 4, FileKind::Regular)).unwrap();
        assert!(matches!(
            store.add(3, &DirEntry::new("x", 5, FileKind::Regular)),
            Err(MdsError::AlreadyExists(_))
        ));
    }

    #[test]
    fn removing_missing_entry_fails() {
        let (_dir, store) = store();
        assert!(matches!(
            store.remove(3, "ghost"),
            Err(MdsError::NotFound(_))
        ));
    }

    #[test]
    fn reset_empties_the_page() {
        let (_dir, store) = store();
        store.add(2, &DirEntry::new("a", 1, FileKind::Regular)).unwrap();
        store.reset(2).unwrap();
        assert!(store.read(2).unwrap().is_empty());
    }

    #[test]
    fn insertion_order_is_preserved() {
        let (_dir, store) = store();
        for (i, name) in ["zeta", "alpha", "mid"].iter().enumerate() {
            store
                .add(7, &DirEntry::new(*name, i as u64, FileKind::Regular))
                .unwrap();
        }
        let names: Vec<_> = store.read(7).unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }
}
