//! Optional persistent path → inode index.
//!
//! A text log of `PUT <ino> <path>` / `DEL <path>` records replayed into a
//! map at open. The index is advisory: inode slot content is authoritative
//! and `rebuild` rewrites the log from a slot scan.

use crate::error::MdsError;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

struct KvState {
    map: HashMap<String, u64>,
    writer: BufWriter<File>,
}

pub struct PathKv {
    state: Mutex<KvState>,
    path: PathBuf,
}

impl PathKv {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MdsError> {
        let path = path.as_ref().to_path_buf();
        let map = Self::replay(&path)?;
        let writer = BufWriter::new(OpenOptions::new().create(true).append(true).open(&path)?);
        Ok(PathKv {
            state: Mutex::new(KvState { map, writer }),
            path,
        })
    }

    fn replay(path: &Path) -> Result<HashMap<String, u64>, MdsError> {
        let mut map = HashMap::new();
        let mut text = String::new();
        match File::open(path) {
            Ok(mut file) => {
                file.read_to_string(&mut text)?;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(map),
            Err(err) => return Err(err.into()),
        }
        for line in text.split_inclusive('\n') {
            // A partial tail (no newline) is a torn append; drop it.
            let Some(line) = line.strip_suffix('\n') else {
                break;
            };
            if let Some(rest) = line.strip_prefix("PUT ") {
                if let Some((ino, p)) = rest.split_once(' ') {
                    if let Ok(ino) = ino.parse::<u64>() {
                        map.insert(p.to_string(), ino);
                    }
                }
            } else if let Some(p) = line.strip_prefix("DEL ") {
                map.remove(p);
            }
        }
        Ok(map)
    }

    pub fn get(&self, path: &str) -> Option<u64> {
        let state = self.state.lock().expect("pathkv lock poisoned");
        state.map.get(path).copied()
    }

    pub fn put(&self, path: &str, ino: u64) -> Result<(), MdsError> {
        let mut state = self.state.lock().expect("pathkv lock poisoned");
        writeln!(state.writer, "PUT {ino} {path}")?;
        state.writer.flush()?;
        state.map.insert(path.to_string(), ino);
        Ok(())
    }

    pub fn delete(&self, path: &str) -> Result<(), MdsError> {
        let mut state = self.state.lock().expect("pathkv lock poisoned");
        if state.map.remove(path).is_none() {
            return Ok(());
        }
        writeln!(state.writer, "DEL {path}")?;
        state.writer.flush()?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock().expect("pathkv lock poisoned");
        state.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaces the index with `entries` and compacts the log to match.
    pub fn rebuild(&self, entries: &HashMap<String, u64>) -> Result<(), MdsError> {
        let mut state = self.state.lock().expect("pathkv lock poisoned");
        let fresh = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(fresh);
        for (path, ino) in entries {
            writeln!(writer, "PUT {ino} {path}")?;
        }
        writer.flush()?;
        state.writer = writer;
        state.map = entries.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_replays_put_and_del() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paths.log");
        {
            let kv = PathKv::open(&path).unwrap();
            kv.put("/a", 1).unwrap();
            kv.put("/a/b", 2).unwrap();
            kv.put("/with space/name", 3).unwrap();
            kv.delete("/a/b").unwrap();
        }
        let kv = PathKv::open(&path).unwrap();
        assert_eq!(kv.get("/a"), Some(1));
        assert_eq!(kv.get("/a/b"), None);
        assert_eq!(kv.get("/with space/name"), Some(3));
    }

    #[test]
    fn torn_tail_record_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paths.log");
        std::fs::write(&path, "PUT 1 /a\nPUT 2 /b").unwrap();
        let kv = PathKv::open(&path).unwrap();
        assert_eq!(kv.get("/a"), Some(1));
        assert_eq!(kv.get("/b"), None);
    }

    #[test]
    fn rebuild_compacts_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paths.log");
        let kv = PathKv::open(&path).unwrap();
        for i in 0..10u64 {
            kv.put(&format!("/f{i}"), i).unwrap();
            kv.delete(&format!("/f{i}")).unwrap();
        }
        let mut fresh = HashMap::new();
        fresh.insert("/only".to_string(), 7);
        kv.rebuild(&fresh).unwrap();
        drop(kv);

        let kv = PathKv::open(&path).unwrap();
        assert_eq!(kv.len(), 1);
        assert_eq!(kv.get("/only"), Some(7));
    }
}
