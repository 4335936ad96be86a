//! Chunk manifest: append-only log of chunk_id → path bindings.
//!
//! Records are text lines, `ADD <chunk_id> <absolute_path>` and
//! `DEL <chunk_id>`. The in-memory map is the replay fold of the log; a
//! torn tail line (no trailing newline) is dropped.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

struct ManifestState {
    map: HashMap<u64, PathBuf>,
    writer: BufWriter<File>,
    next_root: usize,
}

pub struct ManifestLog {
    data_roots: Vec<PathBuf>,
    state: Mutex<ManifestState>,
}

impl ManifestLog {
    /// Opens (or creates) the manifest. `manifest_path` defaults to
    /// `<first_root>/chunk_manifest.log`.
    pub fn open(
        data_roots: Vec<PathBuf>,
        manifest_path: Option<PathBuf>,
    ) -> std::io::Result<Self> {
        if data_roots.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "no data roots configured",
            ));
        }
        for root in &data_roots {
            std::fs::create_dir_all(root)?;
        }
        let manifest_path =
            manifest_path.unwrap_or_else(|| data_roots[0].join("chunk_manifest.log"));

        let map = Self::replay(&manifest_path)?;
        let writer = BufWriter::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&manifest_path)?,
        );
        Ok(ManifestLog {
            data_roots,
            state: Mutex::new(ManifestState {
                map,
                writer,
                next_root: 0,
            }),
        })
    }

    fn replay(path: &Path) -> std::io::Result<HashMap<u64, PathBuf>> {
        let mut map = HashMap::new();
        let mut text = String::new();
        match File::open(path) {
            Ok(mut file) => {
                file.read_to_string(&mut text)?;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(map),
            Err(err) => return Err(err),
        }
        for line in text.split_inclusive('\n') {
            let Some(line) = line.strip_suffix('\n') else {
                break;
            };
            let mut fields = line.splitn(3, ' ');
            let (op, id) = (fields.next(), fields.next());
            let (Some(op), Some(id)) = (op, id) else {
                continue;
            };
            let Ok(chunk_id) = id.parse::<u64>() else {
                warn!(line, "manifest line with bad chunk id skipped");
                continue;
            };
            match op {
                "ADD" => {
                    if let Some(path) = fields.next() {
                        map.insert(chunk_id, PathBuf::from(path));
                    }
                }
                "DEL" => {
                    map.remove(&chunk_id);
                }
                _ => warn!(line, "unknown manifest op skipped"),
            }
        }
        Ok(map)
    }

    /// Current path of a chunk, if bound.
    pub fn get(&self, chunk_id: u64) -> Option<PathBuf> {
        let state = self.state.lock().expect("manifest lock poisoned");
        state.map.get(&chunk_id).cloned()
    }

    /// Idempotent binding: an existing mapping is returned as-is,
    /// otherwise the next data root (round-robin) gets a sharded path,
    /// parent directories are created and an ADD record is flushed.
    pub fn alloc(&self, chunk_id: u64) -> std::io::Result<PathBuf> {
        let mut state = self.state.lock().expect("manifest lock poisoned");
        if let Some(path) = state.map.get(&chunk_id) {
            return Ok(path.clone());
        }
        let root = &self.data_roots[state.next_root % self.data_roots.len()];
        state.next_root += 1;
        let full = root.join(sharded_relative_path(chunk_id));
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        writeln!(state.writer, "ADD {chunk_id} {}", full.display())?;
        state.writer.flush()?;
        state.map.insert(chunk_id, full.clone());
        Ok(full)
    }

    /// Unbinds the chunk and appends a DEL record. The data file itself
    /// is left to the caller.
    pub fn delete(&self, chunk_id: u64) -> std::io::Result<()> {
        let mut state = self.state.lock().expect("manifest lock poisoned");
        if state.map.remove(&chunk_id).is_none() {
            return Ok(());
        }
        writeln!(state.writer, "DEL {chunk_id}")?;
        state.writer.flush()?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("manifest lock poisoned").map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `hex16[0..2]/hex16[2..4]/chunk_<dec>` relative layout.
fn sharded_relative_path(chunk_id: u64) -> PathBuf {
    let hex = format!("{chunk_id:016x}");
    PathBuf::from(&hex[0..2])
        .join(&hex[2..4])
        .join(format!("chunk_{chunk_id}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_idempotent_and_sharded() {
        let dir = tempfile::tempdir().unwrap();
        let log = ManifestLog::open(vec![dir.path().to_path_buf()], None).unwrap();

        let path = log.alloc(0xAB_CDEF).unwrap();
        assert_eq!(log.alloc(0xAB_CDEF).unwrap(), path);
        // 0xabcdef -> 0000000000abcdef: shards 00/00.
        assert!(path.ends_with("00/00/chunk_11259375"));
        assert!(path.parent().unwrap().is_dir());
    }

    #[test]
    fn replay_matches_in_memory_application() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let expected;
        {
            let log = ManifestLog::open(vec![root.clone()], None).unwrap();
            log.alloc(1).unwrap();
            log.alloc(2).unwrap();
            log.alloc(3).unwrap();
            log.delete(2).unwrap();
            expected = (log.get(1), log.get(2), log.get(3));
        }
        let log = ManifestLog::open(vec![root], None).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!((log.get(1), log.get(2), log.get(3)), expected);
    }

    #[test]
    fn round_robin_spreads_across_roots() {
        let dir = tempfile::tempdir().unwrap();
        let roots = vec![dir.path().join("r0"), dir.path().join("r1")];
        let log = ManifestLog::open(roots.clone(), Some(dir.path().join("m.log"))).unwrap();

        let a = log.alloc(10).unwrap();
        let b = log.alloc(11).unwrap();
        assert!(a.starts_with(&roots[0]));
        assert!(b.starts_with(&roots[1]));
    }

    #[test]
    fn torn_tail_line_is_dropped_on_replay() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("m.log");
        std::fs::write(&manifest, "ADD 5 /data/x\nADD 6 /data").unwrap();
        let log = ManifestLog::open(vec![dir.path().to_path_buf()], Some(manifest)).unwrap();
        assert_eq!(log.get(5), Some(PathBuf::from("/data/x")));
        assert_eq!(log.get(6), None);
    }

    #[test]
    fn delete_of_unknown_chunk_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let log = ManifestLog::open(vec![dir.path().to_path_buf()], None).unwrap();
        log.delete(99).unwrap();
        assert!(log.is_empty());
    }
}
