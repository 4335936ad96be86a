//! Inode batch monitor: tails `.bin` slot files and feeds the ledger.
//!
//! Each batch file is a run of 512-byte inode slots. A JSON checkpoint
//! records the per-file byte offset of the next unread slot; the save is
//! best-effort, so a crash between apply and save re-applies slots on
//! restart (the ledger is additive by design).

use crate::ledger::VirtualNodeLedger;
use common::inode::{Inode, SLOT_BYTES};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Receives the set of node ids touched by a scan cycle.
pub type UpdateCallback = Arc<dyn Fn(&[String]) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct BatchMonitorConfig {
    /// Directory holding the `.bin` batch files.
    pub dir: PathBuf,
    /// JSON checkpoint path (`{"files": {name: offset}}`).
    pub checkpoint_path: PathBuf,
    pub poll_interval: Duration,
}

#[derive(Serialize, Deserialize, Default)]
struct Checkpoint {
    files: HashMap<String, u64>,
}

pub struct InodeBatchMonitor {
    config: BatchMonitorConfig,
    ledger: Arc<VirtualNodeLedger>,
    on_update: UpdateCallback,
    offsets: Mutex<HashMap<String, u64>>,
    worker: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl InodeBatchMonitor {
    pub fn new(
        config: BatchMonitorConfig,
        ledger: Arc<VirtualNodeLedger>,
        on_update: UpdateCallback,
    ) -> Arc<Self> {
        Arc::new(InodeBatchMonitor {
            config,
            ledger,
            on_update,
            offsets: Mutex::new(HashMap::new()),
            worker: Mutex::new(None),
        })
    }

    /// Loads the checkpoint and spawns the poll loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().expect("monitor lock poisoned");
        if worker.is_some() {
            return;
        }
        self.load_checkpoint();
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let monitor = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let touched = monitor.scan_once();
                        if !touched.is_empty() {
                            (monitor.on_update)(&touched);
                        }
                    }
                    _ = shutdown_rx.changed() => return,
                }
            }
        });
        *worker = Some((shutdown, handle));
    }

    pub async fn stop(&self) {
        let taken = self.worker.lock().expect("monitor lock poisoned").take();
        if let Some((shutdown, handle)) = taken {
            let _ = shutdown.send(true);
            if let Err(err) = handle.await {
                error!("batch monitor join failed: {err}");
            }
        }
    }

    /// One scan cycle over every batch file, lexicographic order. Returns
    /// the sorted set of node ids whose capacity changed.
    pub fn scan_once(&self) -> Vec<String> {
        let mut files: Vec<String> = match std::fs::read_dir(&self.config.dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                .filter_map(|e| e.file_name().into_string().ok())
                .filter(|name| name.ends_with(".bin"))
                .collect(),
            Err(err) => {
                debug!(dir = %self.config.dir.display(), "batch dir unreadable: {err}");
                return Vec::new();
            }
        };
        if files.is_empty() {
            return Vec::new();
        }
        files.sort();

        let mut touched = BTreeSet::new();
        let mut advanced = false;
        for filename in &files {
            match self.process_file(filename, &mut touched) {
                Ok(did) => advanced |= did,
                Err(err) => warn!(file = %filename, "batch file skipped: {err}"),
            }
        }
        if advanced {
            self.save_checkpoint();
        }
        touched.into_iter().collect()
    }

    /// Reads whole slots from the checkpointed offset to EOF, applying
    /// each to the ledger. Returns whether the offset moved.
    fn process_file(
        &self,
        filename: &str,
        touched: &mut BTreeSet<String>,
    ) -> std::io::Result<bool> {
        let path = self.config.dir.join(filename);
        let mut file = std::fs::File::open(&path)?;
        let len = file.metadata()?.len();
        // Only whole slots count; a partially written tail waits for the
        // next cycle.
        let usable = len - (len % SLOT_BYTES as u64);

        let mut offset = {
            let offsets = self.offsets.lock().expect("offsets lock poisoned");
            offsets.get(filename).copied().unwrap_or(0)
        };
        if offset > usable {
            // The file shrank or the checkpoint is stale; start over.
            offset = 0;
        }
        offset -= offset % SLOT_BYTES as u64;
        if offset >= usable {
            return Ok(false);
        }

        file.seek(SeekFrom::Start(offset))?;
        let mut slot = vec![0u8; SLOT_BYTES];
        while offset + SLOT_BYTES as u64 <= usable {
            file.read_exact(&mut slot)?;
            match Inode::decode_slot(&slot) {
                Ok(inode) => match self.ledger.apply_inode(&inode) {
                    Ok(applied) if applied.complete => {
                        touched.insert(applied.node_id);
                    }
                    Ok(applied) => {
                        warn!(ino = inode.ino, node = %applied.node_id,
                              "inode only partially applied (node out of space)");
                    }
                    Err(err) => warn!(ino = inode.ino, "inode not applied: {err}"),
                },
                Err(err) => warn!(file = %filename, offset, "undecodable slot: {err}"),
            }
            offset += SLOT_BYTES as u64;
        }

        self.offsets
            .lock()
            .expect("offsets lock poisoned")
            .insert(filename.to_string(), offset);
        Ok(true)
    }

    fn load_checkpoint(&self) {
        let text = match std::fs::read_to_string(&self.config.checkpoint_path) {
            Ok(text) => text,
            Err(_) => return,
        };
        match serde_json::from_str::<Checkpoint>(&text) {
            Ok(checkpoint) => {
                *self.offsets.lock().expect("offsets lock poisoned") = checkpoint.files;
            }
            Err(err) => warn!("checkpoint unreadable, rescanning from zero: {err}"),
        }
    }

    /// Best-effort: a failed save only means re-applying slots next start.
    fn save_checkpoint(&self) {
        let checkpoint = Checkpoint {
            files: self.offsets.lock().expect("offsets lock poisoned").clone(),
        };
        if let Some(parent) = self.config.checkpoint_path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        match serde_json::to_string_pretty(&checkpoint) {
            Ok(json) => {
                if let Err(err) = std::fs::write(&self.config.checkpoint_path, json) {
                    warn!("checkpoint save failed: {err}");
                }
            }
            Err(err) => warn!("checkpoint serialize failed: {err}"),
        }
    }
}
