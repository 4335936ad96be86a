//! Wires the virtual fleet together: ledger, batch monitor, registry
//! refresh and the periodic capacity snapshot.

use crate::ledger::VirtualNodeLedger;
use crate::manager::StorageNodeManager;
use crate::monitor::{BatchMonitorConfig, InodeBatchMonitor};
use crate::registry::SimulationParams;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub struct VirtualNodeController {
    manager: Arc<StorageNodeManager>,
    sim: SimulationParams,
    ledger: Arc<VirtualNodeLedger>,
    monitor: Mutex<Option<Arc<InodeBatchMonitor>>>,
    snapshot: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl VirtualNodeController {
    pub fn new(manager: Arc<StorageNodeManager>, sim: SimulationParams) -> Arc<Self> {
        Arc::new(VirtualNodeController {
            manager,
            sim,
            ledger: Arc::new(VirtualNodeLedger::new()),
            monitor: Mutex::new(None),
            snapshot: Mutex::new(None),
        })
    }

    pub fn ledger(&self) -> &Arc<VirtualNodeLedger> {
        &self.ledger
    }

    /// Loads the fleet from a ledger snapshot and registers every node as
    /// a virtual node with its current capacity.
    pub fn load_nodes_from_json(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        self.ledger.load_from_json(path)?;
        self.seed_registry();
        Ok(())
    }

    /// Seeds a synthetic fleet instead of loading one.
    pub fn init_empty_nodes(
        &self,
        ssd_nodes: u32,
        hdd_nodes: u32,
        mix_nodes: u32,
        capacity_bytes: u64,
    ) {
        self.ledger
            .init_empty(ssd_nodes, hdd_nodes, mix_nodes, capacity_bytes);
        self.seed_registry();
    }

    fn seed_registry(&self) {
        for node in self.ledger.list_nodes() {
            self.manager
                .add_virtual_node(&node.node_id, self.sim, node.total_bytes);
            self.manager
                .update_virtual_node_capacity(&node.node_id, node.total_bytes, node.free_bytes);
        }
        info!(nodes = self.ledger.list_nodes().len(), "virtual fleet seeded");
    }

    /// Starts the inode batch monitor; applied batches refresh the
    /// registry's view of virtual capacity.
    pub async fn start_inode_monitor(
        self: &Arc<Self>,
        dir: PathBuf,
        checkpoint_path: PathBuf,
        poll_interval: Duration,
    ) {
        let controller = self.clone();
        let monitor = InodeBatchMonitor::new(
            BatchMonitorConfig {
                dir,
                checkpoint_path,
                poll_interval,
            },
            self.ledger.clone(),
            Arc::new(move |node_ids: &[String]| controller.refresh_nodes(node_ids)),
        );
        monitor.start();
        *self.monitor.lock().await = Some(monitor);
    }

    /// Persists the ledger whenever it went dirty since the last tick.
    /// Writes one snapshot immediately so the file exists from the start.
    pub async fn start_snapshot(self: &Arc<Self>, path: PathBuf, interval: Duration) {
        let mut snapshot = self.snapshot.lock().await;
        if snapshot.is_some() {
            return;
        }
        if let Err(err) = self.ledger.snapshot_to_json(&path) {
            warn!("initial capacity snapshot failed: {err}");
        }
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let controller = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if controller.ledger.take_dirty() {
                            if let Err(err) = controller.ledger.snapshot_to_json(&path) {
                                error!("capacity snapshot failed: {err}");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => return,
                }
            }
        });
        *snapshot = Some((shutdown, handle));
    }

    pub async fn stop(&self) {
        if let Some(monitor) = self.monitor.lock().await.take() {
            monitor.stop().await;
        }
        let taken = self.snapshot.lock().await.take();
        if let Some((shutdown, handle)) = taken {
            let _ = shutdown.send(true);
            if let Err(err) = handle.await {
                error!("snapshot task join failed: {err}");
            }
        }
    }

    fn refresh_nodes(&self, node_ids: &[String]) {
        for node_id in node_ids {
            if let Some((total, free)) = self.ledger.get_node_capacity(node_id) {
                self.manager
                    .update_virtual_node_capacity(node_id, total, free);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerConfig;
    use crate::registry::NodeType;
    use common::inode::{Inode, NodeClass};

    #[tokio::test]
    async fn init_registers_virtual_nodes_with_capacity() {
        let manager = StorageNodeManager::new(ManagerConfig::default());
        let controller = VirtualNodeController::new(manager.clone(), SimulationParams::default());
        controller.init_empty_nodes(2, 1, 0, 4 << 20);

        let ctx = manager.get_node("node_ssd_1").unwrap();
        assert_eq!(ctx.node_type, NodeType::Virtual);
        assert_eq!(ctx.disks[0].total_bytes, 4 << 20);
        assert!(manager.get_node("node_hdd_0").is_some());
    }

    #[tokio::test]
    async fn batch_monitor_refreshes_registry_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StorageNodeManager::new(ManagerConfig::default());
        let controller = VirtualNodeController::new(manager.clone(), SimulationParams::default());
        controller.init_empty_nodes(1, 0, 0, 16 << 20);

        controller
            .start_inode_monitor(
                dir.path().to_path_buf(),
                dir.path().join("cp.json"),
                Duration::from_millis(10),
            )
            .await;

        let mut inode = Inode::default();
        inode.set_node(0, NodeClass::Ssd);
        inode.set_size_bytes(2 << 20);
        std::fs::write(dir.path().join("batch.bin"), inode.encode_slot().unwrap()).unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        controller.stop().await;

        let ctx = manager.get_node("node_ssd_0").unwrap();
        assert_eq!(ctx.disks[0].free_bytes, 14 << 20);
    }

    #[tokio::test]
    async fn snapshot_task_persists_dirty_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cap.json");
        let manager = StorageNodeManager::new(ManagerConfig::default());
        let controller = VirtualNodeController::new(manager, SimulationParams::default());
        controller.init_empty_nodes(1, 0, 0, 8 << 20);
        controller
            .start_snapshot(path.clone(), Duration::from_millis(10))
            .await;

        let mut inode = Inode::default();
        inode.set_node(0, NodeClass::Ssd);
        inode.set_size_bytes(1 << 20);
        controller.ledger().apply_inode(&inode).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        controller.stop().await;

        let restored = VirtualNodeLedger::new();
        restored.load_from_json(&path).unwrap();
        assert_eq!(
            restored.get_node_capacity("node_ssd_0").unwrap(),
            (8 << 20, 7 << 20)
        );
    }
}
