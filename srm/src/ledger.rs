//! Capacity ledger of the simulated fleet.
//!
//! Tracks per-node SSD/HDD device pools and consumes capacity as inode
//! batches are applied. Apply is deliberately additive: replaying a slot
//! (after a lost checkpoint) consumes again, and partial consumption is
//! not rolled back — it only sets the dirty flag so the snapshotter
//! persists the state.

use common::inode::{Inode, NodeClass};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("no virtual node resolves (class {class}, index {index})")]
    NoNode { class: u8, index: u16 },

    #[error("snapshot: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceState {
    pub device_id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub capacity: u64,
    #[serde(rename = "used_bytes", alias = "used", default)]
    pub used: u64,
    #[serde(rename = "free_bytes", alias = "free", default)]
    pub free: Option<u64>,
    #[serde(rename = "read_throughput_MBps", default)]
    pub read_mbps: f64,
    #[serde(rename = "write_throughput_MBps", default)]
    pub write_mbps: f64,
}

impl DeviceState {
    fn new(device_id: String, kind: &str, capacity: u64) -> Self {
        DeviceState {
            device_id,
            kind: kind.to_string(),
            capacity,
            used: 0,
            free: Some(capacity),
            read_mbps: 0.0,
            write_mbps: 0.0,
        }
    }

    fn free_bytes(&self) -> u64 {
        self.free
            .unwrap_or_else(|| self.capacity.saturating_sub(self.used))
    }

    /// Clamp to the invariants used+free <= capacity after a load.
    fn normalize(&mut self) {
        self.used = self.used.min(self.capacity);
        let free = self.free_bytes().min(self.capacity);
        self.free = Some(free);
    }

    fn consume(&mut self, remaining: &mut u64) {
        if *remaining == 0 {
            return;
        }
        let free = self.free_bytes();
        if free == 0 {
            return;
        }
        let take = free.min(*remaining);
        self.free = Some(free - take);
        self.used += take;
        *remaining -= take;
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeDevices {
    pub node_id: String,
    #[serde(rename = "type", default)]
    pub class: u8,
    #[serde(default)]
    pub ssd_devices: Vec<DeviceState>,
    #[serde(default)]
    pub hdd_devices: Vec<DeviceState>,
}

#[derive(Serialize, Deserialize, Default)]
struct SnapshotDoc {
    nodes: Vec<NodeDevices>,
}

/// Capacity summary of one node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeSummary {
    pub node_id: String,
    pub class: u8,
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// Outcome of applying one inode's consumption.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Applied {
    pub node_id: String,
    /// False when the devices collectively lacked free space; what was
    /// taken stays taken.
    pub complete: bool,
}

struct LedgerState {
    nodes: HashMap<String, NodeDevices>,
    ssd_index: Vec<String>,
    hdd_index: Vec<String>,
    mix_index: Vec<String>,
    dirty: bool,
}

#[derive(Default)]
pub struct VirtualNodeLedger {
    state: Mutex<LedgerState>,
}

impl Default for LedgerState {
    fn default() -> Self {
        LedgerState {
            nodes: HashMap::new(),
            ssd_index: Vec::new(),
            hdd_index: Vec::new(),
            mix_index: Vec::new(),
            dirty: false,
        }
    }
}

fn parse_index(node_id: &str, prefix: &str) -> Option<u16> {
    node_id.strip_prefix(prefix)?.parse().ok()
}

impl LedgerState {
    fn rebuild_index(&mut self) {
        self.ssd_index.clear();
        self.hdd_index.clear();
        self.mix_index.clear();
        let labels: Vec<(String, u8)> = self
            .nodes
            .values()
            .map(|node| (node.node_id.clone(), node.class))
            .collect();
        for (node_id, class) in labels {
            let (index, prefix) = match class {
                0 => (&mut self.ssd_index, "node_ssd_"),
                1 => (&mut self.hdd_index, "node_hdd_"),
                _ => (&mut self.mix_index, "node_mix_"),
            };
            match parse_index(&node_id, prefix) {
                Some(i) => {
                    let i = i as usize;
                    if i >= index.len() {
                        index.resize(i + 1, String::new());
                    }
                    index[i] = node_id;
                }
                None => index.push(node_id),
            }
        }
    }

    fn resolve_node_id(&self, index: u16, class: NodeClass) -> Option<String> {
        let list = match class {
            NodeClass::Ssd => &self.ssd_index,
            NodeClass::Hdd => &self.hdd_index,
            NodeClass::Mix => &self.mix_index,
        };
        if let Some(id) = list.get(index as usize).filter(|id| !id.is_empty()) {
            return Some(id.clone());
        }
        // Degraded fallbacks: any node of the class, then any node at all.
        if let Some(id) = list.iter().find(|id| !id.is_empty()) {
            return Some(id.clone());
        }
        self.nodes.keys().next().cloned()
    }
}

impl VirtualNodeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds `node_ssd_<i>` / `node_hdd_<i>` / `node_mix_<i>` fleets, each
    /// node carrying `capacity_bytes` (mix nodes split it between pools).
    pub fn init_empty(&self, ssd_nodes: u32, hdd_nodes: u32, mix_nodes: u32, capacity_bytes: u64) {
        let mut nodes = HashMap::new();
        for i in 0..ssd_nodes {
            let node_id = format!("node_ssd_{i}");
            nodes.insert(
                node_id.clone(),
                NodeDevices {
                    ssd_devices: vec![DeviceState::new(
                        format!("{node_id}_SSD_0"),
                        "SolidStateDrive",
                        capacity_bytes,
                    )],
                    hdd_devices: Vec::new(),
                    node_id,
                    class: 0,
                },
            );
        }
        for i in 0..hdd_nodes {
            let node_id = format!("node_hdd_{i}");
            nodes.insert(
                node_id.clone(),
                NodeDevices {
                    ssd_devices: Vec::new(),
                    hdd_devices: vec![DeviceState::new(
                        format!("{node_id}_HDD_0"),
                        "HardDiskDrive",
                        capacity_bytes,
                    )],
                    node_id,
                    class: 1,
                },
            );
        }
        for i in 0..mix_nodes {
            let node_id = format!("node_mix_{i}");
            let ssd_cap = capacity_bytes / 2;
            nodes.insert(
                node_id.clone(),
                NodeDevices {
                    ssd_devices: vec![DeviceState::new(
                        format!("{node_id}_SSD_0"),
                        "SolidStateDrive",
                        ssd_cap,
                    )],
                    hdd_devices: vec![DeviceState::new(
                        format!("{node_id}_HDD_0"),
                        "HardDiskDrive",
                        capacity_bytes - ssd_cap,
                    )],
                    node_id,
                    class: 2,
                },
            );
        }

        let mut state = self.state.lock().expect("ledger lock poisoned");
        state.nodes = nodes;
        state.rebuild_index();
        state.dirty = false;
    }

    pub fn load_from_json(&self, path: impl AsRef<Path>) -> Result<(), LedgerError> {
        let text = std::fs::read_to_string(path)?;
        let doc: SnapshotDoc = serde_json::from_str(&text)?;
        let mut nodes = HashMap::new();
        for mut node in doc.nodes {
            if node.node_id.is_empty() {
                continue;
            }
            for dev in node
                .ssd_devices
                .iter_mut()
                .chain(node.hdd_devices.iter_mut())
            {
                dev.normalize();
            }
            nodes.insert(node.node_id.clone(), node);
        }
        let mut state = self.state.lock().expect("ledger lock poisoned");
        state.nodes = nodes;
        state.rebuild_index();
        state.dirty = false;
        Ok(())
    }

    pub fn snapshot_to_json(&self, path: impl AsRef<Path>) -> Result<(), LedgerError> {
        let mut nodes: Vec<NodeDevices> = {
            let state = self.state.lock().expect("ledger lock poisoned");
            state.nodes.values().cloned().collect()
        };
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let doc = SnapshotDoc { nodes };
        std::fs::write(path, serde_json::to_string_pretty(&doc)?)?;
        Ok(())
    }

    pub fn list_nodes(&self) -> Vec<NodeSummary> {
        let state = self.state.lock().expect("ledger lock poisoned");
        let mut out: Vec<NodeSummary> = state
            .nodes
            .values()
            .map(|node| {
                let (total, free) = totals(node);
                NodeSummary {
                    node_id: node.node_id.clone(),
                    class: node.class,
                    total_bytes: total,
                    free_bytes: free,
                }
            })
            .collect();
        out.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        out
    }

    pub fn get_node_capacity(&self, node_id: &str) -> Option<(u64, u64)> {
        let state = self.state.lock().expect("ledger lock poisoned");
        state.nodes.get(node_id).map(totals)
    }

    /// Consumes `inode.size_bytes()` from the node resolved by the packed
    /// (class, index) location. Device order depends on the class: SSD
    /// nodes drain ssd then hdd, HDD nodes hdd then ssd, mixed nodes ssd
    /// then hdd.
    pub fn apply_inode(&self, inode: &Inode) -> Result<Applied, LedgerError> {
        let class = inode.node_class;
        let index = inode.node_index;
        let bytes = inode.size_bytes();

        let mut state = self.state.lock().expect("ledger lock poisoned");
        let node_id = state
            .resolve_node_id(index, class)
            .ok_or(LedgerError::NoNode {
                class: class.as_bits(),
                index,
            })?;
        if bytes == 0 {
            return Ok(Applied {
                node_id,
                complete: true,
            });
        }
        let node = state
            .nodes
            .get_mut(&node_id)
            .expect("index entries always name live nodes");

        let mut remaining = bytes;
        match class {
            NodeClass::Ssd => {
                drain(&mut node.ssd_devices, &mut remaining);
                drain(&mut node.hdd_devices, &mut remaining);
            }
            NodeClass::Hdd => {
                drain(&mut node.hdd_devices, &mut remaining);
                drain(&mut node.ssd_devices, &mut remaining);
            }
            NodeClass::Mix => {
                drain(&mut node.ssd_devices, &mut remaining);
                drain(&mut node.hdd_devices, &mut remaining);
            }
        }

        if remaining != bytes {
            state.dirty = true;
        }
        Ok(Applied {
            node_id,
            complete: remaining == 0,
        })
    }

    /// Reads and clears the dirty flag.
    pub fn take_dirty(&self) -> bool {
        let mut state = self.state.lock().expect("ledger lock poisoned");
        std::mem::take(&mut state.dirty)
    }
}

fn drain(devices: &mut [DeviceState], remaining: &mut u64) {
    for dev in devices {
        if *remaining == 0 {
            return;
        }
        dev.consume(remaining);
    }
}

fn totals(node: &NodeDevices) -> (u64, u64) {
    let mut total = 0;
    let mut free = 0;
    for dev in node.ssd_devices.iter().chain(node.hdd_devices.iter()) {
        total += dev.capacity;
        free += dev.free_bytes();
    }
    (total, free)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inode_for(class: NodeClass, index: u16, bytes: u64) -> Inode {
        let mut inode = Inode::default();
        inode.set_node(index, class);
        inode.set_size_bytes(bytes);
        inode
    }

    #[test]
    fn apply_drains_class_pools_in_order() {
        let ledger = VirtualNodeLedger::new();
        ledger.init_empty(0, 0, 1, 2 << 20); // one mix node, 1 MiB ssd + 1 MiB hdd

        let applied = ledger
            .apply_inode(&inode_for(NodeClass::Mix, 0, 1 << 20))
            .unwrap();
        assert_eq!(applied.node_id, "node_mix_0");
        assert!(applied.complete);

        // The SSD pool drained first.
        let (total, free) = ledger.get_node_capacity("node_mix_0").unwrap();
        assert_eq!(total, 2 << 20);
        assert_eq!(free, 1 << 20);
    }

    #[test]
    fn partial_apply_sets_dirty_and_keeps_consumption() {
        let ledger = VirtualNodeLedger::new();
        ledger.init_empty(1, 0, 0, 1 << 20);
        assert!(!ledger.take_dirty());

        let applied = ledger
            .apply_inode(&inode_for(NodeClass::Ssd, 0, 4 << 20))
            .unwrap();
        assert!(!applied.complete);
        assert!(ledger.take_dirty());
        // The entire free pool was consumed, no rollback.
        assert_eq!(ledger.get_node_capacity("node_ssd_0").unwrap().1, 0);
    }

    #[test]
    fn reapply_is_additive() {
        let ledger = VirtualNodeLedger::new();
        ledger.init_empty(1, 0, 0, 10 << 20);
        let inode = inode_for(NodeClass::Ssd, 0, 1 << 20);
        ledger.apply_inode(&inode).unwrap();
        ledger.apply_inode(&inode).unwrap();
        assert_eq!(
            ledger.get_node_capacity("node_ssd_0").unwrap().1,
            8 << 20
        );
    }

    #[test]
    fn unknown_index_falls_back_within_class() {
        let ledger = VirtualNodeLedger::new();
        ledger.init_empty(2, 0, 0, 1 << 20);
        let applied = ledger
            .apply_inode(&inode_for(NodeClass::Ssd, 999, 1024))
            .unwrap();
        assert!(applied.node_id.starts_with("node_ssd_"));
    }

    #[test]
    fn empty_ledger_cannot_resolve() {
        let ledger = VirtualNodeLedger::new();
        assert!(matches!(
            ledger.apply_inode(&inode_for(NodeClass::Ssd, 0, 1024)),
            Err(LedgerError::NoNode { .. })
        ));
    }

    #[test]
    fn snapshot_round_trips_including_usage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");

        let ledger = VirtualNodeLedger::new();
        ledger.init_empty(1, 1, 1, 8 << 20);
        ledger
            .apply_inode(&inode_for(NodeClass::Hdd, 0, 3 << 20))
            .unwrap();
        ledger.snapshot_to_json(&path).unwrap();

        let restored = VirtualNodeLedger::new();
        restored.load_from_json(&path).unwrap();
        assert_eq!(restored.list_nodes(), ledger.list_nodes());
        assert_eq!(
            restored.get_node_capacity("node_hdd_0").unwrap(),
            (8 << 20, 5 << 20)
        );
    }
}
