//! Node records and the registry map they live in.

use common::wire::DiskInfo;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Online,
    Offline,
    Suspected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeType {
    Real,
    Virtual,
}

/// Latency/failure model attached to virtual nodes.
#[derive(Clone, Copy, Debug)]
pub struct SimulationParams {
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    pub failure_rate: f64,
}

impl Default for SimulationParams {
    fn default() -> Self {
        SimulationParams {
            min_latency_ms: 5,
            max_latency_ms: 50,
            failure_rate: 0.0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct NodeContext {
    pub node_id: String,
    pub ip: String,
    pub port: u32,
    pub hostname: String,
    pub disks: Vec<DiskInfo>,
    pub node_type: NodeType,
    pub sim: SimulationParams,
    pub state: NodeState,
    pub last_heartbeat: Instant,
}

impl NodeContext {
    pub fn new(node_id: impl Into<String>) -> Self {
        NodeContext {
            node_id: node_id.into(),
            ip: String::new(),
            port: 0,
            hostname: String::new(),
            disks: Vec::new(),
            node_type: NodeType::Real,
            sim: SimulationParams::default(),
            state: NodeState::Online,
            last_heartbeat: Instant::now(),
        }
    }
}

/// Registry of every storage node the cluster manager knows about.
/// Handlers copy records out and never hold the lock across I/O.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, NodeContext>>,
}

impl NodeRegistry {
    /// Inserts or replaces by node id, stamping the heartbeat.
    pub fn upsert(&self, mut ctx: NodeContext) {
        ctx.last_heartbeat = Instant::now();
        let mut nodes = self.nodes.write().expect("node registry poisoned");
        nodes.insert(ctx.node_id.clone(), ctx);
    }

    /// Refreshes the heartbeat of an existing node and flips it Online.
    /// Unknown nodes are rejected (the agent must re-register).
    pub fn update_heartbeat(&self, node_id: &str, now: Instant) -> bool {
        let mut nodes = self.nodes.write().expect("node registry poisoned");
        match nodes.get_mut(node_id) {
            Some(ctx) => {
                ctx.last_heartbeat = now;
                ctx.state = NodeState::Online;
                true
            }
            None => false,
        }
    }

    pub fn mark_offline(&self, node_id: &str) -> bool {
        let mut nodes = self.nodes.write().expect("node registry poisoned");
        match nodes.get_mut(node_id) {
            Some(ctx) => {
                ctx.state = NodeState::Offline;
                true
            }
            None => false,
        }
    }

    pub fn exists(&self, node_id: &str) -> bool {
        let nodes = self.nodes.read().expect("node registry poisoned");
        nodes.contains_key(node_id)
    }

    pub fn get(&self, node_id: &str) -> Option<NodeContext> {
        let nodes = self.nodes.read().expect("node registry poisoned");
        nodes.get(node_id).cloned()
    }

    /// Copy of every record; liveness sweeps iterate this instead of
    /// holding the map lock.
    pub fn snapshot(&self) -> Vec<NodeContext> {
        let nodes = self.nodes.read().expect("node registry poisoned");
        nodes.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().expect("node registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
