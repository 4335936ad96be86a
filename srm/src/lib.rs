//! Cluster manager and data-plane gateway: node registry with liveness,
//! request dispatch to real or virtual nodes, and the virtual capacity
//! ledger fed by inode batches.

pub mod controller;
pub mod dispatch;
pub mod engine;
pub mod ledger;
pub mod manager;
pub mod monitor;
pub mod registry;
pub mod service;

pub use dispatch::RequestDispatcher;
pub use engine::{SimulationConfig, VirtualNodeEngine};
pub use ledger::VirtualNodeLedger;
pub use manager::{ManagerConfig, StorageNodeManager};
pub use registry::{NodeContext, NodeRegistry, NodeState, NodeType, SimulationParams};
