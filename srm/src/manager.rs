//! Storage node manager: registration, heartbeats and the liveness sweep.

use crate::registry::{NodeContext, NodeRegistry, NodeState, NodeType, SimulationParams};
use common::frame::RpcChannel;
use common::wire::{DiskInfo, MdsRequest, MdsResponse, NodeKind};
use common::{Status, StatusCode};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// A node missing heartbeats for longer than this goes Offline.
    pub heartbeat_timeout: Duration,
    /// Sweep cadence of the health monitor.
    pub health_check_interval: Duration,
    /// Metadata service to mirror node records into, when configured.
    pub mds_addr: Option<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            heartbeat_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(10),
            mds_addr: None,
        }
    }
}

pub struct StorageNodeManager {
    registry: NodeRegistry,
    config: ManagerConfig,
    id_seq: AtomicU64,
    mds: Option<Arc<RpcChannel>>,
    health: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl StorageNodeManager {
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        let mds = config
            .mds_addr
            .as_ref()
            .map(|addr| Arc::new(RpcChannel::new(addr.clone())));
        Arc::new(StorageNodeManager {
            registry: NodeRegistry::default(),
            config,
            id_seq: AtomicU64::new(1),
            mds,
            health: Mutex::new(None),
        })
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn get_node(&self, node_id: &str) -> Option<NodeContext> {
        self.registry.get(node_id)
    }

    /// Spawns the health monitor. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        let mut health = self.health.lock().await;
        if health.is_some() {
            return;
        }
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.health_check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.sweep_once(Instant::now()),
                    _ = shutdown_rx.changed() => {
                        info!("health monitor stopping");
                        return;
                    }
                }
            }
        });
        *health = Some((shutdown, handle));
    }

    /// Stops and joins the health monitor.
    pub async fn stop(&self) {
        let taken = self.health.lock().await.take();
        if let Some((shutdown, handle)) = taken {
            let _ = shutdown.send(true);
            if let Err(err) = handle.await {
                error!("health monitor join failed: {err}");
            }
        }
    }

    /// One liveness sweep over a snapshot of the registry. The map lock is
    /// never held while sweeping.
    pub fn sweep_once(&self, now: Instant) {
        for ctx in self.registry.snapshot() {
            let silent = now.saturating_duration_since(ctx.last_heartbeat);
            if silent > self.config.heartbeat_timeout && ctx.state != NodeState::Offline {
                warn!(node = %ctx.node_id, ?silent, "node missed heartbeats, marking offline");
                self.registry.mark_offline(&ctx.node_id);
            }
        }
    }

    /// Registers a real node and hands back its generated id.
    pub fn handle_register(
        self: &Arc<Self>,
        ip: &str,
        port: u32,
        hostname: &str,
        disks: Vec<DiskInfo>,
    ) -> (Status, String) {
        if ip.is_empty() || port == 0 {
            return (
                Status::error(StatusCode::InvalidArgument, "missing ip/port"),
                String::new(),
            );
        }
        let node_id = self.generate_node_id();
        let mut ctx = NodeContext::new(node_id.clone());
        ctx.ip = ip.to_string();
        ctx.port = port;
        ctx.hostname = hostname.to_string();
        ctx.disks = disks;
        ctx.node_type = NodeType::Real;
        self.registry.upsert(ctx);
        info!(node = %node_id, ip, port, "registered storage node");

        if let Some(ctx) = self.registry.get(&node_id) {
            self.spawn_mds_sync(ctx);
        }
        (Status::ok(), node_id)
    }

    /// Heartbeat handler: unknown nodes are told to re-register.
    pub fn handle_heartbeat(&self, node_id: &str) -> (Status, bool) {
        if node_id.is_empty() {
            return (
                Status::error(StatusCode::InvalidArgument, "empty node_id"),
                true,
            );
        }
        if self.registry.update_heartbeat(node_id, Instant::now()) {
            (Status::ok(), false)
        } else {
            (
                Status::error(StatusCode::NodeNotFound, "node not registered"),
                true,
            )
        }
    }

    /// Pre-registers a virtual node with its simulation parameters and a
    /// synthetic capacity disk.
    pub fn add_virtual_node(
        self: &Arc<Self>,
        node_id: &str,
        sim: SimulationParams,
        capacity_bytes: u64,
    ) {
        let mut ctx = NodeContext::new(node_id);
        ctx.node_type = NodeType::Virtual;
        ctx.sim = sim;
        if capacity_bytes > 0 {
            ctx.disks.push(DiskInfo {
                mount_point: "/virtual".to_string(),
                total_bytes: capacity_bytes,
                free_bytes: capacity_bytes,
            });
        }
        self.registry.upsert(ctx);
        if let Some(ctx) = self.registry.get(node_id) {
            self.spawn_mds_sync(ctx);
        }
    }

    /// Refreshes the synthetic disk of a virtual node after the ledger
    /// consumed capacity.
    pub fn update_virtual_node_capacity(&self, node_id: &str, total_bytes: u64, free_bytes: u64) {
        let Some(mut ctx) = self.registry.get(node_id) else {
            return;
        };
        ctx.disks = vec![DiskInfo {
            mount_point: "/virtual".to_string(),
            total_bytes,
            free_bytes,
        }];
        self.registry.upsert(ctx);
    }

    fn generate_node_id(&self) -> String {
        let seq = self.id_seq.fetch_add(1, Ordering::Relaxed);
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        format!("node-{now_ms}-{seq}")
    }

    /// Mirrors a node record into the MDS node table, off the request
    /// path. Failures are logged; the next registration retries.
    fn spawn_mds_sync(&self, ctx: NodeContext) {
        let Some(mds) = self.mds.clone() else {
            return;
        };
        tokio::spawn(async move {
            let (capacity_bytes, free_bytes) = ctx
                .disks
                .first()
                .map(|d| (d.total_bytes, d.free_bytes))
                .unwrap_or((0, 0));
            let req = MdsRequest::RegisterNode {
                node_id: ctx.node_id.clone(),
                ip: ctx.ip.clone(),
                port: ctx.port,
                kind: match ctx.node_type {
                    NodeType::Real => NodeKind::Real,
                    NodeType::Virtual => NodeKind::Virtual,
                },
                capacity_bytes,
                free_bytes,
            };
            match mds.call::<_, MdsResponse>(&req).await {
                Ok(MdsResponse::Status(st)) if st.is_ok() => {
                    info!(node = %ctx.node_id, "synced node to mds registry");
                }
                Ok(_) => warn!(node = %ctx.node_id, "mds rejected node registration"),
                Err(err) => warn!(node = %ctx.node_id, "mds sync failed: {err}"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(timeout_ms: u64, interval_ms: u64) -> Arc<StorageNodeManager> {
        StorageNodeManager::new(ManagerConfig {
            heartbeat_timeout: Duration::from_millis(timeout_ms),
            health_check_interval: Duration::from_millis(interval_ms),
            mds_addr: None,
        })
    }

    #[tokio::test]
    async fn register_then_heartbeat() {
        let mgr = manager(1000, 100);
        let (st, node_id) = mgr.handle_register("10.0.0.1", 7401, "host-a", Vec::new());
        assert!(st.is_ok());
        assert!(node_id.starts_with("node-"));

        let (st, rereg) = mgr.handle_heartbeat(&node_id);
        assert!(st.is_ok());
        assert!(!rereg);
    }

    #[tokio::test]
    async fn unknown_heartbeat_requests_rereg() {
        let mgr = manager(1000, 100);
        let (st, rereg) = mgr.handle_heartbeat("node-never-seen");
        assert_eq!(st.code, StatusCode::NodeNotFound);
        assert!(rereg);

        let (st, rereg) = mgr.handle_heartbeat("");
        assert_eq!(st.code, StatusCode::InvalidArgument);
        assert!(rereg);
    }

    #[tokio::test]
    async fn silent_node_goes_offline_and_recovers() {
        let mgr = manager(50, 10);
        let (_, node_id) = mgr.handle_register("10.0.0.2", 7402, "host-b", Vec::new());
        mgr.start().await;

        // No heartbeats: within timeout + one interval the sweep flips it.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            mgr.get_node(&node_id).unwrap().state,
            NodeState::Offline
        );

        // A late heartbeat brings it back.
        let (st, rereg) = mgr.handle_heartbeat(&node_id);
        assert!(st.is_ok());
        assert!(!rereg);
        assert_eq!(mgr.get_node(&node_id).unwrap().state, NodeState::Online);

        mgr.stop().await;
    }

    #[tokio::test]
    async fn registration_validates_endpoint() {
        let mgr = manager(1000, 100);
        let (st, id) = mgr.handle_register("", 7400, "h", Vec::new());
        assert_eq!(st.code, StatusCode::InvalidArgument);
        assert!(id.is_empty());
        let (st, _) = mgr.handle_register("10.0.0.3", 0, "h", Vec::new());
        assert_eq!(st.code, StatusCode::InvalidArgument);
    }
}
