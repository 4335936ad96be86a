//! Node agent: registers with the cluster manager and keeps the
//! heartbeat flowing.

use crate::disk::DiskUsage;
use common::frame::RpcChannel;
use common::wire::{ClusterRequest, ClusterResponse, DiskInfo};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Cluster-management address of the SRM.
    pub srm_addr: String,
    /// Port this node's storage service listens on.
    pub listen_port: u32,
    /// Address advertised to the cluster (defaults to loopback).
    pub advertise_ip: String,
    /// Hostname override; the system hostname is reported otherwise.
    pub hostname_override: Option<String>,
    /// Mount point whose usage is reported at registration.
    pub mount_point: PathBuf,
    pub heartbeat_interval: Duration,
    pub register_backoff: Duration,
}

pub struct NodeAgent {
    config: AgentConfig,
    channel: RpcChannel,
    node_id: Mutex<Option<String>>,
    worker: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl NodeAgent {
    pub fn new(config: AgentConfig) -> Arc<Self> {
        let channel = RpcChannel::new(config.srm_addr.clone());
        Arc::new(NodeAgent {
            config,
            channel,
            node_id: Mutex::new(None),
            worker: Mutex::new(None),
        })
    }

    /// Current node id, None while unregistered.
    pub fn node_id(&self) -> Option<String> {
        self.node_id.lock().expect("agent lock poisoned").clone()
    }

    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().expect("agent lock poisoned");
        if worker.is_some() {
            return;
        }
        let (shutdown, shutdown_rx) = watch::channel(false);
        let agent = self.clone();
        let handle = tokio::spawn(async move { agent.run(shutdown_rx).await });
        *worker = Some((shutdown, handle));
    }

    pub async fn stop(&self) {
        let taken = self.worker.lock().expect("agent lock poisoned").take();
        if let Some((shutdown, handle)) = taken {
            let _ = shutdown.send(true);
            if let Err(err) = handle.await {
                error!("node agent join failed: {err}");
            }
        }
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let delay = if self.node_id().is_none() {
                if self.register().await {
                    self.config.heartbeat_interval
                } else {
                    self.config.register_backoff
                }
            } else {
                self.heartbeat().await;
                if self.node_id().is_none() {
                    // Told to re-register: back off before dialing again.
                    self.config.register_backoff
                } else {
                    self.config.heartbeat_interval
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    info!("node agent stopping");
                    return;
                }
            }
        }
    }

    async fn register(&self) -> bool {
        let disks = match DiskUsage::probe(&self.config.mount_point) {
            Ok(usage) => vec![DiskInfo {
                mount_point: self.config.mount_point.display().to_string(),
                total_bytes: usage.total_bytes,
                free_bytes: usage.free_bytes,
            }],
            Err(err) => {
                warn!("disk probe failed, registering without stats: {err}");
                Vec::new()
            }
        };
        let req = ClusterRequest::RegisterNode {
            ip: if self.config.advertise_ip.is_empty() {
                "127.0.0.1".to_string()
            } else {
                self.config.advertise_ip.clone()
            },
            port: self.config.listen_port,
            hostname: self
                .config
                .hostname_override
                .clone()
                .unwrap_or_else(resolve_hostname),
            disks,
        };
        match self.channel.call::<_, ClusterResponse>(&req).await {
            Ok(ClusterResponse::Registered { status, node_id }) if status.is_ok() => {
                info!(node = %node_id, "registered with cluster manager");
                *self.node_id.lock().expect("agent lock poisoned") = Some(node_id);
                true
            }
            Ok(ClusterResponse::Registered { status, .. }) => {
                warn!("registration rejected: {status}");
                false
            }
            Ok(_) => {
                warn!("unexpected reply to registration");
                false
            }
            Err(err) => {
                warn!("registration rpc failed: {err}");
                false
            }
        }
    }

    async fn heartbeat(&self) {
        let Some(node_id) = self.node_id() else {
            return;
        };
        let req = ClusterRequest::Heartbeat {
            node_id,
            timestamp_ms: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            cpu_usage: 0.0,
            mem_usage: 0.0,
            in_flight_io: 0,
        };
        match self.channel.call::<_, ClusterResponse>(&req).await {
            Ok(ClusterResponse::Heartbeat {
                status,
                require_rereg,
            }) => {
                if require_rereg {
                    warn!("cluster manager requested re-registration");
                    *self.node_id.lock().expect("agent lock poisoned") = None;
                } else if !status.is_ok() {
                    warn!("heartbeat rejected: {status}");
                }
            }
            Ok(_) => warn!("unexpected reply to heartbeat"),
            // Transport hiccup: keep the node id and just try again next
            // interval.
            Err(err) => warn!("heartbeat rpc failed: {err}"),
        }
    }
}

fn resolve_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "storage-node".to_string())
}
