//! Wire services: the data-plane gateway and the cluster-management
//! surface node agents talk to.

use crate::dispatch::RequestDispatcher;
use crate::manager::StorageNodeManager;
use common::wire::{ClusterRequest, ClusterResponse, StorageRequest, StorageResponse};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Gateway: every data-plane request goes through the dispatcher.
pub async fn run_gateway(
    listener: TcpListener,
    dispatcher: Arc<RequestDispatcher>,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "gateway listening");
    common::frame::serve(listener, move |req: StorageRequest| {
        let dispatcher = dispatcher.clone();
        async move { dispatcher.dispatch(req).await }
    })
    .await
}

/// Cluster surface: registration and heartbeats.
pub async fn run_cluster(
    listener: TcpListener,
    manager: Arc<StorageNodeManager>,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "cluster service listening");
    common::frame::serve(listener, move |req: ClusterRequest| {
        let manager = manager.clone();
        async move { handle_cluster(&manager, req) }
    })
    .await
}

pub fn handle_cluster(manager: &Arc<StorageNodeManager>, req: ClusterRequest) -> ClusterResponse {
    match req {
        ClusterRequest::RegisterNode {
            ip,
            port,
            hostname,
            disks,
        } => {
            let (status, node_id) = manager.handle_register(&ip, port, &hostname, disks);
            ClusterResponse::Registered { status, node_id }
        }
        ClusterRequest::Heartbeat { node_id, .. } => {
            let (status, require_rereg) = manager.handle_heartbeat(&node_id);
            ClusterResponse::Heartbeat {
                status,
                require_rereg,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerConfig;
    use common::StatusCode;

    #[tokio::test]
    async fn cluster_register_then_heartbeat_round_trip() {
        let manager = StorageNodeManager::new(ManagerConfig::default());
        let ClusterResponse::Registered { status, node_id } = handle_cluster(
            &manager,
            ClusterRequest::RegisterNode {
                ip: "10.1.0.1".into(),
                port: 7402,
                hostname: "n1".into(),
                disks: Vec::new(),
            },
        ) else {
            panic!("wrong variant");
        };
        assert!(status.is_ok());

        let ClusterResponse::Heartbeat {
            status,
            require_rereg,
        } = handle_cluster(
            &manager,
            ClusterRequest::Heartbeat {
                node_id,
                timestamp_ms: 1,
                cpu_usage: 0.0,
                mem_usage: 0.0,
                in_flight_io: 0,
            },
        ) else {
            panic!("wrong variant");
        };
        assert!(status.is_ok());
        assert!(!require_rereg);
    }

    #[tokio::test]
    async fn heartbeat_for_forgotten_node_requires_rereg() {
        let manager = StorageNodeManager::new(ManagerConfig::default());
        let ClusterResponse::Heartbeat {
            status,
            require_rereg,
        } = handle_cluster(
            &manager,
            ClusterRequest::Heartbeat {
                node_id: "node-gone".into(),
                timestamp_ms: 1,
                cpu_usage: 0.0,
                mem_usage: 0.0,
                in_flight_io: 0,
            },
        ) else {
            panic!("wrong variant");
        };
        assert_eq!(status.code, StatusCode::NodeNotFound);
        assert!(require_rereg);
    }
}
