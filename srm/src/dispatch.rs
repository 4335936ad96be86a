//! Data-plane dispatch: virtual nodes complete in-process, real nodes get
//! a persistent stub from the cache.

use crate::engine::VirtualNodeEngine;
use crate::manager::StorageNodeManager;
use crate::registry::{NodeContext, NodeType};
use common::frame::RpcChannel;
use common::wire::{StorageRequest, StorageResponse};
use common::{Status, StatusCode};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// One channel per node id, dialed lazily against `ip:port` and never
/// evicted for the gateway's lifetime.
#[derive(Default)]
pub struct StubCache {
    stubs: Mutex<HashMap<String, Arc<RpcChannel>>>,
}

impl StubCache {
    pub fn get(&self, ctx: &NodeContext) -> Arc<RpcChannel> {
        let mut stubs = self.stubs.lock().expect("stub cache poisoned");
        stubs
            .entry(ctx.node_id.clone())
            .or_insert_with(|| {
                let addr = format!("{}:{}", ctx.ip, ctx.port);
                debug!(node = %ctx.node_id, %addr, "creating storage stub");
                Arc::new(RpcChannel::new(addr))
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.stubs.lock().expect("stub cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct RequestDispatcher {
    manager: Arc<StorageNodeManager>,
    engine: Arc<VirtualNodeEngine>,
    stubs: StubCache,
}

enum Route {
    Virtual,
    Real(Arc<RpcChannel>),
}

impl RequestDispatcher {
    pub fn new(manager: Arc<StorageNodeManager>, engine: Arc<VirtualNodeEngine>) -> Self {
        RequestDispatcher {
            manager,
            engine,
            stubs: StubCache::default(),
        }
    }

    /// Validates the node id and resolves it to a route. No registry lock
    /// is held once the context has been copied out.
    fn route(&self, node_id: &str) -> Result<Route, Status> {
        if node_id.is_empty() {
            return Err(Status::error(StatusCode::InvalidArgument, "missing node_id"));
        }
        let ctx = self
            .manager
            .get_node(node_id)
            .ok_or_else(|| Status::error(StatusCode::NodeNotFound, "unknown node"))?;
        Ok(match ctx.node_type {
            NodeType::Virtual => Route::Virtual,
            NodeType::Real => Route::Real(self.stubs.get(&ctx)),
        })
    }

    pub async fn dispatch(&self, req: StorageRequest) -> StorageResponse {
        match req {
            StorageRequest::Write {
                ref node_id,
                ref data,
                ..
            } => match self.route(node_id) {
                Err(status) => StorageResponse::Write {
                    status,
                    bytes_written: 0,
                },
                Ok(Route::Virtual) => self.engine.simulate_write(data).await,
                Ok(Route::Real(stub)) => match stub.call(&req).await {
                    Ok(resp) => resp,
                    Err(status) => StorageResponse::Write {
                        status,
                        bytes_written: 0,
                    },
                },
            },
            StorageRequest::Read {
                ref node_id,
                length,
                ..
            } => match self.route(node_id) {
                Err(status) => StorageResponse::Read {
                    status,
                    bytes_read: 0,
                    data: Vec::new(),
                    checksum: 0,
                },
                Ok(Route::Virtual) => self.engine.simulate_read(length).await,
                Ok(Route::Real(stub)) => match stub.call(&req).await {
                    Ok(resp) => resp,
                    Err(status) => StorageResponse::Read {
                        status,
                        bytes_read: 0,
                        data: Vec::new(),
                        checksum: 0,
                    },
                },
            },
            StorageRequest::Truncate { ref node_id, .. }
            | StorageRequest::UnmountDisk { ref node_id, .. } => match self.route(node_id) {
                Err(status) => StorageResponse::Status(status),
                Ok(Route::Virtual) => match req {
                    StorageRequest::Truncate { .. } => self.engine.simulate_truncate().await,
                    _ => StorageResponse::Status(Status::ok()),
                },
                Ok(Route::Real(stub)) => match stub.call(&req).await {
                    Ok(resp) => resp,
                    Err(status) => StorageResponse::Status(status),
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SimulationConfig;
    use crate::manager::ManagerConfig;
    use crate::registry::SimulationParams;

    fn dispatcher() -> (Arc<StorageNodeManager>, RequestDispatcher) {
        let manager = StorageNodeManager::new(ManagerConfig::default());
        let engine = Arc::new(VirtualNodeEngine::new(SimulationConfig {
            min_latency_ms: 0,
            max_latency_ms: 0,
            failure_rate: 0.0,
            default_read_size: 4096,
        }));
        let dispatcher = RequestDispatcher::new(manager.clone(), engine);
        (manager, dispatcher)
    }

    fn write_req(node_id: &str, data: &[u8]) -> StorageRequest {
        StorageRequest::Write {
            node_id: node_id.to_string(),
            chunk_id: 1,
            offset: 0,
            data: data.to_vec(),
            checksum: 0,
            flags: 0,
            mode: 0o644,
        }
    }

    #[tokio::test]
    async fn empty_node_id_is_invalid_argument() {
        let (_mgr, dispatcher) = dispatcher();
        let StorageResponse::Write { status, .. } = dispatcher.dispatch(write_req("", b"x")).await
        else {
            panic!("wrong variant");
        };
        assert_eq!(status.code, StatusCode::InvalidArgument);
    }

    #[tokio::test]
    async fn unknown_node_is_node_not_found() {
        let (_mgr, dispatcher) = dispatcher();
        let StorageResponse::Write { status, .. } =
            dispatcher.dispatch(write_req("U", b"x")).await
        else {
            panic!("wrong variant");
        };
        assert_eq!(status.code, StatusCode::NodeNotFound);
    }

    #[tokio::test]
    async fn virtual_node_write_completes_in_process() {
        let (mgr, dispatcher) = dispatcher();
        mgr.add_virtual_node("V", SimulationParams::default(), 1 << 30);

        let StorageResponse::Write {
            status,
            bytes_written,
        } = dispatcher.dispatch(write_req("V", b"abc")).await
        else {
            panic!("wrong variant");
        };
        assert!(status.is_ok());
        assert_eq!(bytes_written, 3);
        // Virtual dispatch never allocates a stub.
        assert!(dispatcher.stubs.is_empty());
    }

    #[tokio::test]
    async fn unreachable_real_node_maps_to_network_error() {
        let (mgr, dispatcher) = dispatcher();
        // A real node whose endpoint nothing listens on.
        let mut ctx = NodeContext::new("R");
        ctx.ip = "127.0.0.1".to_string();
        ctx.port = 1;
        mgr.registry().upsert(ctx);

        let StorageResponse::Write { status, .. } =
            dispatcher.dispatch(write_req("R", b"x")).await
        else {
            panic!("wrong variant");
        };
        assert_eq!(status.code, StatusCode::NetworkError);
        // The stub stays cached for the next attempt.
        assert_eq!(dispatcher.stubs.len(), 1);
    }
}
