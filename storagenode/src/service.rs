//! Wire service of the storage daemon: the same data-plane surface the
//! gateway speaks, served directly off the chunk service.

use crate::chunk::ChunkService;
use common::Status;
use common::wire::{StorageRequest, StorageResponse};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

pub async fn run(listener: TcpListener, chunks: Arc<ChunkService>) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "storage service listening");
    common::frame::serve(listener, move |req: StorageRequest| {
        let chunks = chunks.clone();
        async move { handle(&chunks, req) }
    })
    .await
}

pub fn handle(chunks: &ChunkService, req: StorageRequest) -> StorageResponse {
    match req {
        StorageRequest::Write {
            chunk_id,
            offset,
            data,
            checksum,
            flags,
            mode,
            ..
        } => {
            let (status, bytes_written) =
                chunks.write(chunk_id, offset, &data, checksum, flags, mode);
            StorageResponse::Write {
                status,
                bytes_written,
            }
        }
        StorageRequest::Read {
            chunk_id,
            offset,
            length,
            flags,
            ..
        } => {
            let (status, data, checksum) = chunks.read(chunk_id, offset, length, flags);
            StorageResponse::Read {
                status,
                bytes_read: data.len() as u64,
                data,
                checksum,
            }
        }
        StorageRequest::Truncate { chunk_id, size, .. } => {
            StorageResponse::Status(chunks.truncate(chunk_id, size))
        }
        StorageRequest::UnmountDisk { mount_point, .. } => {
            // Mount orchestration is the operator's job; acknowledging
            // keeps the surface uniform for the gateway.
            info!(mount_point, "unmount requested, nothing to do");
            StorageResponse::Status(Status::ok())
        }
    }
}
