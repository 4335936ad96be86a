//! Wire service: maps the MDS request surface onto `MdsCore`.

use crate::core::{MdsCore, RegisteredNode};
use crate::error::MdsError;
use common::inode::{Inode, NodeClass, INO_NONE};
use common::wire::{DirEntryMsg, MdsRequest, MdsResponse};
use common::{Status, StatusCode};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

pub async fn run(listener: TcpListener, core: Arc<MdsCore>) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "mds service listening");
    common::frame::serve(listener, move |req: MdsRequest| {
        let core = core.clone();
        async move { handle(&core, req).await }
    })
    .await
}

fn status_of(result: Result<(), MdsError>) -> MdsResponse {
    MdsResponse::Status(match result {
        Ok(()) => Status::ok(),
        Err(err) => err.to_status(),
    })
}

pub async fn handle(core: &MdsCore, req: MdsRequest) -> MdsResponse {
    match req {
        MdsRequest::CreateRoot => status_of(core.create_root().await.map(|_| ())),
        MdsRequest::Mkdir { path, mode } => status_of(core.mkdir(&path, mode).await.map(|_| ())),
        MdsRequest::Rmdir { path } => status_of(core.rmdir(&path).await),
        MdsRequest::CreateFile { path, mode } => {
            status_of(core.create_file(&path, mode).await.map(|_| ()))
        }
        MdsRequest::RemoveFile { path } => match core.remove_file(&path).await {
            Ok(ino) => MdsResponse::Removed {
                status: Status::ok(),
                detached_inodes: vec![ino],
            },
            Err(err) => MdsResponse::Removed {
                status: err.to_status(),
                detached_inodes: Vec::new(),
            },
        },
        MdsRequest::TruncateFile { path } => match core.truncate_file(&path).await {
            Ok(inode) => MdsResponse::Truncated {
                status: Status::ok(),
                inode_blob: encode_or_empty(&inode),
            },
            Err(err) => MdsResponse::Truncated {
                status: err.to_status(),
                inode_blob: Vec::new(),
            },
        },
        MdsRequest::UpdateFileSize { ino, size_bytes } => {
            status_of(core.update_file_size(ino, size_bytes).map(|_| ()))
        }
        MdsRequest::Ls { path } => match core.ls(&path).await {
            Ok(entries) => MdsResponse::Listing {
                status: Status::ok(),
                entries: entries
                    .into_iter()
                    .map(|e| DirEntryMsg {
                        name: e.name,
                        ino: e.ino,
                        kind: e.kind.as_bits(),
                    })
                    .collect(),
            },
            Err(err) => MdsResponse::Listing {
                status: err.to_status(),
                entries: Vec::new(),
            },
        },
        MdsRequest::LookupIno { path } => MdsResponse::Ino {
            status: Status::ok(),
            ino: core.lookup_ino(&path),
        },
        MdsRequest::FindInode { path } => match core.find_inode_by_path(&path) {
            Ok(Some(inode)) => {
                let (node_id, volume_id) = core.locate(&inode);
                MdsResponse::Inode {
                    status: Status::ok(),
                    inode_blob: encode_or_empty(&inode),
                    volume_id,
                    node_id,
                }
            }
            Ok(None) => MdsResponse::Inode {
                status: Status::error(StatusCode::NodeNotFound, format!("no inode for {path}")),
                inode_blob: Vec::new(),
                volume_id: String::new(),
                node_id: String::new(),
            },
            Err(err) => MdsResponse::Inode {
                status: err.to_status(),
                inode_blob: Vec::new(),
                volume_id: String::new(),
                node_id: String::new(),
            },
        },
        MdsRequest::WriteInode { ino, inode_blob } => match Inode::decode_slot(&inode_blob) {
            Ok(inode) => status_of(core.write_inode(ino, &inode)),
            Err(err) => MdsResponse::Status(Status::error(
                StatusCode::InvalidArgument,
                err.to_string(),
            )),
        },
        MdsRequest::RegisterNode {
            node_id,
            ip,
            port,
            kind,
            capacity_bytes,
            free_bytes,
        } => {
            core.register_node(RegisteredNode {
                node_id,
                ip,
                port,
                kind,
                capacity_bytes,
                free_bytes,
            });
            MdsResponse::Status(Status::ok())
        }
        MdsRequest::RegisterVolume {
            volume_id,
            node_class,
            capacity_bytes,
        } => match NodeClass::from_bits(node_class) {
            Ok(class) => {
                core.register_volume(&volume_id, class, capacity_bytes);
                MdsResponse::Status(Status::ok())
            }
            Err(err) => MdsResponse::Status(Status::error(
                StatusCode::InvalidArgument,
                err.to_string(),
            )),
        },
        MdsRequest::CollectColdInodes {
            max_candidates,
            min_age_windows,
        } => MdsResponse::ColdInodes {
            status: Status::ok(),
            inodes: core.collect_cold_inodes(max_candidates as usize, min_age_windows),
        },
        MdsRequest::CollectColdInodesBitmap { age_windows } => {
            let bitmap = core.collect_cold_inodes_bitmap(age_windows);
            MdsResponse::ColdBitmap {
                status: Status::ok(),
                total_slots: bitmap.total_slots,
                bits: bitmap.bits,
            }
        }
        MdsRequest::CollectColdInodesByAtimePercent { percent } => MdsResponse::ColdInodes {
            status: Status::ok(),
            inodes: core.collect_cold_inodes_by_atime_percent(percent),
        },
        MdsRequest::RebuildInodeTable => status_of(core.rebuild_inode_table().map(|_| ())),
    }
}

fn encode_or_empty(inode: &Inode) -> Vec<u8> {
    inode.encode_slot().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MdsOptions;

    async fn core() -> (tempfile::TempDir, Arc<MdsCore>) {
        let dir = tempfile::tempdir().unwrap();
        let mut options = MdsOptions::new(dir.path());
        options.create_new = true;
        let core = MdsCore::open(options).unwrap();
        (dir, core)
    }

    #[tokio::test]
    async fn namespace_round_trip_over_handlers() {
        let (_dir, core) = core().await;
        assert!(matches!(
            handle(&core, MdsRequest::CreateRoot).await,
            MdsResponse::Status(st) if st.is_ok()
        ));
        assert!(matches!(
            handle(&core, MdsRequest::Mkdir { path: "/a".into(), mode: 0o755 }).await,
            MdsResponse::Status(st) if st.is_ok()
        ));
        assert!(matches!(
            handle(&core, MdsRequest::CreateFile { path: "/a/f".into(), mode: 0o644 }).await,
            MdsResponse::Status(st) if st.is_ok()
        ));

        let MdsResponse::Ino { ino, .. } =
            handle(&core, MdsRequest::LookupIno { path: "/a/f".into() }).await
        else {
            panic!("wrong response variant");
        };
        assert_ne!(ino, INO_NONE);

        let MdsResponse::Listing { entries, .. } =
            handle(&core, MdsRequest::Ls { path: "/a".into() }).await
        else {
            panic!("wrong response variant");
        };
        let files: Vec<_> = entries
            .iter()
            .filter(|e| e.name != "." && e.name != "..")
            .collect();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "f");

        let MdsResponse::Removed {
            status,
            detached_inodes,
        } = handle(&core, MdsRequest::RemoveFile { path: "/a/f".into() }).await
        else {
            panic!("wrong response variant");
        };
        assert!(status.is_ok());
        assert_eq!(detached_inodes, vec![ino as u64]);

        let MdsResponse::Ino { ino, .. } =
            handle(&core, MdsRequest::LookupIno { path: "/a/f".into() }).await
        else {
            panic!("wrong response variant");
        };
        assert_eq!(ino, INO_NONE);
    }

    #[tokio::test]
    async fn find_inode_returns_slot_blob() {
        let (_dir, core) = core().await;
        core.create_root().await.unwrap();
        core.create_file("/f", 0o644).await.unwrap();

        let MdsResponse::Inode {
            status, inode_blob, ..
        } = handle(&core, MdsRequest::FindInode { path: "/f".into() }).await
        else {
            panic!("wrong response variant");
        };
        assert!(status.is_ok());
        let inode = Inode::decode_slot(&inode_blob).unwrap();
        assert_eq!(inode.filename, "/f");
        assert_eq!(inode.kind, common::inode::FileKind::Regular);
    }

    #[tokio::test]
    async fn missing_path_maps_to_node_not_found() {
        let (_dir, core) = core().await;
        core.create_root().await.unwrap();
        let MdsResponse::Status(st) =
            handle(&core, MdsRequest::Rmdir { path: "/ghost".into() }).await
        else {
            panic!("wrong response variant");
        };
        assert_eq!(st.code, StatusCode::NodeNotFound);
    }
}
