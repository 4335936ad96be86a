//! End-to-end namespace scenarios over the wire surface.

use common::frame::RpcChannel;
use common::inode::{Inode, InodeTimestamp, INO_NONE};
use common::wire::{MdsRequest, MdsResponse};
use mds::{MdsCore, MdsOptions};
use std::sync::Arc;
use tokio::net::TcpListener;

async fn spawn_mds(dir: &std::path::Path) -> (Arc<MdsCore>, RpcChannel) {
    let mut options = MdsOptions::new(dir);
    options.create_new = true;
    let core = MdsCore::open(options).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(mds::service::run(listener, core.clone()));
    (core, RpcChannel::new(addr.to_string()))
}

async fn call(channel: &RpcChannel, req: MdsRequest) -> MdsResponse {
    channel.call(&req).await.unwrap()
}

#[tokio::test]
async fn namespace_round_trip_over_tcp() {
    let dir = tempfile::tempdir().unwrap();
    let (_core, channel) = spawn_mds(dir.path()).await;

    let MdsResponse::Status(st) = call(&channel, MdsRequest::CreateRoot).await else {
        panic!("wrong variant");
    };
    assert!(st.is_ok());

    let MdsResponse::Status(st) = call(
        &channel,
        MdsRequest::Mkdir {
            path: "/a".into(),
            mode: 0o755,
        },
    )
    .await
    else {
        panic!("wrong variant");
    };
    assert!(st.is_ok());

    let MdsResponse::Status(st) = call(
        &channel,
        MdsRequest::CreateFile {
            path: "/a/f".into(),
            mode: 0o644,
        },
    )
    .await
    else {
        panic!("wrong variant");
    };
    assert!(st.is_ok());

    let MdsResponse::Ino { ino, .. } = call(
        &channel,
        MdsRequest::LookupIno {
            path: "/a/f".into(),
        },
    )
    .await
    else {
        panic!("wrong variant");
    };
    assert_ne!(ino, INO_NONE);

    let MdsResponse::Listing { entries, .. } = call(
        &channel,
        MdsRequest::Ls { path: "/a".into() },
    )
    .await
    else {
        panic!("wrong variant");
    };
    let named: Vec<_> = entries
        .iter()
        .filter(|e| e.name != "." && e.name != "..")
        .collect();
    assert_eq!(named.len(), 1);
    assert_eq!(named[0].name, "f");
    assert_eq!(named[0].kind, 1); // regular

    let MdsResponse::Removed { status, .. } = call(
        &channel,
        MdsRequest::RemoveFile {
            path: "/a/f".into(),
        },
    )
    .await
    else {
        panic!("wrong variant");
    };
    assert!(status.is_ok());

    let MdsResponse::Ino { ino, .. } = call(
        &channel,
        MdsRequest::LookupIno {
            path: "/a/f".into(),
        },
    )
    .await
    else {
        panic!("wrong variant");
    };
    assert_eq!(ino, INO_NONE);
}

#[tokio::test]
async fn cold_scans_over_the_wire_pick_oldest_atimes() {
    let dir = tempfile::tempdir().unwrap();
    let (core, channel) = spawn_mds(dir.path()).await;
    core.create_root().await.unwrap();

    // Five files with atime years 2020..2024; root itself is newer.
    let mut slots = Vec::new();
    for (i, year) in [20u8, 21, 22, 23, 24].iter().enumerate() {
        let ino = core.create_file(&format!("/f{i}"), 0o644).await.unwrap();
        let mut inode = core.read_inode(ino).unwrap();
        inode.fa_time = InodeTimestamp {
            year: *year,
            month: 6,
            day: 1,
            hour: 0,
            minute: 0,
        };
        core.write_inode(ino, &inode).unwrap();
        slots.push(ino);
    }

    let MdsResponse::ColdInodes { inodes, .. } = call(
        &channel,
        MdsRequest::CollectColdInodes {
            max_candidates: 3,
            min_age_windows: 0,
        },
    )
    .await
    else {
        panic!("wrong variant");
    };
    assert_eq!(inodes, slots[..3].to_vec());

    // ceil(40% of 6 allocated slots) = 3.
    let MdsResponse::ColdInodes { inodes, .. } = call(
        &channel,
        MdsRequest::CollectColdInodesByAtimePercent { percent: 40.0 },
    )
    .await
    else {
        panic!("wrong variant");
    };
    assert_eq!(inodes.len(), 3);
}

#[tokio::test]
async fn truncate_returns_refreshed_slot_blob() {
    let dir = tempfile::tempdir().unwrap();
    let (core, channel) = spawn_mds(dir.path()).await;
    core.create_root().await.unwrap();
    let ino = core.create_file("/big", 0o644).await.unwrap();
    core.update_file_size(ino, 2 << 20).unwrap();

    let MdsResponse::Truncated { status, inode_blob } = call(
        &channel,
        MdsRequest::TruncateFile {
            path: "/big".into(),
        },
    )
    .await
    else {
        panic!("wrong variant");
    };
    assert!(status.is_ok());
    let inode = Inode::decode_slot(&inode_blob).unwrap();
    assert_eq!(inode.size_bytes(), 0);
    assert_eq!(inode.ino, ino);
}
