//! Typed request/response envelopes for the three service surfaces.
//!
//! The wire encoding is deliberately opaque to the rest of the system:
//! these enums are serialized with bincode inside length-prefixed frames
//! (see [`crate::frame`]). Inodes travel as raw slot bytes.

use crate::status::Status;
use serde::{Deserialize, Serialize};

/// Disk report carried by node registration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    pub mount_point: String,
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// Node flavor as seen by the cluster manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Real,
    Virtual,
}

/// Directory listing entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntryMsg {
    pub name: String,
    pub ino: u64,
    pub kind: u8,
}

/// Metadata service surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MdsRequest {
    CreateRoot,
    Mkdir { path: String, mode: u16 },
    Rmdir { path: String },
    CreateFile { path: String, mode: u16 },
    RemoveFile { path: String },
    TruncateFile { path: String },
    UpdateFileSize { ino: u64, size_bytes: u64 },
    Ls { path: String },
    LookupIno { path: String },
    FindInode { path: String },
    WriteInode { ino: u64, inode_blob: Vec<u8> },
    RegisterNode { node_id: String, ip: String, port: u32, kind: NodeKind, capacity_bytes: u64, free_bytes: u64 },
    RegisterVolume { volume_id: String, node_class: u8, capacity_bytes: u64 },
    CollectColdInodes { max_candidates: u64, min_age_windows: u64 },
    CollectColdInodesBitmap { age_windows: u64 },
    CollectColdInodesByAtimePercent { percent: f64 },
    RebuildInodeTable,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MdsResponse {
    Status(Status),
    Removed { status: Status, detached_inodes: Vec<u64> },
    Truncated { status: Status, inode_blob: Vec<u8> },
    Listing { status: Status, entries: Vec<DirEntryMsg> },
    Ino { status: Status, ino: i64 },
    Inode { status: Status, inode_blob: Vec<u8>, volume_id: String, node_id: String },
    ColdInodes { status: Status, inodes: Vec<u64> },
    ColdBitmap { status: Status, total_slots: u64, bits: Vec<u8> },
}

/// Data-plane surface exposed by the gateway and by storage nodes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum StorageRequest {
    Write { node_id: String, chunk_id: u64, offset: u64, data: Vec<u8>, checksum: u32, flags: i32, mode: u32 },
    Read { node_id: String, chunk_id: u64, offset: u64, length: u64, flags: i32 },
    Truncate { node_id: String, chunk_id: u64, size: u64 },
    UnmountDisk { node_id: String, mount_point: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum StorageResponse {
    Write { status: Status, bytes_written: u64 },
    Read { status: Status, bytes_read: u64, data: Vec<u8>, checksum: u32 },
    Status(Status),
}

/// Cluster management surface (node agents talk to this).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ClusterRequest {
    RegisterNode { ip: String, port: u32, hostname: String, disks: Vec<DiskInfo> },
    Heartbeat { node_id: String, timestamp_ms: u64, cpu_usage: f64, mem_usage: f64, in_flight_io: u64 },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ClusterResponse {
    Registered { status: Status, node_id: String },
    Heartbeat { status: Status, require_rereg: bool },
}
