//! Shared types for the tierfs services: wire status codes, the on-disk
//! inode slot codec, the RPC message surface and the frame transport.

pub mod frame;
pub mod inode;
pub mod status;
pub mod wire;

pub use status::{Status, StatusCode};
