//! Per-node storage daemon: chunk manifest, cached descriptors,
//! positioned I/O and the agent that keeps the node registered.

pub mod agent;
pub mod chunk;
pub mod disk;
pub mod fd_cache;
pub mod flags;
pub mod io_engine;
pub mod manifest;
pub mod service;

pub use chunk::ChunkService;
pub use fd_cache::FdCache;
pub use flags::OpenFlags;
pub use io_engine::{IoEngine, IoOptions, IoResult};
pub use manifest::ManifestLog;
