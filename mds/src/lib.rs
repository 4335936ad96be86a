//! Metadata service: namespace tree, inode slots, directory pages and the
//! cold-inode collector.

pub mod alloc;
pub mod collector;
pub mod core;
pub mod dirlock;
pub mod dirstore;
pub mod error;
pub mod pathkv;
pub mod service;
pub mod store;
pub mod volume;

pub use crate::core::{HandleObserver, MdsCore, MdsOptions};
pub use error::MdsError;
