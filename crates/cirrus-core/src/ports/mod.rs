//! Port definitions (hexagonal architecture interfaces)
//!
//! Ports are the interfaces the engine core depends on; their
//! implementations live in adapter crates (or test doubles).
//!
//! ## Ports Overview
//!
//! - [`IRemoteGateway`] - Cloud storage change feed and content transfer
//! - [`ILocalFileSystem`] - Local mirror I/O, fingerprinting, staging
//! - [`IStateStore`] - Durable items, cursor, transfer queue, conflicts

pub mod local_filesystem;
pub mod remote_gateway;
pub mod state_store;

pub use local_filesystem::{FsEntry, ILocalFileSystem};
pub use remote_gateway::{ChangePage, IRemoteGateway, RemoteChange};
pub use state_store::IStateStore;
