//! Durable adapters for the `codedrop_transfer` ports.

mod blob;
mod repository;

pub use blob::LocalBlobStore;
pub use repository::{SqliteStore, StorageConfig};
