//! Queue module: the durable ordered store, its on-disk format, and the
//! dependency helpers the coordinator applies to it.

pub mod dependency;
mod persistence;
mod store;

pub use persistence::BlobFile;
pub use store::{DurableStore, StoreEntry, StoreLocation, TaskStore};
