//! Per-user storage ceiling for the local index.

mod model;
mod service;

pub use model::{ByteCount, StorageLimit};
pub use service::StorageBudget;
