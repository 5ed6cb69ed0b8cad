//! # vaultsearch-core
//!
//! On-device encrypted search indexing for an end-to-end encrypted mail client.
//!
//! This crate provides:
//! - An encrypted, per-user content index with oldest-first eviction (`SQLite`)
//! - Storage budgets with user-selectable limits
//! - Device condition monitoring (network, power, free storage)
//! - A per-user indexing worker with pause, resume and progress reporting
//! - **Encrypted Search Service** - the facade settings screens and search
//!   bars talk to

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod budget;
pub mod conditions;
pub mod config;
mod error;
pub mod index;
pub mod scheduler;
pub mod service;
pub mod settings;
mod user;

pub use budget::{ByteCount, StorageBudget, StorageLimit};
pub use conditions::{
    ConditionEvent, ConditionMonitor, ConditionSnapshot, PowerState, ThermalState, Transport,
};
pub use config::{IndexingConfig, Throughput};
pub use error::{Error, Result};
pub use index::{
    ContentIndexStore, IndexEntry, InsertOutcome, KeyError, KeyProvider, KeyringKeyProvider,
    MessageFields, SearchHit, SearchQuery, StaticKeyProvider,
};
pub use scheduler::{
    Advisory, DecryptError, IndexingProgress, IndexingState, MessageDecrypter, MessageEvent,
    MessageRef, MessageSource, PauseReason, SourceError, SpeedMode,
};
pub use service::EncryptedSearchService;
pub use settings::{IndexCursor, IndexingStats, SettingsRepository, UserSettings};
pub use user::{MessageId, UserId};
