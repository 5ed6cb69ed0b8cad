//! Encrypted, searchable index of message content.
//!
//! Each user owns an independent partition of the index. Rows are sealed
//! with a key derived from the user's mail key material and evicted oldest
//! first when the partition would outgrow its storage limit.

mod cipher;
mod keys;
mod model;
mod query;
mod repository;

pub use cipher::IndexCipher;
pub use keys::{KeyError, KeyProvider, KeyringKeyProvider, StaticKeyProvider};
pub use model::{IndexEntry, InsertOutcome, MessageFields, SearchHit};
pub use query::SearchQuery;
pub use repository::ContentIndexStore;
