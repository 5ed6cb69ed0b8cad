//! Persisted per-user indexing settings and progress.

mod model;
mod repository;

pub use model::{IndexCursor, IndexingStats, UserSettings};
pub use repository::SettingsRepository;
