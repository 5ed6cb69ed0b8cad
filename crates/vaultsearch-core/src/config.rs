//! Tunables for the indexing worker.
//!
//! Loaded from `indexing.json` in the platform config directory. A missing
//! file yields the defaults, so embedders only write the keys they change.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::budget::ByteCount;

/// Throughput settings for one speed mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Throughput {
    /// Messages processed before the worker yields.
    pub batch_size: usize,
    /// Pause between batches, in milliseconds.
    pub batch_delay_ms: u64,
}

impl Throughput {
    /// Delay between two batches.
    #[must_use]
    pub const fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

/// Indexing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    /// Used while the indexing screen is visible.
    pub foreground: Throughput,
    /// Used otherwise, and while the device runs hot.
    pub background: Throughput,
    /// Upper bound for fetching and decrypting one message, in milliseconds.
    pub item_timeout_ms: u64,
    /// Consecutive per-message failures before indexing pauses.
    pub max_consecutive_failures: u32,
    /// Free device storage below which indexing pauses.
    pub low_device_storage: ByteCount,
    /// Battery level (0.0 to 1.0) below which indexing pauses.
    pub min_battery_level: f32,
    /// Weight of the newest sample in the per-message duration average.
    pub eta_smoothing: f64,
    /// Samples required before a remaining time is reported.
    pub eta_warmup_samples: u32,
    /// Storage limit for users that never picked one.
    pub default_storage_limit: ByteCount,
    /// Index database location. Uses the platform data directory if unset.
    pub database_path: Option<PathBuf>,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            foreground: Throughput {
                batch_size: 50,
                batch_delay_ms: 0,
            },
            background: Throughput {
                batch_size: 8,
                batch_delay_ms: 250,
            },
            item_timeout_ms: 30_000,
            max_consecutive_failures: 25,
            low_device_storage: ByteCount::from_megabytes(100),
            min_battery_level: 0.2,
            eta_smoothing: 0.2,
            eta_warmup_samples: 3,
            default_storage_limit: ByteCount::from_megabytes(1_000),
            database_path: None,
        }
    }
}

impl IndexingConfig {
    /// Per-message timeout.
    #[must_use]
    pub const fn item_timeout(&self) -> Duration {
        Duration::from_millis(self.item_timeout_ms)
    }

    /// Configured database location, or the platform default.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(Self::default_database_path)
    }

    /// Default location of the configuration file.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vaultsearch")
            .join("indexing.json")
    }

    /// Default location of the index database.
    #[must_use]
    pub fn default_database_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vaultsearch")
            .join("index.db")
    }

    /// Load the configuration, falling back to defaults if the file is absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn load(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(Self::default());
        }

        let contents = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Save the configuration, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let contents = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, contents).await?;

        tracing::info!("Indexing config saved to {:?}", path);
        Ok(())
    }
}
