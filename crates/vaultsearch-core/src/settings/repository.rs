//! Settings storage repository.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use super::model::{IndexCursor, IndexingStats, UserSettings};
use crate::budget::ByteCount;
use crate::scheduler::IndexingState;
use crate::{MessageId, Result, UserId};

/// Repository for per-user indexing settings.
///
/// Every setter touches only its own columns, so the storage limit chosen in
/// the settings screen and the progress written by the worker never
/// overwrite each other.
pub struct SettingsRepository {
    pool: SqlitePool,
}

impl SettingsRepository {
    /// Create a new repository with the given database path.
    ///
    /// Creates the database and tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn new(database_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let repo = Self { pool };
        repo.initialize().await?;
        Ok(repo)
    }

    /// Create an in-memory repository for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let repo = Self { pool };
        repo.initialize().await?;
        Ok(repo)
    }

    /// Initialize database schema.
    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS search_settings (
                user_id TEXT PRIMARY KEY,
                enabled INTEGER NOT NULL DEFAULT 0,
                allow_cellular INTEGER NOT NULL DEFAULT 0,
                storage_limit INTEGER,
                paused_by_user INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL DEFAULT 'disabled',
                cursor_time INTEGER,
                cursor_message_id TEXT,
                processed INTEGER NOT NULL DEFAULT 0,
                total INTEGER NOT NULL DEFAULT 0,
                pause_count INTEGER NOT NULL DEFAULT 0,
                interruption_count INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn ensure_row(&self, user_id: &UserId) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO search_settings (user_id, updated_at) VALUES (?, ?)")
            .bind(user_id.as_str())
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Get the settings of a user, if any were ever saved.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, user_id: &UserId) -> Result<Option<UserSettings>> {
        let row = sqlx::query(
            r"
            SELECT enabled, allow_cellular, storage_limit, paused_by_user, state,
                   cursor_time, cursor_message_id, processed, total,
                   pause_count, interruption_count, updated_at
            FROM search_settings
            WHERE user_id = ?
            ",
        )
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let settings = row.map(|row| {
            let cursor_time: Option<i64> = row.get("cursor_time");
            let cursor_message_id: Option<String> = row.get("cursor_message_id");
            let cursor = cursor_time.zip(cursor_message_id).map(|(time, id)| IndexCursor {
                message_time: DateTime::from_timestamp(time, 0).unwrap_or_default(),
                message_id: MessageId(id),
            });
            let updated_at_str: String = row.get("updated_at");
            let updated_at = DateTime::parse_from_rfc3339(&updated_at_str)
                .map_or_else(|_| Utc::now(), |t| t.with_timezone(&Utc));
            let state_str: String = row.get("state");

            UserSettings {
                user_id: user_id.clone(),
                enabled: row.get::<bool, _>("enabled"),
                allow_cellular: row.get::<bool, _>("allow_cellular"),
                storage_limit: row.get::<Option<i64>, _>("storage_limit").map(ByteCount::from_sql),
                paused_by_user: row.get::<bool, _>("paused_by_user"),
                state: IndexingState::parse(&state_str),
                cursor,
                stats: IndexingStats {
                    processed: u64::try_from(row.get::<i64, _>("processed")).unwrap_or(0),
                    total: u64::try_from(row.get::<i64, _>("total")).unwrap_or(0),
                    pause_count: row.get::<u32, _>("pause_count"),
                    interruption_count: row.get::<u32, _>("interruption_count"),
                },
                updated_at,
            }
        });

        Ok(settings)
    }

    /// Get the settings of a user, or the defaults for a new user.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get_or_default(&self, user_id: &UserId) -> Result<UserSettings> {
        Ok(self
            .get(user_id)
            .await?
            .unwrap_or_else(|| UserSettings::new(user_id.clone())))
    }

    /// Switch encrypted search on or off.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn set_enabled(&self, user_id: &UserId, enabled: bool) -> Result<()> {
        self.ensure_row(user_id).await?;
        sqlx::query("UPDATE search_settings SET enabled = ?, updated_at = ? WHERE user_id = ?")
            .bind(enabled)
            .bind(Utc::now().to_rfc3339())
            .bind(user_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Allow or forbid indexing over cellular data.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn set_allow_cellular(&self, user_id: &UserId, allowed: bool) -> Result<()> {
        self.ensure_row(user_id).await?;
        sqlx::query(
            "UPDATE search_settings SET allow_cellular = ?, updated_at = ? WHERE user_id = ?",
        )
        .bind(allowed)
        .bind(Utc::now().to_rfc3339())
        .bind(user_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Store the storage limit picked by the user.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn set_storage_limit(&self, user_id: &UserId, limit: ByteCount) -> Result<()> {
        self.ensure_row(user_id).await?;
        sqlx::query(
            "UPDATE search_settings SET storage_limit = ?, updated_at = ? WHERE user_id = ?",
        )
        .bind(limit.to_sql())
        .bind(Utc::now().to_rfc3339())
        .bind(user_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remember whether the user paused indexing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn set_paused_by_user(&self, user_id: &UserId, paused: bool) -> Result<()> {
        self.ensure_row(user_id).await?;
        sqlx::query(
            "UPDATE search_settings SET paused_by_user = ?, updated_at = ? WHERE user_id = ?",
        )
        .bind(paused)
        .bind(Utc::now().to_rfc3339())
        .bind(user_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Store the current state, resume position and progress counters.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn save_progress(
        &self,
        user_id: &UserId,
        state: &IndexingState,
        cursor: Option<&IndexCursor>,
        stats: &IndexingStats,
    ) -> Result<()> {
        self.ensure_row(user_id).await?;
        sqlx::query(
            r"
            UPDATE search_settings
            SET state = ?, cursor_time = ?, cursor_message_id = ?,
                processed = ?, total = ?, pause_count = ?, interruption_count = ?,
                updated_at = ?
            WHERE user_id = ?
            ",
        )
        .bind(state.as_str())
        .bind(cursor.map(|c| c.message_time.timestamp()))
        .bind(cursor.map(|c| c.message_id.as_str().to_string()))
        .bind(i64::try_from(stats.processed).unwrap_or(i64::MAX))
        .bind(i64::try_from(stats.total).unwrap_or(i64::MAX))
        .bind(stats.pause_count)
        .bind(stats.interruption_count)
        .bind(Utc::now().to_rfc3339())
        .bind(user_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Forget everything about a user's index except their preferences.
    ///
    /// The cellular permission and storage limit survive so that re-enabling
    /// search restores them.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn reset_progress(&self, user_id: &UserId) -> Result<()> {
        sqlx::query(
            r"
            UPDATE search_settings
            SET enabled = 0, paused_by_user = 0, state = 'disabled',
                cursor_time = NULL, cursor_message_id = NULL,
                processed = 0, total = 0, updated_at = ?
            WHERE user_id = ?
            ",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(user_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

impl std::fmt::Debug for SettingsRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsRepository").finish_non_exhaustive()
    }
}
