//! Encrypted content index storage.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::cipher::IndexCipher;
use super::keys::{KeyError, KeyProvider};
use super::model::{IndexEntry, InsertOutcome, MessageFields, SearchHit};
use super::query::SearchQuery;
use crate::budget::ByteCount;
use crate::{MessageId, Result, UserId};

/// Repository holding every user's encrypted index partition.
///
/// Rows are keyed by `(user_id, message_id)`. The per-user usage counter is
/// the sum of the stored row sizes and is read and changed inside the same
/// transaction as every insert and eviction.
pub struct ContentIndexStore {
    pool: SqlitePool,
    keys: Arc<dyn KeyProvider>,
    ciphers: Mutex<HashMap<UserId, Arc<IndexCipher>>>,
}

impl ContentIndexStore {
    /// Create a new store with the given database path.
    ///
    /// Creates the database and tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn new(database_path: &str, keys: Arc<dyn KeyProvider>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self::with_pool(pool, keys);
        store.initialize().await?;
        Ok(store)
    }

    /// Create an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn in_memory(keys: Arc<dyn KeyProvider>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self::with_pool(pool, keys);
        store.initialize().await?;
        Ok(store)
    }

    fn with_pool(pool: SqlitePool, keys: Arc<dyn KeyProvider>) -> Self {
        Self {
            pool,
            keys,
            ciphers: Mutex::new(HashMap::new()),
        }
    }

    /// Initialize database schema.
    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS index_entries (
                user_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                message_time INTEGER NOT NULL,
                payload BLOB NOT NULL,
                size INTEGER NOT NULL,
                indexed_at TEXT NOT NULL,
                PRIMARY KEY(user_id, message_id)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        // Eviction and "oldest indexed" both walk this order
        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_entries_age
            ON index_entries(user_id, message_time, message_id)
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn cipher(&self, user_id: &UserId) -> Result<Arc<IndexCipher>> {
        if let Some(cipher) = self.ciphers.lock().await.get(user_id) {
            return Ok(Arc::clone(cipher));
        }

        // The cache lock is never held across a key lookup.
        let keys = Arc::clone(&self.keys);
        let owner = user_id.clone();
        let material = tokio::task::spawn_blocking(move || keys.key_material(&owner))
            .await
            .map_err(|_| KeyError::Interrupted)??;
        let derived = Arc::new(IndexCipher::derive(&material, user_id)?);

        let mut ciphers = self.ciphers.lock().await;
        let cipher = ciphers.entry(user_id.clone()).or_insert(derived);
        Ok(Arc::clone(cipher))
    }

    async fn open_fields(
        &self,
        user_id: &UserId,
        message_id: &MessageId,
        payload: &[u8],
    ) -> Result<MessageFields> {
        let plaintext = self.cipher(user_id).await?.open(user_id, message_id, payload)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Insert or replace an entry, evicting the oldest entries of the same
    /// user until the partition fits within `limit`.
    ///
    /// Replacing an entry never counts its previous version against the limit.
    /// If the entry alone is larger than `limit` nothing is changed.
    ///
    /// # Errors
    ///
    /// Returns an error if sealing or the database transaction fails.
    pub async fn insert(&self, entry: &IndexEntry, limit: ByteCount) -> Result<InsertOutcome> {
        let plaintext = serde_json::to_vec(&entry.fields)?;
        let size = IndexEntry::stored_size_of(plaintext.len(), &entry.message_id);
        if size > limit {
            return Ok(InsertOutcome::ExceedsLimit { size });
        }

        let payload = self
            .cipher(&entry.user_id)
            .await?
            .seal(&entry.user_id, &entry.message_id, &plaintext)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM index_entries WHERE user_id = ? AND message_id = ?")
            .bind(entry.user_id.as_str())
            .bind(entry.message_id.as_str())
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query(
            "SELECT COALESCE(SUM(size), 0) AS usage FROM index_entries WHERE user_id = ?",
        )
        .bind(entry.user_id.as_str())
        .fetch_one(&mut *tx)
        .await?;
        let mut usage = ByteCount::from_sql(row.get("usage"));

        let mut evicted = Vec::new();
        while usage.saturating_add(size) > limit {
            let oldest = sqlx::query(
                r"
                SELECT message_id, size FROM index_entries
                WHERE user_id = ?
                ORDER BY message_time ASC, message_id ASC
                LIMIT 1
                ",
            )
            .bind(entry.user_id.as_str())
            .fetch_optional(&mut *tx)
            .await?;

            let Some(oldest) = oldest else { break };
            let oldest_id: String = oldest.get("message_id");
            let oldest_size = ByteCount::from_sql(oldest.get("size"));

            sqlx::query("DELETE FROM index_entries WHERE user_id = ? AND message_id = ?")
                .bind(entry.user_id.as_str())
                .bind(&oldest_id)
                .execute(&mut *tx)
                .await?;

            usage = usage.saturating_sub(oldest_size);
            evicted.push(MessageId(oldest_id));
        }

        sqlx::query(
            r"
            INSERT INTO index_entries
                (user_id, message_id, message_time, payload, size, indexed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(entry.user_id.as_str())
        .bind(entry.message_id.as_str())
        .bind(entry.message_time.timestamp())
        .bind(&payload)
        .bind(size.to_sql())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if !evicted.is_empty() {
            debug!(
                "Evicted {} entries for user {} to stay within {}",
                evicted.len(),
                entry.user_id,
                limit
            );
        }

        Ok(InsertOutcome::Stored { evicted })
    }

    /// Get an entry by message.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the row cannot be decrypted.
    pub async fn get(&self, user_id: &UserId, message_id: &MessageId) -> Result<Option<IndexEntry>> {
        let row = sqlx::query(
            r"
            SELECT message_time, payload FROM index_entries
            WHERE user_id = ? AND message_id = ?
            ",
        )
        .bind(user_id.as_str())
        .bind(message_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let payload: Vec<u8> = row.get("payload");
        let fields = self.open_fields(user_id, message_id, &payload).await?;

        Ok(Some(IndexEntry::new(
            user_id.clone(),
            message_id.clone(),
            timestamp_to_utc(row.get("message_time")),
            fields,
        )))
    }

    /// Check whether a message is indexed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn contains(&self, user_id: &UserId, message_id: &MessageId) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM index_entries WHERE user_id = ? AND message_id = ?",
        )
        .bind(user_id.as_str())
        .bind(message_id.as_str())
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = row.get("count");
        Ok(count > 0)
    }

    /// Remove one entry. Returns true if it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn remove(&self, user_id: &UserId, message_id: &MessageId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM index_entries WHERE user_id = ? AND message_id = ?")
            .bind(user_id.as_str())
            .bind(message_id.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove every entry of a user. Returns the number of removed entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn remove_all(&self, user_id: &UserId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM index_entries WHERE user_id = ?")
            .bind(user_id.as_str())
            .execute(&self.pool)
            .await?;

        self.ciphers.lock().await.remove(user_id);
        let keys = Arc::clone(&self.keys);
        let owner = user_id.clone();
        let forgotten = tokio::task::spawn_blocking(move || keys.forget(&owner))
            .await
            .map_err(|_| KeyError::Interrupted);
        if let Err(e) = forgotten.and_then(|r| r) {
            warn!("Index rows of user {user_id} removed but key material was kept: {e}");
        }
        Ok(result.rows_affected())
    }

    /// Evict the oldest entries until the partition fits within `limit`.
    /// Returns the evicted messages, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database transaction fails.
    pub async fn shrink_to(&self, user_id: &UserId, limit: ByteCount) -> Result<Vec<MessageId>> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r"
            SELECT message_id, size FROM index_entries
            WHERE user_id = ?
            ORDER BY message_time ASC, message_id ASC
            ",
        )
        .bind(user_id.as_str())
        .fetch_all(&mut *tx)
        .await?;

        let mut usage = rows
            .iter()
            .map(|row| ByteCount::from_sql(row.get("size")))
            .fold(ByteCount::ZERO, ByteCount::saturating_add);

        let mut evicted = Vec::new();
        for row in &rows {
            if usage <= limit {
                break;
            }
            let message_id: String = row.get("message_id");
            sqlx::query("DELETE FROM index_entries WHERE user_id = ? AND message_id = ?")
                .bind(user_id.as_str())
                .bind(&message_id)
                .execute(&mut *tx)
                .await?;
            usage = usage.saturating_sub(ByteCount::from_sql(row.get("size")));
            evicted.push(MessageId(message_id));
        }

        tx.commit().await?;

        if !evicted.is_empty() {
            debug!("Shrunk index of user {user_id} by {} entries to {usage}", evicted.len());
        }
        Ok(evicted)
    }

    /// Current size of a user's partition.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn size_on_disk(&self, user_id: &UserId) -> Result<ByteCount> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(size), 0) AS usage FROM index_entries WHERE user_id = ?",
        )
        .bind(user_id.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(ByteCount::from_sql(row.get("usage")))
    }

    /// Number of entries in a user's partition.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn count(&self, user_id: &UserId) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM index_entries WHERE user_id = ?")
            .bind(user_id.as_str())
            .fetch_one(&self.pool)
            .await?;

        let count: i64 = row.get("count");
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Time of the oldest indexed message.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn oldest_entry_time(&self, user_id: &UserId) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT MIN(message_time) AS oldest FROM index_entries WHERE user_id = ?",
        )
        .bind(user_id.as_str())
        .fetch_one(&self.pool)
        .await?;

        let oldest: Option<i64> = row.get("oldest");
        Ok(oldest.map(timestamp_to_utc))
    }

    /// Search a user's partition, newest messages first.
    ///
    /// Rows that fail to decrypt are skipped and logged.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn search(
        &self,
        user_id: &UserId,
        query: &SearchQuery,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        if query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r"
            SELECT message_id, message_time, payload FROM index_entries
            WHERE user_id = ?
            ORDER BY message_time DESC, message_id DESC
            ",
        )
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut hits = Vec::new();
        for row in rows {
            let message_id = MessageId(row.get("message_id"));
            let payload: Vec<u8> = row.get("payload");
            let fields = match self.open_fields(user_id, &message_id, &payload).await {
                Ok(fields) => fields,
                Err(e) => {
                    warn!("Skipping unreadable index row {message_id} of user {user_id}: {e}");
                    continue;
                }
            };

            if query.matches(&fields) {
                hits.push(SearchHit {
                    snippet: query.snippet(&fields.body),
                    message_id,
                    message_time: timestamp_to_utc(row.get("message_time")),
                    subject: fields.subject,
                    sender: fields.sender,
                });
                if hits.len() >= limit {
                    break;
                }
            }
        }

        Ok(hits)
    }
}

impl std::fmt::Debug for ContentIndexStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentIndexStore").finish_non_exhaustive()
    }
}

fn timestamp_to_utc(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds, 0).unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::index::StaticKeyProvider;

    async fn store() -> ContentIndexStore {
        ContentIndexStore::in_memory(Arc::new(StaticKeyProvider::shared(b"test material".to_vec())))
            .await
            .unwrap()
    }

    fn entry(user: &str, id: &str, time: i64, body: &str) -> IndexEntry {
        IndexEntry::new(
            UserId::new(user),
            MessageId::new(id),
            DateTime::from_timestamp(time, 0).unwrap(),
            MessageFields {
                subject: format!("Subject {id}"),
                body: body.to_string(),
                sender: "alice@example.com".to_string(),
                recipients: vec!["bob@example.com".to_string()],
            },
        )
    }

    const UNLIMITED: ByteCount = ByteCount(u64::MAX / 2);

    /// Blocks the calling thread while looking up one user's material.
    struct SlowKeys {
        slow: UserId,
    }

    impl KeyProvider for SlowKeys {
        fn key_material(&self, user_id: &UserId) -> std::result::Result<Vec<u8>, KeyError> {
            if *user_id == self.slow {
                std::thread::sleep(std::time::Duration::from_millis(1_500));
            }
            Ok(b"slow material".to_vec())
        }
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = store().await;
        let e = entry("u1", "m1", 100, "hello world");

        store.insert(&e, UNLIMITED).await.unwrap();

        let fetched = store.get(&e.user_id, &e.message_id).await.unwrap().unwrap();
        assert_eq!(fetched, e);
        assert_eq!(store.size_on_disk(&e.user_id).await.unwrap(), e.stored_size().unwrap());
    }

    #[tokio::test]
    async fn test_insert_replaces_existing() {
        let store = store().await;
        let user = UserId::new("u1");
        store.insert(&entry("u1", "m1", 100, "first"), UNLIMITED).await.unwrap();
        let second = entry("u1", "m1", 100, "second version");
        store.insert(&second, UNLIMITED).await.unwrap();

        assert_eq!(store.count(&user).await.unwrap(), 1);
        assert_eq!(store.size_on_disk(&user).await.unwrap(), second.stored_size().unwrap());
        let fetched = store.get(&user, &MessageId::new("m1")).await.unwrap().unwrap();
        assert_eq!(fetched.fields.body, "second version");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_key_lookup_does_not_block_other_users() {
        let keys = Arc::new(SlowKeys {
            slow: UserId::new("slow"),
        });
        let store = Arc::new(ContentIndexStore::in_memory(keys).await.unwrap());

        let pending = {
            let store = Arc::clone(&store);
            let e = entry("slow", "m1", 100, "waiting on the keyring");
            tokio::spawn(async move { store.insert(&e, UNLIMITED).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let fast = entry("fast", "m1", 100, "cached key");
        let inserted =
            tokio::time::timeout(std::time::Duration::from_millis(500), store.insert(&fast, UNLIMITED))
                .await;
        assert!(inserted.is_ok(), "insert waited for another user's key lookup");
        inserted.unwrap().unwrap();

        pending.await.unwrap().unwrap();
        assert_eq!(store.count(&UserId::new("slow")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remove() {
        let store = store().await;
        let e = entry("u1", "m1", 100, "hello");
        store.insert(&e, UNLIMITED).await.unwrap();

        assert!(store.remove(&e.user_id, &e.message_id).await.unwrap());
        assert!(!store.remove(&e.user_id, &e.message_id).await.unwrap());
        assert!(store.get(&e.user_id, &e.message_id).await.unwrap().is_none());
        assert_eq!(store.size_on_disk(&e.user_id).await.unwrap(), ByteCount::ZERO);
    }

    #[tokio::test]
    async fn test_insert_evicts_oldest() {
        let store = store().await;
        let user = UserId::new("u1");
        let first = entry("u1", "m1", 100, "aaaa");
        let second = entry("u1", "m2", 200, "bbbb");
        let third = entry("u1", "m3", 300, "cccc");
        let size = first.stored_size().unwrap();
        let limit = ByteCount(size.0 * 2);

        store.insert(&first, limit).await.unwrap();
        store.insert(&second, limit).await.unwrap();
        let outcome = store.insert(&third, limit).await.unwrap();

        assert_eq!(
            outcome,
            InsertOutcome::Stored {
                evicted: vec![MessageId::new("m1")]
            }
        );
        assert!(store.size_on_disk(&user).await.unwrap() <= limit);
        assert!(store.contains(&user, &MessageId::new("m3")).await.unwrap());
        assert_eq!(
            store.oldest_entry_time(&user).await.unwrap(),
            DateTime::from_timestamp(200, 0)
        );
    }

    #[tokio::test]
    async fn test_insert_larger_than_limit_changes_nothing() {
        let store = store().await;
        let user = UserId::new("u1");
        let small = entry("u1", "m1", 100, "a");
        store.insert(&small, UNLIMITED).await.unwrap();

        let big = entry("u1", "m2", 200, &"x".repeat(1_000));
        let outcome = store.insert(&big, ByteCount(500)).await.unwrap();

        assert!(matches!(outcome, InsertOutcome::ExceedsLimit { .. }));
        assert_eq!(store.count(&user).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_shrink_to() {
        let store = store().await;
        let user = UserId::new("u1");
        for i in 0..5 {
            store
                .insert(&entry("u1", &format!("m{i}"), 100 + i, "body"), UNLIMITED)
                .await
                .unwrap();
        }
        let size = entry("u1", "m0", 0, "body").stored_size().unwrap();

        let evicted = store.shrink_to(&user, ByteCount(size.0 * 2)).await.unwrap();

        assert_eq!(evicted, vec![MessageId::new("m0"), MessageId::new("m1"), MessageId::new("m2")]);
        assert_eq!(store.count(&user).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_partitions_are_isolated() {
        let store = store().await;
        store.insert(&entry("u1", "m1", 100, "shared words"), UNLIMITED).await.unwrap();
        store.insert(&entry("u2", "m1", 100, "shared words"), UNLIMITED).await.unwrap();

        assert_eq!(store.remove_all(&UserId::new("u1")).await.unwrap(), 1);
        assert_eq!(store.count(&UserId::new("u1")).await.unwrap(), 0);
        assert_eq!(store.count(&UserId::new("u2")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_search_newest_first() {
        let store = store().await;
        let user = UserId::new("u1");
        store.insert(&entry("u1", "m1", 100, "Invoice for March"), UNLIMITED).await.unwrap();
        store.insert(&entry("u1", "m2", 300, "Second invoice reminder"), UNLIMITED).await.unwrap();
        store.insert(&entry("u1", "m3", 200, "Lunch plans"), UNLIMITED).await.unwrap();

        let hits = store.search(&user, &SearchQuery::parse("invoice"), 10).await.unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.message_id.as_str()).collect();
        assert_eq!(ids, ["m2", "m1"]);
        assert!(hits[0].snippet.contains("invoice"));

        let limited = store.search(&user, &SearchQuery::parse("invoice"), 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_rows_are_encrypted_at_rest() {
        let store = store().await;
        store.insert(&entry("u1", "m1", 100, "plaintext canary"), UNLIMITED).await.unwrap();

        let row = sqlx::query("SELECT payload FROM index_entries")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        let payload: Vec<u8> = row.get("payload");
        let needle = b"canary";
        assert!(!payload.windows(needle.len()).any(|w| w == needle));
    }
}
