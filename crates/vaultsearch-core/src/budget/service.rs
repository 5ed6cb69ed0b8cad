//! Storage budget enforcement.

use std::sync::Arc;

use tracing::{debug, warn};

use super::model::ByteCount;
use crate::index::{ContentIndexStore, IndexEntry, InsertOutcome};
use crate::settings::SettingsRepository;
use crate::{Error, MessageId, Result, UserId};

/// Reads, changes and enforces the storage limit of each user's index.
#[derive(Debug, Clone)]
pub struct StorageBudget {
    settings: Arc<SettingsRepository>,
    store: Arc<ContentIndexStore>,
    default_limit: ByteCount,
}

impl StorageBudget {
    /// Creates a budget over the given repositories.
    #[must_use]
    pub const fn new(
        settings: Arc<SettingsRepository>,
        store: Arc<ContentIndexStore>,
        default_limit: ByteCount,
    ) -> Self {
        Self {
            settings,
            store,
            default_limit,
        }
    }

    /// The configured ceiling, or the default if unset or unreadable.
    pub async fn limit(&self, user_id: &UserId) -> ByteCount {
        match self.settings.get(user_id).await {
            Ok(settings) => settings
                .and_then(|s| s.storage_limit)
                .unwrap_or(self.default_limit),
            Err(e) => {
                warn!("Failed to read storage limit of user {user_id}, using default: {e}");
                self.default_limit
            }
        }
    }

    /// Persist a new ceiling and evict the oldest entries until usage fits.
    ///
    /// Returns the evicted messages, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidLimit`] for a zero limit, or an error if
    /// persisting the limit or evicting fails.
    pub async fn set_limit(&self, user_id: &UserId, limit: ByteCount) -> Result<Vec<MessageId>> {
        if limit == ByteCount::ZERO {
            return Err(Error::InvalidLimit(limit.as_u64()));
        }

        self.settings.set_storage_limit(user_id, limit).await?;
        let evicted = self.store.shrink_to(user_id, limit).await?;
        debug!("Storage limit of user {user_id} set to {limit}");
        Ok(evicted)
    }

    /// Current size of the user's index.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn usage(&self, user_id: &UserId) -> Result<ByteCount> {
        self.store.size_on_disk(user_id).await
    }

    /// Write an entry within the owner's current limit.
    ///
    /// # Errors
    ///
    /// Returns an error if sealing or the database transaction fails.
    pub async fn admit(&self, entry: &IndexEntry) -> Result<InsertOutcome> {
        let limit = self.limit(&entry.user_id).await;
        self.store.insert(entry, limit).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::index::{MessageFields, StaticKeyProvider};

    async fn budget(default_limit: ByteCount) -> StorageBudget {
        let keys = Arc::new(StaticKeyProvider::shared(b"budget-test".to_vec()));
        let store = Arc::new(ContentIndexStore::in_memory(keys).await.unwrap());
        let settings = Arc::new(SettingsRepository::in_memory().await.unwrap());
        StorageBudget::new(settings, store, default_limit)
    }

    fn entry(user: &UserId, id: &str, secs: i64, body_len: usize) -> IndexEntry {
        IndexEntry::new(
            user.clone(),
            MessageId::new(id),
            DateTime::<Utc>::from_timestamp(secs, 0).unwrap(),
            MessageFields {
                subject: String::new(),
                body: "x".repeat(body_len),
                sender: String::new(),
                recipients: Vec::new(),
            },
        )
    }

    #[tokio::test]
    async fn test_default_limit_until_set() {
        let budget = budget(ByteCount::from_megabytes(1_000)).await;
        let user = UserId::new("u1");

        assert_eq!(budget.limit(&user).await, ByteCount::from_megabytes(1_000));
        budget
            .set_limit(&user, ByteCount::from_megabytes(200))
            .await
            .unwrap();
        assert_eq!(budget.limit(&user).await, ByteCount::from_megabytes(200));
    }

    #[tokio::test]
    async fn test_zero_limit_rejected() {
        let budget = budget(ByteCount::from_megabytes(1)).await;
        let result = budget.set_limit(&UserId::new("u1"), ByteCount::ZERO).await;
        assert!(matches!(result, Err(Error::InvalidLimit(0))));
    }

    #[tokio::test]
    async fn test_lowering_limit_evicts_immediately() {
        let budget = budget(ByteCount(100_000)).await;
        let user = UserId::new("u1");
        for i in 0..10 {
            let outcome = budget.admit(&entry(&user, &format!("m{i}"), i, 1_000)).await.unwrap();
            assert!(matches!(outcome, InsertOutcome::Stored { .. }));
        }
        let before = budget.usage(&user).await.unwrap();
        let single = entry(&user, "m0", 0, 1_000).stored_size().unwrap();

        let new_limit = ByteCount(before.as_u64() / 2);
        let evicted = tokio_test::assert_ok!(budget.set_limit(&user, new_limit).await);

        assert!(!evicted.is_empty());
        assert_eq!(evicted[0], MessageId::new("m0"));
        let after = budget.usage(&user).await.unwrap();
        assert!(after <= new_limit);
        assert!(after.saturating_add(single) > new_limit);
    }

    #[tokio::test]
    async fn test_admit_respects_limit() {
        let budget = budget(ByteCount(5_000)).await;
        let user = UserId::new("u1");
        for i in 0..20 {
            budget.admit(&entry(&user, &format!("m{i:02}"), i, 1_000)).await.unwrap();
            assert!(budget.usage(&user).await.unwrap() <= ByteCount(5_000));
        }
    }
}
