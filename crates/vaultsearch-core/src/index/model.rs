//! Index data models.

use chrono::{DateTime, Utc};
use ring::aead::{MAX_TAG_LEN, NONCE_LEN};
use serde::{Deserialize, Serialize};

use crate::budget::ByteCount;
use crate::{MessageId, UserId};

/// Searchable plaintext extracted from a decrypted message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFields {
    /// Message subject.
    pub subject: String,
    /// Plain text body (or an excerpt of it).
    pub body: String,
    /// Sender address, optionally with display name.
    pub sender: String,
    /// To/CC/BCC addresses.
    pub recipients: Vec<String>,
}

impl MessageFields {
    /// Returns true if `keyword` (already lowercased) occurs in any field.
    #[must_use]
    pub fn contains(&self, keyword: &str) -> bool {
        self.subject.to_lowercase().contains(keyword)
            || self.body.to_lowercase().contains(keyword)
            || self.sender.to_lowercase().contains(keyword)
            || self
                .recipients
                .iter()
                .any(|r| r.to_lowercase().contains(keyword))
    }
}

/// One message's searchable record in the local index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Owner of the index partition.
    pub user_id: UserId,
    /// Source message.
    pub message_id: MessageId,
    /// Message time, the ordering key for eviction and "oldest indexed".
    pub message_time: DateTime<Utc>,
    /// Extracted plaintext.
    pub fields: MessageFields,
}

impl IndexEntry {
    /// Creates a new entry.
    #[must_use]
    pub fn new(
        user_id: UserId,
        message_id: MessageId,
        message_time: DateTime<Utc>,
        fields: MessageFields,
    ) -> Self {
        Self {
            user_id,
            message_id,
            message_time,
            fields,
        }
    }

    /// Bytes this entry occupies once sealed and stored.
    ///
    /// Nonce and tag are counted together with the serialized fields and the
    /// message identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the fields cannot be serialized.
    pub fn stored_size(&self) -> serde_json::Result<ByteCount> {
        let payload = serde_json::to_vec(&self.fields)?.len();
        Ok(Self::stored_size_of(payload, &self.message_id))
    }

    pub(crate) fn stored_size_of(plaintext_len: usize, message_id: &MessageId) -> ByteCount {
        let total = NONCE_LEN + plaintext_len + MAX_TAG_LEN + message_id.as_str().len();
        ByteCount(u64::try_from(total).unwrap_or(u64::MAX))
    }
}

/// Result of inserting an entry under a storage limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The entry was written; older entries may have been evicted first.
    Stored {
        /// Messages evicted to make room, oldest first.
        evicted: Vec<MessageId>,
    },
    /// The entry alone is larger than the limit. Nothing was changed.
    ExceedsLimit {
        /// Size of the rejected entry.
        size: ByteCount,
    },
}

/// A message matching a search query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    /// Matching message.
    pub message_id: MessageId,
    /// Message time.
    pub message_time: DateTime<Utc>,
    /// Message subject.
    pub subject: String,
    /// Message sender.
    pub sender: String,
    /// Body text around the first keyword occurrence.
    pub snippet: String,
}
