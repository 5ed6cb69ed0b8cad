//! Collaborators the worker pulls messages from.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::index::MessageFields;
use crate::settings::IndexCursor;
use crate::{MessageId, UserId};

/// A remote message the index may cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    /// Message ID.
    pub id: MessageId,
    /// Message time.
    pub time: DateTime<Utc>,
}

impl MessageRef {
    /// Creates a message reference.
    #[must_use]
    pub const fn new(id: MessageId, time: DateTime<Utc>) -> Self {
        Self { id, time }
    }

    /// Cursor positioned on this message.
    #[must_use]
    pub fn cursor(&self) -> IndexCursor {
        IndexCursor {
            message_time: self.time,
            message_id: self.id.clone(),
        }
    }

    /// Whether this message sorts at or before `cursor`.
    #[must_use]
    pub fn is_at_or_before(&self, cursor: Option<&IndexCursor>) -> bool {
        cursor.is_some_and(|c| (&self.time, &self.id) <= (&c.message_time, &c.message_id))
    }
}

/// A change to the user's mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageEvent {
    /// A new message was received.
    Arrived(MessageRef),
    /// An existing message changed and must be indexed again.
    Updated(MessageRef),
    /// A message was deleted remotely.
    Deleted(MessageId),
}

/// Failure to list messages.
#[derive(Debug, thiserror::Error)]
#[error("Message source error: {0}")]
pub struct SourceError(pub String);

/// Failure to fetch or decrypt one message.
#[derive(Debug, thiserror::Error)]
pub enum DecryptError {
    /// The key needed for this message is not available.
    #[error("Missing key: {0}")]
    MissingKey(String),

    /// The message no longer exists.
    #[error("Message not found: {0}")]
    NotFound(MessageId),

    /// Fetching the encrypted body failed.
    #[error("Fetch failed: {0}")]
    Fetch(String),

    /// The body could not be decrypted or parsed.
    #[error("Decryption failed: {0}")]
    Decrypt(String),
}

/// Lists the messages of a mailbox in indexing order.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Number of messages the user has.
    async fn total_messages(&self, user_id: &UserId) -> Result<u64, SourceError>;

    /// Up to `limit` messages sorting strictly after `after`, ascending by
    /// `(time, id)`. `None` starts from the oldest message.
    async fn messages_after(
        &self,
        user_id: &UserId,
        after: Option<&IndexCursor>,
        limit: usize,
    ) -> Result<Vec<MessageRef>, SourceError>;
}

/// Fetches and decrypts message content.
#[async_trait]
pub trait MessageDecrypter: Send + Sync {
    /// Searchable fields of `message`.
    async fn decrypt(
        &self,
        user_id: &UserId,
        message: &MessageRef,
    ) -> Result<MessageFields, DecryptError>;
}
