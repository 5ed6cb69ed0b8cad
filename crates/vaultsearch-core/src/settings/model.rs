//! Settings data models.

use chrono::{DateTime, Utc};

use crate::budget::ByteCount;
use crate::scheduler::IndexingState;
use crate::{MessageId, UserId};

/// Position of the last message the worker processed.
///
/// Messages are processed in ascending `(message_time, message_id)` order,
/// so everything at or before the cursor has been indexed or skipped.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexCursor {
    /// Time of the last processed message.
    pub message_time: DateTime<Utc>,
    /// ID of the last processed message.
    pub message_id: MessageId,
}

/// Counters kept for display and metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexingStats {
    /// Messages processed in the current build.
    pub processed: u64,
    /// Messages known to the source when the build last started.
    pub total: u64,
    /// Times indexing was paused, for any reason.
    pub pause_count: u32,
    /// Times indexing was paused by device conditions.
    pub interruption_count: u32,
}

/// Everything persisted about one user's index.
#[derive(Debug, Clone, PartialEq)]
pub struct UserSettings {
    /// Owner.
    pub user_id: UserId,
    /// Whether encrypted search is switched on.
    pub enabled: bool,
    /// Whether indexing may download over cellular data.
    pub allow_cellular: bool,
    /// Storage limit picked by the user, if any.
    pub storage_limit: Option<ByteCount>,
    /// Whether the user paused indexing.
    pub paused_by_user: bool,
    /// Last state the worker reported.
    pub state: IndexingState,
    /// Resume position.
    pub cursor: Option<IndexCursor>,
    /// Progress and pause counters.
    pub stats: IndexingStats,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl UserSettings {
    /// Settings of a user who never enabled encrypted search.
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            enabled: false,
            allow_cellular: false,
            storage_limit: None,
            paused_by_user: false,
            state: IndexingState::Disabled,
            cursor: None,
            stats: IndexingStats::default(),
            updated_at: Utc::now(),
        }
    }
}
