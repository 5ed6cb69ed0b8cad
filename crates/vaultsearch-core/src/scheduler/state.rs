//! Indexing state machine values.

use std::fmt;

/// Why indexing is paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PauseReason {
    /// On cellular data without permission to use it.
    NoWifi,
    /// No network connection.
    NoConnection,
    /// Battery low or low power mode on.
    LowBattery,
    /// Device is critically hot.
    Overheating,
    /// Free device storage below the safety threshold.
    LowDeviceStorage,
    /// The user paused indexing.
    UserRequested,
    /// Too many messages in a row failed to decrypt.
    RepeatedFailures,
    /// Writing to the index kept failing.
    StorageFailure,
}

impl PauseReason {
    /// Convert to string for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NoWifi => "no_wifi",
            Self::NoConnection => "no_connection",
            Self::LowBattery => "low_battery",
            Self::Overheating => "overheating",
            Self::LowDeviceStorage => "low_device_storage",
            Self::UserRequested => "user_requested",
            Self::RepeatedFailures => "repeated_failures",
            Self::StorageFailure => "storage_failure",
        }
    }

    /// Parse from a stored string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "no_wifi" => Some(Self::NoWifi),
            "no_connection" => Some(Self::NoConnection),
            "low_battery" => Some(Self::LowBattery),
            "overheating" => Some(Self::Overheating),
            "low_device_storage" => Some(Self::LowDeviceStorage),
            "user_requested" => Some(Self::UserRequested),
            "repeated_failures" => Some(Self::RepeatedFailures),
            "storage_failure" => Some(Self::StorageFailure),
            _ => None,
        }
    }

    /// Whether the pause comes from device conditions and lifts by itself.
    #[must_use]
    pub const fn is_condition(&self) -> bool {
        matches!(
            self,
            Self::NoWifi
                | Self::NoConnection
                | Self::LowBattery
                | Self::Overheating
                | Self::LowDeviceStorage
        )
    }

    /// Banner to show for this pause.
    #[must_use]
    pub const fn advisory(&self) -> Advisory {
        match self {
            Self::NoWifi => Advisory::NoWifi,
            Self::NoConnection => Advisory::NoConnection,
            Self::LowBattery => Advisory::LowBattery,
            Self::Overheating => Advisory::Overheating,
            Self::LowDeviceStorage => Advisory::LowDeviceStorage,
            Self::UserRequested => Advisory::PausedByUser,
            Self::RepeatedFailures | Self::StorageFailure => Advisory::IndexingError,
        }
    }
}

/// Banner summarizing why the index is not growing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Advisory {
    /// Waiting for Wi-Fi.
    NoWifi,
    /// Waiting for any connection.
    NoConnection,
    /// Waiting for the battery to recover.
    LowBattery,
    /// Waiting for the device to cool down.
    Overheating,
    /// The device is almost full.
    LowDeviceStorage,
    /// The index reached its storage limit.
    StorageLimitReached,
    /// The user paused indexing.
    PausedByUser,
    /// Indexing stopped on errors and needs to be resumed.
    IndexingError,
}

/// Per-user indexing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IndexingState {
    /// Not yet restored this session.
    #[default]
    Undetermined,
    /// Encrypted search is off and the index is empty.
    Disabled,
    /// Working through the mailbox.
    CreatingIndex,
    /// Work halted; the backlog is kept.
    Paused(PauseReason),
    /// Catching up on messages that arrived or changed.
    Refreshing,
    /// Every known message is indexed.
    Complete,
    /// Finished, but older messages were evicted to respect the limit.
    Partial,
    /// A message does not fit in the storage limit at all.
    LowStorage,
}

impl IndexingState {
    /// Convert to string for storage.
    #[must_use]
    pub fn as_str(&self) -> String {
        match self {
            Self::Undetermined => "undetermined".to_string(),
            Self::Disabled => "disabled".to_string(),
            Self::CreatingIndex => "creating_index".to_string(),
            Self::Paused(reason) => format!("paused:{}", reason.as_str()),
            Self::Refreshing => "refreshing".to_string(),
            Self::Complete => "complete".to_string(),
            Self::Partial => "partial".to_string(),
            Self::LowStorage => "low_storage".to_string(),
        }
    }

    /// Parse from a stored string. Unknown values map to
    /// [`IndexingState::Undetermined`].
    #[must_use]
    pub fn parse(s: &str) -> Self {
        if let Some(reason) = s.strip_prefix("paused:") {
            return PauseReason::parse(reason).map_or(Self::Undetermined, Self::Paused);
        }
        match s {
            "disabled" => Self::Disabled,
            "creating_index" => Self::CreatingIndex,
            "refreshing" => Self::Refreshing,
            "complete" => Self::Complete,
            "partial" => Self::Partial,
            "low_storage" => Self::LowStorage,
            _ => Self::Undetermined,
        }
    }

    /// Whether the worker is consuming messages in this state.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::CreatingIndex | Self::Refreshing)
    }

    /// Banner to show, if any.
    #[must_use]
    pub const fn advisory(&self) -> Option<Advisory> {
        match self {
            Self::Paused(reason) => Some(reason.advisory()),
            Self::LowStorage | Self::Partial => Some(Advisory::StorageLimitReached),
            _ => None,
        }
    }
}

impl fmt::Display for IndexingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

/// Throughput requested by the embedding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SpeedMode {
    /// The indexing screen is visible.
    Foreground,
    /// Everything else.
    #[default]
    Background,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_REASONS: [PauseReason; 8] = [
        PauseReason::NoWifi,
        PauseReason::NoConnection,
        PauseReason::LowBattery,
        PauseReason::Overheating,
        PauseReason::LowDeviceStorage,
        PauseReason::UserRequested,
        PauseReason::RepeatedFailures,
        PauseReason::StorageFailure,
    ];

    #[test]
    fn test_state_storage_strings() {
        let mut states = vec![
            IndexingState::Disabled,
            IndexingState::CreatingIndex,
            IndexingState::Refreshing,
            IndexingState::Complete,
            IndexingState::Partial,
            IndexingState::LowStorage,
        ];
        states.extend(ALL_REASONS.map(IndexingState::Paused));

        for state in states {
            assert_eq!(IndexingState::parse(&state.as_str()), state);
        }
        assert_eq!(IndexingState::parse("paused:bogus"), IndexingState::Undetermined);
        assert_eq!(IndexingState::parse(""), IndexingState::Undetermined);
    }

    #[test]
    fn test_only_user_and_error_pauses_need_resume() {
        let manual: Vec<_> = ALL_REASONS.iter().filter(|r| !r.is_condition()).collect();
        assert_eq!(
            manual,
            [
                &PauseReason::UserRequested,
                &PauseReason::RepeatedFailures,
                &PauseReason::StorageFailure
            ]
        );
    }

    #[test]
    fn test_advisory() {
        assert_eq!(IndexingState::Complete.advisory(), None);
        assert_eq!(IndexingState::CreatingIndex.advisory(), None);
        assert_eq!(
            IndexingState::Paused(PauseReason::NoWifi).advisory(),
            Some(Advisory::NoWifi)
        );
        assert_eq!(
            IndexingState::LowStorage.advisory(),
            Some(Advisory::StorageLimitReached)
        );
        assert_eq!(
            IndexingState::Paused(PauseReason::StorageFailure).advisory(),
            Some(Advisory::IndexingError)
        );
    }
}
