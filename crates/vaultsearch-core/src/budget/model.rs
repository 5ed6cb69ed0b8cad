//! Byte counts and storage limit steps.

use serde::{Deserialize, Serialize};

/// A size in bytes.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ByteCount(pub u64);

impl ByteCount {
    /// Zero bytes.
    pub const ZERO: Self = Self(0);

    /// Create a byte count from decimal megabytes.
    #[must_use]
    pub const fn from_megabytes(mb: u64) -> Self {
        Self(mb * 1_000_000)
    }

    /// Raw number of bytes.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Saturating addition.
    #[must_use]
    pub const fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    /// Saturating subtraction.
    #[must_use]
    pub const fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// Convert from a SQLite integer, clamping negatives to zero.
    #[must_use]
    pub fn from_sql(value: i64) -> Self {
        Self(u64::try_from(value).unwrap_or(0))
    }

    /// Convert to a SQLite integer, saturating at `i64::MAX`.
    #[must_use]
    pub fn to_sql(self) -> i64 {
        i64::try_from(self.0).unwrap_or(i64::MAX)
    }
}

impl std::fmt::Display for ByteCount {
    #[allow(clippy::cast_precision_loss)]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
        if self.0 < 1_000 {
            return write!(f, "{} bytes", self.0);
        }
        let mut value = self.0 as f64 / 1_000.0;
        let mut unit = 0;
        while value >= 1_000.0 && unit < UNITS.len() - 1 {
            value /= 1_000.0;
            unit += 1;
        }
        write!(f, "{value:.1} {}", UNITS[unit])
    }
}

/// Discrete storage limits offered to the user.
pub struct StorageLimit;

impl StorageLimit {
    /// The selectable limits, smallest first.
    pub const STEPS: [ByteCount; 6] = [
        ByteCount::from_megabytes(200),
        ByteCount::from_megabytes(400),
        ByteCount::from_megabytes(600),
        ByteCount::from_megabytes(800),
        ByteCount::from_megabytes(1_000),
        ByteCount::from_megabytes(1_200),
    ];

    /// Limit used when the user never picked one.
    pub const DEFAULT: ByteCount = ByteCount::from_megabytes(1_000);

    /// Index of the step closest to `limit`, for positioning a slider.
    #[must_use]
    pub fn nearest_step(limit: ByteCount) -> usize {
        Self::STEPS
            .iter()
            .enumerate()
            .min_by_key(|(_, step)| step.0.abs_diff(limit.0))
            .map_or(0, |(index, _)| index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(ByteCount(512).to_string(), "512 bytes");
        assert_eq!(ByteCount::from_megabytes(600).to_string(), "600.0 MB");
        assert_eq!(ByteCount::from_megabytes(1_200).to_string(), "1.2 GB");
    }

    #[test]
    fn test_nearest_step() {
        assert_eq!(StorageLimit::nearest_step(StorageLimit::DEFAULT), 4);
        assert_eq!(StorageLimit::nearest_step(ByteCount(1)), 0);
        assert_eq!(StorageLimit::nearest_step(ByteCount::from_megabytes(650)), 2);
        assert_eq!(StorageLimit::nearest_step(ByteCount::from_megabytes(9_000)), 5);
    }

    #[test]
    fn test_sql_conversions_clamp() {
        assert_eq!(ByteCount::from_sql(-5), ByteCount::ZERO);
        assert_eq!(ByteCount(u64::MAX).to_sql(), i64::MAX);
        assert_eq!(ByteCount(10).saturating_sub(ByteCount(20)), ByteCount::ZERO);
    }
}
