//! Condition data models.

use serde::{Deserialize, Serialize};

use crate::budget::ByteCount;
use crate::config::IndexingConfig;
use crate::scheduler::PauseReason;

/// Network transport class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// Unmetered connection.
    #[default]
    Wifi,
    /// Metered mobile data.
    Cellular,
    /// No connection at all.
    Offline,
}

/// Thermal pressure reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThermalState {
    /// Normal operating temperature.
    #[default]
    Nominal,
    /// Slightly elevated.
    Fair,
    /// High; work should be reduced.
    Serious,
    /// Critical; work should stop.
    Critical,
}

/// Battery and thermal readings.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PowerState {
    /// Charge from 0.0 to 1.0, if the device reports one.
    pub battery_level: Option<f32>,
    /// Whether the operating system's low power mode is on.
    pub low_power_mode: bool,
    /// Thermal pressure.
    pub thermal: ThermalState,
}

/// Latest readings of every condition. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ConditionSnapshot {
    /// Current transport.
    pub transport: Transport,
    /// Current power readings.
    pub power: PowerState,
    /// Free device storage, if known.
    pub free_storage: Option<ByteCount>,
}

impl ConditionSnapshot {
    /// The reason indexing must not run, if any.
    ///
    /// When several conditions apply, the one the user can least work around
    /// is reported: no connection, then no Wi-Fi, low device storage,
    /// overheating and finally low battery.
    #[must_use]
    pub fn blocking_reason(
        &self,
        allow_cellular: bool,
        config: &IndexingConfig,
    ) -> Option<PauseReason> {
        match self.transport {
            Transport::Offline => return Some(PauseReason::NoConnection),
            Transport::Cellular if !allow_cellular => return Some(PauseReason::NoWifi),
            _ => {}
        }

        if self
            .free_storage
            .is_some_and(|free| free < config.low_device_storage)
        {
            return Some(PauseReason::LowDeviceStorage);
        }

        if self.power.thermal == ThermalState::Critical {
            return Some(PauseReason::Overheating);
        }

        let battery_low = self
            .power
            .battery_level
            .is_some_and(|level| level < config.min_battery_level);
        if self.power.low_power_mode || battery_low {
            return Some(PauseReason::LowBattery);
        }

        None
    }

    /// Whether work must run at background throughput regardless of the
    /// requested speed.
    #[must_use]
    pub fn forces_background(&self) -> bool {
        matches!(
            self.power.thermal,
            ThermalState::Serious | ThermalState::Critical
        )
    }
}

/// A single condition change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConditionEvent {
    /// Network transport changed.
    TransportChanged(Transport),
    /// Battery, low power mode or thermal state changed.
    PowerChanged(PowerState),
    /// Free device storage changed.
    StorageChanged(ByteCount),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(transport: Transport) -> ConditionSnapshot {
        ConditionSnapshot {
            transport,
            ..ConditionSnapshot::default()
        }
    }

    #[test]
    fn test_default_snapshot_does_not_block() {
        let config = IndexingConfig::default();
        assert_eq!(ConditionSnapshot::default().blocking_reason(false, &config), None);
    }

    #[test]
    fn test_cellular_needs_permission() {
        let config = IndexingConfig::default();
        let cellular = snapshot(Transport::Cellular);
        assert_eq!(cellular.blocking_reason(false, &config), Some(PauseReason::NoWifi));
        assert_eq!(cellular.blocking_reason(true, &config), None);
        assert_eq!(
            snapshot(Transport::Offline).blocking_reason(true, &config),
            Some(PauseReason::NoConnection)
        );
    }

    #[test]
    fn test_power_conditions() {
        let config = IndexingConfig::default();
        let mut conditions = ConditionSnapshot::default();

        conditions.power.battery_level = Some(0.1);
        assert_eq!(conditions.blocking_reason(false, &config), Some(PauseReason::LowBattery));

        conditions.power.battery_level = Some(0.9);
        conditions.power.low_power_mode = true;
        assert_eq!(conditions.blocking_reason(false, &config), Some(PauseReason::LowBattery));

        conditions.power.thermal = ThermalState::Critical;
        assert_eq!(conditions.blocking_reason(false, &config), Some(PauseReason::Overheating));
        assert!(conditions.forces_background());
    }

    #[test]
    fn test_serious_thermal_slows_without_pausing() {
        let config = IndexingConfig::default();
        let mut conditions = ConditionSnapshot::default();
        conditions.power.thermal = ThermalState::Serious;

        assert_eq!(conditions.blocking_reason(false, &config), None);
        assert!(conditions.forces_background());
    }

    #[test]
    fn test_priority_of_reasons() {
        let config = IndexingConfig::default();
        let conditions = ConditionSnapshot {
            transport: Transport::Cellular,
            power: PowerState {
                battery_level: Some(0.05),
                low_power_mode: true,
                thermal: ThermalState::Critical,
            },
            free_storage: Some(ByteCount(10)),
        };

        assert_eq!(conditions.blocking_reason(false, &config), Some(PauseReason::NoWifi));
        assert_eq!(
            conditions.blocking_reason(true, &config),
            Some(PauseReason::LowDeviceStorage)
        );
    }
}
