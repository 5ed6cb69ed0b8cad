//! Publishes device condition readings to indexing workers.

use tokio::sync::{broadcast, watch};
use tracing::debug;

use super::model::{ConditionEvent, ConditionSnapshot, PowerState, Transport};
use crate::budget::ByteCount;

/// Capacity of the change event channel. Slow subscribers lag, they never
/// block updates.
const EVENT_CAPACITY: usize = 32;

/// Observes network, power and storage conditions.
///
/// The monitor never touches indexing state. Workers hold a
/// [`watch::Receiver`] and re-evaluate whenever the snapshot changes; other
/// observers can follow individual [`ConditionEvent`]s.
#[derive(Debug)]
pub struct ConditionMonitor {
    snapshot: watch::Sender<ConditionSnapshot>,
    events: broadcast::Sender<ConditionEvent>,
}

impl Default for ConditionMonitor {
    fn default() -> Self {
        Self::new(ConditionSnapshot::default())
    }
}

impl ConditionMonitor {
    /// Creates a monitor starting from `initial` readings.
    #[must_use]
    pub fn new(initial: ConditionSnapshot) -> Self {
        let (snapshot, _) = watch::channel(initial);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { snapshot, events }
    }

    /// Current readings.
    #[must_use]
    pub fn snapshot(&self) -> ConditionSnapshot {
        *self.snapshot.borrow()
    }

    /// Receiver that is notified whenever the snapshot changes.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ConditionSnapshot> {
        self.snapshot.subscribe()
    }

    /// Stream of individual condition changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConditionEvent> {
        self.events.subscribe()
    }

    /// Record a new network transport.
    pub fn update_transport(&self, transport: Transport) {
        self.apply(ConditionEvent::TransportChanged(transport), |s| {
            let changed = s.transport != transport;
            s.transport = transport;
            changed
        });
    }

    /// Record new battery and thermal readings.
    pub fn update_power(&self, power: PowerState) {
        self.apply(ConditionEvent::PowerChanged(power), |s| {
            let changed = s.power != power;
            s.power = power;
            changed
        });
    }

    /// Record the free space left on the device.
    pub fn update_free_storage(&self, free: ByteCount) {
        self.apply(ConditionEvent::StorageChanged(free), |s| {
            let changed = s.free_storage != Some(free);
            s.free_storage = Some(free);
            changed
        });
    }

    fn apply(&self, event: ConditionEvent, modify: impl FnOnce(&mut ConditionSnapshot) -> bool) {
        if self.snapshot.send_if_modified(modify) {
            debug!("Device conditions changed: {:?}", event);
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::conditions::ThermalState;

    #[tokio::test]
    async fn test_watchers_see_changes() {
        let monitor = ConditionMonitor::default();
        let mut watcher = monitor.watch();

        monitor.update_transport(Transport::Cellular);
        watcher.changed().await.unwrap();
        assert_eq!(watcher.borrow_and_update().transport, Transport::Cellular);
        assert_eq!(monitor.snapshot().transport, Transport::Cellular);
    }

    #[tokio::test]
    async fn test_unchanged_readings_are_not_broadcast() {
        let monitor = ConditionMonitor::default();
        let mut events = monitor.subscribe();

        monitor.update_transport(Transport::Wifi);
        monitor.update_free_storage(ByteCount::from_megabytes(500));
        monitor.update_free_storage(ByteCount::from_megabytes(500));
        monitor.update_power(PowerState {
            thermal: ThermalState::Serious,
            ..PowerState::default()
        });

        assert_eq!(
            events.recv().await.unwrap(),
            ConditionEvent::StorageChanged(ByteCount::from_megabytes(500))
        );
        assert!(matches!(
            events.recv().await.unwrap(),
            ConditionEvent::PowerChanged(PowerState {
                thermal: ThermalState::Serious,
                ..
            })
        ));
        assert!(events.try_recv().is_err());
    }
}
