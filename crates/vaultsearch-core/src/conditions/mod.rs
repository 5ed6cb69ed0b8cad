//! Device conditions that gate indexing.
//!
//! The embedding application feeds network, power and storage readings into
//! a [`ConditionMonitor`]; indexing workers watch the resulting
//! [`ConditionSnapshot`] and decide for themselves whether to pause.

mod model;
mod monitor;

pub use model::{ConditionEvent, ConditionSnapshot, PowerState, ThermalState, Transport};
pub use monitor::ConditionMonitor;
