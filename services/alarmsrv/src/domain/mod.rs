//! Domain model: alarm records and their transition rules

pub mod alarm;
pub mod state_machine;

pub use alarm::{Alarm, AlarmKey, AlarmRef, AlarmState, NO_CODE};
pub use state_machine::{AlarmChange, AlarmEntry, ChangeKind, Transition};
