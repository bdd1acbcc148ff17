//! Alarm Lifecycle Manager
//!
//! Keeps the authoritative state of every alarm raised by local hardware or
//! mirrored from peer services, fans each state change out to persistence,
//! broadcast and board actuation, and runs a single timed alarm test at a time.

pub mod board;
pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod listeners;
pub mod manager;
pub mod messages;
pub mod messaging;
pub mod registry;
pub mod service;
pub mod sources;
pub mod storage;
pub mod test_controller;
pub mod virtual_board;

pub use config::AlarmConfig;
pub use domain::{Alarm, AlarmChange, AlarmKey, AlarmRef, AlarmState, ChangeKind};
pub use error::{AlarmError, Result};
pub use manager::AlarmManager;
pub use service::{AlarmService, ServiceStatus};
pub use test_controller::TestController;
