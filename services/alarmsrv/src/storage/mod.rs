//! Alarm persistence
//!
//! Stored records give registration ids and the remote alarm sets known from
//! earlier runs; every persistable change updates the record and appends a log
//! row.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Alarm, AlarmChange, AlarmKey, AlarmState};
use crate::error::Result;

pub use self::memory::MemoryAlarmStore;
pub use self::sqlite::SqliteAlarmStore;

/// Alarm record as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAlarm {
    pub id: i64,
    pub sid: String,
    pub name: String,
    pub source: String,
    pub active: bool,
    pub state: AlarmState,
    pub last_raised: Option<DateTime<Utc>>,
    pub last_lowered: Option<DateTime<Utc>>,
    pub last_disabled: Option<DateTime<Utc>>,
}

impl StoredAlarm {
    pub fn key(&self) -> AlarmKey {
        AlarmKey::new(&self.source, &self.sid)
    }
}

/// One row of alarm history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmLogEntry {
    pub alarm_id: i64,
    pub state: AlarmState,
    pub message: String,
    pub code: i32,
    pub created: DateTime<Utc>,
}

impl From<&AlarmChange> for AlarmLogEntry {
    fn from(change: &AlarmChange) -> Self {
        Self {
            alarm_id: change.alarm.id,
            state: change.alarm.state,
            message: change.alarm.message.clone(),
            code: change.alarm.code,
            created: change.at,
        }
    }
}

#[async_trait]
pub trait AlarmPersistence: Send + Sync {
    /// Active alarm records
    async fn load_alarms(&self) -> Result<Vec<StoredAlarm>>;

    /// Id of every stored record, active or not
    async fn known_ids(&self) -> Result<Vec<(AlarmKey, i64)>>;

    /// Insert or update the record with `alarm.id`
    async fn update_alarm(&self, alarm: &Alarm) -> Result<()>;

    async fn log_alarm(&self, entry: &AlarmLogEntry) -> Result<()>;
}
