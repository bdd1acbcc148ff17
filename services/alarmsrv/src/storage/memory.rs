//! In-process alarm store

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{AlarmLogEntry, AlarmPersistence, StoredAlarm};
use crate::domain::{Alarm, AlarmKey};
use crate::error::{AlarmError, Result};

#[derive(Debug, Default)]
pub struct MemoryAlarmStore {
    alarms: Mutex<BTreeMap<i64, StoredAlarm>>,
    log: Mutex<Vec<AlarmLogEntry>>,
    fail_writes: AtomicBool,
    fail_updates: AtomicBool,
    fail_loads: AtomicBool,
}

impl MemoryAlarmStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_alarms(alarms: Vec<StoredAlarm>) -> Self {
        let store = Self::new();
        store
            .alarms
            .lock()
            .extend(alarms.into_iter().map(|a| (a.id, a)));
        store
    }

    /// Make every write fail with a transient error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail only record updates; log appends still succeed
    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn stored(&self) -> Vec<StoredAlarm> {
        self.alarms.lock().values().cloned().collect()
    }

    pub fn log(&self) -> Vec<AlarmLogEntry> {
        self.log.lock().clone()
    }

    fn check_write(&self, context: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AlarmError::transient(context, "store unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl AlarmPersistence for MemoryAlarmStore {
    async fn load_alarms(&self) -> Result<Vec<StoredAlarm>> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(AlarmError::transient("load_alarms", "store unavailable"));
        }
        Ok(self
            .alarms
            .lock()
            .values()
            .filter(|a| a.active)
            .cloned()
            .collect())
    }

    async fn known_ids(&self) -> Result<Vec<(AlarmKey, i64)>> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(AlarmError::transient("known_ids", "store unavailable"));
        }
        Ok(self.alarms.lock().values().map(|a| (a.key(), a.id)).collect())
    }

    async fn update_alarm(&self, alarm: &Alarm) -> Result<()> {
        self.check_write("update_alarm")?;
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(AlarmError::transient("update_alarm", "record table locked"));
        }
        self.alarms.lock().insert(
            alarm.id,
            StoredAlarm {
                id: alarm.id,
                sid: alarm.sid.clone(),
                name: alarm.name.clone(),
                source: alarm.source.clone(),
                active: true,
                state: alarm.state,
                last_raised: alarm.last_raised,
                last_lowered: alarm.last_lowered,
                last_disabled: alarm.last_disabled,
            },
        );
        Ok(())
    }

    async fn log_alarm(&self, entry: &AlarmLogEntry) -> Result<()> {
        self.check_write("log_alarm")?;
        self.log.lock().push(entry.clone());
        Ok(())
    }
}
