//! Dequeued listeners for persistence and network broadcast

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::dispatcher::DequeueListener;
use crate::domain::AlarmChange;
use crate::error::Result;
use crate::messages::Message;
use crate::messaging::Messaging;
use crate::storage::{AlarmLogEntry, AlarmPersistence};

/// Writes the alarm record and a history row; test traffic is never stored
pub struct PersistenceListener {
    store: Arc<dyn AlarmPersistence>,
}

impl PersistenceListener {
    pub fn new(store: Arc<dyn AlarmPersistence>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DequeueListener for PersistenceListener {
    fn name(&self) -> &str {
        "persistence"
    }

    async fn on_dequeued(&self, change: &AlarmChange) -> Result<()> {
        if !change.is_persistable() {
            return Ok(());
        }
        // Both writes are attempted; the first failure is reported
        let updated = self.store.update_alarm(&change.alarm).await;
        let logged = self.store.log_alarm(&AlarmLogEntry::from(change)).await;
        updated.and(logged)
    }
}

/// Broadcasts every change, test status included, as an alert
pub struct BroadcastListener {
    messaging: Arc<dyn Messaging>,
}

impl BroadcastListener {
    pub fn new(messaging: Arc<dyn Messaging>) -> Self {
        Self { messaging }
    }
}

#[async_trait]
impl DequeueListener for BroadcastListener {
    fn name(&self) -> &str {
        "broadcast"
    }

    async fn on_dequeued(&self, change: &AlarmChange) -> Result<()> {
        let message = Message::alert(self.messaging.name(), &change.alarm);
        self.messaging.broadcast(message).await?;
        debug!("Broadcast {} {}", change.key(), change.alarm.state);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::domain::{Alarm, AlarmState, ChangeKind};
    use crate::messaging::MemoryMessaging;
    use crate::storage::MemoryAlarmStore;
    use chrono::Utc;

    fn change(kind: ChangeKind, testing: bool) -> AlarmChange {
        let mut alarm = Alarm::new(1, "local", "gs", "Gensets");
        alarm.state = AlarmState::Critical;
        alarm.is_testing = testing;
        AlarmChange {
            seq: 1,
            kind,
            test_cancelled: false,
            alarm,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_persistence_skips_tests() {
        let store = Arc::new(MemoryAlarmStore::new());
        let listener = PersistenceListener::new(store.clone());

        listener
            .on_dequeued(&change(ChangeKind::TestStarted, true))
            .await
            .unwrap();
        assert!(store.log().is_empty());

        listener
            .on_dequeued(&change(ChangeKind::Raised, false))
            .await
            .unwrap();
        assert_eq!(store.log().len(), 1);
        assert_eq!(store.stored()[0].state, AlarmState::Critical);
    }

    #[tokio::test]
    async fn test_failed_update_still_appends_log() {
        let store = Arc::new(MemoryAlarmStore::new());
        store.set_fail_updates(true);
        let listener = PersistenceListener::new(store.clone());

        let result = listener
            .on_dequeued(&change(ChangeKind::Raised, false))
            .await;
        assert!(result.unwrap_err().to_string().contains("update_alarm"));
        assert!(store.stored().is_empty());
        assert_eq!(store.log().len(), 1);
        assert_eq!(store.log()[0].state, AlarmState::Critical);
    }

    #[tokio::test]
    async fn test_broadcast_includes_tests() {
        let messaging = Arc::new(MemoryMessaging::new("alarms"));
        let listener = BroadcastListener::new(messaging.clone());

        listener
            .on_dequeued(&change(ChangeKind::TestStarted, true))
            .await
            .unwrap();

        let sent = messaging.broadcasts();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].alarm().unwrap().is_testing);
    }
}
