//! Time-boxed alarm tests
//!
//! Wraps the manager's start/end test with one expiry timer. The timer and the
//! manual end both go through the single active slot, so a test is ended once.
//! A genuine transition that cancels the test also cancels the timer through a
//! changed listener.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{AlarmChange, AlarmKey, AlarmRef, AlarmState};
use crate::error::{AlarmError, Result};
use crate::manager::AlarmManager;

#[derive(Debug, Clone)]
pub struct TestOptions {
    pub default_state: AlarmState,
    pub default_duration: Duration,
    pub max_duration: Duration,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            default_state: AlarmState::Critical,
            default_duration: Duration::from_secs(5),
            max_duration: Duration::from_secs(300),
        }
    }
}

struct ActiveTest {
    id: u64,
    key: AlarmKey,
    /// Sequence number of the test start change
    started_seq: u64,
    token: CancellationToken,
    started: DateTime<Utc>,
    expires: DateTime<Utc>,
}

/// Public view of the running test
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTestInfo {
    pub source: String,
    pub sid: String,
    pub started: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

pub struct TestController {
    manager: Arc<AlarmManager>,
    active: Arc<Mutex<Option<ActiveTest>>>,
    next_id: AtomicU64,
    options: TestOptions,
}

impl TestController {
    pub fn new(manager: Arc<AlarmManager>, options: TestOptions) -> Self {
        let active: Arc<Mutex<Option<ActiveTest>>> = Arc::new(Mutex::new(None));

        let slot = active.clone();
        manager.on_changed(Arc::new(move |change: &AlarmChange| {
            if !change.test_cancelled {
                return;
            }
            let mut slot = slot.lock();
            let owned = slot
                .as_ref()
                .is_some_and(|t| t.key == change.key() && t.started_seq < change.seq);
            if owned {
                if let Some(test) = slot.take() {
                    test.token.cancel();
                    debug!("Test on {} cancelled by {:?}", test.key, change.kind);
                }
            }
        }));

        Self {
            manager,
            active,
            next_id: AtomicU64::new(1),
            options,
        }
    }

    pub fn options(&self) -> &TestOptions {
        &self.options
    }

    /// Start a test that ends by itself after `duration`
    pub fn start_test<'a>(
        &self,
        target: impl Into<AlarmRef<'a>>,
        state: Option<AlarmState>,
        message: Option<&str>,
        duration: Option<Duration>,
    ) -> Result<AlarmChange> {
        let duration = duration.unwrap_or(self.options.default_duration);
        if duration.is_zero() || duration > self.options.max_duration {
            return Err(AlarmError::validation(format!(
                "test duration must be between 1s and {}s",
                self.options.max_duration.as_secs()
            )));
        }
        let state = state.unwrap_or(self.options.default_state);
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| AlarmError::internal("test timer needs a tokio runtime"))?;

        let target = target.into();
        let message = match message {
            Some(m) => m.to_string(),
            None => format!("Testing alarm {} for {}s", target, duration.as_secs()),
        };

        // Slot held across the start so a cancelling change waits for the fill.
        // The start change is never test_cancelled, so the changed listener
        // returns before touching the slot.
        let mut slot = self.active.lock();
        let change = self.manager.start_test(target, state, &message)?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        let key = change.key();
        let started = change.at;
        let expires = started
            + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());

        let stale = slot.replace(ActiveTest {
            id,
            key: key.clone(),
            started_seq: change.seq,
            token: token.clone(),
            started,
            expires,
        });
        drop(slot);
        if let Some(stale) = stale {
            stale.token.cancel();
        }

        let manager = self.manager.clone();
        let active = self.active.clone();
        handle.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(duration) => {},
            }

            let expired = {
                let mut slot = active.lock();
                if slot.as_ref().is_some_and(|t| t.id == id) {
                    slot.take()
                } else {
                    None
                }
            };
            if expired.is_some() {
                info!("Test expired: {}", key);
                if let Err(e) = manager.end_test(&key) {
                    warn!("Test end {}: {}", key, e);
                }
            }
        });

        Ok(change)
    }

    /// End a test before its timer; no-op when the alarm is not testing
    pub fn end_test<'a>(&self, target: impl Into<AlarmRef<'a>>) -> Result<Option<AlarmChange>> {
        let key = self.manager.key_of(target)?;

        let taken = {
            let mut slot = self.active.lock();
            if slot.as_ref().is_some_and(|t| t.key == key) {
                slot.take()
            } else {
                None
            }
        };
        if let Some(test) = taken {
            test.token.cancel();
        }

        self.manager.end_test(&key)
    }

    /// End whatever test is running
    pub fn end_active(&self) -> Result<Option<AlarmChange>> {
        match self.manager.testing_alarm() {
            Some(alarm) => self.end_test(&alarm.key()),
            None => Ok(None),
        }
    }

    pub fn active_test(&self) -> Option<ActiveTestInfo> {
        self.active.lock().as_ref().map(|t| ActiveTestInfo {
            source: t.key.source.clone(),
            sid: t.key.sid.clone(),
            started: t.started,
            expires: t.expires,
        })
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::dispatcher::DispatcherOptions;

    fn controller() -> (Arc<AlarmManager>, TestController) {
        let manager = Arc::new(AlarmManager::new(DispatcherOptions::default()));
        manager.register_alarm("local", "gs", "Gensets").unwrap();
        manager.register_alarm("local", "iv", "Inverter").unwrap();
        manager.connect("local");
        let controller = TestController::new(manager.clone(), TestOptions::default());
        (manager, controller)
    }

    #[tokio::test]
    async fn test_timer_ends_test() {
        let (manager, controller) = controller();
        controller
            .start_test("gs", None, None, Some(Duration::from_millis(50)))
            .unwrap();
        assert!(manager.get_alarm("gs").unwrap().is_testing);
        assert!(controller.active_test().is_some());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!manager.get_alarm("gs").unwrap().is_testing);
        assert!(controller.active_test().is_none());
    }

    #[tokio::test]
    async fn test_manual_end_cancels_timer() {
        let (manager, controller) = controller();
        controller
            .start_test("gs", Some(AlarmState::Moderate), Some("t"), Some(Duration::from_millis(50)))
            .unwrap();

        let change = controller.end_test("gs").unwrap();
        assert!(change.is_some());
        let depth = manager.dispatcher().depth();

        tokio::time::sleep(Duration::from_millis(150)).await;
        // No second end from the timer
        assert_eq!(manager.dispatcher().depth(), depth);
        assert!(controller.end_test("gs").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_genuine_raise_clears_slot() {
        let (manager, controller) = controller();
        controller
            .start_test("gs", None, None, Some(Duration::from_secs(60)))
            .unwrap();

        let change = manager
            .raise("gs", AlarmState::Critical, "real", None)
            .unwrap()
            .unwrap();
        assert!(change.test_cancelled);
        assert!(controller.active_test().is_none());

        // Slot is free again
        controller
            .start_test("iv", None, None, Some(Duration::from_secs(60)))
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slot_tracks_testing_under_racing_raise() {
        let (manager, controller) = controller();
        let controller = Arc::new(controller);
        let handle = tokio::runtime::Handle::current();

        for round in 0..50 {
            let starter = {
                let controller = controller.clone();
                let handle = handle.clone();
                std::thread::spawn(move || {
                    let _guard = handle.enter();
                    let _ = controller.start_test("gs", None, None, Some(Duration::from_secs(60)));
                })
            };
            let raiser = {
                let manager = manager.clone();
                std::thread::spawn(move || {
                    manager.raise("gs", AlarmState::Critical, "real", None).unwrap();
                })
            };
            starter.join().unwrap();
            raiser.join().unwrap();

            let testing = manager.get_alarm("gs").unwrap().is_testing;
            assert_eq!(
                controller.active_test().is_some(),
                testing,
                "slot and alarm disagree in round {}",
                round
            );

            controller.end_test("gs").unwrap();
            manager.lower("gs", "reset").unwrap();
            assert!(controller.active_test().is_none());
        }
    }

    #[tokio::test]
    async fn test_second_test_conflicts() {
        let (manager, controller) = controller();
        controller.start_test("gs", None, None, None).unwrap();

        let err = controller.start_test("iv", None, None, None).unwrap_err();
        assert!(matches!(err, AlarmError::Conflict(_)));
        assert_eq!(controller.active_test().unwrap().sid, "gs");
        assert!(manager.get_alarm("gs").unwrap().is_testing);
    }

    #[tokio::test]
    async fn test_duration_bounds() {
        let (_, controller) = controller();
        let err = controller
            .start_test("gs", None, None, Some(Duration::from_secs(3600)))
            .unwrap_err();
        assert!(matches!(err, AlarmError::Validation(_)));
        assert!(controller.active_test().is_none());
    }
}
