//! Shared fixtures for the alarm service integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use alarmsrv::dispatcher::{DequeueListener, DispatcherOptions};
use alarmsrv::domain::{AlarmChange, AlarmState};
use alarmsrv::messages::AlarmPayload;
use alarmsrv::AlarmConfig;
use async_trait::async_trait;
use parking_lot::Mutex;

pub fn fast_dispatcher() -> DispatcherOptions {
    DispatcherOptions {
        ready_poll: Duration::from_millis(10),
        drain_grace: Duration::from_secs(2),
    }
}

/// Config with one remote, fast timers and no periodic refresh
pub fn test_config() -> AlarmConfig {
    let mut config = AlarmConfig::default();
    config.service.name = "alarms".to_string();
    config.remotes = vec!["remote1".to_string()];
    config.dispatcher.ready_poll_ms = 10;
    config.dispatcher.drain_grace_ms = 2000;
    config.refresh.interval_secs = 0;
    config
}

/// Listener that remembers every dequeued change
#[derive(Default)]
pub struct RecordingListener {
    seen: Mutex<Vec<AlarmChange>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn changes(&self) -> Vec<AlarmChange> {
        self.seen.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }
}

#[async_trait]
impl DequeueListener for RecordingListener {
    fn name(&self) -> &str {
        "recording"
    }

    async fn on_dequeued(&self, change: &AlarmChange) -> alarmsrv::Result<()> {
        self.seen.lock().push(change.clone());
        Ok(())
    }
}

/// Poll `cond` every 10ms until it holds or `timeout` passes
pub async fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

pub fn remote_payload(sid: &str, name: &str, state: AlarmState, message: &str) -> AlarmPayload {
    AlarmPayload {
        id: sid.to_string(),
        name: name.to_string(),
        state,
        message: message.to_string(),
        code: -1,
        source: "remote1".to_string(),
        is_testing: false,
    }
}
