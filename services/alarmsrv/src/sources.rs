//! Alarm sources and connectivity reconciliation
//!
//! A raiser owns the alarms of one source and registers them once. The
//! reconciler maps source connectivity onto connect/disconnect: local hardware
//! follows the board readiness, remote peers follow their service events. A
//! disconnect never reads as cleared.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::domain::{AlarmChange, AlarmState};
use crate::error::Result;
use crate::manager::AlarmManager;
use crate::messages::{AlarmPayload, Message, ServiceEvent};
use crate::messaging::Messaging;
use crate::storage::StoredAlarm;

/// Command used to ask a peer for its full alarm list
pub const COMMAND_LIST_ALARMS: &str = "list-alarms";

/// Provider of the alarms of one source
pub trait AlarmRaiser: Send + Sync {
    fn source_name(&self) -> &str;

    fn register_alarms(&self, manager: &AlarmManager) -> Result<()>;
}

/// Remote source known from storage
pub struct StoredAlarmsRaiser {
    source: String,
    alarms: Vec<(String, String)>,
}

impl StoredAlarmsRaiser {
    pub fn new(source: impl Into<String>, alarms: Vec<(String, String)>) -> Self {
        Self {
            source: source.into(),
            alarms,
        }
    }

    /// One raiser per non-local source, preserving stored order
    pub fn group(stored: &[StoredAlarm], local_source: &str) -> Vec<Self> {
        let mut raisers: Vec<Self> = Vec::new();
        for alarm in stored.iter().filter(|a| a.active && a.source != local_source) {
            let pair = (alarm.sid.clone(), alarm.name.clone());
            match raisers.iter_mut().find(|r| r.source == alarm.source) {
                Some(raiser) => raiser.alarms.push(pair),
                None => raisers.push(Self::new(&alarm.source, vec![pair])),
            }
        }
        raisers
    }
}

impl AlarmRaiser for StoredAlarmsRaiser {
    fn source_name(&self) -> &str {
        &self.source
    }

    fn register_alarms(&self, manager: &AlarmManager) -> Result<()> {
        for (sid, name) in &self.alarms {
            manager.register_alarm(&self.source, sid, name)?;
        }
        Ok(())
    }
}

pub struct SourceReconciler {
    manager: Arc<AlarmManager>,
    messaging: Arc<dyn Messaging>,
    local_source: String,
    remotes: RwLock<BTreeSet<String>>,
}

impl SourceReconciler {
    pub fn new(
        manager: Arc<AlarmManager>,
        messaging: Arc<dyn Messaging>,
        local_source: impl Into<String>,
    ) -> Self {
        Self {
            manager,
            messaging,
            local_source: local_source.into(),
            remotes: RwLock::new(BTreeSet::new()),
        }
    }

    pub fn local_source(&self) -> &str {
        &self.local_source
    }

    /// Register the raiser's alarms, once per call
    pub fn add_raiser(&self, raiser: &dyn AlarmRaiser) -> Result<()> {
        raiser.register_alarms(&self.manager)?;
        info!("Raiser added: {}", raiser.source_name());
        Ok(())
    }

    /// Follow a remote peer's service events and alerts
    pub async fn add_remote_source(&self, source: &str) -> Result<()> {
        self.messaging.subscribe(source).await?;
        self.remotes.write().insert(source.to_string());
        Ok(())
    }

    pub fn is_remote(&self, source: &str) -> bool {
        self.remotes.read().contains(source)
    }

    pub fn remotes(&self) -> Vec<String> {
        self.remotes.read().iter().cloned().collect()
    }

    /// Local hardware readiness drives the local source
    pub fn on_hardware_ready(&self, ready: bool) -> Vec<AlarmChange> {
        if ready {
            self.manager.connect(&self.local_source)
        } else {
            self.manager.disconnect(&self.local_source)
        }
    }

    pub async fn on_service_event(&self, sender: &str, event: ServiceEvent) -> Vec<AlarmChange> {
        if !self.is_remote(sender) {
            debug!("Service event from unknown source {}: {:?}", sender, event);
            return Vec::new();
        }

        match event {
            ServiceEvent::Connected => {
                let changes = self.manager.connect(sender);
                self.request_list(sender).await;
                changes
            },
            ServiceEvent::Disconnecting => self.manager.disconnect(sender),
        }
    }

    /// Ask a peer for its full alarm list
    pub async fn request_list(&self, source: &str) {
        let message = Message::command(self.messaging.name(), source, COMMAND_LIST_ALARMS, &[]);
        if let Err(e) = self.messaging.send(message).await {
            warn!("List request to {}: {}", source, e);
        }
    }

    /// Incremental update from a peer alert
    pub fn apply_remote_alert(&self, sender: &str, payload: &AlarmPayload) -> Result<Option<AlarmChange>> {
        if !self.is_remote(sender) {
            debug!("Alert from unknown source {} ignored", sender);
            return Ok(None);
        }
        // Peer tests and peer-side disables are not ours to mirror
        if payload.is_testing || payload.state == AlarmState::Disabled {
            return Ok(None);
        }

        self.manager.register_alarm(sender, &payload.id, &payload.name)?;
        let target = (sender, payload.id.as_str());
        match payload.state {
            AlarmState::Lowered => self.manager.lower(target, &payload.message),
            state => self
                .manager
                .raise(target, state, &payload.message, Some(payload.code)),
        }
    }

    /// Full resynchronisation from a peer's list
    ///
    /// A list reply proves the peer is up, so the source is connected first.
    pub fn apply_remote_list(&self, sender: &str, list: &[AlarmPayload]) -> Vec<AlarmChange> {
        if !self.is_remote(sender) {
            debug!("Alarm list from unknown source {} ignored", sender);
            return Vec::new();
        }

        for payload in list {
            if let Err(e) = self.manager.register_alarm(sender, &payload.id, &payload.name) {
                warn!("Remote alarm {}:{} skipped: {}", sender, payload.id, e);
            }
        }

        let mut changes = Vec::new();
        if !self.manager.is_connected(sender) {
            changes.extend(self.manager.connect(sender));
        }

        for payload in list {
            match self.apply_remote_alert(sender, payload) {
                Ok(Some(change)) => changes.push(change),
                Ok(None) => {},
                Err(e) => warn!("Remote alarm {}:{} not applied: {}", sender, payload.id, e),
            }
        }

        debug!("Resync {}: {} alarms, {} changes", sender, list.len(), changes.len());
        changes
    }

    /// Periodic resynchronisation of every remote
    pub async fn refresh_remotes(&self) {
        for source in self.remotes() {
            self.request_list(&source).await;
        }
    }
}
