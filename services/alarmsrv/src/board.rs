//! Local alarms board
//!
//! Passive switches wired to local alarms (gensets, inverter, high water) plus
//! three control switches:
//! - `master`: on while the board is ready. When off, hard-wired alarms go
//!   straight to the buzzer and cannot be silenced in software.
//! - `buzzer`: on while any alarm that is not under test is raised
//! - `pilot`: on while any alarm that is not under test is raised or disabled
//!
//! The serial device protocol sits behind [`HardwareLink`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dispatcher::DequeueListener;
use crate::domain::{AlarmChange, AlarmState};
use crate::error::Result;
use crate::manager::AlarmManager;
use crate::sources::AlarmRaiser;

pub const GENSET_ALARM_SID: &str = "gs";
pub const INVERTER_ALARM_SID: &str = "iv";
pub const HIGHWATER_ALARM_SID: &str = "hw";

/// Pin change reported by the hardware
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchEvent {
    pub switch_id: String,
    pub on: bool,
}

impl SwitchEvent {
    pub fn new(switch_id: impl Into<String>, on: bool) -> Self {
        Self {
            switch_id: switch_id.into(),
            on,
        }
    }
}

#[async_trait]
pub trait HardwareLink: Send + Sync {
    async fn set_switch(&self, switch_id: &str, on: bool) -> Result<()>;

    /// Ask the device to report every switch state again
    async fn request_status(&self) -> Result<()>;
}

/// Link that only remembers what it was told; used by the virtual board
#[derive(Debug, Default)]
pub struct MemoryLink {
    switches: Mutex<BTreeMap<String, bool>>,
    status_requests: Mutex<usize>,
}

impl MemoryLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn switch(&self, switch_id: &str) -> Option<bool> {
        self.switches.lock().get(switch_id).copied()
    }

    pub fn status_requests(&self) -> usize {
        *self.status_requests.lock()
    }
}

#[async_trait]
impl HardwareLink for MemoryLink {
    async fn set_switch(&self, switch_id: &str, on: bool) -> Result<()> {
        self.switches.lock().insert(switch_id.to_string(), on);
        Ok(())
    }

    async fn request_status(&self) -> Result<()> {
        *self.status_requests.lock() += 1;
        Ok(())
    }
}

/// One local alarm switch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalAlarm {
    pub sid: String,
    pub name: String,
    /// State raised on pin-on
    #[serde(default = "default_severity")]
    pub severity: AlarmState,
}

fn default_severity() -> AlarmState {
    AlarmState::Critical
}

impl LocalAlarm {
    pub fn new(sid: &str, name: &str) -> Self {
        Self {
            sid: sid.to_string(),
            name: name.to_string(),
            severity: default_severity(),
        }
    }

    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new(GENSET_ALARM_SID, "Gensets"),
            Self::new(INVERTER_ALARM_SID, "Inverter"),
            Self::new(HIGHWATER_ALARM_SID, "High Water"),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSwitchIds {
    pub master: String,
    pub buzzer: String,
    pub pilot: String,
}

impl Default for ControlSwitchIds {
    fn default() -> Self {
        Self {
            master: "master".to_string(),
            buzzer: "buzzer".to_string(),
            pilot: "pilot".to_string(),
        }
    }
}

pub struct AlarmsBoard {
    source: String,
    alarms: Vec<LocalAlarm>,
    controls: ControlSwitchIds,
    link: Arc<dyn HardwareLink>,
    manager: Arc<AlarmManager>,
    ready: AtomicBool,
    /// Last (buzzer, pilot) written to the link
    indicators: tokio::sync::Mutex<Option<(bool, bool)>>,
}

impl AlarmsBoard {
    pub fn new(
        source: impl Into<String>,
        alarms: Vec<LocalAlarm>,
        controls: ControlSwitchIds,
        link: Arc<dyn HardwareLink>,
        manager: Arc<AlarmManager>,
    ) -> Self {
        Self {
            source: source.into(),
            alarms,
            controls,
            link,
            manager,
            ready: AtomicBool::new(false),
            indicators: tokio::sync::Mutex::new(None),
        }
    }

    pub fn local_alarms(&self) -> &[LocalAlarm] {
        &self.alarms
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Record readiness and route hard-wired alarms through software while ready
    pub async fn set_ready(&self, ready: bool) -> Result<()> {
        self.ready.store(ready, Ordering::SeqCst);
        info!("Board ready: {}", ready);
        self.link.set_switch(&self.controls.master, ready).await
    }

    /// Map a pin change onto raise/lower of the matching local alarm
    pub fn handle_switch(&self, event: &SwitchEvent) -> Result<Option<AlarmChange>> {
        let Some(alarm) = self.alarms.iter().find(|a| a.sid == event.switch_id) else {
            debug!("Switch {} is not an alarm", event.switch_id);
            return Ok(None);
        };

        let target = (self.source.as_str(), alarm.sid.as_str());
        if event.on {
            let message = format!("{} alarm on", alarm.name);
            self.manager.raise(target, alarm.severity, &message, None)
        } else {
            let message = format!("{} alarm off", alarm.name);
            self.manager.lower(target, &message)
        }
    }

    pub async fn request_status(&self) -> Result<()> {
        self.link.request_status().await
    }

    /// Recompute buzzer and pilot from the current alarm set
    pub async fn update_indicators(&self) -> Result<()> {
        let alarms = self.manager.list_alarms();
        let real = alarms.iter().filter(|a| !a.is_testing);
        let (mut buzzer, mut pilot) = (false, false);
        for alarm in real {
            buzzer |= alarm.is_raised();
            pilot |= alarm.is_raised() || alarm.is_disabled();
        }

        let mut last = self.indicators.lock().await;
        if *last == Some((buzzer, pilot)) {
            return Ok(());
        }
        self.link.set_switch(&self.controls.buzzer, buzzer).await?;
        self.link.set_switch(&self.controls.pilot, pilot).await?;
        *last = Some((buzzer, pilot));
        debug!("Indicators: buzzer={} pilot={}", buzzer, pilot);
        Ok(())
    }

    /// Turn every control switch off
    pub async fn shutdown(&self) {
        for id in [&self.controls.master, &self.controls.buzzer, &self.controls.pilot] {
            if let Err(e) = self.link.set_switch(id, false).await {
                warn!("Switch {} off: {}", id, e);
            }
        }
        self.ready.store(false, Ordering::SeqCst);
    }
}

impl AlarmRaiser for AlarmsBoard {
    fn source_name(&self) -> &str {
        &self.source
    }

    fn register_alarms(&self, manager: &AlarmManager) -> Result<()> {
        for alarm in &self.alarms {
            manager.register_alarm(&self.source, &alarm.sid, &alarm.name)?;
        }
        Ok(())
    }
}

/// Keeps buzzer and pilot in line with real alarm changes
pub struct ActuationListener {
    board: Arc<AlarmsBoard>,
}

impl ActuationListener {
    pub fn new(board: Arc<AlarmsBoard>) -> Self {
        Self { board }
    }
}

#[async_trait]
impl DequeueListener for ActuationListener {
    fn name(&self) -> &str {
        "actuation"
    }

    async fn on_dequeued(&self, change: &AlarmChange) -> Result<()> {
        if !change.is_persistable() {
            return Ok(());
        }
        self.board.update_indicators().await
    }
}
