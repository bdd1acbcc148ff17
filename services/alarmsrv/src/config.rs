//! Alarm service configuration
//!
//! Layered with figment: built-in defaults, then the YAML file, then
//! `ALARMSRV_` environment variables (`ALARMSRV_MESSAGING__URL=...`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::board::{ControlSwitchIds, LocalAlarm};
use crate::dispatcher::DispatcherOptions;
use crate::domain::AlarmState;
use crate::error::{AlarmError, Result};
use crate::test_controller::TestOptions;

pub const DEFAULT_CONFIG_PATH: &str = "config/alarmsrv.yaml";
pub const ENV_PREFIX: &str = "ALARMSRV_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSection {
    /// Identity on the messaging fabric
    pub name: String,
    /// Source name of the local board alarms
    pub local_source: String,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            name: "alarms".to_string(),
            local_source: "local".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagingSection {
    pub enabled: bool,
    pub url: String,
    /// Channel prefix
    pub prefix: String,
}

impl Default for MessagingSection {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "redis://127.0.0.1:6379".to_string(),
            prefix: "alarms".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSection {
    pub enabled: bool,
    pub url: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "sqlite://data/alarms.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardSection {
    pub enabled: bool,
    pub alarms: Vec<LocalAlarm>,
    pub controls: ControlSwitchIds,
    /// Delay between virtual regime steps
    pub regime_interval_ms: u64,
}

impl Default for BoardSection {
    fn default() -> Self {
        Self {
            enabled: true,
            alarms: LocalAlarm::defaults(),
            controls: ControlSwitchIds::default(),
            regime_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSection {
    pub default_state: AlarmState,
    pub default_duration_secs: u64,
    pub max_duration_secs: u64,
}

impl Default for TestSection {
    fn default() -> Self {
        Self {
            default_state: AlarmState::Critical,
            default_duration_secs: 5,
            max_duration_secs: 300,
        }
    }
}

impl TestSection {
    pub fn options(&self) -> TestOptions {
        TestOptions {
            default_state: self.default_state,
            default_duration: Duration::from_secs(self.default_duration_secs),
            max_duration: Duration::from_secs(self.max_duration_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherSection {
    pub ready_poll_ms: u64,
    pub drain_grace_ms: u64,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            ready_poll_ms: 200,
            drain_grace_ms: 5000,
        }
    }
}

impl DispatcherSection {
    pub fn options(&self) -> DispatcherOptions {
        DispatcherOptions {
            ready_poll: Duration::from_millis(self.ready_poll_ms),
            drain_grace: Duration::from_millis(self.drain_grace_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshSection {
    /// Remote list refresh period, 0 disables it
    pub interval_secs: u64,
}

impl Default for RefreshSection {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    pub level: String,
    pub dir: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlarmConfig {
    pub service: ServiceSection,
    pub messaging: MessagingSection,
    pub storage: StorageSection,
    pub board: BoardSection,
    /// Peer services whose alarms are mirrored
    pub remotes: Vec<String>,
    pub test: TestSection,
    pub dispatcher: DispatcherSection,
    pub refresh: RefreshSection,
    pub logging: LoggingSection,
}

impl AlarmConfig {
    /// Load defaults, then `path` if it exists, then the environment
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut figment = Figment::from(Serialized::defaults(AlarmConfig::default()));

        if path.exists() {
            figment = figment.merge(Yaml::file(path));
        } else {
            warn!("Config {} not found, using defaults", path.display());
        }

        Self::extract(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Defaults plus an inline YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Self::extract(Figment::from(Serialized::defaults(AlarmConfig::default())).merge(Yaml::string(yaml)))
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: AlarmConfig = figment
            .extract()
            .map_err(|e| AlarmError::config(format!("failed to load configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.service.name.trim().is_empty() {
            return Err(AlarmError::config("service.name must not be empty"));
        }
        if self.service.local_source.trim().is_empty() {
            return Err(AlarmError::config("service.local_source must not be empty"));
        }
        if self.remotes.iter().any(|r| r == &self.service.local_source) {
            return Err(AlarmError::config(format!(
                "remote '{}' clashes with the local source",
                self.service.local_source
            )));
        }
        if self.messaging.enabled && self.messaging.url.is_empty() {
            return Err(AlarmError::config("messaging.url must not be empty"));
        }
        if self.storage.enabled && self.storage.url.is_empty() {
            return Err(AlarmError::config("storage.url must not be empty"));
        }
        if !self.test.default_state.is_raised() {
            return Err(AlarmError::config("test.default_state must be MODERATE or CRITICAL"));
        }
        if self.test.default_duration_secs == 0
            || self.test.default_duration_secs > self.test.max_duration_secs
        {
            return Err(AlarmError::config(
                "test.default_duration_secs must be between 1 and test.max_duration_secs",
            ));
        }
        if let Some(alarm) = self.board.alarms.iter().find(|a| !a.severity.is_raised()) {
            return Err(AlarmError::config(format!(
                "board alarm {} severity must be MODERATE or CRITICAL",
                alarm.sid
            )));
        }
        Ok(())
    }
}
