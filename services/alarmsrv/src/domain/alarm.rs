//! Alarm entity and its identity types

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AlarmError;

/// Code carried by an alarm that has no specific code
pub const NO_CODE: i32 = -1;

/// Alarm state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmState {
    #[default]
    Lowered,
    Moderate,
    Critical,
    /// Owning source is not connected, real state unknown
    Disabled,
}

impl AlarmState {
    pub fn is_raised(self) -> bool {
        matches!(self, Self::Moderate | Self::Critical)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lowered => "LOWERED",
            Self::Moderate => "MODERATE",
            Self::Critical => "CRITICAL",
            Self::Disabled => "DISABLED",
        }
    }
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlarmState {
    type Err = AlarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOWERED" => Ok(Self::Lowered),
            "MODERATE" => Ok(Self::Moderate),
            "CRITICAL" => Ok(Self::Critical),
            "DISABLED" => Ok(Self::Disabled),
            other => Err(AlarmError::validation(format!("unknown alarm state '{}'", other))),
        }
    }
}

/// Registry key: short id is unique within its source
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlarmKey {
    pub source: String,
    pub sid: String,
}

impl AlarmKey {
    pub fn new(source: impl Into<String>, sid: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            sid: sid.into(),
        }
    }
}

impl fmt::Display for AlarmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.sid)
    }
}

/// Lookup target for manager operations
///
/// A bare sid is accepted when it is unambiguous across sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmRef<'a> {
    pub source: Option<&'a str>,
    pub sid: &'a str,
}

impl<'a> From<&'a str> for AlarmRef<'a> {
    fn from(sid: &'a str) -> Self {
        Self { source: None, sid }
    }
}

impl<'a> From<&'a String> for AlarmRef<'a> {
    fn from(sid: &'a String) -> Self {
        Self {
            source: None,
            sid: sid.as_str(),
        }
    }
}

impl<'a> From<(&'a str, &'a str)> for AlarmRef<'a> {
    fn from((source, sid): (&'a str, &'a str)) -> Self {
        Self {
            source: Some(source),
            sid,
        }
    }
}

impl<'a> From<&'a AlarmKey> for AlarmRef<'a> {
    fn from(key: &'a AlarmKey) -> Self {
        Self {
            source: Some(key.source.as_str()),
            sid: key.sid.as_str(),
        }
    }
}

impl fmt::Display for AlarmRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source {
            Some(source) => write!(f, "{}:{}", source, self.sid),
            None => f.write_str(self.sid),
        }
    }
}

/// Alarm record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alarm {
    /// Stable numeric identity, assigned once at registration
    pub id: i64,
    pub sid: String,
    pub name: String,
    pub source: String,
    pub state: AlarmState,
    pub message: String,
    pub code: i32,
    pub last_raised: Option<DateTime<Utc>>,
    pub last_lowered: Option<DateTime<Utc>>,
    pub last_disabled: Option<DateTime<Utc>>,
    pub is_testing: bool,
    pub connected: bool,
}

impl Alarm {
    pub fn new(
        id: i64,
        source: impl Into<String>,
        sid: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id,
            sid: sid.into(),
            name: name.into(),
            source: source.into(),
            state: AlarmState::Lowered,
            message: String::new(),
            code: NO_CODE,
            last_raised: None,
            last_lowered: None,
            last_disabled: None,
            is_testing: false,
            connected: false,
        }
    }

    pub fn key(&self) -> AlarmKey {
        AlarmKey::new(&self.source, &self.sid)
    }

    pub fn is_raised(&self) -> bool {
        self.state.is_raised()
    }

    pub fn is_disabled(&self) -> bool {
        self.state == AlarmState::Disabled
    }
}
