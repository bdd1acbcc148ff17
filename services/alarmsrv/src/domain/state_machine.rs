//! Transition rules for a single alarm
//!
//! Pure logic: every operation mutates one [`AlarmEntry`] and reports whether an
//! observable change happened. Locking, sequencing and notification live in the
//! manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::alarm::{Alarm, AlarmKey, AlarmState, NO_CODE};
use crate::error::{AlarmError, Result};

/// Kind of an observable change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Raised,
    Lowered,
    Disconnected,
    Connected,
    TestStarted,
    TestEnded,
}

/// Outcome of a transition that changed the alarm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub kind: ChangeKind,
    /// A genuine transition hit the alarm while it was under test
    pub test_cancelled: bool,
}

impl Transition {
    fn new(kind: ChangeKind) -> Self {
        Self {
            kind,
            test_cancelled: false,
        }
    }
}

/// Snapshot of an alarm after a change, as delivered to listeners
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmChange {
    /// Manager-wide sequence number, increasing in transition order
    pub seq: u64,
    pub kind: ChangeKind,
    pub test_cancelled: bool,
    pub alarm: Alarm,
    pub at: DateTime<Utc>,
}

impl AlarmChange {
    /// Ephemeral test start/end, never persisted or actuated
    pub fn is_test(&self) -> bool {
        matches!(self.kind, ChangeKind::TestStarted | ChangeKind::TestEnded)
    }

    /// Whether persistence and actuation should see this change
    pub fn is_persistable(&self) -> bool {
        !self.is_test() && !self.alarm.is_testing
    }

    pub fn key(&self) -> AlarmKey {
        self.alarm.key()
    }
}

/// The real (non-test) reading of an alarm
#[derive(Debug, Clone, PartialEq)]
struct Reading {
    state: AlarmState,
    message: String,
    code: i32,
    last_raised: Option<DateTime<Utc>>,
}

impl Reading {
    fn of(alarm: &Alarm) -> Self {
        Self {
            state: alarm.state,
            message: alarm.message.clone(),
            code: alarm.code,
            last_raised: alarm.last_raised,
        }
    }

    fn restore_into(self, alarm: &mut Alarm) {
        alarm.state = self.state;
        alarm.message = self.message;
        alarm.code = self.code;
        alarm.last_raised = self.last_raised;
    }
}

/// An alarm plus the hidden state its transitions need
#[derive(Debug, Clone)]
pub struct AlarmEntry {
    pub alarm: Alarm,
    /// Reading to come back to on connect, captured at disconnect
    resume: Option<Reading>,
    /// Reading captured at test start
    pre_test: Option<Reading>,
}

impl AlarmEntry {
    pub fn new(alarm: Alarm) -> Self {
        Self {
            alarm,
            resume: None,
            pre_test: None,
        }
    }

    /// Real state, looking through an active test
    pub fn real_state(&self) -> AlarmState {
        match &self.pre_test {
            Some(reading) => reading.state,
            None => self.alarm.state,
        }
    }

    /// Drop an active test, putting the real reading back. Returns true if a
    /// test was active.
    fn abort_test(&mut self) -> bool {
        match self.pre_test.take() {
            Some(reading) => {
                reading.restore_into(&mut self.alarm);
                self.alarm.is_testing = false;
                true
            },
            None => false,
        }
    }

    pub fn raise(
        &mut self,
        state: AlarmState,
        message: &str,
        code: Option<i32>,
        now: DateTime<Utc>,
    ) -> Result<Option<Transition>> {
        if !state.is_raised() {
            return Err(AlarmError::validation(format!(
                "cannot raise to {}, expected MODERATE or CRITICAL",
                state
            )));
        }
        if self.alarm.is_disabled() {
            return Ok(None);
        }

        let test_cancelled = self.abort_test();
        let prior = self.alarm.state;

        self.alarm.state = state;
        self.alarm.message = message.to_string();
        self.alarm.code = code.unwrap_or(NO_CODE);
        if prior == AlarmState::Lowered {
            self.alarm.last_raised = Some(now);
        }

        Ok(Some(Transition {
            kind: ChangeKind::Raised,
            test_cancelled,
        }))
    }

    pub fn lower(&mut self, message: &str, now: DateTime<Utc>) -> Option<Transition> {
        if !self.real_state().is_raised() {
            return None;
        }

        let test_cancelled = self.abort_test();
        self.alarm.state = AlarmState::Lowered;
        self.alarm.message = message.to_string();
        self.alarm.code = NO_CODE;
        self.alarm.last_lowered = Some(now);

        Some(Transition {
            kind: ChangeKind::Lowered,
            test_cancelled,
        })
    }

    pub fn disconnect(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        self.alarm.connected = false;
        if self.alarm.is_disabled() {
            return None;
        }

        let test_cancelled = self.abort_test();
        self.resume = Some(Reading::of(&self.alarm));
        self.alarm.state = AlarmState::Disabled;
        self.alarm.last_disabled = Some(now);

        Some(Transition {
            kind: ChangeKind::Disconnected,
            test_cancelled,
        })
    }

    pub fn connect(&mut self) -> Option<Transition> {
        self.alarm.connected = true;
        if !self.alarm.is_disabled() {
            return None;
        }

        match self.resume.take() {
            Some(reading) => reading.restore_into(&mut self.alarm),
            None => {
                self.alarm.state = AlarmState::Lowered;
                self.alarm.code = NO_CODE;
            },
        }

        Some(Transition::new(ChangeKind::Connected))
    }

    pub fn start_test(
        &mut self,
        state: AlarmState,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        if !state.is_raised() {
            return Err(AlarmError::validation(format!(
                "cannot test with {}, expected MODERATE or CRITICAL",
                state
            )));
        }
        if self.alarm.is_disabled() {
            return Err(AlarmError::conflict(format!(
                "alarm {} is disabled",
                self.alarm.key()
            )));
        }
        if self.alarm.is_testing {
            return Err(AlarmError::conflict(format!(
                "alarm {} is already testing",
                self.alarm.key()
            )));
        }

        let prior = self.alarm.state;
        self.pre_test = Some(Reading::of(&self.alarm));
        self.alarm.is_testing = true;
        self.alarm.state = state;
        self.alarm.message = message.to_string();
        self.alarm.code = NO_CODE;
        if prior == AlarmState::Lowered {
            self.alarm.last_raised = Some(now);
        }

        Ok(Transition::new(ChangeKind::TestStarted))
    }

    pub fn end_test(&mut self) -> Option<Transition> {
        if self.abort_test() {
            Some(Transition::new(ChangeKind::TestEnded))
        } else {
            None
        }
    }
}
