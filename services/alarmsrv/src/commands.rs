//! Command surface
//!
//! - `list-alarms`
//! - `test-alarm <sid> [state] [durationSeconds]`
//! - `end-test <sid>`
//! - `refresh-alarm <sid>`
//!
//! A sid may be written `source:sid` when several sources use it. Malformed
//! commands fail before touching any state.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::domain::{Alarm, AlarmRef, AlarmState};
use crate::error::{AlarmError, Result};
use crate::manager::AlarmManager;
use crate::messages::{CommandRequest, Message};
use crate::messaging::Messaging;
use crate::sources::{SourceReconciler, COMMAND_LIST_ALARMS};
use crate::test_controller::TestController;

pub const COMMAND_TEST_ALARM: &str = "test-alarm";
pub const COMMAND_END_TEST: &str = "end-test";
pub const COMMAND_REFRESH_ALARM: &str = "refresh-alarm";

/// `sid` or `source:sid`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmTarget {
    pub source: Option<String>,
    pub sid: String,
}

impl AlarmTarget {
    fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (source, sid) = match raw.split_once(':') {
            Some((source, sid)) => (Some(source.to_string()), sid),
            None => (None, raw),
        };
        if sid.is_empty() || source.as_deref().is_some_and(str::is_empty) {
            return Err(AlarmError::validation(format!("bad alarm id '{}'", raw)));
        }
        Ok(Self {
            source,
            sid: sid.to_string(),
        })
    }

    pub fn alarm_ref(&self) -> AlarmRef<'_> {
        AlarmRef {
            source: self.source.as_deref(),
            sid: &self.sid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlarmCommand {
    ListAlarms,
    TestAlarm {
        target: AlarmTarget,
        state: Option<AlarmState>,
        duration: Option<Duration>,
    },
    EndTest {
        target: AlarmTarget,
    },
    RefreshAlarm {
        target: AlarmTarget,
    },
}

fn required_target(command: &str, args: &[String]) -> Result<AlarmTarget> {
    let raw = args
        .first()
        .ok_or_else(|| AlarmError::validation(format!("{} requires an alarm sid", command)))?;
    AlarmTarget::parse(raw)
}

impl AlarmCommand {
    pub fn parse(name: &str, args: &[String]) -> Result<Self> {
        match name.trim() {
            COMMAND_LIST_ALARMS => Ok(Self::ListAlarms),
            COMMAND_TEST_ALARM => {
                let target = required_target(COMMAND_TEST_ALARM, args)?;
                let state = args.get(1).map(|s| s.parse::<AlarmState>()).transpose()?;
                if state.is_some_and(|s| !s.is_raised()) {
                    return Err(AlarmError::validation(
                        "test state must be MODERATE or CRITICAL",
                    ));
                }
                let duration = args
                    .get(2)
                    .map(|s| {
                        s.trim().parse::<u64>().map(Duration::from_secs).map_err(|_| {
                            AlarmError::validation(format!("bad test duration '{}'", s))
                        })
                    })
                    .transpose()?;
                Ok(Self::TestAlarm {
                    target,
                    state,
                    duration,
                })
            },
            COMMAND_END_TEST => Ok(Self::EndTest {
                target: required_target(COMMAND_END_TEST, args)?,
            }),
            COMMAND_REFRESH_ALARM => Ok(Self::RefreshAlarm {
                target: required_target(COMMAND_REFRESH_ALARM, args)?,
            }),
            other => Err(AlarmError::validation(format!("unknown command '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandReply {
    Alarms(Vec<Alarm>),
    Alarm(Alarm),
}

pub struct CommandHandler {
    manager: Arc<AlarmManager>,
    tests: Arc<TestController>,
    reconciler: Arc<SourceReconciler>,
    messaging: Arc<dyn Messaging>,
}

impl CommandHandler {
    pub fn new(
        manager: Arc<AlarmManager>,
        tests: Arc<TestController>,
        reconciler: Arc<SourceReconciler>,
        messaging: Arc<dyn Messaging>,
    ) -> Self {
        Self {
            manager,
            tests,
            reconciler,
            messaging,
        }
    }

    pub async fn handle(&self, request: &CommandRequest) -> Result<CommandReply> {
        let command = AlarmCommand::parse(&request.name, &request.args)?;
        debug!("Command: {:?}", command);
        self.execute(command).await
    }

    pub async fn execute(&self, command: AlarmCommand) -> Result<CommandReply> {
        match command {
            AlarmCommand::ListAlarms => Ok(CommandReply::Alarms(self.manager.list_alarms())),
            AlarmCommand::TestAlarm {
                target,
                state,
                duration,
            } => {
                let change = self.tests.start_test(target.alarm_ref(), state, None, duration)?;
                Ok(CommandReply::Alarm(change.alarm))
            },
            AlarmCommand::EndTest { target } => {
                self.tests.end_test(target.alarm_ref())?;
                Ok(CommandReply::Alarm(self.manager.get_alarm(target.alarm_ref())?))
            },
            AlarmCommand::RefreshAlarm { target } => {
                let alarm = self.manager.get_alarm(target.alarm_ref())?;
                if self.reconciler.is_remote(&alarm.source) {
                    self.reconciler.request_list(&alarm.source).await;
                }
                self.messaging
                    .broadcast(Message::alert(self.messaging.name(), &alarm))
                    .await?;
                Ok(CommandReply::Alarm(alarm))
            },
        }
    }
}
