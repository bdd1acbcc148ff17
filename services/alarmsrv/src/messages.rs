//! Wire messages exchanged with peers
//!
//! Pure mapping between alarms and message shapes. A message carries one typed
//! payload next to its routing header, e.g.
//!
//! ```json
//! {"type":"ALERT","sender":"alarms","alarm":{"id":"gs","name":"Gensets","state":"CRITICAL",...}}
//! ```

use errors::ErrorInfo;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::{Alarm, AlarmState};
use crate::error::{AlarmError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Alert,
    Command,
    CommandResponse,
    Notification,
    SubscribeResponse,
    Error,
}

/// Service lifecycle notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceEvent {
    Connected,
    Disconnecting,
}

/// Alarm as it travels on the wire; `id` is the short id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmPayload {
    pub id: String,
    pub name: String,
    pub state: AlarmState,
    #[serde(default)]
    pub message: String,
    #[serde(default = "no_code")]
    pub code: i32,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub is_testing: bool,
}

fn no_code() -> i32 {
    crate::domain::NO_CODE
}

impl From<&Alarm> for AlarmPayload {
    fn from(alarm: &Alarm) -> Self {
        Self {
            id: alarm.sid.clone(),
            name: alarm.name.clone(),
            state: alarm.state,
            message: alarm.message.clone(),
            code: alarm.code,
            source: alarm.source.clone(),
            is_testing: alarm.is_testing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// Typed payload, one per message kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Payload {
    Alarm(AlarmPayload),
    AlarmsList(Vec<AlarmPayload>),
    ServiceEvent(ServiceEvent),
    Command(CommandRequest),
    Error(ErrorInfo),
    /// Untyped passthrough
    Fields(Map<String, Value>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Message {
    fn new(message_type: MessageType, sender: &str, target: Option<&str>, payload: Payload) -> Self {
        Self {
            message_type,
            sender: sender.to_string(),
            target: target.map(str::to_string),
            payload,
        }
    }

    /// Alert for one alarm
    pub fn alert(sender: &str, alarm: &Alarm) -> Self {
        Self::new(MessageType::Alert, sender, None, Payload::Alarm(alarm.into()))
    }

    /// `list-alarms` response
    pub fn alarms_list(sender: &str, target: &str, alarms: &[Alarm]) -> Self {
        Self::new(
            MessageType::CommandResponse,
            sender,
            Some(target),
            Payload::AlarmsList(alarms.iter().map(AlarmPayload::from).collect()),
        )
    }

    /// Single alarm command response
    pub fn alarm_response(sender: &str, target: &str, alarm: &Alarm) -> Self {
        Self::new(MessageType::CommandResponse, sender, Some(target), Payload::Alarm(alarm.into()))
    }

    pub fn service_event(sender: &str, event: ServiceEvent) -> Self {
        Self::new(MessageType::Notification, sender, None, Payload::ServiceEvent(event))
    }

    pub fn command(sender: &str, target: &str, name: &str, args: &[&str]) -> Self {
        Self::new(
            MessageType::Command,
            sender,
            Some(target),
            Payload::Command(CommandRequest {
                name: name.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
            }),
        )
    }

    pub fn error(sender: &str, target: &str, info: ErrorInfo) -> Self {
        Self::new(MessageType::Error, sender, Some(target), Payload::Error(info))
    }

    pub fn alarm(&self) -> Option<&AlarmPayload> {
        match &self.payload {
            Payload::Alarm(alarm) => Some(alarm),
            _ => None,
        }
    }

    pub fn alarms_list_payload(&self) -> Option<&[AlarmPayload]> {
        match &self.payload {
            Payload::AlarmsList(list) => Some(list),
            _ => None,
        }
    }

    pub fn service_event_payload(&self) -> Option<ServiceEvent> {
        match &self.payload {
            Payload::ServiceEvent(event) => Some(*event),
            _ => None,
        }
    }

    pub fn command_payload(&self) -> Option<&CommandRequest> {
        match &self.payload {
            Payload::Command(command) => Some(command),
            _ => None,
        }
    }
}

pub fn encode(message: &Message) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

pub fn decode(raw: &str) -> Result<Message> {
    serde_json::from_str(raw).map_err(AlarmError::from)
}
