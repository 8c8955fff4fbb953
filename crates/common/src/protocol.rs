//! Command channel wire format.
//!
//! Every frame is one line of JSON: `{"msgType": <int>, "msgContent": "<json>"}`.
//! `msgContent` is itself a JSON document encoded as a string; inbound frames
//! may also carry it inline as an object.
//!
//! | msgType | direction        | meaning                          |
//! |---------|------------------|----------------------------------|
//! | 4       | device → server  | poll, `{"name": <device>}`       |
//! | 5       | device → server  | hello                            |
//! | 6       | server → device  | hello acknowledgment             |
//! | 8       | device → server  | command acknowledgment           |
//! | 9       | server → device  | command push                     |

use std::fmt::Display;

use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::tasks::PendingCommand;

/// Frames longer than this are dropped unread.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// `fromName` of every server push.
pub const PUSH_SENDER: &str = "push";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Poll,
    Hello,
    HelloAck,
    CommandAck,
    CommandPush,
    Other(i64),
}

impl MsgType {
    pub fn code(self) -> i64 {
        match self {
            MsgType::Poll => 4,
            MsgType::Hello => 5,
            MsgType::HelloAck => 6,
            MsgType::CommandAck => 8,
            MsgType::CommandPush => 9,
            MsgType::Other(code) => code,
        }
    }
}

impl From<i64> for MsgType {
    fn from(code: i64) -> Self {
        match code {
            4 => MsgType::Poll,
            5 => MsgType::Hello,
            6 => MsgType::HelloAck,
            8 => MsgType::CommandAck,
            9 => MsgType::CommandPush,
            other => MsgType::Other(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("msgContent is not a JSON object")]
    BadContent,

    #[error("poll frame carries no device name")]
    MissingDeviceName,

    #[error("unexpected msgType {0}")]
    Unexpected(i64),

    #[error("missing field {0}")]
    MissingField(&'static str),
}

/// The `{msgType, msgContent}` unit exchanged on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "msgType")]
    pub msg_type: i64,
    #[serde(rename = "msgContent", default)]
    pub msg_content: Value,
}

impl Envelope {
    fn with_content(kind: MsgType, content: Value) -> Self {
        Self {
            msg_type: kind.code(),
            msg_content: Value::String(content.to_string()),
        }
    }

    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(line.trim())?)
    }

    /// Serialised frame including the trailing newline.
    pub fn encode_line(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)? + "\n")
    }

    pub fn kind(&self) -> MsgType {
        MsgType::from(self.msg_type)
    }

    /// Decoded `msgContent`; a missing content is an empty object.
    pub fn content(&self) -> Result<Map<String, Value>, ProtocolError> {
        match &self.msg_content {
            Value::Null => Ok(Map::new()),
            Value::Object(map) => Ok(map.clone()),
            Value::String(raw) if raw.trim().is_empty() => Ok(Map::new()),
            Value::String(raw) => match serde_json::from_str::<Value>(raw)? {
                Value::Object(map) => Ok(map),
                _ => Err(ProtocolError::BadContent),
            },
            _ => Err(ProtocolError::BadContent),
        }
    }

    pub fn hello() -> Self {
        Self::with_content(MsgType::Hello, json!({}))
    }

    pub fn hello_ack() -> Self {
        Self::with_content(MsgType::HelloAck, json!({"result": "true", "reason": ""}))
    }

    pub fn poll(device: &str) -> Self {
        Self::with_content(MsgType::Poll, json!({ "name": device }))
    }

    pub fn command_ack(command_uuid: &str) -> Self {
        Self::with_content(MsgType::CommandAck, json!({ "CommandUUID": command_uuid }))
    }

    /// Push of a claimed command. `content` is encoded a second time, as
    /// devices expect it.
    pub fn command_push(device: &str, command: &PendingCommand, msg_date: &str) -> Self {
        let mut body = command.body.clone();
        if let Value::Object(fields) = &mut body {
            fields.insert("msgDate".into(), Value::String(msg_date.to_string()));
        }

        let content = json!({
            "CommandUUID": command.command_uuid,
            "type": command.kind,
            "body": body,
        });

        Self::with_content(
            MsgType::CommandPush,
            json!({
                "UserName": device,
                "fromName": PUSH_SENDER,
                "CommandUUID": command.command_uuid,
                "content": content.to_string(),
            }),
        )
    }
}

/// Inbound frame after validation, one variant per transition of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Hello,
    Poll { device: String },
    CommandAck { command_uuid: Option<String> },
    Other(i64),
}

impl Inbound {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let envelope = Envelope::decode(line)?;
        match envelope.kind() {
            MsgType::Hello => Ok(Inbound::Hello),
            MsgType::Poll => {
                let content = envelope.content()?;
                let device = content
                    .get("name")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .ok_or(ProtocolError::MissingDeviceName)?;
                Ok(Inbound::Poll {
                    device: device.to_string(),
                })
            }
            MsgType::CommandAck => {
                let command_uuid = envelope.content().ok().and_then(|content| {
                    content
                        .get("CommandUUID")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                });
                Ok(Inbound::CommandAck { command_uuid })
            }
            other => Ok(Inbound::Other(other.code())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloAck {
    pub result: String,
    pub reason: String,
}

impl HelloAck {
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        if envelope.kind() != MsgType::HelloAck {
            return Err(ProtocolError::Unexpected(envelope.msg_type));
        }
        let content = envelope.content()?;
        Ok(Self {
            result: string_field(&content, "result")?,
            reason: string_field(&content, "reason").unwrap_or_default(),
        })
    }

    pub fn accepted(&self) -> bool {
        self.result == "true"
    }
}

/// Inner `content` of a command push.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommandContent {
    #[serde(rename = "CommandUUID")]
    pub command_uuid: String,
    #[serde(rename = "type", default)]
    pub kind: Value,
    #[serde(default)]
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandPush {
    pub user_name: String,
    pub from_name: String,
    pub command_uuid: String,
    pub content: CommandContent,
}

impl CommandPush {
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        if envelope.kind() != MsgType::CommandPush {
            return Err(ProtocolError::Unexpected(envelope.msg_type));
        }
        let outer = envelope.content()?;
        let content = match outer.get("content") {
            Some(Value::String(raw)) => serde_json::from_str(raw)?,
            Some(inline @ Value::Object(_)) => serde_json::from_value(inline.clone())?,
            _ => return Err(ProtocolError::MissingField("content")),
        };
        Ok(Self {
            user_name: string_field(&outer, "UserName")?,
            from_name: string_field(&outer, "fromName")?,
            command_uuid: string_field(&outer, "CommandUUID")?,
            content,
        })
    }
}

fn string_field(map: &Map<String, Value>, key: &'static str) -> Result<String, ProtocolError> {
    map.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(ProtocolError::MissingField(key))
}

/// Timestamp format of the `msgDate` stamped into pushed bodies.
pub fn format_msg_date<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: Display,
{
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn hello_ack_frame_is_fixed() {
        let line = Envelope::hello_ack().encode_line().unwrap();
        assert!(line.ends_with('\n'));

        let raw: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(raw["msgType"], 6);
        let content: Value = serde_json::from_str(raw["msgContent"].as_str().unwrap()).unwrap();
        assert_eq!(content, json!({"result": "true", "reason": ""}));
    }

    #[test]
    fn poll_accepts_encoded_or_inline_content() {
        let encoded = r#"{"msgType":4,"msgContent":"{\"name\":\"dev-1\"}"}"#;
        let inline = r#"{"msgType":4,"msgContent":{"name":"dev-1"}}"#;
        for line in [encoded, inline] {
            assert_eq!(
                Inbound::parse(line).unwrap(),
                Inbound::Poll {
                    device: "dev-1".into()
                }
            );
        }
    }

    #[test]
    fn poll_without_name_is_rejected() {
        let err = Inbound::parse(r#"{"msgType":4,"msgContent":"{}"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingDeviceName));
    }

    #[test]
    fn hello_ignores_content() {
        let parsed = Inbound::parse(r#"{"msgType":5,"msgContent":"not json"}"#).unwrap();
        assert_eq!(parsed, Inbound::Hello);
    }

    #[test]
    fn unknown_and_garbage_frames() {
        assert_eq!(
            Inbound::parse(r#"{"msgType":42,"msgContent":"{}"}"#).unwrap(),
            Inbound::Other(42)
        );
        assert!(Inbound::parse("{{{").is_err());
        assert!(Inbound::parse(r#"{"msgContent":"{}"}"#).is_err());
    }

    #[test]
    fn command_push_stamps_date_and_double_encodes_content() {
        let command = PendingCommand {
            template: "locate".into(),
            command_uuid: "abc".into(),
            kind: json!("locate"),
            body: json!({"RequestType": "GPS", "msgDate": "stale"}),
        };
        let date = format_msg_date(&Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap());
        assert_eq!(date, "2024-05-06 07:08:09");

        let envelope = Envelope::command_push("dev-1", &command, &date);
        let outer = envelope.content().unwrap();
        assert!(outer["content"].is_string());

        let push = CommandPush::from_envelope(&envelope).unwrap();
        assert_eq!(push.user_name, "dev-1");
        assert_eq!(push.from_name, "push");
        assert_eq!(push.command_uuid, "abc");
        assert_eq!(push.content.command_uuid, "abc");
        assert_eq!(push.content.kind, json!("locate"));
        assert_eq!(push.content.body["msgDate"], "2024-05-06 07:08:09");
        assert_eq!(push.content.body["RequestType"], "GPS");
    }

    #[test]
    fn non_object_body_is_forwarded_verbatim() {
        let command = PendingCommand {
            template: "raw".into(),
            command_uuid: "x".into(),
            kind: Value::Null,
            body: json!("REBOOT"),
        };
        let push =
            CommandPush::from_envelope(&Envelope::command_push("d", &command, "now")).unwrap();
        assert_eq!(push.content.body, json!("REBOOT"));
    }
}
