//! Wire message model.
//!
//! Every message entering the broker, whether over HTTP, a socket frame, or
//! the broker consumer, deserializes into [`Message`]. The `type` and
//! `recipient` fields together are sufficient for the router to make a
//! dispatch decision.

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain_types::{ClientId, MissionId};

/// Recipient tag addressing all connected end users.
pub const RECIPIENT_USER: &str = "user";
/// Recipient tag addressing this broker itself.
pub const RECIPIENT_POSTOFFICE: &str = "PostOffice";
/// Service type of the mission controller.
pub const MISSION_CONTROL: &str = "MissionControl";

/// Routing-significant message kinds.
///
/// Unknown kinds are preserved verbatim in [`MessageType::Other`] so the
/// broker can forward payloads it does not itself understand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageType {
    Statistics,
    UserMessage,
    Request,
    Response,
    ClientConnect,
    ConnectionConfirmed,
    Pause,
    UserInputRequest,
    UserInputResponse,
    Other(String),
}

impl MessageType {
    /// Parses a wire string, accepting the historical aliases
    /// (`agentStatistics` for statistics, `userMessage` for user messages).
    #[must_use]
    pub fn from_wire(s: &str) -> Self {
        match s {
            "STATISTICS" | "agentStatistics" => Self::Statistics,
            "USER_MESSAGE" | "userMessage" => Self::UserMessage,
            "REQUEST" => Self::Request,
            "RESPONSE" => Self::Response,
            "CLIENT_CONNECT" => Self::ClientConnect,
            "CONNECTION_CONFIRMED" => Self::ConnectionConfirmed,
            "PAUSE" => Self::Pause,
            "USER_INPUT_REQUEST" => Self::UserInputRequest,
            "USER_INPUT_RESPONSE" => Self::UserInputResponse,
            other => Self::Other(other.to_string()),
        }
    }

    /// Canonical wire spelling.
    #[must_use]
    pub fn as_wire(&self) -> &str {
        match self {
            Self::Statistics => "STATISTICS",
            Self::UserMessage => "USER_MESSAGE",
            Self::Request => "REQUEST",
            Self::Response => "RESPONSE",
            Self::ClientConnect => "CLIENT_CONNECT",
            Self::ConnectionConfirmed => "CONNECTION_CONFIRMED",
            Self::Pause => "PAUSE",
            Self::UserInputRequest => "USER_INPUT_REQUEST",
            Self::UserInputResponse => "USER_INPUT_RESPONSE",
            Self::Other(s) => s,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire())
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_wire())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct WireVisitor;

        impl Visitor<'_> for WireVisitor {
            type Value = MessageType;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a message type string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(MessageType::from_wire(v))
            }
        }

        deserializer.deserialize_str(WireVisitor)
    }
}

/// A routable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Monotone local id, assigned by the router when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Logical recipient tag: `user`, this broker's id, a service type, or a
    /// component id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mission_id: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub content: Value,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub requires_sync: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    /// Creates a message of the given kind with empty content.
    #[must_use]
    pub fn new(kind: MessageType) -> Self {
        Self {
            id: None,
            kind,
            sender: None,
            recipient: None,
            client_id: None,
            mission_id: None,
            content: Value::Null,
            requires_sync: false,
            correlation_id: None,
            reply_to: None,
            timestamp: Some(Utc::now()),
        }
    }

    /// The control frame sent to a client immediately after its upgrade.
    #[must_use]
    pub fn connection_confirmed(client_id: &ClientId) -> Self {
        let mut msg = Self::new(MessageType::ConnectionConfirmed);
        msg.client_id = Some(client_id.to_string());
        msg
    }

    /// The pause request synthesized when a mission's client disconnects.
    #[must_use]
    pub fn pause_for_mission(mission_id: &MissionId) -> Self {
        let mut msg = Self::new(MessageType::Pause);
        msg.sender = Some(RECIPIENT_POSTOFFICE.to_string());
        msg.recipient = Some(MISSION_CONTROL.to_string());
        msg.content = serde_json::json!({
            "missionId": mission_id.as_ref(),
            "reason": "Client disconnected",
        });
        msg
    }

    /// Whether this message must travel the synchronous request/reply path.
    #[must_use]
    pub fn requires_sync(&self) -> bool {
        self.requires_sync || matches!(self.kind, MessageType::Request | MessageType::Response)
    }

    /// Extracts the addressed client id, checking the top-level field first
    /// and then `content.clientId`. Upstream SDKs place it in either spot.
    #[must_use]
    pub fn addressed_client(&self) -> Option<ClientId> {
        if let Some(raw) = self.client_id.as_deref() {
            if let Some(id) = ClientId::canonicalize(raw) {
                return Some(id);
            }
        }
        self.content
            .get("clientId")
            .and_then(Value::as_str)
            .and_then(ClientId::canonicalize)
    }

    /// Extracts the addressed mission id, checking `content.missionId` first
    /// and then the top-level field.
    #[must_use]
    pub fn addressed_mission(&self) -> Option<MissionId> {
        let from_content = self
            .content
            .get("missionId")
            .and_then(Value::as_str)
            .and_then(|raw| MissionId::try_new(raw.to_string()).ok());
        if from_content.is_some() {
            return from_content;
        }
        self.mission_id
            .as_deref()
            .and_then(|raw| MissionId::try_new(raw.to_string()).ok())
    }

    /// Logical recipient tag, empty string treated as absent.
    #[must_use]
    pub fn recipient_tag(&self) -> Option<&str> {
        self.recipient.as_deref().filter(|r| !r.is_empty())
    }
}
