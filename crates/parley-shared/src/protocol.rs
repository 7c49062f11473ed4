//! Line protocol spoken over `/ws`.
//!
//! Every frame is a JSON object discriminated by a top-level `type` string.
//! Inbound frames decode into [`ClientFrame`]; everything the server pushes
//! to a client is an [`Event`]. Ping/pong are transport control frames and
//! never appear here.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FrameError;
use crate::types::{Envelope, MessageId, MessageStatus, UserId};

// ---------------------------------------------------------------------------
// Inbound (client -> server)
// ---------------------------------------------------------------------------

/// A decoded client frame. Field-level rules (positive ids, non-empty
/// content, complete envelopes) are enforced by the session handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Message(OutgoingMessage),
    MarkDelivered(StatusClaim),
    MarkRead(StatusClaim),
    Signal(SignalKind, SignalFrame),
}

/// Body of an inbound `message` frame.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub receiver_id: UserId,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub client_message_id: Option<String>,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub e2ee_v: Option<i64>,
    #[serde(default)]
    pub alg: Option<String>,
    #[serde(default)]
    pub sender_device_id: Option<String>,
    #[serde(default)]
    pub key_id: Option<String>,
    #[serde(default)]
    pub iv: Option<String>,
    #[serde(default)]
    pub ciphertext: Option<String>,
    #[serde(default)]
    pub aad: Option<String>,
}

impl OutgoingMessage {
    /// Assemble the encryption envelope if every mandatory field is present
    /// and non-empty (`aad` is optional). Returns `None` otherwise.
    pub fn envelope(&self) -> Option<Envelope> {
        fn filled(field: &Option<String>) -> Option<String> {
            field.as_ref().filter(|s| !s.is_empty()).cloned()
        }

        let e2ee_v = self.e2ee_v.filter(|v| *v > 0)?;
        Some(Envelope {
            e2ee_v,
            alg: filled(&self.alg)?,
            sender_device_id: filled(&self.sender_device_id)?,
            key_id: filled(&self.key_id)?,
            iv: filled(&self.iv)?,
            ciphertext: filled(&self.ciphertext)?,
            aad: filled(&self.aad),
        })
    }
}

/// Body of `mark_delivered` / `mark_read`.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct StatusClaim {
    pub message_id: MessageId,
}

/// Body of every call-signaling frame. `payload` is relayed untouched.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SignalFrame {
    pub receiver_id: UserId,
    #[serde(default)]
    pub payload: Value,
}

/// The signaling frame types relayed between peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    CallOffer,
    CallAnswer,
    IceCandidate,
    CallReject,
    CallHangup,
}

impl SignalKind {
    pub const ALL: [SignalKind; 5] = [
        SignalKind::CallOffer,
        SignalKind::CallAnswer,
        SignalKind::IceCandidate,
        SignalKind::CallReject,
        SignalKind::CallHangup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::CallOffer => "call_offer",
            SignalKind::CallAnswer => "call_answer",
            SignalKind::IceCandidate => "ice_candidate",
            SignalKind::CallReject => "call_reject",
            SignalKind::CallHangup => "call_hangup",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SignalKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or(())
    }
}

impl ClientFrame {
    /// Decode one text frame.
    ///
    /// The `type` discriminator is read first so unknown types can be told
    /// apart from known types with bad fields.
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text).map_err(FrameError::NotJson)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(FrameError::MissingType)?
            .to_string();

        match kind.as_str() {
            "message" => body(&kind, value).map(ClientFrame::Message),
            "mark_delivered" => body(&kind, value).map(ClientFrame::MarkDelivered),
            "mark_read" => body(&kind, value).map(ClientFrame::MarkRead),
            other => match other.parse::<SignalKind>() {
                Ok(signal) => body(&kind, value).map(|frame| ClientFrame::Signal(signal, frame)),
                Err(()) => Err(FrameError::UnknownType(kind)),
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Message(_) => "message",
            ClientFrame::MarkDelivered(_) => "mark_delivered",
            ClientFrame::MarkRead(_) => "mark_read",
            ClientFrame::Signal(kind, _) => kind.as_str(),
        }
    }
}

fn body<T: DeserializeOwned>(kind: &str, value: Value) -> Result<T, FrameError> {
    serde_json::from_value(value).map_err(|e| FrameError::Invalid {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Outbound (server -> client) and hub events
// ---------------------------------------------------------------------------

/// An event travelling through the hub. Its serialized form is exactly the
/// outbound frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Message(MessageEvent),
    StatusUpdate(StatusUpdate),
    CallOffer(SignalEvent),
    CallAnswer(SignalEvent),
    IceCandidate(SignalEvent),
    CallReject(SignalEvent),
    CallHangup(SignalEvent),
}

/// A persisted chat message as pushed to sender and receiver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageEvent {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_content_type: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub encrypted: bool,
    #[serde(flatten)]
    pub envelope: Option<Envelope>,
}

/// Delivery/read receipt. `sender_id` is the message author, `receiver_id`
/// the user whose client acknowledged it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusUpdate {
    pub message_id: MessageId,
    pub status: MessageStatus,
    pub sender_id: UserId,
    pub receiver_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalEvent {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    pub fn signal(kind: SignalKind, signal: SignalEvent) -> Self {
        match kind {
            SignalKind::CallOffer => Event::CallOffer(signal),
            SignalKind::CallAnswer => Event::CallAnswer(signal),
            SignalKind::IceCandidate => Event::IceCandidate(signal),
            SignalKind::CallReject => Event::CallReject(signal),
            SignalKind::CallHangup => Event::CallHangup(signal),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::Message(_) => "message",
            Event::StatusUpdate(_) => "status_update",
            Event::CallOffer(_) => SignalKind::CallOffer.as_str(),
            Event::CallAnswer(_) => SignalKind::CallAnswer.as_str(),
            Event::IceCandidate(_) => SignalKind::IceCandidate.as_str(),
            Event::CallReject(_) => SignalKind::CallReject.as_str(),
            Event::CallHangup(_) => SignalKind::CallHangup.as_str(),
        }
    }

    pub fn sender_id(&self) -> UserId {
        match self {
            Event::Message(m) => m.sender_id,
            Event::StatusUpdate(s) => s.sender_id,
            Event::CallOffer(s)
            | Event::CallAnswer(s)
            | Event::IceCandidate(s)
            | Event::CallReject(s)
            | Event::CallHangup(s) => s.sender_id,
        }
    }

    pub fn receiver_id(&self) -> UserId {
        match self {
            Event::Message(m) => m.receiver_id,
            Event::StatusUpdate(s) => s.receiver_id,
            Event::CallOffer(s)
            | Event::CallAnswer(s)
            | Event::IceCandidate(s)
            | Event::CallReject(s)
            | Event::CallHangup(s) => s.receiver_id,
        }
    }

    /// Serialize to the outbound text frame.
    pub fn encode(&self) -> Result<String, FrameError> {
        serde_json::to_string(self).map_err(FrameError::Encode)
    }
}
