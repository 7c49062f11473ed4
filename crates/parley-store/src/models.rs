//! Row types persisted in the message database.

use chrono::{DateTime, Utc};
use parley_shared::types::{Envelope, MessageId, MessageStatus, UserId};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A stored direct message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    /// Plaintext body; empty for encrypted messages.
    pub content: String,
    pub status: MessageStatus,
    /// Server wall clock at insert.
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    /// Opaque envelope, present iff the message was sent encrypted.
    pub envelope: Option<Envelope>,
}

impl Message {
    pub fn is_encrypted(&self) -> bool {
        self.envelope.is_some()
    }
}

/// Input to [`Store::insert_message`](crate::Store::insert_message).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub envelope: Option<Envelope>,
}

/// Identity assigned to a freshly inserted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertedMessage {
    pub id: MessageId,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Status transitions
// ---------------------------------------------------------------------------

/// Outcome of a delivered/read claim by the message's receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub message_id: MessageId,
    /// Author of the message; where the receipt must be routed.
    pub sender_id: UserId,
    pub receiver_id: UserId,
    /// Status after the call.
    pub status: MessageStatus,
    /// False when the row already was at (or past) the requested status.
    pub applied: bool,
}
