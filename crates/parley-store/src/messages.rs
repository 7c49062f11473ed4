use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use parley_shared::types::{Envelope, MessageId, MessageStatus, UserId};
use rusqlite::{params, OptionalExtension, TransactionBehavior};

use crate::database::Store;
use crate::error::{Result, StoreError};
use crate::models::{InsertedMessage, Message, NewMessage, StatusChange};

const MESSAGE_COLUMNS: &str = "id, sender_id, receiver_id, content, status, created_at,
     delivered_at, read_at, encrypted, e2ee_v, alg, sender_device_id, key_id, iv,
     ciphertext, aad";

impl Store {
    /// Persist a new message with status `sent`. Returns the assigned id and
    /// the server timestamp it was stored with.
    pub fn insert_message(&self, message: &NewMessage) -> Result<InsertedMessage> {
        let created_at = Utc::now().trunc_subsecs(3);
        let envelope = message.envelope.as_ref();

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO messages (sender_id, receiver_id, content, status, created_at,
                                   encrypted, e2ee_v, alg, sender_device_id, key_id, iv,
                                   ciphertext, aad)
             VALUES (?1, ?2, ?3, 'sent', ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                message.sender_id.0,
                message.receiver_id.0,
                message.content,
                format_ts(&created_at),
                envelope.is_some(),
                envelope.map(|e| e.e2ee_v),
                envelope.map(|e| e.alg.as_str()),
                envelope.map(|e| e.sender_device_id.as_str()),
                envelope.map(|e| e.key_id.as_str()),
                envelope.map(|e| e.iv.as_str()),
                envelope.map(|e| e.ciphertext.as_str()),
                envelope.and_then(|e| e.aad.as_deref()),
            ],
        )?;
        let id = MessageId(tx.last_insert_rowid());
        tx.commit()?;

        tracing::debug!(
            message_id = %id,
            sender_id = %message.sender_id,
            receiver_id = %message.receiver_id,
            encrypted = envelope.is_some(),
            "message stored"
        );

        Ok(InsertedMessage { id, created_at })
    }

    /// Move a `sent` message to `delivered`. Only the receiver may claim it.
    pub fn mark_delivered(&self, id: MessageId, claimant: UserId) -> Result<StatusChange> {
        self.advance_status(id, claimant, MessageStatus::Delivered)
    }

    /// Move a `sent` or `delivered` message to `read`. Re-reading a read
    /// message succeeds without touching the row.
    pub fn mark_read(&self, id: MessageId, claimant: UserId) -> Result<StatusChange> {
        self.advance_status(id, claimant, MessageStatus::Read)
    }

    fn advance_status(
        &self,
        id: MessageId,
        claimant: UserId,
        target: MessageStatus,
    ) -> Result<StatusChange> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let row = tx
            .query_row(
                "SELECT sender_id, receiver_id, status FROM messages WHERE id = ?1",
                params![id.0],
                |row| {
                    let status: String = row.get(2)?;
                    Ok((
                        UserId(row.get(0)?),
                        UserId(row.get(1)?),
                        parse_status(2, &status)?,
                    ))
                },
            )
            .optional()?;

        let Some((sender_id, receiver_id, current)) = row else {
            return Err(StoreError::NotFound);
        };
        if receiver_id != claimant {
            return Err(StoreError::NotReceiver);
        }

        let mut change = StatusChange {
            message_id: id,
            sender_id,
            receiver_id,
            status: current,
            applied: false,
        };
        if !current.can_advance_to(target) {
            return Ok(change);
        }

        // Timestamps never precede the previous milestone, even if the wall
        // clock stepped backwards since the row was written.
        let now = format_ts(&Utc::now());
        let updated = match target {
            MessageStatus::Delivered => tx.execute(
                "UPDATE messages
                 SET status = 'delivered',
                     delivered_at = MAX(created_at, ?2)
                 WHERE id = ?1 AND status = 'sent'",
                params![id.0, now],
            )?,
            MessageStatus::Read => tx.execute(
                "UPDATE messages
                 SET status = 'read',
                     delivered_at = COALESCE(delivered_at, MAX(created_at, ?2)),
                     read_at = MAX(COALESCE(delivered_at, created_at), ?2)
                 WHERE id = ?1 AND status IN ('sent', 'delivered')",
                params![id.0, now],
            )?,
            MessageStatus::Sent => 0,
        };
        tx.commit()?;

        if updated > 0 {
            change.status = target;
            change.applied = true;
        }
        Ok(change)
    }

    /// Author of a message.
    pub fn lookup_sender(&self, id: MessageId) -> Result<UserId> {
        self.conn()?
            .query_row(
                "SELECT sender_id FROM messages WHERE id = ?1",
                params![id.0],
                |row| row.get(0).map(UserId),
            )
            .optional()?
            .ok_or(StoreError::NotFound)
    }

    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        self.conn()?
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.0],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Conversation history between two users, newest first. `before`
    /// restricts the page to ids strictly below it.
    pub fn messages_between(
        &self,
        a: UserId,
        b: UserId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE ((sender_id = ?1 AND receiver_id = ?2)
                 OR (sender_id = ?2 AND receiver_id = ?1))
               AND (?3 IS NULL OR id < ?3)
             ORDER BY id DESC
             LIMIT ?4"
        ))?;

        let rows = stmt.query_map(
            params![a.0, b.0, before.map(|id| id.0), limit],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Messages addressed to `receiver` that have not been read, optionally
    /// restricted to one sender.
    pub fn unread_count(&self, receiver: UserId, sender: Option<UserId>) -> Result<u64> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE receiver_id = ?1
               AND (?2 IS NULL OR sender_id = ?2)
               AND read_at IS NULL",
            params![receiver.0, sender.map(|s| s.0)],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    pub fn delete_message(&self, id: MessageId) -> Result<bool> {
        let affected = self
            .conn()?
            .execute("DELETE FROM messages WHERE id = ?1", params![id.0])?;
        Ok(affected > 0)
    }
}

/// Fixed-width RFC-3339 (millisecond, `Z` suffix) so that text order equals
/// time order inside SQLite.
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(idx: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_status(idx: usize, text: &str) -> rusqlite::Result<MessageStatus> {
    text.parse::<MessageStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let status: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let delivered_at: Option<String> = row.get(6)?;
    let read_at: Option<String> = row.get(7)?;
    let encrypted: bool = row.get(8)?;

    let envelope = if encrypted {
        Some(Envelope {
            e2ee_v: row.get::<_, Option<i64>>(9)?.unwrap_or_default(),
            alg: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
            sender_device_id: row.get::<_, Option<String>>(11)?.unwrap_or_default(),
            key_id: row.get::<_, Option<String>>(12)?.unwrap_or_default(),
            iv: row.get::<_, Option<String>>(13)?.unwrap_or_default(),
            ciphertext: row.get::<_, Option<String>>(14)?.unwrap_or_default(),
            aad: row.get(15)?,
        })
    } else {
        None
    };

    Ok(Message {
        id: MessageId(row.get(0)?),
        sender_id: UserId(row.get(1)?),
        receiver_id: UserId(row.get(2)?),
        content: row.get(3)?,
        status: parse_status(4, &status)?,
        created_at: parse_ts(5, &created_at)?,
        delivered_at: delivered_at.as_deref().map(|t| parse_ts(6, t)).transpose()?,
        read_at: read_at.as_deref().map(|t| parse_ts(7, t)).transpose()?,
        envelope,
    })
}
