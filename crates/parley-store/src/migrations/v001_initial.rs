//! v001 -- Initial schema creation.
//!
//! Creates the `messages` table and the indexes used for conversation
//! listing, inbox lookups, recency ordering and unread counts.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    sender_id        INTEGER NOT NULL,
    receiver_id      INTEGER NOT NULL,
    content          TEXT    NOT NULL DEFAULT '',
    status           TEXT    NOT NULL DEFAULT 'sent'
                     CHECK (status IN ('sent', 'delivered', 'read')),
    created_at       TEXT    NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    delivered_at     TEXT,                       -- RFC-3339, set once status >= delivered
    read_at          TEXT,                       -- RFC-3339, set once status = read
    encrypted        INTEGER NOT NULL DEFAULT 0, -- boolean 0/1

    -- opaque E2EE envelope, stored as received
    e2ee_v           INTEGER,
    alg              TEXT,
    sender_device_id TEXT,
    key_id           TEXT,
    iv               TEXT,
    ciphertext       TEXT,
    aad              TEXT,

    CHECK (sender_id <> receiver_id)
);

CREATE INDEX IF NOT EXISTS idx_messages_sender_receiver
    ON messages(sender_id, receiver_id);

CREATE INDEX IF NOT EXISTS idx_messages_receiver
    ON messages(receiver_id);

CREATE INDEX IF NOT EXISTS idx_messages_created_at
    ON messages(created_at DESC);

CREATE INDEX IF NOT EXISTS idx_messages_unread
    ON messages(receiver_id, sender_id, read_at);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
