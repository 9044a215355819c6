//! v001 -- Initial schema creation.
//!
//! Creates `users`, `blocked_users`, `conversations` and `messages`, plus the
//! trigger that keeps message delivery flags monotonic.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users (mirrored from the account service)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id                 TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    first_name         TEXT NOT NULL,
    last_name          TEXT NOT NULL,
    profile_picture    TEXT NOT NULL DEFAULT '',
    is_active          INTEGER NOT NULL DEFAULT 1,
    is_suspended       INTEGER NOT NULL DEFAULT 0,
    lang               TEXT NOT NULL DEFAULT 'en',
    session_token      TEXT,
    session_expires_at TEXT,                        -- RFC-3339, NULL = no expiry
    notification_token TEXT,
    created_at         TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_users_session_token
    ON users(session_token) WHERE session_token IS NOT NULL;

-- ----------------------------------------------------------------
-- Blocks (directional: blocker -> blocked)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS blocked_users (
    blocker_id TEXT NOT NULL,
    blocked_id TEXT NOT NULL,
    created_at TEXT NOT NULL,

    PRIMARY KEY (blocker_id, blocked_id),
    FOREIGN KEY (blocker_id) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (blocked_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_blocked_users_blocked ON blocked_users(blocked_id);

-- ----------------------------------------------------------------
-- Conversations (exactly two participants, canonical order)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id            TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    participant_a TEXT NOT NULL,
    participant_b TEXT NOT NULL,
    cleared_by    TEXT,                       -- at most one participant
    cleared_at    TEXT,
    created_at    TEXT NOT NULL,

    CHECK (participant_a < participant_b),
    CHECK ((cleared_by IS NULL) = (cleared_at IS NULL)),
    CHECK (cleared_by IS NULL OR cleared_by IN (participant_a, participant_b))
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_pair
    ON conversations(participant_a, participant_b);
CREATE INDEX IF NOT EXISTS idx_conversations_b ON conversations(participant_b);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    conversation_id TEXT,                       -- NULL only while orphaned
    sender_id       TEXT,                       -- NULL for labels
    content         TEXT NOT NULL,
    kind            TEXT NOT NULL DEFAULT 'text'
        CHECK (kind IN ('text', 'label', 'image', 'video', 'audio', 'file')),
    is_delivered    INTEGER NOT NULL DEFAULT 0,
    is_read         INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,

    CHECK (is_read = 0 OR is_delivered = 1),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);
CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(sender_id);
CREATE INDEX IF NOT EXISTS idx_messages_delivered ON messages(is_delivered);
CREATE INDEX IF NOT EXISTS idx_messages_read ON messages(is_read);
CREATE INDEX IF NOT EXISTS idx_messages_created ON messages(created_at);
CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
    ON messages(conversation_id, created_at DESC);

-- Delivery flags only move forward.
CREATE TRIGGER IF NOT EXISTS trg_messages_flags_monotonic
BEFORE UPDATE OF is_delivered, is_read ON messages
WHEN (OLD.is_delivered = 1 AND NEW.is_delivered = 0)
  OR (OLD.is_read = 1 AND NEW.is_read = 0)
BEGIN
    SELECT RAISE(ABORT, 'delivery flags cannot regress');
END;
"#;

/// Apply the initial schema.
pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
