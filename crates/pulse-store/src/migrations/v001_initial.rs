//! v001 -- Initial schema creation.
//!
//! Creates `users`, `conversations`, `conversation_members`, `messages`,
//! `message_stars`, `message_status` and `calls`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users (identity is owned by the auth service; we keep what the
-- realtime layer needs: call eligibility and durable presence)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id                  TEXT PRIMARY KEY NOT NULL,   -- UUID
    display_name        TEXT,
    call_access_enabled INTEGER NOT NULL DEFAULT 1,  -- boolean 0/1
    presence            TEXT NOT NULL DEFAULT 'disconnected',
    last_seen_at        TEXT,                        -- RFC-3339
    created_at          TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Conversations and membership
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id         TEXT PRIMARY KEY NOT NULL,
    name       TEXT,
    is_group   INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS conversation_members (
    conversation_id TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    joined_at       TEXT NOT NULL,

    PRIMARY KEY (conversation_id, user_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_members_user ON conversation_members(user_id);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,
    conversation_id TEXT NOT NULL,
    sender_id       TEXT NOT NULL,
    body            TEXT,
    attachments     TEXT NOT NULL DEFAULT '[]',  -- JSON array
    metadata        TEXT,                        -- JSON object
    reply_to        TEXT,
    forwarded_from  TEXT,
    pinned          INTEGER NOT NULL DEFAULT 0,
    deleted_at      TEXT,
    created_at      TEXT NOT NULL,

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
    ON messages(conversation_id, created_at DESC);

CREATE TABLE IF NOT EXISTS message_stars (
    message_id TEXT NOT NULL,
    user_id    TEXT NOT NULL,
    created_at TEXT NOT NULL,

    PRIMARY KEY (message_id, user_id),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Per-recipient delivery state
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS message_status (
    message_id      TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    conversation_id TEXT NOT NULL,
    delivered_at    TEXT,
    read_at         TEXT,
    updated_at      TEXT NOT NULL,

    PRIMARY KEY (message_id, user_id)
);

CREATE INDEX IF NOT EXISTS idx_status_user_conversation
    ON message_status(user_id, conversation_id);

-- ----------------------------------------------------------------
-- Calls
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS calls (
    id               TEXT PRIMARY KEY NOT NULL,
    caller_id        TEXT NOT NULL,
    callee_id        TEXT NOT NULL,
    call_type        TEXT NOT NULL,
    status           TEXT NOT NULL,
    created_at       TEXT NOT NULL,
    answered_at      TEXT,
    ended_at         TEXT,
    duration_seconds INTEGER,
    end_reason       TEXT
);

CREATE INDEX IF NOT EXISTS idx_calls_caller ON calls(caller_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_calls_callee ON calls(callee_id, created_at DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
