//! SQL DDL for the relay database.
//! WAL mode + foreign keys enabled at connection time.

/// Current schema version, recorded in `schema_version`.
pub const SCHEMA_VERSION: u32 = 1;

/// Idempotent table and index creation.
pub const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS users (
    username TEXT PRIMARY KEY,
    password_hash TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sender TEXT NOT NULL,
    recipient TEXT NOT NULL,
    content_type TEXT NOT NULL,
    content TEXT NOT NULL,
    sent_at TEXT NOT NULL,
    delivered INTEGER NOT NULL DEFAULT 0,
    delivered_at TEXT
);

CREATE TABLE IF NOT EXISTS conversations (
    user1 TEXT NOT NULL,
    user2 TEXT NOT NULL,
    last_message TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (user1, user2)
);

CREATE TABLE IF NOT EXISTS files (
    id TEXT PRIMARY KEY,
    uploader TEXT NOT NULL,
    original_name TEXT NOT NULL,
    stored_name TEXT NOT NULL,
    content_type TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_undelivered ON messages(recipient, delivered, sent_at);
CREATE INDEX IF NOT EXISTS idx_messages_pair ON messages(sender, recipient, sent_at);
CREATE INDEX IF NOT EXISTS idx_conversations_user2 ON conversations(user2);
";

/// Connection pragmas.
pub const PRAGMAS: &str = r"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
";
