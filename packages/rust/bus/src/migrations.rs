//! SQL migration definitions for the message bus database.
//!
//! Migrations are applied in order on open. Each migration has a version
//! number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: topics, messages, consumer groups, pending set",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Topics with their id counter. Ids never go backwards, even after a trim.
CREATE TABLE IF NOT EXISTS topics (
    name       TEXT PRIMARY KEY,
    next_id    INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

-- Append-only log
CREATE TABLE IF NOT EXISTS messages (
    topic       TEXT NOT NULL REFERENCES topics(name),
    id          INTEGER NOT NULL,
    payload     TEXT NOT NULL,
    appended_at INTEGER NOT NULL,
    PRIMARY KEY (topic, id)
);

CREATE INDEX IF NOT EXISTS idx_messages_appended ON messages(topic, appended_at);

-- Group cursors
CREATE TABLE IF NOT EXISTS consumer_groups (
    topic             TEXT NOT NULL REFERENCES topics(name),
    name              TEXT NOT NULL,
    last_delivered_id INTEGER NOT NULL DEFAULT 0,
    created_at        TEXT NOT NULL,
    PRIMARY KEY (topic, name)
);

-- Per-consumer bookkeeping
CREATE TABLE IF NOT EXISTS consumers (
    topic             TEXT NOT NULL,
    group_name        TEXT NOT NULL,
    consumer          TEXT NOT NULL,
    last_delivered_id INTEGER NOT NULL DEFAULT 0,
    seen_at           INTEGER NOT NULL,
    PRIMARY KEY (topic, group_name, consumer)
);

-- Delivered but unacknowledged
CREATE TABLE IF NOT EXISTS pending (
    topic          TEXT NOT NULL,
    group_name     TEXT NOT NULL,
    message_id     INTEGER NOT NULL,
    consumer       TEXT NOT NULL,
    delivered_at   INTEGER NOT NULL,
    delivery_count INTEGER NOT NULL,
    PRIMARY KEY (topic, group_name, message_id)
);

CREATE INDEX IF NOT EXISTS idx_pending_delivered ON pending(topic, group_name, delivered_at);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Dead letters and producer dedupe keys",
            sql: r#"
CREATE TABLE IF NOT EXISTS dead_letters (
    topic          TEXT NOT NULL,
    group_name     TEXT NOT NULL,
    message_id     INTEGER NOT NULL,
    consumer       TEXT NOT NULL,
    delivery_count INTEGER NOT NULL,
    payload        TEXT NOT NULL,
    dead_at        TEXT NOT NULL,
    PRIMARY KEY (topic, group_name, message_id)
);

CREATE TABLE IF NOT EXISTS dedupe_keys (
    topic      TEXT NOT NULL,
    key        TEXT NOT NULL,
    message_id INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (topic, key)
);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
