//! v001 -- Initial schema creation.
//!
//! Direct messages, groups, group members, group messages and the two
//! per-user hidden marker tables.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Direct messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS direct_messages (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    sender_id   INTEGER NOT NULL,
    receiver_id INTEGER NOT NULL,
    kind        TEXT NOT NULL,              -- envelope kind, e.g. "text"
    preview     TEXT NOT NULL,
    payload     TEXT NOT NULL,              -- envelope JSON
    created_at  TEXT NOT NULL               -- RFC-3339, UTC
);

CREATE INDEX IF NOT EXISTS idx_direct_pair_ts
    ON direct_messages(sender_id, receiver_id, created_at DESC);

CREATE TABLE IF NOT EXISTS hidden_direct_messages (
    message_id INTEGER NOT NULL,
    user_id    INTEGER NOT NULL,
    created_at TEXT NOT NULL,

    PRIMARY KEY (message_id, user_id),
    FOREIGN KEY (message_id) REFERENCES direct_messages(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Groups
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chat_groups (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    name       TEXT NOT NULL,
    muted      INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS group_members (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    group_id    INTEGER NOT NULL,
    user_id     INTEGER NOT NULL,
    nickname    TEXT NOT NULL DEFAULT '',
    role        INTEGER NOT NULL,           -- 1 owner, 2 admin, 3 member
    muted_until TEXT,                       -- nullable RFC-3339
    created_at  TEXT NOT NULL,

    UNIQUE (group_id, user_id),
    FOREIGN KEY (group_id) REFERENCES chat_groups(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS group_messages (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    group_id   INTEGER NOT NULL,
    sender_id  INTEGER NOT NULL,
    member_id  INTEGER,                     -- NULL once the member left
    kind       TEXT NOT NULL,
    preview    TEXT NOT NULL,
    payload    TEXT NOT NULL,
    created_at TEXT NOT NULL,

    FOREIGN KEY (group_id) REFERENCES chat_groups(id) ON DELETE CASCADE,
    FOREIGN KEY (member_id) REFERENCES group_members(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_group_messages_ts
    ON group_messages(group_id, created_at DESC);

CREATE TABLE IF NOT EXISTS hidden_group_messages (
    message_id INTEGER NOT NULL,
    user_id    INTEGER NOT NULL,
    group_id   INTEGER NOT NULL,
    created_at TEXT NOT NULL,

    PRIMARY KEY (message_id, user_id),
    FOREIGN KEY (message_id) REFERENCES group_messages(id) ON DELETE CASCADE
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
