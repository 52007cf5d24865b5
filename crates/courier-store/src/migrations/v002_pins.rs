//! v002 -- Pinned conversations.
//!
//! A user may pin a peer or a group; pinned sessions list first.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS pinned_peers (
    user_id    INTEGER NOT NULL,
    peer_id    INTEGER NOT NULL,
    created_at TEXT NOT NULL,

    PRIMARY KEY (user_id, peer_id)
);

CREATE TABLE IF NOT EXISTS pinned_groups (
    user_id    INTEGER NOT NULL,
    group_id   INTEGER NOT NULL,
    created_at TEXT NOT NULL,

    PRIMARY KEY (user_id, group_id),
    FOREIGN KEY (group_id) REFERENCES chat_groups(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_direct_receiver_ts
    ON direct_messages(receiver_id, created_at DESC);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
