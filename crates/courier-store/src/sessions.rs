//! Conversation lists and pinned conversations.
//!
//! A session is the latest message of a conversation that the user has not
//! hidden. Pinned sessions sort first, then newest first.

use chrono::{DateTime, Utc};
use rusqlite::params;

use courier_shared::types::{GroupId, MessageId, UserId};

use crate::database::{id_from_sql, id_to_sql, ts_from_sql, ts_to_sql, Database};
use crate::error::Result;
use crate::models::{DirectSession, GroupSession};

impl Database {
    // ------------------------------------------------------------------
    // Pins
    // ------------------------------------------------------------------

    /// Pin `peer` for `user`, or unpin it when already pinned. Returns the
    /// new pin state.
    pub fn toggle_peer_pin(
        &self,
        user: UserId,
        peer: UserId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let removed = self.conn().execute(
            "DELETE FROM pinned_peers WHERE user_id = ?1 AND peer_id = ?2",
            params![id_to_sql(user.0), id_to_sql(peer.0)],
        )?;
        if removed > 0 {
            return Ok(false);
        }
        self.conn().execute(
            "INSERT INTO pinned_peers (user_id, peer_id, created_at) VALUES (?1, ?2, ?3)",
            params![id_to_sql(user.0), id_to_sql(peer.0), ts_to_sql(&now)],
        )?;
        Ok(true)
    }

    /// Group counterpart of [`Database::toggle_peer_pin`].
    pub fn toggle_group_pin(
        &self,
        user: UserId,
        group_id: GroupId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let removed = self.conn().execute(
            "DELETE FROM pinned_groups WHERE user_id = ?1 AND group_id = ?2",
            params![id_to_sql(user.0), id_to_sql(group_id.0)],
        )?;
        if removed > 0 {
            return Ok(false);
        }
        self.conn().execute(
            "INSERT INTO pinned_groups (user_id, group_id, created_at) VALUES (?1, ?2, ?3)",
            params![id_to_sql(user.0), id_to_sql(group_id.0), ts_to_sql(&now)],
        )?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Lists
    // ------------------------------------------------------------------

    pub fn direct_sessions(
        &self,
        user: UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<DirectSession>> {
        let mut stmt = self.conn().prepare(
            "WITH visible AS (
                 SELECT m.id, m.preview, m.created_at,
                        CASE WHEN m.sender_id = ?1 THEN m.receiver_id ELSE m.sender_id END AS peer_id
                 FROM direct_messages m
                 WHERE (m.sender_id = ?1 OR m.receiver_id = ?1)
                   AND m.id NOT IN (SELECT message_id FROM hidden_direct_messages WHERE user_id = ?1)
             ),
             latest AS (
                 SELECT peer_id, id, preview, created_at,
                        ROW_NUMBER() OVER (PARTITION BY peer_id ORDER BY created_at DESC, id DESC) AS rn
                 FROM visible
             )
             SELECT l.peer_id, l.id, l.preview, l.created_at,
                    EXISTS (SELECT 1 FROM pinned_peers p
                            WHERE p.user_id = ?1 AND p.peer_id = l.peer_id) AS pinned
             FROM latest l
             WHERE l.rn = 1
             ORDER BY pinned DESC, l.created_at DESC, l.id DESC
             LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(params![id_to_sql(user.0), limit, offset], |row| {
            let peer_id: i64 = row.get(0)?;
            let id: i64 = row.get(1)?;
            let created_str: String = row.get(3)?;
            Ok(DirectSession {
                peer_id: UserId(id_from_sql(0, peer_id)?),
                last_message_id: MessageId(id_from_sql(1, id)?),
                preview: row.get(2)?,
                last_at: ts_from_sql(3, &created_str)?,
                pinned: row.get(4)?,
            })
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    /// Sessions of the groups `user` belongs to. Groups without a visible
    /// message are not listed.
    pub fn group_sessions(
        &self,
        user: UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<GroupSession>> {
        let mut stmt = self.conn().prepare(
            "WITH visible AS (
                 SELECT m.id, m.group_id, m.preview, m.created_at,
                        ROW_NUMBER() OVER (PARTITION BY m.group_id
                                           ORDER BY m.created_at DESC, m.id DESC) AS rn
                 FROM group_messages m
                 JOIN group_members gm ON gm.group_id = m.group_id AND gm.user_id = ?1
                 WHERE m.id NOT IN (SELECT message_id FROM hidden_group_messages WHERE user_id = ?1)
             )
             SELECT v.group_id, g.name, v.id, v.preview, v.created_at,
                    EXISTS (SELECT 1 FROM pinned_groups p
                            WHERE p.user_id = ?1 AND p.group_id = v.group_id) AS pinned
             FROM visible v
             JOIN chat_groups g ON g.id = v.group_id
             WHERE v.rn = 1
             ORDER BY pinned DESC, v.created_at DESC, v.id DESC
             LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(params![id_to_sql(user.0), limit, offset], |row| {
            let group_id: i64 = row.get(0)?;
            let id: i64 = row.get(2)?;
            let created_str: String = row.get(4)?;
            Ok(GroupSession {
                group_id: GroupId(id_from_sql(0, group_id)?),
                name: row.get(1)?,
                last_message_id: MessageId(id_from_sql(2, id)?),
                preview: row.get(3)?,
                last_at: ts_from_sql(4, &created_str)?,
                pinned: row.get(5)?,
            })
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }
}
