//! Groups, memberships, group messages and their per-user hidden markers.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension};

use courier_shared::envelope::{Envelope, MsgKind};
use courier_shared::types::{GroupId, GroupRole, MessageId, UserId};

use crate::database::{
    envelope_from_sql, id_from_sql, id_to_sql, kind_from_sql, ts_from_sql, ts_to_sql, Database,
};
use crate::error::{not_found, Result, StoreError};
use crate::models::{Group, GroupMember, StoredGroupMessage};

const MEMBER_COLUMNS: &str =
    "SELECT id, group_id, user_id, nickname, role, muted_until, created_at FROM group_members";

const MESSAGE_COLUMNS: &str = "SELECT id, group_id, sender_id, member_id, kind, preview, payload, created_at
     FROM group_messages";

impl Database {
    // ------------------------------------------------------------------
    // Groups
    // ------------------------------------------------------------------

    pub fn create_group(&self, name: &str, created_at: DateTime<Utc>) -> Result<Group> {
        self.conn().execute(
            "INSERT INTO chat_groups (name, muted, created_at) VALUES (?1, 0, ?2)",
            params![name, ts_to_sql(&created_at)],
        )?;
        let id = self.conn().last_insert_rowid();
        Ok(Group {
            id: GroupId(id as u64),
            name: name.to_string(),
            muted: false,
            created_at,
        })
    }

    pub fn get_group(&self, id: GroupId) -> Result<Group> {
        self.conn()
            .query_row(
                "SELECT id, name, muted, created_at FROM chat_groups WHERE id = ?1",
                params![id_to_sql(id.0)],
                row_to_group,
            )
            .map_err(not_found)
    }

    pub fn set_group_muted(&self, id: GroupId, muted: bool) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE chat_groups SET muted = ?2 WHERE id = ?1",
            params![id_to_sql(id.0), muted],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Members
    // ------------------------------------------------------------------

    pub fn add_group_member(
        &self,
        group_id: GroupId,
        user_id: UserId,
        nickname: &str,
        role: GroupRole,
        created_at: DateTime<Utc>,
    ) -> Result<GroupMember> {
        self.conn().execute(
            "INSERT INTO group_members (group_id, user_id, nickname, role, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id_to_sql(group_id.0),
                id_to_sql(user_id.0),
                nickname,
                role.code(),
                ts_to_sql(&created_at),
            ],
        )?;
        Ok(GroupMember {
            id: self.conn().last_insert_rowid(),
            group_id,
            user_id,
            nickname: nickname.to_string(),
            role,
            muted_until: None,
            created_at,
        })
    }

    pub fn get_group_member(&self, group_id: GroupId, user_id: UserId) -> Result<Option<GroupMember>> {
        let member = self
            .conn()
            .query_row(
                &format!("{MEMBER_COLUMNS} WHERE group_id = ?1 AND user_id = ?2"),
                params![id_to_sql(group_id.0), id_to_sql(user_id.0)],
                row_to_member,
            )
            .optional()?;
        Ok(member)
    }

    pub fn get_group_member_by_id(&self, member_id: i64) -> Result<Option<GroupMember>> {
        let member = self
            .conn()
            .query_row(
                &format!("{MEMBER_COLUMNS} WHERE id = ?1"),
                params![member_id],
                row_to_member,
            )
            .optional()?;
        Ok(member)
    }

    pub fn group_member_ids(&self, group_id: GroupId) -> Result<Vec<UserId>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT user_id FROM group_members WHERE group_id = ?1 ORDER BY id ASC")?;
        let rows = stmt.query_map(params![id_to_sql(group_id.0)], |row| {
            let raw: i64 = row.get(0)?;
            Ok(UserId(id_from_sql(0, raw)?))
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn set_member_muted_until(
        &self,
        group_id: GroupId,
        user_id: UserId,
        until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE group_members SET muted_until = ?3 WHERE group_id = ?1 AND user_id = ?2",
            params![
                id_to_sql(group_id.0),
                id_to_sql(user_id.0),
                until.as_ref().map(ts_to_sql),
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Remove a membership. The member's messages stay in the group with
    /// `member_id` cleared. Returns how many messages were detached.
    pub fn remove_group_member(&self, group_id: GroupId, user_id: UserId) -> Result<usize> {
        let member = self
            .get_group_member(group_id, user_id)?
            .ok_or(StoreError::NotFound)?;

        let tx = self.conn().unchecked_transaction()?;
        let detached = tx.execute(
            "UPDATE group_messages SET member_id = NULL WHERE member_id = ?1",
            params![member.id],
        )?;
        tx.execute("DELETE FROM group_members WHERE id = ?1", params![member.id])?;
        tx.commit()?;
        Ok(detached)
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    pub fn insert_group_message(
        &self,
        member: &GroupMember,
        envelope: &Envelope,
        created_at: DateTime<Utc>,
    ) -> Result<StoredGroupMessage> {
        let preview = envelope.preview();
        let payload = serde_json::to_string(envelope)?;

        self.conn().execute(
            "INSERT INTO group_messages (group_id, sender_id, member_id, kind, preview, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id_to_sql(member.group_id.0),
                id_to_sql(member.user_id.0),
                member.id,
                envelope.kind().as_str(),
                preview,
                payload,
                ts_to_sql(&created_at),
            ],
        )?;
        let id = self.conn().last_insert_rowid();

        Ok(StoredGroupMessage {
            id: MessageId(id as u64),
            group_id: member.group_id,
            sender_id: member.user_id,
            member_id: Some(member.id),
            kind: envelope.kind(),
            preview,
            envelope: envelope.clone(),
            created_at,
        })
    }

    pub fn get_group_message(&self, id: MessageId) -> Result<StoredGroupMessage> {
        self.conn()
            .query_row(
                &format!("{MESSAGE_COLUMNS} WHERE id = ?1"),
                params![id_to_sql(id.0)],
                row_to_group_message,
            )
            .map_err(not_found)
    }

    /// Same contract as [`Database::withdraw_direct_message`].
    pub fn withdraw_group_message(&self, id: MessageId, withdrawn: &Envelope) -> Result<bool> {
        let payload = serde_json::to_string(withdrawn)?;
        let affected = self.conn().execute(
            "UPDATE group_messages SET kind = ?2, preview = ?3, payload = ?4
             WHERE id = ?1 AND kind != ?2",
            params![
                id_to_sql(id.0),
                MsgKind::Withdraw.as_str(),
                withdrawn.preview(),
                payload,
            ],
        )?;
        Ok(affected > 0)
    }

    /// A page of the group's messages, newest first, without the rows
    /// `user` has hidden.
    pub fn group_history(
        &self,
        group_id: GroupId,
        user: UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<StoredGroupMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "{MESSAGE_COLUMNS}
             WHERE group_id = ?1
               AND id NOT IN (SELECT message_id FROM hidden_group_messages WHERE user_id = ?2)
             ORDER BY created_at DESC, id DESC
             LIMIT ?3 OFFSET ?4"
        ))?;
        let rows = stmt.query_map(
            params![id_to_sql(group_id.0), id_to_sql(user.0), limit, offset],
            row_to_group_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Hide group messages for `user` only. Ids outside the group and ids
    /// already hidden are skipped.
    pub fn hide_group_messages(
        &self,
        group_id: GroupId,
        user: UserId,
        ids: &[MessageId],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let tx = self.conn().unchecked_transaction()?;
        let mut hidden = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO hidden_group_messages (message_id, user_id, group_id, created_at)
                 SELECT id, ?3, group_id, ?4 FROM group_messages
                 WHERE id = ?1 AND group_id = ?2",
            )?;
            let group = id_to_sql(group_id.0);
            let user = id_to_sql(user.0);
            let now = ts_to_sql(&now);
            for id in ids {
                hidden += stmt.execute(params![id_to_sql(id.0), group, user, now])?;
            }
        }
        tx.commit()?;
        Ok(hidden)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn row_to_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<Group> {
    let id: i64 = row.get(0)?;
    let name: String = row.get(1)?;
    let muted: bool = row.get(2)?;
    let created_str: String = row.get(3)?;

    Ok(Group {
        id: GroupId(id_from_sql(0, id)?),
        name,
        muted,
        created_at: ts_from_sql(3, &created_str)?,
    })
}

fn row_to_member(row: &rusqlite::Row<'_>) -> rusqlite::Result<GroupMember> {
    let id: i64 = row.get(0)?;
    let group_id: i64 = row.get(1)?;
    let user_id: i64 = row.get(2)?;
    let nickname: String = row.get(3)?;
    let role_code: i64 = row.get(4)?;
    let muted_str: Option<String> = row.get(5)?;
    let created_str: String = row.get(6)?;

    let role = GroupRole::from_code(role_code).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            Type::Integer,
            format!("unknown group role {role_code}").into(),
        )
    })?;
    let muted_until = muted_str.map(|s| ts_from_sql(5, &s)).transpose()?;

    Ok(GroupMember {
        id,
        group_id: GroupId(id_from_sql(1, group_id)?),
        user_id: UserId(id_from_sql(2, user_id)?),
        nickname,
        role,
        muted_until,
        created_at: ts_from_sql(6, &created_str)?,
    })
}

fn row_to_group_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredGroupMessage> {
    let id: i64 = row.get(0)?;
    let group_id: i64 = row.get(1)?;
    let sender_id: i64 = row.get(2)?;
    let member_id: Option<i64> = row.get(3)?;
    let kind: String = row.get(4)?;
    let preview: String = row.get(5)?;
    let payload: String = row.get(6)?;
    let created_str: String = row.get(7)?;

    Ok(StoredGroupMessage {
        id: MessageId(id_from_sql(0, id)?),
        group_id: GroupId(id_from_sql(1, group_id)?),
        sender_id: UserId(id_from_sql(2, sender_id)?),
        member_id,
        kind: kind_from_sql(4, &kind)?,
        preview,
        envelope: envelope_from_sql(6, &payload)?,
        created_at: ts_from_sql(7, &created_str)?,
    })
}
