//! Direct (one-to-one) messages and their per-user hidden markers.

use chrono::{DateTime, Utc};
use rusqlite::params;

use courier_shared::envelope::{Envelope, MsgKind};
use courier_shared::types::{MessageId, UserId};

use crate::database::{
    envelope_from_sql, id_from_sql, id_to_sql, kind_from_sql, ts_from_sql, ts_to_sql, Database,
};
use crate::error::{not_found, Result};
use crate::models::StoredMessage;

const SELECT_COLUMNS: &str =
    "SELECT id, sender_id, receiver_id, kind, preview, payload, created_at FROM direct_messages";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    pub fn insert_direct_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        envelope: &Envelope,
        created_at: DateTime<Utc>,
    ) -> Result<StoredMessage> {
        let preview = envelope.preview();
        let payload = serde_json::to_string(envelope)?;

        self.conn().execute(
            "INSERT INTO direct_messages (sender_id, receiver_id, kind, preview, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id_to_sql(sender_id.0),
                id_to_sql(receiver_id.0),
                envelope.kind().as_str(),
                preview,
                payload,
                ts_to_sql(&created_at),
            ],
        )?;
        let id = self.conn().last_insert_rowid();

        Ok(StoredMessage {
            id: MessageId(id as u64),
            sender_id,
            receiver_id,
            kind: envelope.kind(),
            preview,
            envelope: envelope.clone(),
            created_at,
        })
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_direct_message(&self, id: MessageId) -> Result<StoredMessage> {
        self.conn()
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                params![id_to_sql(id.0)],
                row_to_message,
            )
            .map_err(not_found)
    }

    /// A page of the conversation between `user` and `peer`, newest first,
    /// without the rows `user` has hidden.
    pub fn direct_history(
        &self,
        user: UserId,
        peer: UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<StoredMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_COLUMNS}
             WHERE ((sender_id = ?1 AND receiver_id = ?2) OR (sender_id = ?2 AND receiver_id = ?1))
               AND id NOT IN (SELECT message_id FROM hidden_direct_messages WHERE user_id = ?1)
             ORDER BY created_at DESC, id DESC
             LIMIT ?3 OFFSET ?4"
        ))?;

        let rows = stmt.query_map(
            params![id_to_sql(user.0), id_to_sql(peer.0), limit, offset],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Replace the row with its withdrawal. Returns `false` when the row is
    /// missing or was already withdrawn, in which case nothing is written.
    pub fn withdraw_direct_message(&self, id: MessageId, withdrawn: &Envelope) -> Result<bool> {
        let payload = serde_json::to_string(withdrawn)?;
        let affected = self.conn().execute(
            "UPDATE direct_messages SET kind = ?2, preview = ?3, payload = ?4
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

    /// Hide messages for `user` only. Ids the user is not a party to, and
    /// ids already hidden, are skipped. Returns how many markers were added.
    pub fn hide_direct_messages(
        &self,
        user: UserId,
        ids: &[MessageId],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let tx = self.conn().unchecked_transaction()?;
        let mut hidden = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO hidden_direct_messages (message_id, user_id, created_at)
                 SELECT id, ?2, ?3 FROM direct_messages
                 WHERE id = ?1 AND (sender_id = ?2 OR receiver_id = ?2)",
            )?;
            let user = id_to_sql(user.0);
            let now = ts_to_sql(&now);
            for id in ids {
                hidden += stmt.execute(params![id_to_sql(id.0), user, now])?;
            }
        }
        tx.commit()?;
        Ok(hidden)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let id: i64 = row.get(0)?;
    let sender_id: i64 = row.get(1)?;
    let receiver_id: i64 = row.get(2)?;
    let kind: String = row.get(3)?;
    let preview: String = row.get(4)?;
    let payload: String = row.get(5)?;
    let created_str: String = row.get(6)?;

    Ok(StoredMessage {
        id: MessageId(id_from_sql(0, id)?),
        sender_id: UserId(id_from_sql(1, sender_id)?),
        receiver_id: UserId(id_from_sql(2, receiver_id)?),
        kind: kind_from_sql(3, &kind)?,
        preview,
        envelope: envelope_from_sql(5, &payload)?,
        created_at: ts_from_sql(6, &created_str)?,
    })
}
