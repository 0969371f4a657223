//! Per-recipient delivery/read rows.
//!
//! Writes here sit on the fan-out hot path, so every operation is a single
//! transaction no matter how many rows it touches. Inserts are upserts:
//! re-applying a timestamp for the same (message, user) pair only moves the
//! non-null columns (last write wins), so replays are harmless.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter};

use pulse_shared::types::{ConversationId, MessageId, UserId};

use crate::database::{parse_id, parse_opt_ts, parse_ts, Database};
use crate::error::{Result, StoreError};
use crate::models::{MessageStatus, StatusPatch};

/// Rows per multi-row INSERT statement (6 bound params each).
const INSERT_CHUNK: usize = 500;

/// Ids per `IN (...)` list.
const UPDATE_CHUNK: usize = 500;

const STATUS_COLUMNS: &str =
    "message_id, user_id, conversation_id, delivered_at, read_at, updated_at";

fn ts_value(ts: Option<DateTime<Utc>>) -> Value {
    match ts {
        Some(t) => Value::Text(t.to_rfc3339()),
        None => Value::Null,
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

impl Database {
    /// Bulk upsert of status rows in one transaction.
    ///
    /// Either every row lands or none does. Returns the number of rows written.
    pub fn insert_statuses(&mut self, records: &[MessageStatus]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let tx = self.conn_mut().transaction()?;
        let mut written = 0;

        for chunk in records.chunks(INSERT_CHUNK) {
            let rows = vec!["(?, ?, ?, ?, ?, ?)"; chunk.len()].join(", ");
            let sql = format!(
                "INSERT INTO message_status ({STATUS_COLUMNS}) VALUES {rows}
                 ON CONFLICT(message_id, user_id) DO UPDATE SET
                    delivered_at = COALESCE(excluded.delivered_at, message_status.delivered_at),
                    read_at = COALESCE(excluded.read_at, message_status.read_at),
                    updated_at = excluded.updated_at"
            );

            let mut values = Vec::with_capacity(chunk.len() * 6);
            for record in chunk {
                values.push(Value::Text(record.message_id.to_string()));
                values.push(Value::Text(record.user_id.to_string()));
                values.push(Value::Text(record.conversation_id.to_string()));
                values.push(ts_value(record.delivered_at));
                values.push(ts_value(record.read_at));
                values.push(Value::Text(record.updated_at.to_rfc3339()));
            }

            written += tx.execute(&sql, params_from_iter(values))?;
        }

        tx.commit()?;
        Ok(written)
    }

    /// Apply `patch` to the given messages for one user.
    ///
    /// A read stamp also fills a missing delivered stamp. When
    /// `conversation_id` is set, rows outside it are left alone.
    pub fn update_statuses(
        &mut self,
        user_id: UserId,
        message_ids: &[MessageId],
        patch: StatusPatch,
        conversation_id: Option<ConversationId>,
    ) -> Result<usize> {
        if message_ids.is_empty() || patch.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let tx = self.conn_mut().transaction()?;
        let mut updated = 0;

        for chunk in message_ids.chunks(UPDATE_CHUNK) {
            let mut sql = format!(
                "UPDATE message_status SET
                    delivered_at = COALESCE(?1, delivered_at, ?2),
                    read_at = COALESCE(?2, read_at),
                    updated_at = ?3
                 WHERE user_id = ?4 AND message_id IN ({})",
                placeholders(chunk.len())
            );

            let mut values = vec![
                ts_value(patch.delivered_at),
                ts_value(patch.read_at),
                Value::Text(now.to_rfc3339()),
                Value::Text(user_id.to_string()),
            ];
            values.extend(chunk.iter().map(|id| Value::Text(id.to_string())));

            if let Some(conversation_id) = conversation_id {
                sql.push_str(" AND conversation_id = ?");
                values.push(Value::Text(conversation_id.to_string()));
            }

            updated += tx.execute(&sql, params_from_iter(values))?;
        }

        tx.commit()?;
        Ok(updated)
    }

    /// Stamp `read_at` on every unread row of `user_id` in a conversation.
    ///
    /// Returns the ids that changed, so read receipts can be fanned out.
    pub fn mark_conversation_read(
        &mut self,
        user_id: UserId,
        conversation_id: ConversationId,
        at: DateTime<Utc>,
    ) -> Result<Vec<MessageId>> {
        let tx = self.conn_mut().transaction()?;

        let ids = {
            let mut stmt = tx.prepare(
                "SELECT message_id FROM message_status
                 WHERE user_id = ?1 AND conversation_id = ?2 AND read_at IS NULL",
            )?;
            let rows = stmt.query_map(
                params![user_id.to_string(), conversation_id.to_string()],
                |row| {
                    let raw: String = row.get(0)?;
                    parse_id::<MessageId>(0, &raw)
                },
            )?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            ids
        };

        if !ids.is_empty() {
            tx.execute(
                "UPDATE message_status SET
                    read_at = ?3,
                    delivered_at = COALESCE(delivered_at, ?3),
                    updated_at = ?3
                 WHERE user_id = ?1 AND conversation_id = ?2 AND read_at IS NULL",
                params![user_id.to_string(), conversation_id.to_string(), at.to_rfc3339()],
            )?;
        }

        tx.commit()?;
        Ok(ids)
    }

    /// Stamp `delivered_at` on every undelivered row of `user_id`.
    ///
    /// Used when a user reconnects; returns the rows as they are after the
    /// update.
    pub fn mark_backlog_delivered(
        &mut self,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<Vec<MessageStatus>> {
        let tx = self.conn_mut().transaction()?;

        let rows = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {STATUS_COLUMNS} FROM message_status
                 WHERE user_id = ?1 AND delivered_at IS NULL"
            ))?;
            let rows = stmt.query_map(params![user_id.to_string()], row_to_status)?;
            let mut out = Vec::new();
            for row in rows {
                let mut status = row?;
                status.delivered_at = Some(at);
                status.updated_at = at;
                out.push(status);
            }
            out
        };

        if !rows.is_empty() {
            tx.execute(
                "UPDATE message_status SET delivered_at = ?2, updated_at = ?2
                 WHERE user_id = ?1 AND delivered_at IS NULL",
                params![user_id.to_string(), at.to_rfc3339()],
            )?;
        }

        tx.commit()?;
        Ok(rows)
    }

    pub fn get_status(&self, message_id: MessageId, user_id: UserId) -> Result<MessageStatus> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {STATUS_COLUMNS} FROM message_status
                     WHERE message_id = ?1 AND user_id = ?2"
                ),
                params![message_id.to_string(), user_id.to_string()],
                row_to_status,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn statuses_for_message(&self, message_id: MessageId) -> Result<Vec<MessageStatus>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {STATUS_COLUMNS} FROM message_status WHERE message_id = ?1"
        ))?;
        let rows = stmt.query_map(params![message_id.to_string()], row_to_status)?;

        let mut statuses = Vec::new();
        for row in rows {
            statuses.push(row?);
        }
        Ok(statuses)
    }

    /// Unread rows for a user in one conversation.
    pub fn unread_count(&self, user_id: UserId, conversation_id: ConversationId) -> Result<i64> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM message_status
             WHERE user_id = ?1 AND conversation_id = ?2 AND read_at IS NULL",
            params![user_id.to_string(), conversation_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn row_to_status(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageStatus> {
    let message_id: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    let conversation_id: String = row.get(2)?;
    let updated_at: String = row.get(5)?;

    Ok(MessageStatus {
        message_id: parse_id(0, &message_id)?,
        user_id: parse_id(1, &user_id)?,
        conversation_id: parse_id(2, &conversation_id)?,
        delivered_at: parse_opt_ts(3, row.get(3)?)?,
        read_at: parse_opt_ts(4, row.get(4)?)?,
        updated_at: parse_ts(5, &updated_at)?,
    })
}

impl MessageStatus {
    /// A row with the given stamps, `updated_at` set to now.
    pub fn new(
        message_id: MessageId,
        user_id: UserId,
        conversation_id: ConversationId,
        delivered_at: Option<DateTime<Utc>>,
        read_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            message_id,
            user_id,
            conversation_id,
            delivered_at,
            read_at,
            updated_at: Utc::now(),
        }
    }
}
