use chrono::{DateTime, Utc};
use rusqlite::params;

use pulse_shared::types::{CallId, CallStatus, CallType, UserId};

use crate::database::{parse_enum, parse_id, parse_opt_ts, parse_ts, Database};
use crate::error::{Result, StoreError};
use crate::models::CallRecord;

const CALL_COLUMNS: &str = "id, caller_id, callee_id, call_type, status, created_at,
     answered_at, ended_at, duration_seconds, end_reason";

impl Database {
    pub fn insert_call(&self, call: &CallRecord) -> Result<()> {
        self.conn().execute(
            &format!(
                "INSERT INTO calls ({CALL_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                call.id.to_string(),
                call.caller_id.to_string(),
                call.callee_id.to_string(),
                call.call_type.as_str(),
                call.status.as_str(),
                call.created_at.to_rfc3339(),
                call.answered_at.map(|t| t.to_rfc3339()),
                call.ended_at.map(|t| t.to_rfc3339()),
                call.duration_seconds,
                call.end_reason,
            ],
        )?;
        Ok(())
    }

    /// Move a call to a new non-terminal status, optionally stamping
    /// `answered_at`. Returns `false` without writing when the call has
    /// already finished.
    pub fn update_call_status(
        &self,
        id: CallId,
        status: CallStatus,
        answered_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE calls SET status = ?2, answered_at = COALESCE(?3, answered_at)
             WHERE id = ?1 AND ended_at IS NULL",
            params![
                id.to_string(),
                status.as_str(),
                answered_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        self.applied_or_missing(id, affected)
    }

    /// Write the terminal state of a call. The first terminal write wins;
    /// later ones return `false`.
    pub fn finish_call(
        &self,
        id: CallId,
        status: CallStatus,
        ended_at: DateTime<Utc>,
        duration_seconds: Option<i64>,
        reason: Option<&str>,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE calls
             SET status = ?2, ended_at = ?3, duration_seconds = ?4, end_reason = ?5
             WHERE id = ?1 AND ended_at IS NULL",
            params![
                id.to_string(),
                status.as_str(),
                ended_at.to_rfc3339(),
                duration_seconds,
                reason,
            ],
        )?;
        self.applied_or_missing(id, affected)
    }

    fn applied_or_missing(&self, id: CallId, affected: usize) -> Result<bool> {
        if affected > 0 {
            return Ok(true);
        }
        let exists: bool = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM calls WHERE id = ?1)",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        if exists {
            Ok(false)
        } else {
            Err(StoreError::NotFound)
        }
    }

    pub fn get_call(&self, id: CallId) -> Result<CallRecord> {
        self.conn()
            .query_row(
                &format!("SELECT {CALL_COLUMNS} FROM calls WHERE id = ?1"),
                params![id.to_string()],
                row_to_call,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Most recent calls the user took part in, newest first.
    pub fn recent_calls(&self, user_id: UserId, limit: u32) -> Result<Vec<CallRecord>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CALL_COLUMNS} FROM calls
             WHERE caller_id = ?1 OR callee_id = ?1
             ORDER BY created_at DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![user_id.to_string(), limit], row_to_call)?;

        let mut calls = Vec::new();
        for row in rows {
            calls.push(row?);
        }
        Ok(calls)
    }
}

fn row_to_call(row: &rusqlite::Row<'_>) -> rusqlite::Result<CallRecord> {
    let id: String = row.get(0)?;
    let caller_id: String = row.get(1)?;
    let callee_id: String = row.get(2)?;
    let call_type: String = row.get(3)?;
    let status: String = row.get(4)?;
    let created_at: String = row.get(5)?;

    Ok(CallRecord {
        id: parse_id(0, &id)?,
        caller_id: parse_id(1, &caller_id)?,
        callee_id: parse_id(2, &callee_id)?,
        call_type: parse_enum(3, &call_type)?,
        status: parse_enum(4, &status)?,
        created_at: parse_ts(5, &created_at)?,
        answered_at: parse_opt_ts(6, row.get(6)?)?,
        ended_at: parse_opt_ts(7, row.get(7)?)?,
        duration_seconds: row.get(8)?,
        end_reason: row.get(9)?,
    })
}

impl CallRecord {
    /// A freshly initiated call.
    pub fn new(id: CallId, caller_id: UserId, callee_id: UserId, call_type: CallType) -> Self {
        Self {
            id,
            caller_id,
            callee_id,
            call_type,
            status: CallStatus::Initiated,
            created_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            duration_seconds: None,
            end_reason: None,
        }
    }
}
