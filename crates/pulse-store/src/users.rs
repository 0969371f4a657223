//! CRUD operations for [`User`] records and durable presence.

use chrono::{DateTime, Utc};
use rusqlite::params;

use pulse_shared::types::{PresenceState, UserId};

use crate::database::{parse_enum, parse_id, parse_opt_ts, parse_ts, Database};
use crate::error::{Result, StoreError};
use crate::models::User;

impl Database {
    /// Insert a user, or refresh display name and call access if it exists.
    pub fn upsert_user(&self, user: &User) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, display_name, call_access_enabled, presence, last_seen_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                call_access_enabled = excluded.call_access_enabled",
            params![
                user.id.to_string(),
                user.display_name,
                user.call_access_enabled,
                user.presence.as_str(),
                user.last_seen_at.map(|t| t.to_rfc3339()),
                user.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: UserId) -> Result<User> {
        self.conn()
            .query_row(
                "SELECT id, display_name, call_access_enabled, presence, last_seen_at, created_at
                 FROM users WHERE id = ?1",
                params![id.to_string()],
                row_to_user,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Record the user's presence. Returns `false` if the user is unknown.
    pub fn set_presence(&self, id: UserId, presence: PresenceState, at: DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE users SET presence = ?2, last_seen_at = ?3 WHERE id = ?1",
            params![id.to_string(), presence.as_str(), at.to_rfc3339()],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let id: String = row.get(0)?;
    let presence: String = row.get(3)?;
    let created_at: String = row.get(5)?;

    Ok(User {
        id: parse_id(0, &id)?,
        display_name: row.get(1)?,
        call_access_enabled: row.get(2)?,
        presence: parse_enum(3, &presence)?,
        last_seen_at: parse_opt_ts(4, row.get(4)?)?,
        created_at: parse_ts(5, &created_at)?,
    })
}

impl User {
    /// A call-enabled, offline user created now.
    pub fn new(id: UserId, display_name: Option<String>) -> Self {
        Self {
            id,
            display_name,
            call_access_enabled: true,
            presence: PresenceState::Disconnected,
            last_seen_at: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_and_fetch() {
        let db = Database::open_in_memory().unwrap();
        let user = User::new(UserId::new(), Some("ada".into()));
        db.upsert_user(&user).unwrap();

        let fetched = db.get_user(user.id).unwrap();
        assert_eq!(fetched.display_name.as_deref(), Some("ada"));
        assert!(fetched.call_access_enabled);
        assert_eq!(fetched.presence, PresenceState::Disconnected);
    }

    #[test]
    fn upsert_keeps_presence() {
        let db = Database::open_in_memory().unwrap();
        let mut user = User::new(UserId::new(), None);
        db.upsert_user(&user).unwrap();
        db.set_presence(user.id, PresenceState::Foreground, Utc::now())
            .unwrap();

        user.call_access_enabled = false;
        db.upsert_user(&user).unwrap();

        let fetched = db.get_user(user.id).unwrap();
        assert!(!fetched.call_access_enabled);
        assert_eq!(fetched.presence, PresenceState::Foreground);
        assert!(fetched.last_seen_at.is_some());
    }

    #[test]
    fn missing_user_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(db.get_user(UserId::new()), Err(StoreError::NotFound)));
        assert!(!db
            .set_presence(UserId::new(), PresenceState::Background, Utc::now())
            .unwrap());
    }
}
