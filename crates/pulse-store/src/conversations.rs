//! Conversations and their membership rows.

use chrono::Utc;
use rusqlite::params;

use pulse_shared::types::{ConversationId, UserId};

use crate::database::{parse_id, parse_ts, Database};
use crate::error::{Result, StoreError};
use crate::models::Conversation;

impl Database {
    // ------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------

    pub fn create_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.conn().execute(
            "INSERT INTO conversations (id, name, is_group, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                conversation.id.to_string(),
                conversation.name,
                conversation.is_group,
                conversation.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_conversation(&self, id: ConversationId) -> Result<Conversation> {
        self.conn()
            .query_row(
                "SELECT id, name, is_group, created_at FROM conversations WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    let id: String = row.get(0)?;
                    let created_at: String = row.get(3)?;
                    Ok(Conversation {
                        id: parse_id(0, &id)?,
                        name: row.get(1)?,
                        is_group: row.get(2)?,
                        created_at: parse_ts(3, &created_at)?,
                    })
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Add a member. Adding an existing member is a no-op.
    pub fn add_member(&self, conversation_id: ConversationId, user_id: UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO conversation_members (conversation_id, user_id, joined_at)
             VALUES (?1, ?2, ?3)",
            params![
                conversation_id.to_string(),
                user_id.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn remove_member(&self, conversation_id: ConversationId, user_id: UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM conversation_members WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation_id.to_string(), user_id.to_string()],
        )?;
        Ok(affected > 0)
    }

    pub fn conversation_members(&self, conversation_id: ConversationId) -> Result<Vec<UserId>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id FROM conversation_members WHERE conversation_id = ?1",
        )?;
        let rows = stmt.query_map(params![conversation_id.to_string()], |row| {
            let raw: String = row.get(0)?;
            parse_id(0, &raw)
        })?;

        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        Ok(members)
    }

    pub fn user_conversations(&self, user_id: UserId) -> Result<Vec<ConversationId>> {
        let mut stmt = self.conn().prepare(
            "SELECT conversation_id FROM conversation_members WHERE user_id = ?1",
        )?;
        let rows = stmt.query_map(params![user_id.to_string()], |row| {
            let raw: String = row.get(0)?;
            parse_id(0, &raw)
        })?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }
}

impl Conversation {
    pub fn new(name: Option<String>, is_group: bool) -> Self {
        Self {
            id: ConversationId::new(),
            name,
            is_group,
            created_at: Utc::now(),
        }
    }
}
