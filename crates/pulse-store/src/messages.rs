use chrono::{DateTime, Utc};
use rusqlite::params;

use pulse_shared::types::{MessageId, UserId};

use crate::database::{parse_id, parse_opt_id, parse_opt_ts, parse_ts, Database};
use crate::error::{Result, StoreError};
use crate::models::Message;

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, body, attachments, metadata,
     reply_to, forwarded_from, pinned, deleted_at, created_at";

const INSERT_MESSAGE_SQL: &str = "INSERT INTO messages (id, conversation_id, sender_id, body, attachments, metadata,
     reply_to, forwarded_from, pinned, deleted_at, created_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)";

impl Database {
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        let attachments = serde_json::to_string(&message.attachments)?;
        let metadata = message
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn().execute(
            INSERT_MESSAGE_SQL,
            params![
                message.id.to_string(),
                message.conversation_id.to_string(),
                message.sender_id.to_string(),
                message.body,
                attachments,
                metadata,
                message.reply_to.map(|id| id.to_string()),
                message.forwarded_from.map(|id| id.to_string()),
                message.pinned,
                message.deleted_at.map(|t| t.to_rfc3339()),
                message.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Insert several messages in one transaction (all or nothing).
    pub fn insert_messages(&mut self, messages: &[Message]) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        {
            let mut stmt = tx.prepare(INSERT_MESSAGE_SQL)?;
            for message in messages {
                let attachments = serde_json::to_string(&message.attachments)?;
                let metadata = message
                    .metadata
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                stmt.execute(params![
                    message.id.to_string(),
                    message.conversation_id.to_string(),
                    message.sender_id.to_string(),
                    message.body,
                    attachments,
                    metadata,
                    message.reply_to.map(|id| id.to_string()),
                    message.forwarded_from.map(|id| id.to_string()),
                    message.pinned,
                    message.deleted_at.map(|t| t.to_rfc3339()),
                    message.created_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn set_pinned(&self, id: MessageId, pinned: bool) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET pinned = ?2 WHERE id = ?1 AND deleted_at IS NULL",
            params![id.to_string(), pinned],
        )?;
        Ok(affected > 0)
    }

    /// Star or unstar a message for one user. Returns whether anything changed.
    pub fn set_starred(&self, id: MessageId, user_id: UserId, starred: bool) -> Result<bool> {
        let affected = if starred {
            self.conn().execute(
                "INSERT OR IGNORE INTO message_stars (message_id, user_id, created_at)
                 VALUES (?1, ?2, ?3)",
                params![id.to_string(), user_id.to_string(), Utc::now().to_rfc3339()],
            )?
        } else {
            self.conn().execute(
                "DELETE FROM message_stars WHERE message_id = ?1 AND user_id = ?2",
                params![id.to_string(), user_id.to_string()],
            )?
        };
        Ok(affected > 0)
    }

    pub fn is_starred(&self, id: MessageId, user_id: UserId) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM message_stars WHERE message_id = ?1 AND user_id = ?2",
            params![id.to_string(), user_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Soft delete. Content is cleared; the row stays for status bookkeeping.
    pub fn soft_delete_message(&self, id: MessageId, at: DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages
             SET deleted_at = ?2, body = NULL, attachments = '[]', metadata = NULL, pinned = 0
             WHERE id = ?1 AND deleted_at IS NULL",
            params![id.to_string(), at.to_rfc3339()],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id: String = row.get(0)?;
    let conversation_id: String = row.get(1)?;
    let sender_id: String = row.get(2)?;
    let attachments: String = row.get(4)?;
    let metadata: Option<String> = row.get(5)?;
    let created_at: String = row.get(10)?;

    let attachments = serde_json::from_str(&attachments).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let metadata = metadata
        .map(|m| serde_json::from_str(&m))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Message {
        id: parse_id(0, &id)?,
        conversation_id: parse_id(1, &conversation_id)?,
        sender_id: parse_id(2, &sender_id)?,
        body: row.get(3)?,
        attachments,
        metadata,
        reply_to: parse_opt_id(6, row.get(6)?)?,
        forwarded_from: parse_opt_id(7, row.get(7)?)?,
        pinned: row.get(8)?,
        deleted_at: parse_opt_ts(9, row.get(9)?)?,
        created_at: parse_ts(10, &created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Conversation;
    use pulse_shared::types::ConversationId;

    fn seed_conversation(db: &Database) -> ConversationId {
        let conv = Conversation::new(None, false);
        db.create_conversation(&conv).unwrap();
        conv.id
    }

    #[test]
    fn insert_and_fetch() {
        let db = Database::open_in_memory().unwrap();
        let conv = seed_conversation(&db);
        let mut message = Message::new(conv, UserId::new());
        message.body = Some("hello".into());
        message.attachments = vec![serde_json::json!({"url": "https://cdn/x.png"})];
        message.metadata = Some(serde_json::json!({"mentions": []}));

        db.insert_message(&message).unwrap();

        let fetched = db.get_message(message.id).unwrap();
        assert_eq!(fetched.body.as_deref(), Some("hello"));
        assert_eq!(fetched.attachments.len(), 1);
        assert_eq!(fetched.metadata, message.metadata);
        assert!(!fetched.pinned);
    }

    #[test]
    fn insert_many_is_atomic() {
        let mut db = Database::open_in_memory().unwrap();
        let conv = seed_conversation(&db);
        let first = Message::new(conv, UserId::new());
        // Second message points at a conversation that does not exist.
        let broken = Message::new(ConversationId::new(), UserId::new());

        assert!(db.insert_messages(&[first.clone(), broken]).is_err());
        assert!(matches!(db.get_message(first.id), Err(StoreError::NotFound)));

        db.insert_messages(&[first.clone()]).unwrap();
        assert!(db.get_message(first.id).is_ok());
    }

    #[test]
    fn pin_star_delete() {
        let db = Database::open_in_memory().unwrap();
        let conv = seed_conversation(&db);
        let user = UserId::new();
        let mut message = Message::new(conv, user);
        message.body = Some("pin me".into());
        db.insert_message(&message).unwrap();

        assert!(db.set_pinned(message.id, true).unwrap());
        assert!(db.get_message(message.id).unwrap().pinned);

        assert!(db.set_starred(message.id, user, true).unwrap());
        assert!(!db.set_starred(message.id, user, true).unwrap());
        assert!(db.is_starred(message.id, user).unwrap());
        assert!(db.set_starred(message.id, user, false).unwrap());
        assert!(!db.is_starred(message.id, user).unwrap());

        assert!(db.soft_delete_message(message.id, Utc::now()).unwrap());
        assert!(!db.soft_delete_message(message.id, Utc::now()).unwrap());
        let deleted = db.get_message(message.id).unwrap();
        assert!(deleted.is_deleted());
        assert!(deleted.body.is_none());
        assert!(!deleted.pinned);
        assert!(!db.set_pinned(message.id, true).unwrap());
    }
}
