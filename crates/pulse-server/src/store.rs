//! Async view of the durable store.
//!
//! The realtime core only talks to [`Store`]; [`SqliteStore`] adapts the
//! synchronous `pulse_store::Database` by running each call on the blocking
//! pool behind a mutex.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use pulse_shared::types::{CallId, CallStatus, ConversationId, MessageId, PresenceState, UserId};
use pulse_store::{
    CallRecord, Database, Message, MessageStatus, Result, StatusPatch, StoreError, User,
};

#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Cheap round-trip used by the health check.
    async fn ping(&self) -> Result<()>;

    async fn get_user(&self, id: UserId) -> Result<Option<User>>;
    async fn set_presence(&self, id: UserId, state: PresenceState, at: DateTime<Utc>)
        -> Result<()>;

    async fn insert_message(&self, message: Message) -> Result<()>;
    /// All or nothing.
    async fn insert_messages(&self, messages: Vec<Message>) -> Result<()>;
    async fn get_message(&self, id: MessageId) -> Result<Option<Message>>;
    async fn set_pinned(&self, id: MessageId, pinned: bool) -> Result<bool>;
    async fn set_starred(&self, id: MessageId, user_id: UserId, starred: bool) -> Result<bool>;
    async fn soft_delete_message(&self, id: MessageId, at: DateTime<Utc>) -> Result<bool>;

    /// One transactional bulk write.
    async fn insert_statuses(&self, records: Vec<MessageStatus>) -> Result<usize>;
    async fn update_statuses(
        &self,
        user_id: UserId,
        message_ids: Vec<MessageId>,
        patch: StatusPatch,
        conversation_id: Option<ConversationId>,
    ) -> Result<usize>;
    async fn mark_conversation_read(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        at: DateTime<Utc>,
    ) -> Result<Vec<MessageId>>;
    async fn mark_backlog_delivered(
        &self,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<Vec<MessageStatus>>;

    async fn insert_call(&self, call: CallRecord) -> Result<()>;
    /// `false` when the call already has a terminal state.
    async fn update_call_status(
        &self,
        id: CallId,
        status: CallStatus,
        answered_at: Option<DateTime<Utc>>,
    ) -> Result<bool>;
    /// `false` when another terminal state was written first.
    async fn finish_call(
        &self,
        id: CallId,
        status: CallStatus,
        ended_at: DateTime<Utc>,
        duration_seconds: Option<i64>,
        reason: Option<String>,
    ) -> Result<bool>;
}

/// Membership lookups behind the cache tiers.
#[async_trait]
pub trait MembershipSource: Send + Sync + 'static {
    async fn conversation_members(&self, conversation_id: ConversationId) -> Result<Vec<UserId>>;
    async fn user_conversations(&self, user_id: UserId) -> Result<Vec<ConversationId>>;
}

#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Database>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::from_database(Database::open_at(path)?))
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        Ok(Self::from_database(Database::open_in_memory()?))
    }

    pub fn from_database(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    /// Run `f` against the database on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Database) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut guard = db
                .lock()
                .map_err(|_| StoreError::Unavailable("database lock poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store worker failed: {e}")))?
    }

    /// Direct access for seeding and inspection in tests.
    #[cfg(test)]
    pub fn with_db<T>(&self, f: impl FnOnce(&mut Database) -> T) -> T {
        let mut guard = self.db.lock().unwrap();
        f(&mut guard)
    }
}

fn found<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(StoreError::NotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn ping(&self) -> Result<()> {
        self.run(|db| {
            db.conn().query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
        .await
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        self.run(move |db| found(db.get_user(id))).await
    }

    async fn set_presence(
        &self,
        id: UserId,
        state: PresenceState,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.run(move |db| db.set_presence(id, state, at).map(|_| ()))
            .await
    }

    async fn insert_message(&self, message: Message) -> Result<()> {
        self.run(move |db| db.insert_message(&message)).await
    }

    async fn insert_messages(&self, messages: Vec<Message>) -> Result<()> {
        self.run(move |db| db.insert_messages(&messages)).await
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>> {
        self.run(move |db| found(db.get_message(id))).await
    }

    async fn set_pinned(&self, id: MessageId, pinned: bool) -> Result<bool> {
        self.run(move |db| db.set_pinned(id, pinned)).await
    }

    async fn set_starred(&self, id: MessageId, user_id: UserId, starred: bool) -> Result<bool> {
        self.run(move |db| db.set_starred(id, user_id, starred))
            .await
    }

    async fn soft_delete_message(&self, id: MessageId, at: DateTime<Utc>) -> Result<bool> {
        self.run(move |db| db.soft_delete_message(id, at)).await
    }

    async fn insert_statuses(&self, records: Vec<MessageStatus>) -> Result<usize> {
        self.run(move |db| db.insert_statuses(&records)).await
    }

    async fn update_statuses(
        &self,
        user_id: UserId,
        message_ids: Vec<MessageId>,
        patch: StatusPatch,
        conversation_id: Option<ConversationId>,
    ) -> Result<usize> {
        self.run(move |db| db.update_statuses(user_id, &message_ids, patch, conversation_id))
            .await
    }

    async fn mark_conversation_read(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        at: DateTime<Utc>,
    ) -> Result<Vec<MessageId>> {
        self.run(move |db| db.mark_conversation_read(user_id, conversation_id, at))
            .await
    }

    async fn mark_backlog_delivered(
        &self,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<Vec<MessageStatus>> {
        self.run(move |db| db.mark_backlog_delivered(user_id, at))
            .await
    }

    async fn insert_call(&self, call: CallRecord) -> Result<()> {
        self.run(move |db| db.insert_call(&call)).await
    }

    async fn update_call_status(
        &self,
        id: CallId,
        status: CallStatus,
        answered_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        self.run(move |db| db.update_call_status(id, status, answered_at))
            .await
    }

    async fn finish_call(
        &self,
        id: CallId,
        status: CallStatus,
        ended_at: DateTime<Utc>,
        duration_seconds: Option<i64>,
        reason: Option<String>,
    ) -> Result<bool> {
        self.run(move |db| {
            db.finish_call(id, status, ended_at, duration_seconds, reason.as_deref())
        })
        .await
    }
}

#[async_trait]
impl MembershipSource for SqliteStore {
    async fn conversation_members(&self, conversation_id: ConversationId) -> Result<Vec<UserId>> {
        self.run(move |db| db.conversation_members(conversation_id))
            .await
    }

    async fn user_conversations(&self, user_id: UserId) -> Result<Vec<ConversationId>> {
        self.run(move |db| db.user_conversations(user_id)).await
    }
}
