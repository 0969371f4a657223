//! Durable delivered/read accounting per (message, recipient).
//!
//! Broadcast classification turns into status rows here, always in a single
//! store round-trip no matter how many recipients or conversations are
//! involved.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use pulse_shared::types::{ConversationId, MessageId, UserId};
use pulse_store::{MessageStatus, Result, StatusPatch};

use crate::broadcast::Delivery;
use crate::store::Store;

pub struct MessageStatusLedger {
    store: Arc<dyn Store>,
}

impl MessageStatusLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// One row per recipient in `delivery`: `delivered_at` iff the recipient
    /// was online, `read_at` iff they were viewing the conversation.
    pub fn records_for(
        message_id: MessageId,
        conversation_id: ConversationId,
        delivery: &Delivery,
        at: DateTime<Utc>,
    ) -> Vec<MessageStatus> {
        let online = delivery.online.iter().map(|user| {
            let read_at = delivery.is_active(user).then_some(at);
            MessageStatus {
                message_id,
                user_id: *user,
                conversation_id,
                delivered_at: Some(at),
                read_at,
                updated_at: at,
            }
        });
        let offline = delivery.offline.iter().map(|user| MessageStatus {
            message_id,
            user_id: *user,
            conversation_id,
            delivered_at: None,
            read_at: None,
            updated_at: at,
        });
        online.chain(offline).collect()
    }

    pub async fn batch_insert(&self, records: Vec<MessageStatus>) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let count = records.len();
        let written = self.store.insert_statuses(records).await?;
        debug!(count, written, "Status rows written");
        Ok(written)
    }

    pub async fn batch_update(
        &self,
        user_id: UserId,
        message_ids: Vec<MessageId>,
        patch: StatusPatch,
        conversation_id: Option<ConversationId>,
    ) -> Result<usize> {
        if message_ids.is_empty() || patch.is_empty() {
            return Ok(0);
        }
        self.store
            .update_statuses(user_id, message_ids, patch, conversation_id)
            .await
    }

    /// Everything unread for `user_id` in a conversation becomes read.
    /// Returns the ids that changed.
    pub async fn mark_conversation_read(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        at: DateTime<Utc>,
    ) -> Result<Vec<MessageId>> {
        self.store
            .mark_conversation_read(user_id, conversation_id, at)
            .await
    }

    /// Stamp every undelivered row of a user that just came online.
    pub async fn flush_backlog(&self, user_id: UserId) -> Result<Vec<MessageStatus>> {
        let stamped = self
            .store
            .mark_backlog_delivered(user_id, Utc::now())
            .await?;
        if !stamped.is_empty() {
            debug!(user = %user_id, count = stamped.len(), "Backlog marked delivered");
        }
        Ok(stamped)
    }
}
