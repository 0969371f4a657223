//! Fan-out of one frame to a resolved recipient set.
//!
//! The engine only classifies and sends. Ledger writes and push fallback
//! are left to the caller, which gets the [`Delivery`] partition back.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, error};

use pulse_shared::protocol::OutboundFrame;
use pulse_shared::types::{ConversationId, UserId};

use crate::membership::MembershipCache;
use crate::registry::ConnectionRegistry;

/// Who a broadcast is for: a conversation's members, explicit users, or
/// both (unioned).
#[derive(Debug, Clone, Default)]
pub struct BroadcastTarget {
    pub conversation_id: Option<ConversationId>,
    pub user_ids: Vec<UserId>,
}

impl BroadcastTarget {
    pub fn conversation(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id: Some(conversation_id),
            user_ids: Vec::new(),
        }
    }

    pub fn users(user_ids: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            conversation_id: None,
            user_ids: user_ids.into_iter().collect(),
        }
    }
}

/// Delivery classification of one broadcast.
///
/// `online` and `offline` partition the recipients; `active_in_conversation`
/// is the subset of `online` viewing the target conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub online: Vec<UserId>,
    pub offline: Vec<UserId>,
    pub active_in_conversation: Vec<UserId>,
}

impl Delivery {
    pub fn is_active(&self, user_id: &UserId) -> bool {
        self.active_in_conversation.contains(user_id)
    }
}

pub struct BroadcastEngine {
    registry: Arc<ConnectionRegistry>,
    membership: Arc<MembershipCache>,
}

impl BroadcastEngine {
    pub fn new(registry: Arc<ConnectionRegistry>, membership: Arc<MembershipCache>) -> Self {
        Self {
            registry,
            membership,
        }
    }

    /// Send `frame` to every recipient of `target` except `exclude`.
    pub async fn broadcast(
        &self,
        target: &BroadcastTarget,
        frame: &OutboundFrame,
        exclude: &[UserId],
    ) -> Delivery {
        let recipients = self.resolve(target, exclude).await;

        let text: Option<Arc<str>> = match frame.to_json() {
            Ok(json) => Some(json.into()),
            Err(e) => {
                error!(error = %e, "Failed to encode broadcast frame");
                None
            }
        };

        let mut delivery = Delivery::default();
        for user_id in recipients {
            let Some(conn) = self.registry.get(user_id) else {
                delivery.offline.push(user_id);
                continue;
            };

            let sent = match &text {
                Some(text) => conn.send_text(Arc::clone(text)).is_ok(),
                None => false,
            };
            if !sent {
                // Dead socket still registered: evict it, by identity.
                self.registry.unregister(user_id, conn.id());
                delivery.offline.push(user_id);
                continue;
            }

            delivery.online.push(user_id);
            if target.conversation_id.is_some()
                && conn.active_conversation() == target.conversation_id
            {
                delivery.active_in_conversation.push(user_id);
            }
        }

        debug!(
            conversation = ?target.conversation_id,
            online = delivery.online.len(),
            offline = delivery.offline.len(),
            active = delivery.active_in_conversation.len(),
            "Broadcast complete"
        );
        delivery
    }

    /// Send to one user. Returns whether a live socket accepted the frame.
    pub fn send_to(&self, user_id: UserId, frame: &OutboundFrame) -> bool {
        let Some(conn) = self.registry.get(user_id) else {
            return false;
        };
        if conn.send(frame).is_ok() {
            return true;
        }
        self.registry.unregister(user_id, conn.id());
        false
    }

    /// Members (if any) unioned with explicit ids, minus `exclude`,
    /// deduplicated in first-seen order.
    async fn resolve(&self, target: &BroadcastTarget, exclude: &[UserId]) -> Vec<UserId> {
        let mut candidates: Vec<UserId> = Vec::new();
        if let Some(conversation_id) = target.conversation_id {
            let mut members: Vec<UserId> =
                self.membership.get_members(conversation_id).await.into_iter().collect();
            members.sort();
            candidates.extend(members);
        }
        candidates.extend(target.user_ids.iter().copied());

        let excluded: HashSet<UserId> = exclude.iter().copied().collect();
        let mut seen = HashSet::with_capacity(candidates.len());
        candidates
            .into_iter()
            .filter(|u| !excluded.contains(u) && seen.insert(*u))
            .collect()
    }
}
