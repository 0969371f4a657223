//! Call session state machine.
//!
//! `initiated -> ringing -> answered -> ended`, with `missed` (ring timeout)
//! and `declined` (callee) reachable while the call is still pending.
//!
//! A user is caller or callee of at most one live call, enforced by the
//! user index. Every state change, the busy check and the ring-timer
//! cancellation happen under the one table lock; the first terminal
//! transition wins and later ones find nothing to do.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use pulse_shared::error::ErrorCode;
use pulse_shared::types::{CallId, CallStatus, CallType, UserId};
use pulse_store::{CallRecord, StoreError};

use crate::store::Store;

/// `call:end` reason when a participant's connection went away.
pub const DISCONNECTED_REASON: &str = "disconnected";

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("user is already in a call")]
    UserBusy,

    #[error("callee does not exist")]
    UserNotFound,

    #[error("callee does not accept calls")]
    CallAccessDisabled,

    #[error("a user cannot call themselves")]
    SelfCall,

    #[error("call not found")]
    NotFound,

    #[error("not allowed to act on this call")]
    Forbidden,

    #[error("call is {0:?}, transition not allowed")]
    InvalidState(CallStatus),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CallError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UserBusy => ErrorCode::UserBusy,
            Self::UserNotFound => ErrorCode::UserNotFound,
            Self::CallAccessDisabled => ErrorCode::CallAccessDisabled,
            Self::SelfCall => ErrorCode::ValidationError,
            Self::NotFound => ErrorCode::CallNotFound,
            Self::Forbidden => ErrorCode::Unauthorized,
            Self::InvalidState(_) => ErrorCode::InvalidCallState,
            Self::Store(_) => ErrorCode::InternalError,
        }
    }
}

/// Snapshot of a live call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    pub id: CallId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    pub call_type: CallType,
    pub status: CallStatus,
    pub created_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    /// Caller's initial offer, kept so a reconnecting callee can be rung
    /// again.
    pub offer_sdp: Option<String>,
}

impl CallSession {
    pub fn is_participant(&self, user_id: UserId) -> bool {
        self.caller_id == user_id || self.callee_id == user_id
    }

    pub fn peer_of(&self, user_id: UserId) -> Option<UserId> {
        if user_id == self.caller_id {
            Some(self.callee_id)
        } else if user_id == self.callee_id {
            Some(self.caller_id)
        } else {
            None
        }
    }
}

/// Final state of a call that just left the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedCall {
    pub session: CallSession,
    pub ended_by: Option<UserId>,
    pub duration_seconds: Option<i64>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    /// The ring timeout fired before the callee answered.
    Missed(FinishedCall),
}

struct ActiveCall {
    session: CallSession,
    ring_timer: Option<AbortHandle>,
}

#[derive(Default)]
struct CallTable {
    sessions: HashMap<CallId, ActiveCall>,
    by_user: HashMap<UserId, CallId>,
}

impl CallTable {
    /// The only way a call leaves the table: both user index entries and the
    /// session go together. The ring timer is aborted unless the timer
    /// itself is the caller.
    fn detach(&mut self, call_id: CallId, abort_timer: bool) -> Option<CallSession> {
        let active = self.sessions.remove(&call_id)?;
        for user in [active.session.caller_id, active.session.callee_id] {
            if self.by_user.get(&user) == Some(&call_id) {
                self.by_user.remove(&user);
            }
        }
        if abort_timer {
            if let Some(timer) = active.ring_timer {
                timer.abort();
            }
        }
        Some(active.session)
    }
}

pub struct CallSessionManager {
    table: Mutex<CallTable>,
    store: Arc<dyn Store>,
    ring_timeout: Duration,
    events: mpsc::UnboundedSender<CallEvent>,
    this: Weak<CallSessionManager>,
}

impl CallSessionManager {
    /// The receiver yields a [`CallEvent`] for every call that times out.
    pub fn new(
        store: Arc<dyn Store>,
        ring_timeout: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<CallEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Arc::new_cyclic(|this| Self {
            table: Mutex::new(CallTable::default()),
            store,
            ring_timeout,
            events,
            this: this.clone(),
        });
        (manager, rx)
    }

    fn table(&self) -> MutexGuard<'_, CallTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a call. The callee must exist and accept calls, and neither
    /// party may already be in a call.
    pub async fn initiate(
        &self,
        caller_id: UserId,
        callee_id: UserId,
        call_type: CallType,
        offer_sdp: Option<String>,
    ) -> Result<CallSession, CallError> {
        if caller_id == callee_id {
            return Err(CallError::SelfCall);
        }

        let callee = self
            .store
            .get_user(callee_id)
            .await?
            .ok_or(CallError::UserNotFound)?;
        if !callee.call_access_enabled {
            return Err(CallError::CallAccessDisabled);
        }

        let session = CallSession {
            id: CallId::new(),
            caller_id,
            callee_id,
            call_type,
            status: CallStatus::Initiated,
            created_at: Utc::now(),
            answered_at: None,
            offer_sdp,
        };

        {
            let mut table = self.table();
            if table.by_user.contains_key(&caller_id) || table.by_user.contains_key(&callee_id) {
                return Err(CallError::UserBusy);
            }
            table.by_user.insert(caller_id, session.id);
            table.by_user.insert(callee_id, session.id);
            table.sessions.insert(
                session.id,
                ActiveCall {
                    session: session.clone(),
                    ring_timer: None,
                },
            );
        }

        let record = CallRecord {
            created_at: session.created_at,
            ..CallRecord::new(session.id, caller_id, callee_id, call_type)
        };
        if let Err(e) = self.store.insert_call(record).await {
            warn!(call = %session.id, error = %e, "Failed to persist call, rolling back");
            self.table().detach(session.id, true);
            return Err(e.into());
        }

        self.arm_ring_timer(session.id);
        info!(call = %session.id, caller = %caller_id, callee = %callee_id, "Call initiated");
        Ok(session)
    }

    /// Start the ring timeout, stored with the session under the table lock.
    fn arm_ring_timer(&self, call_id: CallId) {
        let mut table = self.table();
        let Some(active) = table.sessions.get_mut(&call_id) else {
            return;
        };
        if !active.session.status.is_pending() {
            return;
        }

        let manager = self.this.clone();
        let timeout = self.ring_timeout;
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(manager) = manager.upgrade() {
                manager.expire(call_id).await;
            }
        });
        active.ring_timer = Some(task.abort_handle());
    }

    /// Ring timeout path. A no-op if the call was answered, declined or
    /// ended first.
    async fn expire(&self, call_id: CallId) {
        let session = {
            let mut table = self.table();
            match table.sessions.get(&call_id) {
                Some(active) if active.session.status.is_pending() => {}
                _ => return,
            }
            match table.detach(call_id, false) {
                Some(mut session) => {
                    session.status = CallStatus::Missed;
                    session
                }
                None => return,
            }
        };

        info!(call = %call_id, "Call missed");
        let finished = FinishedCall {
            session,
            ended_by: None,
            duration_seconds: None,
            reason: Some("missed".to_string()),
        };
        self.persist_finish(&finished).await;
        let _ = self.events.send(CallEvent::Missed(finished));
    }

    /// `initiated -> ringing`, once the callee's socket got the offer.
    pub async fn mark_ringing(&self, call_id: CallId) -> bool {
        let changed = {
            let mut table = self.table();
            match table.sessions.get_mut(&call_id) {
                Some(active) if active.session.status == CallStatus::Initiated => {
                    active.session.status = CallStatus::Ringing;
                    true
                }
                _ => false,
            }
        };
        if changed {
            match self
                .store
                .update_call_status(call_id, CallStatus::Ringing, None)
                .await
            {
                Ok(true) => {}
                Ok(false) => debug!(call = %call_id, "Call finished before ringing was stored"),
                Err(e) => warn!(call = %call_id, error = %e, "Failed to persist ringing state"),
            }
        }
        changed
    }

    /// Callee picks up. Cancels the ring timer in the same critical section.
    pub async fn accept(&self, call_id: CallId, user_id: UserId) -> Result<CallSession, CallError> {
        let session = {
            let mut table = self.table();
            let active = table.sessions.get_mut(&call_id).ok_or(CallError::NotFound)?;
            if active.session.callee_id != user_id {
                return Err(CallError::Forbidden);
            }
            if !active.session.status.is_pending() {
                return Err(CallError::InvalidState(active.session.status));
            }
            active.session.status = CallStatus::Answered;
            active.session.answered_at = Some(Utc::now());
            if let Some(timer) = active.ring_timer.take() {
                timer.abort();
            }
            active.session.clone()
        };

        match self
            .store
            .update_call_status(call_id, CallStatus::Answered, session.answered_at)
            .await
        {
            Ok(true) => {}
            // A hangup overtook this write; its terminal state stands.
            Ok(false) => debug!(call = %call_id, "Call finished before answer was stored"),
            Err(e) => warn!(call = %call_id, error = %e, "Failed to persist answered state"),
        }
        info!(call = %call_id, "Call answered");
        Ok(session)
    }

    /// Callee refuses. `Ok(None)` if the call already finished.
    pub async fn decline(
        &self,
        call_id: CallId,
        user_id: UserId,
        reason: Option<String>,
    ) -> Result<Option<FinishedCall>, CallError> {
        let session = {
            let mut table = self.table();
            let Some(active) = table.sessions.get(&call_id) else {
                debug!(call = %call_id, "Decline on a finished call ignored");
                return Ok(None);
            };
            if active.session.callee_id != user_id {
                return Err(CallError::Forbidden);
            }
            if !active.session.status.is_pending() {
                return Err(CallError::InvalidState(active.session.status));
            }
            match table.detach(call_id, true) {
                Some(mut session) => {
                    session.status = CallStatus::Declined;
                    session
                }
                None => return Ok(None),
            }
        };

        let finished = FinishedCall {
            session,
            ended_by: Some(user_id),
            duration_seconds: None,
            reason,
        };
        self.persist_finish(&finished).await;
        info!(call = %call_id, "Call declined");
        Ok(Some(finished))
    }

    /// Either party hangs up. `Ok(None)` if the call already finished.
    pub async fn end(
        &self,
        call_id: CallId,
        user_id: UserId,
        reason: Option<String>,
    ) -> Result<Option<FinishedCall>, CallError> {
        let session = {
            let mut table = self.table();
            let Some(active) = table.sessions.get(&call_id) else {
                debug!(call = %call_id, "End on a finished call ignored");
                return Ok(None);
            };
            if !active.session.is_participant(user_id) {
                return Err(CallError::Forbidden);
            }
            match table.detach(call_id, true) {
                Some(mut session) => {
                    session.status = CallStatus::Ended;
                    session
                }
                None => return Ok(None),
            }
        };

        let duration_seconds = session
            .answered_at
            .map(|answered| (Utc::now() - answered).num_seconds().max(0));
        let finished = FinishedCall {
            session,
            ended_by: Some(user_id),
            duration_seconds,
            reason,
        };
        self.persist_finish(&finished).await;
        info!(call = %call_id, duration = ?duration_seconds, "Call ended");
        Ok(Some(finished))
    }

    async fn persist_finish(&self, finished: &FinishedCall) {
        let session = &finished.session;
        match self
            .store
            .finish_call(
                session.id,
                session.status,
                Utc::now(),
                finished.duration_seconds,
                finished.reason.clone(),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(call = %session.id, "Call already had a stored outcome"),
            Err(e) => warn!(call = %session.id, error = %e, "Failed to persist call outcome"),
        }
    }

    /// `user_id` has no connection left. An answered call, or one the user
    /// is placing, ends with reason `disconnected`. A call still ringing the
    /// user is left to its ring timer so a quick reconnect can pick it up.
    pub async fn end_for_disconnect(&self, user_id: UserId) -> Option<FinishedCall> {
        let call_id = {
            let table = self.table();
            let call_id = *table.by_user.get(&user_id)?;
            let active = table.sessions.get(&call_id)?;
            if active.session.status.is_pending() && active.session.callee_id == user_id {
                return None;
            }
            call_id
        };

        match self
            .end(call_id, user_id, Some(DISCONNECTED_REASON.to_string()))
            .await
        {
            Ok(finished) => finished,
            Err(e) => {
                warn!(call = %call_id, user = %user_id, error = %e, "Failed to end call on disconnect");
                None
            }
        }
    }

    pub fn get_active_call(&self, user_id: UserId) -> Option<CallSession> {
        let table = self.table();
        let call_id = table.by_user.get(&user_id)?;
        table.sessions.get(call_id).map(|a| a.session.clone())
    }

    /// A still-ringing call waiting on `user_id` to pick up.
    pub fn pending_for_callee(&self, user_id: UserId) -> Option<CallSession> {
        self.get_active_call(user_id)
            .filter(|s| s.callee_id == user_id && s.status.is_pending())
    }

    /// The other participant of a live call, for signaling relay.
    pub fn peer_for_relay(&self, call_id: CallId, user_id: UserId) -> Result<UserId, CallError> {
        let table = self.table();
        let active = table.sessions.get(&call_id).ok_or(CallError::NotFound)?;
        active.session.peer_of(user_id).ok_or(CallError::Forbidden)
    }

    pub fn active_count(&self) -> usize {
        self.table().sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pulse_shared::types::{ConversationId, MessageId, PresenceState};
    use pulse_store::{Message, MessageStatus, StatusPatch, User};
    use tokio::sync::Notify;

    use crate::store::SqliteStore;

    struct Fixture {
        store: SqliteStore,
        manager: Arc<CallSessionManager>,
        events: mpsc::UnboundedReceiver<CallEvent>,
    }

    fn fixture() -> Fixture {
        let store = SqliteStore::in_memory().unwrap();
        let (manager, events) = CallSessionManager::new(
            Arc::new(store.clone()) as Arc<dyn Store>,
            Duration::from_secs(30),
        );
        Fixture {
            store,
            manager,
            events,
        }
    }

    fn user(f: &Fixture, call_access_enabled: bool) -> UserId {
        let mut user = User::new(UserId::new(), None);
        user.call_access_enabled = call_access_enabled;
        f.store.with_db(|db| db.upsert_user(&user).unwrap());
        user.id
    }

    fn stored_status(f: &Fixture, call_id: CallId) -> CallStatus {
        f.store.with_db(|db| db.get_call(call_id).unwrap().status)
    }

    #[tokio::test]
    async fn test_callee_eligibility() {
        let f = fixture();
        let caller = user(&f, true);
        let closed = user(&f, false);

        let err = f
            .manager
            .initiate(caller, UserId::new(), CallType::Audio, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::UserNotFound);

        let err = f
            .manager
            .initiate(caller, closed, CallType::Audio, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CallAccessDisabled);
        assert_eq!(f.manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_one_active_call_per_user() {
        let f = fixture();
        let (a, b, c) = (user(&f, true), user(&f, true), user(&f, true));

        let call = f.manager.initiate(a, b, CallType::Video, None).await.unwrap();

        for (caller, callee) in [(a, c), (c, a), (c, b)] {
            let err = f
                .manager
                .initiate(caller, callee, CallType::Audio, None)
                .await
                .unwrap_err();
            assert!(matches!(err, CallError::UserBusy));
        }
        assert_eq!(f.manager.active_count(), 1);
        assert_eq!(f.manager.get_active_call(b).unwrap().id, call.id);
        assert!(f.manager.get_active_call(c).is_none());
    }

    #[tokio::test]
    async fn test_only_callee_may_accept() {
        let f = fixture();
        let (a, b) = (user(&f, true), user(&f, true));
        let call = f.manager.initiate(a, b, CallType::Audio, None).await.unwrap();

        assert!(matches!(
            f.manager.accept(call.id, a).await,
            Err(CallError::Forbidden)
        ));
        assert!(matches!(
            f.manager.accept(CallId::new(), b).await,
            Err(CallError::NotFound)
        ));

        let session = f.manager.accept(call.id, b).await.unwrap();
        assert_eq!(session.status, CallStatus::Answered);
        assert_eq!(stored_status(&f, call.id), CallStatus::Answered);
        assert!(matches!(
            f.manager.accept(call.id, b).await,
            Err(CallError::InvalidState(CallStatus::Answered))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_just_before_timeout_wins() {
        let mut f = fixture();
        let (a, b) = (user(&f, true), user(&f, true));
        let call = f.manager.initiate(a, b, CallType::Audio, None).await.unwrap();

        tokio::time::advance(Duration::from_millis(29_999)).await;
        f.manager.accept(call.id, b).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;

        assert_eq!(
            f.manager.get_active_call(a).unwrap().status,
            CallStatus::Answered
        );
        assert!(f.events.try_recv().is_err());
        assert_eq!(stored_status(&f, call.id), CallStatus::Answered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_call_is_missed() {
        let mut f = fixture();
        let (a, b) = (user(&f, true), user(&f, true));
        let call = f.manager.initiate(a, b, CallType::Audio, None).await.unwrap();
        assert!(f.manager.mark_ringing(call.id).await);

        tokio::time::advance(Duration::from_secs(30)).await;
        let CallEvent::Missed(missed) = f.events.recv().await.unwrap();

        assert_eq!(missed.session.id, call.id);
        assert_eq!(missed.session.status, CallStatus::Missed);
        assert_eq!(f.manager.active_count(), 0);
        assert!(f.manager.get_active_call(a).is_none());
        assert!(f.manager.get_active_call(b).is_none());
        assert_eq!(stored_status(&f, call.id), CallStatus::Missed);

        // Both users are free again.
        f.manager.initiate(b, a, CallType::Audio, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_decline_then_end_is_noop() {
        let f = fixture();
        let (a, b) = (user(&f, true), user(&f, true));
        let call = f.manager.initiate(a, b, CallType::Audio, None).await.unwrap();

        assert!(matches!(
            f.manager.decline(call.id, a, None).await,
            Err(CallError::Forbidden)
        ));
        let declined = f
            .manager
            .decline(call.id, b, Some("busy".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(declined.session.status, CallStatus::Declined);

        assert!(f.manager.end(call.id, a, None).await.unwrap().is_none());
        assert!(f.manager.decline(call.id, b, None).await.unwrap().is_none());
        assert_eq!(stored_status(&f, call.id), CallStatus::Declined);
        assert_eq!(f.manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_end_after_answer_reports_duration() {
        let f = fixture();
        let (a, b) = (user(&f, true), user(&f, true));
        let call = f.manager.initiate(a, b, CallType::Video, None).await.unwrap();
        f.manager.accept(call.id, b).await.unwrap();

        let outsider = UserId::new();
        assert!(matches!(
            f.manager.end(call.id, outsider, None).await,
            Err(CallError::Forbidden)
        ));

        let ended = f.manager.end(call.id, a, None).await.unwrap().unwrap();
        assert_eq!(ended.session.status, CallStatus::Ended);
        assert!(ended.duration_seconds.is_some());
        assert_eq!(ended.ended_by, Some(a));

        let record = f.store.with_db(|db| db.get_call(call.id).unwrap());
        assert_eq!(record.status, CallStatus::Ended);
        assert!(record.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_end_before_answer_has_no_duration() {
        let f = fixture();
        let (a, b) = (user(&f, true), user(&f, true));
        let call = f.manager.initiate(a, b, CallType::Audio, None).await.unwrap();

        let ended = f.manager.end(call.id, a, Some("cancel".into())).await.unwrap().unwrap();
        assert!(ended.duration_seconds.is_none());
        assert!(f.manager.get_active_call(b).is_none());
    }

    #[tokio::test]
    async fn test_relay_peer_lookup() {
        let f = fixture();
        let (a, b) = (user(&f, true), user(&f, true));
        let call = f.manager.initiate(a, b, CallType::Audio, None).await.unwrap();

        assert_eq!(f.manager.peer_for_relay(call.id, a).unwrap(), b);
        assert_eq!(f.manager.peer_for_relay(call.id, b).unwrap(), a);
        assert!(matches!(
            f.manager.peer_for_relay(call.id, UserId::new()),
            Err(CallError::Forbidden)
        ));
        assert_eq!(f.manager.pending_for_callee(b).unwrap().id, call.id);
        assert!(f.manager.pending_for_callee(a).is_none());
    }

    #[tokio::test]
    async fn test_self_call_rejected() {
        let f = fixture();
        let a = user(&f, true);
        let err = f
            .manager
            .initiate(a, a, CallType::Audio, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn test_disconnect_ends_answered_call() {
        let f = fixture();
        let (a, b, c) = (user(&f, true), user(&f, true), user(&f, true));
        let call = f.manager.initiate(a, b, CallType::Audio, None).await.unwrap();
        f.manager.accept(call.id, b).await.unwrap();

        let finished = f.manager.end_for_disconnect(a).await.unwrap();
        assert_eq!(finished.session.status, CallStatus::Ended);
        assert_eq!(finished.ended_by, Some(a));
        assert_eq!(finished.reason.as_deref(), Some(DISCONNECTED_REASON));
        assert_eq!(f.manager.active_count(), 0);
        assert!(f.manager.end_for_disconnect(b).await.is_none());

        let record = f.store.with_db(|db| db.get_call(call.id).unwrap());
        assert_eq!(record.status, CallStatus::Ended);
        assert_eq!(record.end_reason.as_deref(), Some(DISCONNECTED_REASON));

        // Neither party is left busy.
        f.manager.initiate(a, c, CallType::Audio, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_while_ringing() {
        let f = fixture();
        let (a, b) = (user(&f, true), user(&f, true));
        let call = f.manager.initiate(a, b, CallType::Audio, None).await.unwrap();

        // The callee may reconnect and still pick up.
        assert!(f.manager.end_for_disconnect(b).await.is_none());
        assert_eq!(f.manager.pending_for_callee(b).unwrap().id, call.id);

        // The caller leaving cancels the call.
        let finished = f.manager.end_for_disconnect(a).await.unwrap();
        assert_eq!(finished.session.id, call.id);
        assert!(finished.duration_seconds.is_none());
        assert!(f.manager.get_active_call(b).is_none());
    }

    /// Holds answered-state writes until released.
    struct GatedStore {
        inner: SqliteStore,
        answer_gate: Notify,
    }

    #[async_trait]
    impl Store for GatedStore {
        async fn ping(&self) -> pulse_store::Result<()> {
            self.inner.ping().await
        }
        async fn get_user(&self, id: UserId) -> pulse_store::Result<Option<User>> {
            self.inner.get_user(id).await
        }
        async fn set_presence(
            &self,
            id: UserId,
            state: PresenceState,
            at: DateTime<Utc>,
        ) -> pulse_store::Result<()> {
            self.inner.set_presence(id, state, at).await
        }
        async fn insert_message(&self, message: Message) -> pulse_store::Result<()> {
            self.inner.insert_message(message).await
        }
        async fn insert_messages(&self, messages: Vec<Message>) -> pulse_store::Result<()> {
            self.inner.insert_messages(messages).await
        }
        async fn get_message(&self, id: MessageId) -> pulse_store::Result<Option<Message>> {
            self.inner.get_message(id).await
        }
        async fn set_pinned(&self, id: MessageId, pinned: bool) -> pulse_store::Result<bool> {
            self.inner.set_pinned(id, pinned).await
        }
        async fn set_starred(
            &self,
            id: MessageId,
            user_id: UserId,
            starred: bool,
        ) -> pulse_store::Result<bool> {
            self.inner.set_starred(id, user_id, starred).await
        }
        async fn soft_delete_message(
            &self,
            id: MessageId,
            at: DateTime<Utc>,
        ) -> pulse_store::Result<bool> {
            self.inner.soft_delete_message(id, at).await
        }
        async fn insert_statuses(&self, records: Vec<MessageStatus>) -> pulse_store::Result<usize> {
            self.inner.insert_statuses(records).await
        }
        async fn update_statuses(
            &self,
            user_id: UserId,
            message_ids: Vec<MessageId>,
            patch: StatusPatch,
            conversation_id: Option<ConversationId>,
        ) -> pulse_store::Result<usize> {
            self.inner
                .update_statuses(user_id, message_ids, patch, conversation_id)
                .await
        }
        async fn mark_conversation_read(
            &self,
            user_id: UserId,
            conversation_id: ConversationId,
            at: DateTime<Utc>,
        ) -> pulse_store::Result<Vec<MessageId>> {
            self.inner
                .mark_conversation_read(user_id, conversation_id, at)
                .await
        }
        async fn mark_backlog_delivered(
            &self,
            user_id: UserId,
            at: DateTime<Utc>,
        ) -> pulse_store::Result<Vec<MessageStatus>> {
            self.inner.mark_backlog_delivered(user_id, at).await
        }
        async fn insert_call(&self, call: CallRecord) -> pulse_store::Result<()> {
            self.inner.insert_call(call).await
        }
        async fn update_call_status(
            &self,
            id: CallId,
            status: CallStatus,
            answered_at: Option<DateTime<Utc>>,
        ) -> pulse_store::Result<bool> {
            if status == CallStatus::Answered {
                self.answer_gate.notified().await;
            }
            self.inner.update_call_status(id, status, answered_at).await
        }
        async fn finish_call(
            &self,
            id: CallId,
            status: CallStatus,
            ended_at: DateTime<Utc>,
            duration_seconds: Option<i64>,
            reason: Option<String>,
        ) -> pulse_store::Result<bool> {
            self.inner
                .finish_call(id, status, ended_at, duration_seconds, reason)
                .await
        }
    }

    #[tokio::test]
    async fn test_hangup_overtaking_answer_write_stays_ended() {
        let store = GatedStore {
            inner: SqliteStore::in_memory().unwrap(),
            answer_gate: Notify::new(),
        };
        let (a, b) = (User::new(UserId::new(), None), User::new(UserId::new(), None));
        store.inner.with_db(|db| {
            db.upsert_user(&a).unwrap();
            db.upsert_user(&b).unwrap();
        });
        let store = Arc::new(store);
        let (manager, _events) = CallSessionManager::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Duration::from_secs(30),
        );

        let call = manager.initiate(a.id, b.id, CallType::Audio, None).await.unwrap();
        let accepting = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.accept(call.id, b.id).await }
        });
        while manager.get_active_call(a.id).map(|s| s.status) != Some(CallStatus::Answered) {
            tokio::task::yield_now().await;
        }

        manager.end(call.id, a.id, None).await.unwrap().unwrap();
        store.answer_gate.notify_one();
        accepting.await.unwrap().unwrap();

        let record = store.inner.with_db(|db| db.get_call(call.id).unwrap());
        assert_eq!(record.status, CallStatus::Ended);
        assert!(record.ended_at.is_some());
    }
}
