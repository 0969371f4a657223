//! Socket lifecycle and per-frame dispatch.
//!
//! Each connection runs one read loop (frames are handled strictly in
//! arrival order) and one writer task draining the connection's outbound
//! queue. A failing frame is answered with `socket:error` and never takes
//! the connection down.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
};
use chrono::Utc;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pulse_shared::constants::{CLOSE_STALE, CLOSE_UNAUTHORIZED, MAX_FRAME_SIZE};
use pulse_shared::error::ErrorCode;
use pulse_shared::protocol::{
    CallInit, CallRinging, CallUpdate, DeleteEvent, ForwardRequest, IncomingCall, InboundFrame,
    MessageAck, MessageEvent, NewMessage, OutboundFrame, PinEvent, Pong, PresenceEvent,
    ReadReceipt, ReadRequest, SignalRelay, StarEvent, TypingEvent,
};
use pulse_shared::types::{CallId, CallStatus, ConversationId, MessageId, PresenceState, UserId};
use pulse_store::{Message, StatusPatch};

use crate::api::AppState;
use crate::broadcast::{BroadcastEngine, BroadcastTarget, Delivery};
use crate::calls::{CallEvent, CallSession, CallSessionManager, FinishedCall};
use crate::error::FrameError;
use crate::ledger::MessageStatusLedger;
use crate::membership::MembershipCache;
use crate::notifier::{Notifier, PushKind, PushNotification};
use crate::registry::{ConnectionHandle, ConnectionRegistry, Outgoing};
use crate::store::Store;

type FrameResult = Result<(), FrameError>;

/// Everything a connection needs, shared by all of them.
pub struct Hub {
    pub registry: Arc<ConnectionRegistry>,
    pub membership: Arc<MembershipCache>,
    pub broadcaster: BroadcastEngine,
    pub calls: Arc<CallSessionManager>,
    pub ledger: MessageStatusLedger,
    pub store: Arc<dyn Store>,
    pub notifier: Arc<dyn Notifier>,
    pub queue_capacity: usize,
}

impl Hub {
    /// Wire the realtime core together. The receiver carries ring timeouts
    /// and should be handed to [`spawn_call_event_relay`].
    pub fn new(
        store: Arc<dyn Store>,
        membership: Arc<MembershipCache>,
        notifier: Arc<dyn Notifier>,
        ring_timeout: Duration,
        queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<CallEvent>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let (calls, call_events) = CallSessionManager::new(Arc::clone(&store), ring_timeout);
        let hub = Arc::new(Self {
            broadcaster: BroadcastEngine::new(Arc::clone(&registry), Arc::clone(&membership)),
            ledger: MessageStatusLedger::new(Arc::clone(&store)),
            registry,
            membership,
            calls,
            store,
            notifier,
            queue_capacity,
        });
        (hub, call_events)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Register an authenticated connection and bring the user up to date.
    pub async fn open(&self, user_id: UserId) -> Arc<ConnectionHandle> {
        let conn = ConnectionHandle::new(user_id, self.queue_capacity);
        self.registry.register(Arc::clone(&conn));
        info!(user = %user_id, conn = %conn.id(), "Connection opened");

        self.persist_presence(user_id, PresenceState::Foreground).await;

        if let Err(e) = self.ledger.flush_backlog(user_id).await {
            warn!(user = %user_id, error = %e, "Backlog flush failed");
        }

        if let Some(call) = self.calls.pending_for_callee(user_id) {
            if conn.send(&incoming_call_frame(&call)).is_ok() {
                self.calls.mark_ringing(call.id).await;
                debug!(user = %user_id, call = %call.id, "Pending call re-delivered");
            }
        }

        self.fanout_presence(user_id, PresenceState::Foreground).await;
        conn
    }

    /// Tear down after the socket is gone. A connection that was already
    /// replaced leaves presence alone.
    pub async fn close(&self, conn: &ConnectionHandle) {
        let user_id = conn.user_id();
        if !self.registry.unregister(user_id, conn.id()) {
            debug!(user = %user_id, conn = %conn.id(), "Closed connection was not current");
            return;
        }
        info!(user = %user_id, conn = %conn.id(), dropped = conn.queue().dropped(), "Connection closed");
        self.end_call_on_disconnect(user_id).await;
        self.persist_presence(user_id, PresenceState::Disconnected).await;
        self.fanout_presence(user_id, PresenceState::Disconnected).await;
    }

    /// Close and unregister connections silent for `threshold`.
    pub async fn sweep_stale(&self, threshold: Duration) -> usize {
        let mut swept = 0;
        for conn in self.registry.idle_connections(threshold) {
            let user_id = conn.user_id();
            conn.set_presence(PresenceState::Stale);
            conn.close(CLOSE_STALE, "no activity");
            if self.registry.unregister(user_id, conn.id()) {
                swept += 1;
                info!(user = %user_id, idle = ?conn.idle_for(), "Stale connection swept");
                self.end_call_on_disconnect(user_id).await;
                self.persist_presence(user_id, PresenceState::Stale).await;
                self.fanout_presence(user_id, PresenceState::Stale).await;
            }
        }
        swept
    }

    /// The peer of a call the departed user was holding gets `call:end`.
    async fn end_call_on_disconnect(&self, user_id: UserId) {
        // A reconnect that raced the teardown keeps the call.
        if self.registry.is_online(user_id) {
            return;
        }
        let Some(finished) = self.calls.end_for_disconnect(user_id).await else {
            return;
        };
        if let Some(peer) = finished.session.peer_of(user_id) {
            let frame = OutboundFrame::CallEnded(call_update(&finished, user_id));
            self.broadcaster.send_to(peer, &frame);
        }
    }

    async fn persist_presence(&self, user_id: UserId, state: PresenceState) {
        if let Err(e) = self.store.set_presence(user_id, state, Utc::now()).await {
            warn!(user = %user_id, error = %e, "Failed to persist presence");
        }
    }

    /// Tell everyone sharing a conversation with `user_id` about its presence.
    async fn fanout_presence(&self, user_id: UserId, state: PresenceState) {
        let mut peers = HashSet::new();
        for conversation_id in self.membership.get_conversations(user_id).await {
            peers.extend(self.membership.get_members(conversation_id).await);
        }
        peers.remove(&user_id);
        if peers.is_empty() {
            return;
        }

        let frame = OutboundFrame::Presence(PresenceEvent {
            user_id,
            state,
            online: state.is_online(),
            at: Utc::now(),
        });
        self.broadcaster
            .broadcast(&BroadcastTarget::users(peers), &frame, &[])
            .await;
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Handle one text frame. Failures are reported back on `conn`.
    pub async fn handle_text(&self, conn: &ConnectionHandle, text: &str) {
        conn.touch();

        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(user = %conn.user_id(), error = %e, "Unparsable frame");
                let _ = conn.send(&OutboundFrame::error(
                    ErrorCode::ValidationError,
                    e.to_string(),
                    None,
                ));
                return;
            }
        };

        let tag = frame.tag();
        debug!(user = %conn.user_id(), tag, "Frame received");

        let result = match frame.validate() {
            Ok(()) => self.dispatch(conn, frame).await,
            Err(reason) => Err(FrameError::validation(reason)),
        };

        if let Err(e) = result {
            warn!(user = %conn.user_id(), tag, code = %e.code, error = %e.message, "Frame failed");
            let _ = conn.send(&OutboundFrame::error(e.code, e.message, Some(tag)));
        }
    }

    async fn dispatch(&self, conn: &ConnectionHandle, frame: InboundFrame) -> FrameResult {
        let user_id = conn.user_id();
        match frame {
            InboundFrame::ConnectionStatus(update) => {
                self.registry.set_presence(user_id, update.state);
                self.persist_presence(user_id, update.state).await;
                self.fanout_presence(user_id, update.state).await;
                Ok(())
            }
            InboundFrame::ConversationJoin(r) => self.join_conversation(conn, r.conversation_id).await,
            InboundFrame::ConversationLeave(r) => {
                if conn.active_conversation() == Some(r.conversation_id) {
                    self.registry.set_active_conversation(user_id, None);
                }
                Ok(())
            }
            InboundFrame::MessageNew(msg) => self.new_message(user_id, msg).await,
            InboundFrame::MessageRead(req) => self.read_messages(user_id, req).await,
            InboundFrame::Typing(t) => {
                self.require_member(t.conversation_id, user_id).await?;
                let frame = OutboundFrame::Typing(TypingEvent {
                    conversation_id: t.conversation_id,
                    user_id,
                    is_typing: t.is_typing,
                });
                self.broadcaster
                    .broadcast(&BroadcastTarget::conversation(t.conversation_id), &frame, &[user_id])
                    .await;
                Ok(())
            }
            InboundFrame::MessagePin(req) => {
                let message = self.load_message(req.message_id, user_id).await?;
                if !self.store.set_pinned(message.id, req.pinned).await? {
                    return Err(FrameError::new(ErrorCode::MessageNotFound, "message was deleted"));
                }
                let frame = OutboundFrame::MessagePinned(PinEvent {
                    message_id: message.id,
                    conversation_id: message.conversation_id,
                    pinned: req.pinned,
                    by: user_id,
                });
                self.broadcaster
                    .broadcast(&BroadcastTarget::conversation(message.conversation_id), &frame, &[])
                    .await;
                Ok(())
            }
            InboundFrame::MessageStar(req) => {
                let message = self.load_message(req.message_id, user_id).await?;
                self.store
                    .set_starred(message.id, user_id, req.starred)
                    .await?;
                let _ = conn.send(&OutboundFrame::MessageStarred(StarEvent {
                    message_id: message.id,
                    starred: req.starred,
                }));
                Ok(())
            }
            InboundFrame::MessageDelete(req) => {
                let message = self.load_message(req.message_id, user_id).await?;
                if message.sender_id != user_id {
                    return Err(FrameError::new(
                        ErrorCode::Unauthorized,
                        "only the author can delete a message",
                    ));
                }
                let deleted_at = Utc::now();
                self.store.soft_delete_message(message.id, deleted_at).await?;
                let frame = OutboundFrame::MessageDeleted(DeleteEvent {
                    message_id: message.id,
                    conversation_id: message.conversation_id,
                    deleted_at,
                });
                self.broadcaster
                    .broadcast(&BroadcastTarget::conversation(message.conversation_id), &frame, &[])
                    .await;
                Ok(())
            }
            InboundFrame::MessageForward(req) => self.forward(conn, req).await,
            InboundFrame::CallInit(init) => self.start_call(conn, init).await,
            InboundFrame::CallOffer(p) => {
                let frame = OutboundFrame::CallOffer(SignalRelay {
                    call_id: p.call_id,
                    from: user_id,
                    sdp: Some(p.sdp),
                    candidate: None,
                });
                self.relay_signal(p.call_id, user_id, &frame)
            }
            InboundFrame::CallAnswer(p) => {
                let frame = OutboundFrame::CallAnswer(SignalRelay {
                    call_id: p.call_id,
                    from: user_id,
                    sdp: Some(p.sdp),
                    candidate: None,
                });
                self.relay_signal(p.call_id, user_id, &frame)
            }
            InboundFrame::CallIce(p) => {
                let frame = OutboundFrame::CallIce(SignalRelay {
                    call_id: p.call_id,
                    from: user_id,
                    sdp: None,
                    candidate: Some(p.candidate),
                });
                self.relay_signal(p.call_id, user_id, &frame)
            }
            InboundFrame::CallAccept(r) => {
                let session = self.calls.accept(r.call_id, user_id).await?;
                let frame = OutboundFrame::CallAccepted(CallUpdate {
                    call_id: session.id,
                    by: user_id,
                    status: CallStatus::Answered,
                    reason: None,
                    duration_seconds: None,
                });
                self.broadcaster.send_to(session.caller_id, &frame);
                Ok(())
            }
            InboundFrame::CallDecline(c) => {
                if let Some(finished) = self.calls.decline(c.call_id, user_id, c.reason).await? {
                    let frame = OutboundFrame::CallDeclined(call_update(&finished, user_id));
                    self.broadcaster.send_to(finished.session.caller_id, &frame);
                }
                Ok(())
            }
            InboundFrame::CallEnd(c) => {
                if let Some(finished) = self.calls.end(c.call_id, user_id, c.reason).await? {
                    if let Some(peer) = finished.session.peer_of(user_id) {
                        let frame = OutboundFrame::CallEnded(call_update(&finished, user_id));
                        self.broadcaster.send_to(peer, &frame);
                    }
                }
                Ok(())
            }
            InboundFrame::Ping => {
                let _ = conn.send(&OutboundFrame::Pong(Pong {
                    server_time: Utc::now(),
                }));
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Conversations and messages
    // -----------------------------------------------------------------------

    async fn require_member(&self, conversation_id: ConversationId, user_id: UserId) -> FrameResult {
        if self.membership.is_member(conversation_id, user_id).await {
            Ok(())
        } else {
            Err(FrameError::not_a_member())
        }
    }

    /// Fetch a live message the user can see.
    async fn load_message(&self, message_id: MessageId, user_id: UserId) -> Result<Message, FrameError> {
        let message = self
            .store
            .get_message(message_id)
            .await?
            .filter(|m| !m.is_deleted())
            .ok_or_else(|| FrameError::new(ErrorCode::MessageNotFound, "message not found"))?;
        self.require_member(message.conversation_id, user_id).await?;
        Ok(message)
    }

    async fn join_conversation(&self, conn: &ConnectionHandle, conversation_id: ConversationId) -> FrameResult {
        let user_id = conn.user_id();
        self.require_member(conversation_id, user_id).await?;
        self.registry
            .set_active_conversation(user_id, Some(conversation_id));

        let read_at = Utc::now();
        let message_ids = self
            .ledger
            .mark_conversation_read(user_id, conversation_id, read_at)
            .await?;
        if !message_ids.is_empty() {
            self.send_read_receipt(user_id, conversation_id, message_ids, read_at)
                .await;
        }
        Ok(())
    }

    async fn read_messages(&self, user_id: UserId, req: ReadRequest) -> FrameResult {
        self.require_member(req.conversation_id, user_id).await?;
        let read_at = Utc::now();
        let updated = self
            .ledger
            .batch_update(
                user_id,
                req.message_ids.clone(),
                StatusPatch::read(read_at),
                Some(req.conversation_id),
            )
            .await?;
        if updated > 0 {
            self.send_read_receipt(user_id, req.conversation_id, req.message_ids, read_at)
                .await;
        }
        Ok(())
    }

    async fn send_read_receipt(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
        read_at: chrono::DateTime<Utc>,
    ) {
        let frame = OutboundFrame::MessageRead(ReadReceipt {
            conversation_id,
            user_id,
            message_ids,
            read_at,
        });
        self.broadcaster
            .broadcast(&BroadcastTarget::conversation(conversation_id), &frame, &[user_id])
            .await;
    }

    async fn new_message(&self, sender_id: UserId, req: NewMessage) -> FrameResult {
        self.require_member(req.conversation_id, sender_id).await?;

        if let Some(reply_to) = req.reply_to {
            let parent = self.store.get_message(reply_to).await?;
            if parent.map(|p| p.conversation_id) != Some(req.conversation_id) {
                return Err(FrameError::new(
                    ErrorCode::MessageNotFound,
                    "replied-to message is not in this conversation",
                ));
            }
        }

        let message = Message {
            body: req.body,
            attachments: req.attachments,
            metadata: req.metadata,
            reply_to: req.reply_to,
            ..Message::new(req.conversation_id, sender_id)
        };
        self.store.insert_message(message.clone()).await?;

        let delivery = self.fan_out_message(&message).await;

        let records = MessageStatusLedger::records_for(
            message.id,
            message.conversation_id,
            &delivery,
            message.created_at,
        );
        if let Err(e) = self.ledger.batch_insert(records).await {
            warn!(message = %message.id, error = %e, "Status rows not written");
        }

        self.notify_offline(&message, &delivery.offline);

        self.broadcaster.send_to(
            sender_id,
            &OutboundFrame::MessageAck(MessageAck {
                message_id: message.id,
                conversation_id: message.conversation_id,
                client_id: req.client_id,
                online: delivery.online,
                offline: delivery.offline,
                read_by: delivery.active_in_conversation,
            }),
        );
        Ok(())
    }

    async fn fan_out_message(&self, message: &Message) -> Delivery {
        let frame = OutboundFrame::MessageNew(MessageEvent {
            message_id: message.id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            body: message.body.clone(),
            attachments: message.attachments.clone(),
            metadata: message.metadata.clone(),
            reply_to: message.reply_to,
            forwarded_from: message.forwarded_from,
            created_at: message.created_at,
        });
        self.broadcaster
            .broadcast(
                &BroadcastTarget::conversation(message.conversation_id),
                &frame,
                &[message.sender_id],
            )
            .await
    }

    fn notify_offline(&self, message: &Message, offline: &[UserId]) {
        if offline.is_empty() {
            return;
        }
        self.notifier.notify(PushNotification::message(
            offline.to_vec(),
            message.sender_id,
            message.conversation_id,
            message.id,
            message.body.as_deref(),
        ));
    }

    /// Copy messages into other conversations. Every copy is stored in one
    /// transaction and all of their status rows in one batch.
    async fn forward(&self, conn: &ConnectionHandle, req: ForwardRequest) -> FrameResult {
        let user_id = conn.user_id();
        let targets = dedup(req.conversation_ids);
        let source_ids = dedup(req.message_ids);

        for target in &targets {
            self.require_member(*target, user_id).await?;
        }
        let mut sources = Vec::with_capacity(source_ids.len());
        for id in source_ids {
            sources.push(self.load_message(id, user_id).await?);
        }

        let copies: Vec<Message> = targets
            .iter()
            .flat_map(|target| {
                sources.iter().map(move |source| Message {
                    body: source.body.clone(),
                    attachments: source.attachments.clone(),
                    metadata: source.metadata.clone(),
                    forwarded_from: Some(source.id),
                    ..Message::new(*target, user_id)
                })
            })
            .collect();
        self.store.insert_messages(copies.clone()).await?;

        let mut records = Vec::new();
        let mut offline_by_target: HashMap<ConversationId, (MessageId, Vec<UserId>)> =
            HashMap::new();
        for copy in &copies {
            let delivery = self.fan_out_message(copy).await;
            records.extend(MessageStatusLedger::records_for(
                copy.id,
                copy.conversation_id,
                &delivery,
                copy.created_at,
            ));

            let entry = offline_by_target
                .entry(copy.conversation_id)
                .or_insert_with(|| (copy.id, Vec::new()));
            entry.0 = copy.id;
            for user in &delivery.offline {
                if !entry.1.contains(user) {
                    entry.1.push(*user);
                }
            }

            let _ = conn.send(&OutboundFrame::MessageAck(MessageAck {
                message_id: copy.id,
                conversation_id: copy.conversation_id,
                client_id: None,
                online: delivery.online,
                offline: delivery.offline,
                read_by: delivery.active_in_conversation,
            }));
        }

        if let Err(e) = self.ledger.batch_insert(records).await {
            warn!(user = %user_id, error = %e, "Status rows for forwarded messages not written");
        }

        for (conversation_id, (message_id, offline)) in offline_by_target {
            if offline.is_empty() {
                continue;
            }
            self.notifier.notify(PushNotification::message(
                offline,
                user_id,
                conversation_id,
                message_id,
                None,
            ));
        }
        info!(user = %user_id, copies = copies.len(), "Messages forwarded");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------------

    async fn start_call(&self, conn: &ConnectionHandle, init: CallInit) -> FrameResult {
        let caller_id = conn.user_id();
        let session = self
            .calls
            .initiate(caller_id, init.callee_id, init.call_type, init.sdp)
            .await?;

        let delivered = self
            .broadcaster
            .send_to(session.callee_id, &incoming_call_frame(&session));
        if delivered {
            self.calls.mark_ringing(session.id).await;
        } else {
            self.notifier.notify(PushNotification {
                recipients: vec![session.callee_id],
                sender_id: caller_id,
                kind: PushKind::IncomingCall {
                    call_id: session.id,
                    call_type: session.call_type,
                },
            });
        }

        let _ = conn.send(&OutboundFrame::CallRinging(CallRinging {
            call_id: session.id,
            callee_id: session.callee_id,
            delivered,
        }));
        Ok(())
    }

    /// Forward SDP/ICE to the other participant of a live call.
    fn relay_signal(&self, call_id: CallId, from: UserId, frame: &OutboundFrame) -> FrameResult {
        let peer = self.calls.peer_for_relay(call_id, from)?;
        if !self.broadcaster.send_to(peer, frame) {
            debug!(call = %call_id, peer = %peer, "Signal dropped, peer offline");
        }
        Ok(())
    }

    /// Tell both parties a call timed out and push the callee.
    pub fn relay_missed(&self, missed: &FinishedCall) {
        let session = &missed.session;
        let frame = OutboundFrame::CallEnded(CallUpdate {
            call_id: session.id,
            by: session.callee_id,
            status: CallStatus::Missed,
            reason: missed.reason.clone(),
            duration_seconds: None,
        });
        self.broadcaster.send_to(session.caller_id, &frame);
        self.broadcaster.send_to(session.callee_id, &frame);
        self.notifier.notify(PushNotification {
            recipients: vec![session.callee_id],
            sender_id: session.caller_id,
            kind: PushKind::MissedCall { call_id: session.id },
        });
    }
}

fn incoming_call_frame(session: &CallSession) -> OutboundFrame {
    OutboundFrame::IncomingCall(IncomingCall {
        call_id: session.id,
        caller_id: session.caller_id,
        call_type: session.call_type,
        sdp: session.offer_sdp.clone(),
        created_at: session.created_at,
    })
}

fn call_update(finished: &FinishedCall, by: UserId) -> CallUpdate {
    CallUpdate {
        call_id: finished.session.id,
        by,
        status: finished.session.status,
        reason: finished.reason.clone(),
        duration_seconds: finished.duration_seconds,
    }
}

fn dedup<T: Eq + std::hash::Hash + Copy>(items: Vec<T>) -> Vec<T> {
    let mut seen = HashSet::with_capacity(items.len());
    items.into_iter().filter(|i| seen.insert(*i)).collect()
}

/// Relay ring timeouts from the call manager to the sockets.
pub fn spawn_call_event_relay(
    hub: Arc<Hub>,
    mut events: mpsc::UnboundedReceiver<CallEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                CallEvent::Missed(missed) => hub.relay_missed(&missed),
            }
        }
    })
}

// ---------------------------------------------------------------------------
// WebSocket plumbing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct WsParams {
    #[serde(default)]
    token: Option<String>,
}

/// `GET /ws`: authenticate, then upgrade. A bad token still upgrades, but
/// the socket is closed at once with [`CLOSE_UNAUTHORIZED`] and nothing is
/// registered.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
) -> Response {
    let auth = state.verifier.authenticate(&headers, params.token.as_deref());
    let hub = Arc::clone(&state.hub);

    ws.max_message_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| async move {
            match auth {
                Ok(user_id) => run_connection(socket, hub, user_id).await,
                Err(e) => {
                    info!(error = %e, "Rejecting unauthenticated socket");
                    reject(socket, &e.to_string()).await;
                }
            }
        })
}

async fn reject(mut socket: WebSocket, reason: &str) {
    let _ = socket
        .send(WsMessage::Close(Some(CloseFrame {
            code: CLOSE_UNAUTHORIZED,
            reason: Cow::Owned(reason.to_string()),
        })))
        .await;
}

async fn run_connection(socket: WebSocket, hub: Arc<Hub>, user_id: UserId) {
    let (sink, mut stream) = socket.split();
    let conn = hub.open(user_id).await;
    let mut writer = tokio::spawn(write_loop(sink, Arc::clone(&conn)));

    let reader = async {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(WsMessage::Text(text)) => hub.handle_text(&conn, &text).await,
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => conn.touch(),
                Err(e) => {
                    debug!(user = %user_id, error = %e, "Socket read failed");
                    break;
                }
            }
        }
    };

    // Stop reading as soon as the writer is done (superseded, swept, or the
    // peer vanished).
    let writer_done = tokio::select! {
        _ = reader => false,
        _ = &mut writer => true,
    };

    conn.close(1000, "closing");
    hub.close(&conn).await;
    if !writer_done && tokio::time::timeout(Duration::from_secs(2), writer).await.is_err() {
        debug!(user = %user_id, "Writer did not finish in time");
    }
}

async fn write_loop(mut sink: SplitSink<WebSocket, WsMessage>, conn: Arc<ConnectionHandle>) {
    loop {
        match conn.queue().next().await {
            Outgoing::Frame(text) => {
                if sink.send(WsMessage::Text(text.to_string())).await.is_err() {
                    break;
                }
            }
            Outgoing::Close(reason) => {
                let _ = sink
                    .send(WsMessage::Close(Some(CloseFrame {
                        code: reason.code,
                        reason: Cow::Owned(reason.reason),
                    })))
                    .await;
                break;
            }
        }
    }
    // Anything queued after this point has nowhere to go.
    conn.close(1011, "writer stopped");
}
