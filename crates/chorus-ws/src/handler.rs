use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chorus_core::auth::authenticate_claim;
use chorus_core::hub::RelayHub;
use chorus_core::rate_limit::RateClass;
use chorus_core::{AppState, CoreError};
use chorus_models::gateway::*;
use chorus_models::room::RoomName;
use chorus_models::{ConnectionId, UserId};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::time::Instant;

use crate::session::Connection;

const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_POLICY: u16 = 1008;
const CLOSE_INTERNAL: u16 = 1011;
const CLOSE_TRY_AGAIN: u16 = 1013;

/// What the read loop does after one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Close(u16, &'static str),
}

/// Releases everything a connection holds, however its task ends.
struct ConnectionGuard {
    hub: Arc<RelayHub>,
    active: Arc<AtomicUsize>,
    connection_id: Option<ConnectionId>,
    user_id: Option<UserId>,
    global_acquired: bool,
}

impl ConnectionGuard {
    fn new(state: &AppState) -> Self {
        Self {
            hub: state.hub.clone(),
            active: state.active_connections.clone(),
            connection_id: None,
            user_id: None,
            global_acquired: false,
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(connection_id) = self.connection_id.take() {
            self.hub.disconnect(connection_id, self.user_id.take());
        }
        if self.global_acquired {
            self.active.fetch_sub(1, AtomicOrdering::SeqCst);
        }
    }
}

fn try_acquire_global_connection_slot(active: &AtomicUsize, max: usize) -> bool {
    let mut current = active.load(AtomicOrdering::SeqCst);
    loop {
        if current >= max {
            return false;
        }
        match active.compare_exchange(
            current,
            current + 1,
            AtomicOrdering::SeqCst,
            AtomicOrdering::SeqCst,
        ) {
            Ok(_) => return true,
            Err(observed) => current = observed,
        }
    }
}

async fn send_close(
    sender: &mut (impl SinkExt<Message> + Unpin),
    code: u16,
    reason: &str,
) -> Result<(), ()> {
    sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await
        .map_err(|_| ())
}

pub async fn handle_connection(socket: WebSocket, state: AppState, handshake_token: Option<String>) {
    let mut guard = ConnectionGuard::new(&state);
    if !try_acquire_global_connection_slot(&state.active_connections, state.config.max_connections)
    {
        let (mut sender, _) = socket.split();
        let _ = send_close(&mut sender, CLOSE_TRY_AGAIN, "Gateway is at connection capacity").await;
        return;
    }
    guard.global_acquired = true;

    let (mut sender, mut receiver) = socket.split();
    let mut connection = Connection::new();
    let (outbound_tx, mut outbound_rx) =
        chorus_core::rooms::outbound_channel(state.config.outbound_queue_capacity);
    state.hub.attach(connection.id, outbound_tx);
    guard.connection_id = Some(connection.id);
    connection.opened();

    if let Some(token) = handshake_token {
        match state.verifier.verify(&token).await {
            Ok(identity) => {
                let flow = bind_identity(&state, &mut connection, identity.user_id);
                guard.user_id = connection.user_id();
                if let Flow::Close(code, reason) = flow {
                    let _ = send_close(&mut sender, code, reason).await;
                    return;
                }
            }
            Err(e) => {
                // Not fatal: the client may still send `auth`.
                tracing::debug!(connection_id = %connection.id, "handshake token rejected: {e}");
            }
        }
    }

    let idle_timeout = state.config.idle_timeout;
    let heartbeat = state.config.heartbeat_interval;
    let mut ping_interval = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let idle_sleep = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle_sleep);

    let disconnect_reason = loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        connection.touch();
                        idle_sleep.as_mut().reset(Instant::now() + idle_timeout);
                        let flow = handle_text(&state, &mut connection, text.as_str()).await;
                        guard.user_id = connection.user_id();
                        if let Flow::Close(code, reason) = flow {
                            let _ = send_close(&mut sender, code, reason).await;
                            break reason.to_string();
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        connection.touch();
                        idle_sleep.as_mut().reset(Instant::now() + idle_timeout);
                        tracing::debug!(connection_id = %connection.id, "binary frame dropped");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => format!(
                                "client close frame (code={}, reason={})",
                                frame.code, frame.reason.as_str()
                            ),
                            None => "client close frame (no code/reason)".to_string(),
                        };
                    }
                    Some(Ok(_)) => {
                        // Ping/pong keep the socket alive.
                        connection.touch();
                        idle_sleep.as_mut().reset(Instant::now() + idle_timeout);
                    }
                    Some(Err(err)) => break format!("websocket receive error: {err}"),
                    None => break "websocket stream ended".to_string(),
                }
            }
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else {
                    break "outbound queue closed".to_string();
                };
                if sender.send(Message::Text(frame.to_string().into())).await.is_err() {
                    break "websocket send error".to_string();
                }
            }
            () = &mut idle_sleep => {
                tracing::warn!(
                    connection_id = %connection.id,
                    user_id = ?connection.user_id(),
                    idle_ms = connection.idle_for().as_millis() as u64,
                    "closing idle connection"
                );
                break format!("idle timeout after {}ms", idle_timeout.as_millis());
            }
            _ = ping_interval.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break "websocket ping send error".to_string();
                }
            }
            _ = state.shutdown.cancelled() => {
                let _ = send_close(&mut sender, CLOSE_GOING_AWAY, "Server shutting down").await;
                break "server shutdown".to_string();
            }
        }
    };

    connection.begin_close();
    tracing::info!(
        connection_id = %connection.id,
        user_id = ?connection.user_id(),
        connected_ms = connection.created_at.elapsed().as_millis() as u64,
        reason = %disconnect_reason,
        "gateway connection closed"
    );
    drop(guard);
    connection.close();
}

/// Parse and process one text frame.
pub(crate) async fn handle_text(state: &AppState, connection: &mut Connection, text: &str) -> Flow {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(connection_id = %connection.id, "malformed frame dropped: {e}");
            return Flow::Continue;
        }
    };

    if !connection.accepts(&message) {
        tracing::debug!(
            connection_id = %connection.id,
            event = message.event_name(),
            "dropping event before authentication"
        );
        return Flow::Continue;
    }

    match message {
        ClientMessage::Auth { user_id, token } => {
            handle_auth(state, connection, user_id, token.as_deref()).await
        }
        message => {
            let Some(user_id) = connection.user_id() else {
                return Flow::Continue;
            };
            let class = match message {
                ClientMessage::TypingStart { .. } | ClientMessage::TypingStop { .. } => {
                    RateClass::Typing
                }
                _ => RateClass::Other,
            };
            if let Err(retry_after_ms) = state.rate_limits.check(user_id, class) {
                if class == RateClass::Typing {
                    tracing::debug!(user_id, "typing rate limited (silent drop)");
                } else {
                    tracing::debug!(user_id, event = message.event_name(), "rate limited");
                    state.hub.rooms().send_to(
                        connection.id,
                        &ServerEvent::RateLimited(RateLimited { retry_after_ms }),
                    );
                }
                return Flow::Continue;
            }
            dispatch(state, connection.id, user_id, message);
            Flow::Continue
        }
    }
}

async fn handle_auth(
    state: &AppState,
    connection: &mut Connection,
    claimed: UserId,
    token: Option<&str>,
) -> Flow {
    if connection.user_id().is_some() {
        tracing::debug!(connection_id = %connection.id, claimed, "ignoring repeated auth");
        return Flow::Continue;
    }
    match authenticate_claim(
        state.verifier.as_ref(),
        claimed,
        token,
        state.config.trust_client_auth,
    )
    .await
    {
        Ok(identity) => bind_identity(state, connection, identity.user_id),
        Err(e) => {
            tracing::debug!(connection_id = %connection.id, claimed, "auth rejected: {e}");
            state.hub.rooms().send_to(
                connection.id,
                &ServerEvent::AuthError(AuthErrorPayload {
                    reason: e.to_string(),
                }),
            );
            Flow::Continue
        }
    }
}

/// Register a verified identity and move the connection to Active.
fn bind_identity(state: &AppState, connection: &mut Connection, user_id: UserId) -> Flow {
    if !connection.authenticate(user_id) {
        return Flow::Continue;
    }
    match state.hub.connect_user(connection.id, user_id) {
        Ok(transition) => {
            connection.activate();
            state.hub.rooms().send_to(
                connection.id,
                &ServerEvent::AuthSuccess(AuthSuccess {
                    user_id,
                    connection_id: connection.id,
                }),
            );
            tracing::info!(
                connection_id = %connection.id,
                user_id,
                ?transition,
                "gateway connection authenticated"
            );
            Flow::Continue
        }
        Err(CoreError::ConnectionLimit { limit, .. }) => {
            tracing::warn!(user_id, limit, "per-user connection limit reached");
            connection.reject();
            Flow::Close(CLOSE_POLICY, "Too many concurrent sessions for this user")
        }
        Err(e) => {
            tracing::error!(connection_id = %connection.id, user_id, "failed to register connection: {e}");
            connection.reject();
            Flow::Close(CLOSE_INTERNAL, "Failed to register connection")
        }
    }
}

/// Apply one authenticated client message. Never fails; misses are silent.
pub(crate) fn dispatch(
    state: &AppState,
    connection_id: ConnectionId,
    user_id: UserId,
    message: ClientMessage,
) {
    let hub = &state.hub;
    match message {
        ClientMessage::Auth { .. } => {}
        ClientMessage::TypingStart {
            conversation_id,
            username,
            ..
        } => {
            hub.start_typing(conversation_id, user_id, username);
        }
        ClientMessage::TypingStop {
            conversation_id, ..
        } => {
            hub.stop_typing(conversation_id, user_id);
        }
        ClientMessage::ConversationJoin { conversation_id } => {
            if let Err(e) = hub.join_conversation(connection_id, user_id, conversation_id) {
                tracing::debug!(%connection_id, conversation_id, "join failed: {e}");
            }
        }
        ClientMessage::ConversationLeave { conversation_id } => {
            hub.leave_conversation(connection_id, conversation_id);
        }
        ClientMessage::FeedSubscribe => {
            if let Err(e) = hub.subscribe_feed(connection_id) {
                tracing::debug!(%connection_id, "feed subscribe failed: {e}");
            }
        }
        ClientMessage::FeedUnsubscribe => hub.unsubscribe_feed(connection_id),
        ClientMessage::MessageSend {
            recipient_id,
            sender_id,
            sender_name,
            content,
            timestamp,
        } => {
            if sender_id.is_some_and(|claimed| claimed != user_id) {
                tracing::debug!(user_id, ?sender_id, "ignoring mismatched senderId");
            }
            relay_direct_message(
                state,
                connection_id,
                user_id,
                recipient_id,
                sender_name.unwrap_or_default(),
                content,
                timestamp.unwrap_or_else(Utc::now),
            );
        }
        ClientMessage::NotificationRead { notification_id } => {
            hub.rooms().broadcast_except(
                RoomName::User(user_id),
                &ServerEvent::NotificationRead(NotificationReadPayload { notification_id }),
                connection_id,
            );
        }
        ClientMessage::NotificationReadAll => {
            hub.rooms().broadcast_except(
                RoomName::User(user_id),
                &ServerEvent::NotificationReadAll(ReadAllPayload {
                    timestamp: Utc::now(),
                }),
                connection_id,
            );
        }
    }
}

/// Instant-message fast path. The durable write happens elsewhere; this is
/// only the live hint to the recipient plus an ack to the sender.
fn relay_direct_message(
    state: &AppState,
    connection_id: ConnectionId,
    sender_id: UserId,
    recipient_id: UserId,
    sender_name: String,
    content: String,
    timestamp: chrono::DateTime<Utc>,
) {
    let message_id = uuid::Uuid::new_v4().to_string();
    let delivered = state.hub.rooms().broadcast(
        RoomName::User(recipient_id),
        &ServerEvent::MessageNew(MessageNew {
            id: message_id.clone(),
            sender_id,
            sender_name,
            content,
            timestamp,
        }),
    );
    tracing::trace!(sender_id, recipient_id, delivered, "direct message relayed");
    state.hub.rooms().send_to(
        connection_id,
        &ServerEvent::MessageDelivered(MessageDelivered {
            message_id,
            recipient_id,
            timestamp: Utc::now(),
        }),
    );
}
