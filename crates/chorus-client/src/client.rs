use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chorus_models::gateway::{ClientMessage, ServerEvent};
use chorus_models::{ConversationId, UserId};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::buffer::{BufferedNotification, NotificationBuffer, DEFAULT_BUFFER_CAPACITY};
use crate::error::ClientError;
use crate::policy::{ReconnectDecision, ReconnectPolicy, ReconnectState};
use crate::transport::{Connector, FrameSink, FrameStream};

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub user_id: UserId,
    /// Session token sent with every `auth`. Without one the server must
    /// trust bare identity claims.
    pub token: Option<String>,
    pub policy: ReconnectPolicy,
    pub buffer_capacity: usize,
}

impl ClientConfig {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            token: None,
            policy: ReconnectPolicy::default(),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    /// The relay accepted our `auth`. An open transport alone is not enough.
    Connected,
    Reconnecting { attempt: u32 },
    /// Retry budget exhausted or shut down. Only a manual reconnect leaves it.
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
enum Command {
    JoinConversation(ConversationId),
    LeaveConversation(ConversationId),
    TypingStart {
        conversation_id: ConversationId,
        username: Option<String>,
    },
    TypingStop(ConversationId),
    SendMessage {
        recipient_id: UserId,
        sender_name: Option<String>,
        content: String,
    },
    SubscribeFeed,
    UnsubscribeFeed,
    MarkRead(String),
    MarkAllRead,
    Reconnect,
    Shutdown,
}

type SharedBuffer = Arc<Mutex<NotificationBuffer>>;

fn lock(buffer: &SharedBuffer) -> MutexGuard<'_, NotificationBuffer> {
    buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cheap, cloneable front end to a running [`RelayClient`].
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    events: broadcast::Sender<ServerEvent>,
    notifications: SharedBuffer,
}

impl ClientHandle {
    async fn command(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::Closed)
    }

    pub async fn join_conversation(&self, conversation_id: ConversationId) -> Result<(), ClientError> {
        self.command(Command::JoinConversation(conversation_id)).await
    }

    pub async fn leave_conversation(&self, conversation_id: ConversationId) -> Result<(), ClientError> {
        self.command(Command::LeaveConversation(conversation_id)).await
    }

    pub async fn start_typing(
        &self,
        conversation_id: ConversationId,
        username: Option<String>,
    ) -> Result<(), ClientError> {
        self.command(Command::TypingStart {
            conversation_id,
            username,
        })
        .await
    }

    pub async fn stop_typing(&self, conversation_id: ConversationId) -> Result<(), ClientError> {
        self.command(Command::TypingStop(conversation_id)).await
    }

    pub async fn send_message(
        &self,
        recipient_id: UserId,
        sender_name: Option<String>,
        content: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.command(Command::SendMessage {
            recipient_id,
            sender_name,
            content: content.into(),
        })
        .await
    }

    pub async fn subscribe_feed(&self) -> Result<(), ClientError> {
        self.command(Command::SubscribeFeed).await
    }

    pub async fn unsubscribe_feed(&self) -> Result<(), ClientError> {
        self.command(Command::UnsubscribeFeed).await
    }

    /// Mark one notification read locally and on the user's other devices.
    pub async fn mark_read(&self, notification_id: &str) -> Result<bool, ClientError> {
        let changed = lock(&self.notifications).mark_read(notification_id);
        self.command(Command::MarkRead(notification_id.to_string()))
            .await?;
        Ok(changed)
    }

    pub async fn mark_all_read(&self) -> Result<usize, ClientError> {
        let changed = lock(&self.notifications).mark_all_read();
        self.command(Command::MarkAllRead).await?;
        Ok(changed)
    }

    /// Start over with a fresh retry budget after giving up.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        self.command(Command::Reconnect).await
    }

    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.command(Command::Shutdown).await
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Every server event, in arrival order.
    pub fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub fn notifications(&self) -> Vec<BufferedNotification> {
        lock(&self.notifications).to_vec()
    }

    pub fn unread_count(&self) -> usize {
        lock(&self.notifications).unread_count()
    }
}

enum SessionEnd {
    Lost(String),
    Shutdown,
}

/// One logical client: owns its transport, its reconnect state and the
/// rooms it wants to be in, so they can be replayed after a reconnect.
pub struct RelayClient<C> {
    connector: C,
    config: ClientConfig,
    reconnect: ReconnectState,
    conversations: BTreeSet<ConversationId>,
    feed: bool,
    commands: mpsc::Receiver<Command>,
    status: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<ServerEvent>,
    notifications: SharedBuffer,
}

impl<C: Connector> RelayClient<C> {
    pub fn new(connector: C, config: ClientConfig) -> (Self, ClientHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let notifications = Arc::new(Mutex::new(NotificationBuffer::new(config.buffer_capacity)));
        let handle = ClientHandle {
            commands: command_tx,
            status: status_rx,
            events: events.clone(),
            notifications: notifications.clone(),
        };
        let client = Self {
            connector,
            reconnect: ReconnectState::new(config.policy),
            config,
            conversations: BTreeSet::new(),
            feed: false,
            commands: command_rx,
            status: status_tx,
            events,
            notifications,
        };
        (client, handle)
    }

    pub fn spawn(connector: C, config: ClientConfig) -> (ClientHandle, JoinHandle<()>) {
        let (client, handle) = Self::new(connector, config);
        (handle, tokio::spawn(client.run()))
    }

    pub async fn run(mut self) {
        loop {
            match self.connector.connect().await {
                Ok((sink, stream)) => {
                    // Not connected until auth:success; the budget resets there.
                    tracing::debug!(user_id = self.config.user_id, "relay transport open");
                    match self.session(sink, stream).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost(reason) => {
                            tracing::warn!(user_id = self.config.user_id, %reason, "relay connection lost");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        user_id = self.config.user_id,
                        attempt = self.reconnect.attempts(),
                        "relay connect failed: {e}"
                    );
                }
            }

            match self.reconnect.on_disconnected() {
                ReconnectDecision::RetryAfter(delay) => {
                    self.set_status(ConnectionStatus::Reconnecting {
                        attempt: self.reconnect.attempts(),
                    });
                    if !self.wait_offline(Some(delay)).await {
                        break;
                    }
                }
                ReconnectDecision::GiveUp => {
                    tracing::warn!(user_id = self.config.user_id, "relay retry budget exhausted");
                    self.set_status(ConnectionStatus::Disconnected);
                    if !self.wait_offline(None).await {
                        break;
                    }
                    self.reconnect.reset();
                    self.set_status(ConnectionStatus::Connecting);
                }
            }
        }
        self.set_status(ConnectionStatus::Disconnected);
    }

    /// Sleep through a retry delay (or until a manual reconnect when `delay`
    /// is `None`) while still recording room intent. Returns false on shutdown.
    async fn wait_offline(&mut self, delay: Option<Duration>) -> bool {
        let sleep = tokio::time::sleep(delay.unwrap_or(Duration::MAX));
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep, if delay.is_some() => return true,
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => return false,
                    Some(Command::Reconnect) => return true,
                    Some(command) => {
                        self.record_intent(&command);
                        tracing::debug!(?command, "offline, command not sent");
                    }
                },
            }
        }
    }

    async fn session(&mut self, mut sink: FrameSink, mut stream: FrameStream) -> SessionEnd {
        // Identity does not survive a transport reconnect; re-auth first,
        // then restore rooms.
        for message in self.handshake() {
            if let Err(e) = send(&mut sink, &message).await {
                return SessionEnd::Lost(e.to_string());
            }
        }

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(text)) => self.handle_frame(&text),
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    None => return SessionEnd::Lost("transport closed".to_string()),
                },
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => {
                        let _ = sink.close().await;
                        return SessionEnd::Shutdown;
                    }
                    Some(Command::Reconnect) => {}
                    Some(command) => {
                        self.record_intent(&command);
                        if let Some(message) = self.outbound(command) {
                            if let Err(e) = send(&mut sink, &message).await {
                                return SessionEnd::Lost(e.to_string());
                            }
                        }
                    }
                },
            }
        }
    }

    fn handshake(&self) -> Vec<ClientMessage> {
        let mut messages = vec![ClientMessage::Auth {
            user_id: self.config.user_id,
            token: self.config.token.clone(),
        }];
        messages.extend(
            self.conversations
                .iter()
                .map(|&conversation_id| ClientMessage::ConversationJoin { conversation_id }),
        );
        if self.feed {
            messages.push(ClientMessage::FeedSubscribe);
        }
        messages
    }

    fn record_intent(&mut self, command: &Command) {
        match command {
            Command::JoinConversation(id) => {
                self.conversations.insert(*id);
            }
            Command::LeaveConversation(id) => {
                self.conversations.remove(id);
            }
            Command::SubscribeFeed => self.feed = true,
            Command::UnsubscribeFeed => self.feed = false,
            _ => {}
        }
    }

    fn outbound(&self, command: Command) -> Option<ClientMessage> {
        let message = match command {
            Command::JoinConversation(conversation_id) => {
                ClientMessage::ConversationJoin { conversation_id }
            }
            Command::LeaveConversation(conversation_id) => {
                ClientMessage::ConversationLeave { conversation_id }
            }
            Command::TypingStart {
                conversation_id,
                username,
            } => ClientMessage::TypingStart {
                conversation_id,
                user_id: Some(self.config.user_id),
                username,
            },
            Command::TypingStop(conversation_id) => ClientMessage::TypingStop {
                conversation_id,
                user_id: Some(self.config.user_id),
            },
            Command::SendMessage {
                recipient_id,
                sender_name,
                content,
            } => ClientMessage::MessageSend {
                recipient_id,
                sender_id: Some(self.config.user_id),
                sender_name,
                content,
                timestamp: Some(Utc::now()),
            },
            Command::SubscribeFeed => ClientMessage::FeedSubscribe,
            Command::UnsubscribeFeed => ClientMessage::FeedUnsubscribe,
            Command::MarkRead(notification_id) => ClientMessage::NotificationRead { notification_id },
            Command::MarkAllRead => ClientMessage::NotificationReadAll,
            Command::Reconnect | Command::Shutdown => return None,
        };
        Some(message)
    }

    fn handle_frame(&mut self, text: &str) {
        let event = match serde_json::from_str::<ServerEvent>(text) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!("ignoring unrecognised frame: {e}");
                return;
            }
        };
        match &event {
            ServerEvent::NotificationRead(payload) => {
                lock(&self.notifications).mark_read(&payload.notification_id);
            }
            ServerEvent::NotificationReadAll(_) => {
                lock(&self.notifications).mark_all_read();
            }
            ServerEvent::AuthSuccess(_) => {
                self.reconnect.on_connected();
                self.set_status(ConnectionStatus::Connected);
                tracing::info!(user_id = self.config.user_id, "relay connected");
            }
            ServerEvent::AuthError(payload) => {
                tracing::warn!(user_id = self.config.user_id, reason = %payload.reason, "relay auth rejected");
            }
            other => {
                if let Some(notification) = other.notification() {
                    lock(&self.notifications).push(notification.clone());
                }
            }
        }
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }
}

async fn send(sink: &mut FrameSink, message: &ClientMessage) -> Result<(), ClientError> {
    let text = serde_json::to_string(message)?;
    sink.send(text).await
}
