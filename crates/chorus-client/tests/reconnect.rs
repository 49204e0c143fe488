use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chorus_client::{
    ClientConfig, ClientError, ConnectionStatus, Connector, FrameSink, FrameStream,
    ReconnectPolicy, RelayClient, WsConnector,
};
use chorus_models::gateway::{AuthErrorPayload, AuthSuccess, ServerEvent};
use chorus_models::notification::{Notification, NotificationKind};
use chorus_models::ConnectionId;
use futures_util::future::BoxFuture;
use futures_util::{sink, stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

/// The relay's side of one scripted session.
struct ServerEnd {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<Result<String, ClientError>>,
}

impl ServerEnd {
    async fn next_frame(&mut self) -> Value {
        let text = tokio::time::timeout(Duration::from_secs(5), self.from_client.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("client sink dropped");
        serde_json::from_str(&text).unwrap()
    }

    async fn events(&mut self, n: usize) -> Vec<String> {
        let mut names = Vec::new();
        for _ in 0..n {
            names.push(self.next_frame().await["event"].as_str().unwrap().to_string());
        }
        names
    }

    /// Read the client's `auth` frame and accept it.
    async fn accept_auth(&mut self) {
        let auth = self.next_frame().await;
        assert_eq!(auth["event"], "auth");
        self.push(&ServerEvent::AuthSuccess(AuthSuccess {
            user_id: auth["userId"].as_i64().unwrap(),
            connection_id: ConnectionId::new(),
        }));
    }

    fn push(&self, event: &ServerEvent) {
        self.to_client
            .send(Ok(serde_json::to_string(event).unwrap()))
            .unwrap();
    }
}

/// Accepts or refuses each connect according to a script; refuses once the
/// script runs out.
#[derive(Clone)]
struct ScriptedConnector {
    calls: Arc<AtomicUsize>,
    script: Arc<Mutex<VecDeque<bool>>>,
    sessions: mpsc::UnboundedSender<ServerEnd>,
}

impl ScriptedConnector {
    fn new(script: &[bool]) -> (Self, mpsc::UnboundedReceiver<ServerEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            calls: Arc::new(AtomicUsize::new(0)),
            script: Arc::new(Mutex::new(script.iter().copied().collect())),
            sessions: tx,
        };
        (connector, rx)
    }

    fn allow_next(&self) {
        self.script.lock().unwrap().push_back(true);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Connector for ScriptedConnector {
    fn connect(&self) -> BoxFuture<'_, Result<(FrameSink, FrameStream), ClientError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let accept = self.script.lock().unwrap().pop_front().unwrap_or(false);
            if !accept {
                return Err(ClientError::Connect("connection refused".into()));
            }

            let (client_tx, from_client) = mpsc::unbounded_channel::<String>();
            let (to_client, client_rx) = mpsc::unbounded_channel();
            let sink = sink::unfold(client_tx, |tx, frame: String| async move {
                tx.send(frame).map_err(|_| ClientError::Closed)?;
                Ok::<_, ClientError>(tx)
            });
            let stream = stream::unfold(client_rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });
            self.sessions
                .send(ServerEnd {
                    from_client,
                    to_client,
                })
                .map_err(|_| ClientError::Connect("test harness gone".into()))?;

            let sink: FrameSink = Box::pin(sink);
            Ok((sink, stream.boxed()))
        })
    }
}

async fn wait_status(
    status: &mut tokio::sync::watch::Receiver<ConnectionStatus>,
    want: ConnectionStatus,
) {
    tokio::time::timeout(Duration::from_secs(60), status.wait_for(|s| *s == want))
        .await
        .expect("timed out waiting for status")
        .expect("client dropped");
}

async fn next_event(events: &mut tokio::sync::broadcast::Receiver<ServerEvent>) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

// Scenario: connection lost, five failed retries, then give up.
#[tokio::test(start_paused = true)]
async fn gives_up_after_retry_budget() {
    let (connector, mut sessions) = ScriptedConnector::new(&[true]);
    let (handle, _task) = RelayClient::spawn(connector.clone(), ClientConfig::new(1));
    let mut status = handle.status_watch();

    let mut server = sessions.recv().await.unwrap();
    server.accept_auth().await;
    wait_status(&mut status, ConnectionStatus::Connected).await;

    let lost_at = tokio::time::Instant::now();
    drop(server);
    wait_status(&mut status, ConnectionStatus::Disconnected).await;

    assert_eq!(connector.calls(), 6);
    assert!(lost_at.elapsed() >= Duration::from_secs(15));

    // Stays down until asked.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.calls(), 6);

    connector.allow_next();
    handle.reconnect().await.unwrap();
    let mut server = sessions.recv().await.unwrap();
    server.accept_auth().await;
    wait_status(&mut status, ConnectionStatus::Connected).await;
    assert_eq!(connector.calls(), 7);
}

#[tokio::test(start_paused = true)]
async fn reports_reconnect_attempts() {
    let (connector, mut sessions) = ScriptedConnector::new(&[true, false, true]);
    let (handle, _task) = RelayClient::spawn(connector.clone(), ClientConfig::new(1));
    let mut status = handle.status_watch();

    drop(sessions.recv().await.unwrap());
    wait_status(&mut status, ConnectionStatus::Reconnecting { attempt: 1 }).await;
    wait_status(&mut status, ConnectionStatus::Reconnecting { attempt: 2 }).await;
    let mut server = sessions.recv().await.unwrap();
    server.accept_auth().await;
    wait_status(&mut status, ConnectionStatus::Connected).await;
    assert_eq!(connector.calls(), 3);
}

// A relay that upgrades and then closes at once (over capacity, per-user cap)
// never authenticates us, so it must not refill the retry budget.
#[tokio::test(start_paused = true)]
async fn accept_then_close_still_exhausts_retry_budget() {
    let (connector, mut sessions) = ScriptedConnector::new(&[true; 40]);
    let (handle, _task) = RelayClient::spawn(connector.clone(), ClientConfig::new(1));
    let mut status = handle.status_watch();
    tokio::spawn(async move { while sessions.recv().await.is_some() {} });

    wait_status(&mut status, ConnectionStatus::Disconnected).await;
    assert_eq!(connector.calls(), 6);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.calls(), 6);
    assert_eq!(handle.status(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn rejected_auth_is_not_connected() {
    let (connector, mut sessions) = ScriptedConnector::new(&[true]);
    let (client, handle) = RelayClient::new(connector, ClientConfig::new(5).with_token("stale"));
    let mut events = handle.events();
    tokio::spawn(client.run());

    let mut server = sessions.recv().await.unwrap();
    assert_eq!(server.next_frame().await["event"], "auth");
    server.push(&ServerEvent::AuthError(AuthErrorPayload {
        reason: "Invalid token".into(),
    }));
    assert_eq!(next_event(&mut events).await.event_name(), "auth:error");
    assert_eq!(handle.status(), ConnectionStatus::Connecting);

    server.push(&ServerEvent::AuthSuccess(AuthSuccess {
        user_id: 5,
        connection_id: ConnectionId::new(),
    }));
    let mut status = handle.status_watch();
    wait_status(&mut status, ConnectionStatus::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn reauthenticates_and_restores_rooms() {
    let (connector, mut sessions) = ScriptedConnector::new(&[true, true]);
    let config = ClientConfig {
        policy: ReconnectPolicy {
            delay: Duration::from_millis(10),
            max_attempts: 5,
        },
        ..ClientConfig::new(7).with_token("session-token")
    };
    let (handle, _task) = RelayClient::spawn(connector, config);

    let mut first = sessions.recv().await.unwrap();
    let auth = first.next_frame().await;
    assert_eq!(auth["userId"], 7);
    assert_eq!(auth["token"], "session-token");

    handle.join_conversation(9).await.unwrap();
    handle.subscribe_feed().await.unwrap();
    handle.join_conversation(10).await.unwrap();
    handle.leave_conversation(10).await.unwrap();
    assert_eq!(
        first.events(4).await,
        [
            "conversation:join",
            "feed:subscribe",
            "conversation:join",
            "conversation:leave"
        ]
    );
    drop(first);

    let mut second = sessions.recv().await.unwrap();
    let auth = second.next_frame().await;
    assert_eq!(auth["event"], "auth");
    assert_eq!(auth["token"], "session-token");
    let join = second.next_frame().await;
    assert_eq!(join["event"], "conversation:join");
    assert_eq!(join["conversationId"], 9);
    assert_eq!(second.next_frame().await["event"], "feed:subscribe");
}

#[tokio::test]
async fn buffers_notifications_and_syncs_read_state() {
    let (connector, mut sessions) = ScriptedConnector::new(&[true]);
    let (client, handle) = RelayClient::new(connector, ClientConfig::new(42));
    let mut events = handle.events();
    tokio::spawn(client.run());

    let mut server = sessions.recv().await.unwrap();
    server.next_frame().await;

    let like = Notification::new(NotificationKind::Like, "New Like", "Ann liked your post");
    let like_id = like.id.clone();
    server.push(&ServerEvent::NotificationLike(like));
    assert_eq!(next_event(&mut events).await.event_name(), "notification:like");
    assert_eq!(handle.unread_count(), 1);

    assert!(handle.mark_read(&like_id).await.unwrap());
    let read = server.next_frame().await;
    assert_eq!(read["event"], "notification:read");
    assert_eq!(read["notificationId"], like_id.as_str());
    assert_eq!(handle.unread_count(), 0);

    server.push(&ServerEvent::NotificationFollow(Notification::new(
        NotificationKind::Follow,
        "New Follower",
        "Bob started following you",
    )));
    next_event(&mut events).await;
    assert_eq!(handle.unread_count(), 1);

    // Another device of the same user read everything.
    server
        .to_client
        .send(Ok(r#"{"event":"notification:read_all","timestamp":"2026-01-01T00:00:00Z"}"#.into()))
        .unwrap();
    next_event(&mut events).await;
    assert_eq!(handle.unread_count(), 0);
    assert_eq!(handle.notifications().len(), 2);
    assert_eq!(
        handle.notifications()[0].notification.message,
        "Bob started following you"
    );
}

#[tokio::test]
async fn shutdown_stops_the_task() {
    let (connector, mut sessions) = ScriptedConnector::new(&[true]);
    let (handle, task) = RelayClient::spawn(connector, ClientConfig::new(3));
    let _server = sessions.recv().await.unwrap();
    handle.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("client did not stop")
        .unwrap();
    assert_eq!(handle.status(), ConnectionStatus::Disconnected);
    assert!(matches!(
        handle.join_conversation(1).await,
        Err(ClientError::Closed)
    ));
}

#[tokio::test]
async fn talks_to_a_live_gateway() {
    use chorus_core::auth::{create_token, JwtSessionVerifier};
    use chorus_core::{AppConfig, AppState};
    use chorus_models::notification::Actor;

    const SECRET: &str = "client-e2e-secret";
    let state = AppState::new(
        AppConfig {
            jwt_secret: SECRET.to_string(),
            ..AppConfig::default()
        },
        Arc::new(JwtSessionVerifier::new(SECRET)),
    );
    let app = chorus_ws::gateway_router().with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let token = create_token(42, SECRET, 3600).unwrap();
    let (client, handle) = RelayClient::new(
        WsConnector::new(format!("ws://{addr}/gateway")),
        ClientConfig::new(42).with_token(token),
    );
    let mut events = handle.events();
    tokio::spawn(client.run());

    loop {
        if let ServerEvent::AuthSuccess(ok) = next_event(&mut events).await {
            assert_eq!(ok.user_id, 42);
            break;
        }
    }
    assert!(state.hub.registry().is_online(42));

    state
        .notifier
        .send_follow_notification(42, &Actor::new(7, "Ann"));
    loop {
        if let ServerEvent::NotificationFollow(n) = next_event(&mut events).await {
            assert_eq!(n.actor_id, Some(7));
            break;
        }
    }
    assert_eq!(handle.unread_count(), 1);

    handle.shutdown().await.unwrap();
}
