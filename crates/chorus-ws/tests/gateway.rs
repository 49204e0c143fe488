//! End-to-end gateway tests over a real listener.

use std::sync::Arc;
use std::time::Duration;

use chorus_core::auth::{create_token, JwtSessionVerifier};
use chorus_core::{AppConfig, AppState};
use chorus_models::events::FeedPost;
use chorus_models::notification::Actor;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

const SECRET: &str = "gateway-integration-secret";

type Ws = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn start(config: AppConfig) -> (String, AppState) {
    let state = AppState::new(
        AppConfig {
            jwt_secret: SECRET.to_string(),
            ..config
        },
        Arc::new(JwtSessionVerifier::new(SECRET)),
    );
    let app = chorus_ws::gateway_router().with_state(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("ws://{addr}/gateway"), state)
}

async fn connect(url: &str) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

async fn connect_with_token(url: &str, user_id: i64) -> Ws {
    let token = create_token(user_id, SECRET, 3600).unwrap();
    let mut ws = connect(&format!("{url}?token={token}")).await;
    wait_for(&mut ws, "auth:success").await;
    ws
}

async fn send(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

async fn next_event(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn wait_for(ws: &mut Ws, event: &str) -> Value {
    loop {
        let value = next_event(ws).await;
        if value["event"] == event {
            return value;
        }
    }
}

/// Nothing but control frames for `window`.
async fn assert_quiet(ws: &mut Ws, window: Duration) {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Text(text)))) => panic!("unexpected frame: {text:?}"),
            Ok(Some(Ok(_))) => continue,
            Ok(other) => panic!("socket ended: {other:?}"),
        }
    }
}

#[tokio::test]
async fn explicit_auth_then_presence_broadcast() {
    let (url, state) = start(AppConfig::default()).await;
    let mut watcher = connect_with_token(&url, 100).await;

    let mut ws = connect(&url).await;
    send(&mut ws, json!({"event": "feed:subscribe"})).await;
    send(&mut ws, json!({"event": "auth", "userId": 5})).await;
    let ok = wait_for(&mut ws, "auth:success").await;
    assert_eq!(ok["userId"], 5);

    let online = wait_for(&mut watcher, "user:online").await;
    assert_eq!(online["userId"], 5);
    assert!(state.hub.registry().is_online(5));
    // The pre-auth subscribe was dropped.
    assert_eq!(state.hub.rooms().members(chorus_models::room::RoomName::FeedGlobal).len(), 0);

    ws.close(None).await.unwrap();
    let offline = wait_for(&mut watcher, "user:offline").await;
    assert_eq!(offline["userId"], 5);
}

#[tokio::test]
async fn bad_handshake_token_leaves_socket_open_for_auth() {
    let (url, state) = start(AppConfig::default()).await;
    let mut ws = connect(&format!("{url}?token=not-a-jwt")).await;
    assert_quiet(&mut ws, Duration::from_millis(150)).await;

    let token = create_token(8, SECRET, 60).unwrap();
    send(&mut ws, json!({"event": "auth", "userID": 8, "token": token})).await;
    wait_for(&mut ws, "auth:success").await;
    assert!(state.hub.registry().is_online(8));
}

// Scenario: instant message between two online users, then to an offline one.
#[tokio::test]
async fn instant_message_fast_path() {
    let (url, _state) = start(AppConfig::default()).await;
    let mut ann = connect_with_token(&url, 1).await;
    let mut bob_phone = connect_with_token(&url, 2).await;
    let mut bob_laptop = connect_with_token(&url, 2).await;

    send(
        &mut ann,
        json!({
            "event": "message:send",
            "recipientId": 2,
            "senderName": "Ann",
            "content": "lunch?"
        }),
    )
    .await;

    for bob in [&mut bob_phone, &mut bob_laptop] {
        let new = wait_for(bob, "message:new").await;
        assert_eq!(new["senderId"], 1);
        assert_eq!(new["content"], "lunch?");
    }
    let ack = wait_for(&mut ann, "message:delivered").await;
    assert_eq!(ack["recipientId"], 2);

    send(
        &mut ann,
        json!({"event": "message:send", "recipientId": 404, "content": "hello?"}),
    )
    .await;
    let ack = wait_for(&mut ann, "message:delivered").await;
    assert_eq!(ack["recipientId"], 404);
}

// Scenario: a follow notification fans out to every device of the target.
#[tokio::test]
async fn notifier_reaches_every_device() {
    let (url, state) = start(AppConfig::default()).await;
    let mut phone = connect_with_token(&url, 42).await;
    let mut laptop = connect_with_token(&url, 42).await;
    let mut stranger = connect_with_token(&url, 43).await;
    wait_for(&mut phone, "user:online").await;
    wait_for(&mut laptop, "user:online").await;

    let delivered = state
        .notifier
        .send_follow_notification(42, &Actor::new(7, "Ann"));
    assert_eq!(delivered, 2);

    for device in [&mut phone, &mut laptop] {
        let n = wait_for(device, "notification:follow").await;
        assert_eq!(n["message"], "Ann started following you");
        assert_eq!(n["actorId"], 7);
    }
    assert_quiet(&mut stranger, Duration::from_millis(150)).await;
}

#[tokio::test]
async fn typing_and_feed_rooms() {
    let (url, state) = start(AppConfig::default()).await;
    let mut ann = connect_with_token(&url, 1).await;
    let mut bob = connect_with_token(&url, 2).await;
    wait_for(&mut ann, "user:online").await;

    send(&mut ann, json!({"event": "conversation:join", "conversationId": 9})).await;
    send(&mut bob, json!({"event": "conversation:join", "conversationId": 9})).await;
    send(&mut bob, json!({"event": "feed:subscribe"})).await;
    // Ordering per connection: a message:send ack marks that earlier frames ran.
    send(&mut bob, json!({"event": "message:send", "recipientId": 2, "content": "sync"})).await;
    wait_for(&mut bob, "message:delivered").await;
    send(&mut ann, json!({"event": "message:send", "recipientId": 1, "content": "sync"})).await;
    wait_for(&mut ann, "message:delivered").await;

    send(
        &mut ann,
        json!({"event": "typing:start", "conversationId": 9, "username": "Ann"}),
    )
    .await;
    let typing = wait_for(&mut bob, "typing:start").await;
    assert_eq!(typing["userId"], 1);
    assert_eq!(typing["username"], "Ann");

    state.notifier.broadcast_feed_update(FeedPost {
        id: 11,
        author_id: 1,
        author_name: Some("Ann".into()),
        excerpt: None,
        created_at: None,
    });
    let update = wait_for(&mut bob, "feed:update").await;
    assert_eq!(update["type"], "new_post");
    assert_eq!(update["post"]["id"], 11);

    // Disconnecting ann clears her typing indicator for bob.
    ann.close(None).await.unwrap();
    let stop = wait_for(&mut bob, "typing:stop").await;
    assert_eq!(stop["userId"], 1);
}

// Scenario: a user types on one device while their other device sits in the
// same conversation.
#[tokio::test]
async fn typing_never_echoes_to_own_devices() {
    let (url, _state) = start(AppConfig::default()).await;
    let mut ann_phone = connect_with_token(&url, 1).await;
    let mut ann_laptop = connect_with_token(&url, 1).await;
    let mut bob = connect_with_token(&url, 2).await;

    for ws in [&mut ann_phone, &mut ann_laptop, &mut bob] {
        send(ws, json!({"event": "conversation:join", "conversationId": 12})).await;
        send(ws, json!({"event": "message:send", "recipientId": 404, "content": "sync"})).await;
        // The ack is queued after any earlier presence frames.
        wait_for(ws, "message:delivered").await;
    }

    send(
        &mut ann_phone,
        json!({"event": "typing:start", "conversationId": 12, "username": "Ann"}),
    )
    .await;
    let typing = wait_for(&mut bob, "typing:start").await;
    assert_eq!(typing["userId"], 1);

    send(&mut ann_phone, json!({"event": "typing:stop", "conversationId": 12})).await;
    wait_for(&mut bob, "typing:stop").await;
    assert_quiet(&mut ann_laptop, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn global_capacity_closes_with_try_again() {
    let (url, _state) = start(AppConfig {
        max_connections: 1,
        ..AppConfig::default()
    })
    .await;
    let _first = connect_with_token(&url, 1).await;

    let mut second = connect(&url).await;
    let msg = tokio::time::timeout(Duration::from_secs(2), second.next())
        .await
        .expect("timed out")
        .expect("stream ended")
        .expect("websocket error");
    match msg {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1013),
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn shutdown_closes_live_sockets() {
    let (url, state) = start(AppConfig::default()).await;
    let mut ws = connect_with_token(&url, 3).await;
    state.shutdown.cancel();
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out");
        match msg {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), 1001);
                break;
            }
            Some(Ok(_)) => continue,
            other => panic!("unexpected: {other:?}"),
        }
    }
}

// Scenario: a user drops their only connection and comes back.
#[tokio::test]
async fn reconnect_announces_presence_again() {
    let (url, state) = start(AppConfig::default()).await;
    let mut watcher = connect_with_token(&url, 100).await;

    let mut ws = connect_with_token(&url, 6).await;
    wait_for(&mut watcher, "user:online").await;
    ws.close(None).await.unwrap();
    let offline = wait_for(&mut watcher, "user:offline").await;
    assert_eq!(offline["userId"], 6);
    assert!(!state.hub.registry().is_online(6));

    let _ws = connect_with_token(&url, 6).await;
    let online = wait_for(&mut watcher, "user:online").await;
    assert_eq!(online["userId"], 6);
    assert_eq!(state.hub.registry().connections_of(6).len(), 1);
}
