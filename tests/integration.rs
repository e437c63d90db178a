//! Integration tests against a fake platform served by axum on loopback
//! (token, users, subscriptions and an EventSub WebSocket), plus scripted
//! raw-TCP WebSocket peers for handshake and control-frame behaviour.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use twitchsub::net::{SocketRegistry, DEFAULT_CAPACITY};
use twitchsub::ws::{Inbound, WsClient, WsEndpoint, WsState};
use twitchsub::{
    AppError, AuthState, ChannelPointRewardRedemption, Config, Controller, RedemptionCallback, Session,
    SubscriptionKind, SubscriptionStatus,
};

const WAIT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct Platform {
    expires_in: AtomicU64,
    code_grants: AtomicUsize,
    refresh_grants: AtomicUsize,
    last_code: Mutex<Option<String>>,
    creates: AtomicUsize,
    deletes: AtomicUsize,
    ws_connections: AtomicUsize,
    reconnect_first: AtomicBool,
    fail_refresh: AtomicBool,
}

async fn token(State(platform): State<Arc<Platform>>, body: String) -> Response {
    let access_token = if body.contains("grant_type=refresh_token") {
        platform.refresh_grants.fetch_add(1, Ordering::SeqCst);
        if platform.fail_refresh.load(Ordering::SeqCst) {
            return (StatusCode::BAD_REQUEST, "Invalid refresh token").into_response();
        }
        "access-refreshed"
    } else if body.contains("grant_type=authorization_code") {
        platform.code_grants.fetch_add(1, Ordering::SeqCst);
        let code = body
            .split('&')
            .find_map(|pair| pair.strip_prefix("code="))
            .map(str::to_string);
        *platform.last_code.lock().unwrap() = code;
        "access-0123456789"
    } else {
        return (StatusCode::BAD_REQUEST, "unsupported grant").into_response();
    };
    Json(json!({
        "access_token": access_token,
        "refresh_token": "refresh-0123456789",
        "expires_in": platform.expires_in.load(Ordering::SeqCst),
        "scope": ["channel:read:redemptions", "chat:read", "moderator:manage:automod"],
        "token_type": "bearer",
    }))
    .into_response()
}

async fn users() -> Json<serde_json::Value> {
    Json(json!({ "data": [{ "id": "4242", "login": "caster" }] }))
}

async fn create_subscription(State(platform): State<Arc<Platform>>, body: String) -> Response {
    let n = platform.creates.fetch_add(1, Ordering::SeqCst);
    let request: serde_json::Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    if request["transport"]["session_id"].as_str().is_none() {
        return StatusCode::BAD_REQUEST.into_response();
    }
    (
        StatusCode::ACCEPTED,
        Json(json!({ "data": [{ "id": format!("sub-{}", n), "status": "enabled", "type": request["type"] }] })),
    )
        .into_response()
}

async fn delete_subscription(State(platform): State<Arc<Platform>>) -> StatusCode {
    platform.deletes.fetch_add(1, Ordering::SeqCst);
    StatusCode::NO_CONTENT
}

async fn eventsub(State(platform): State<Arc<Platform>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| eventsub_session(platform, socket))
}

fn welcome(session_id: &str) -> String {
    json!({
        "metadata": { "message_id": "w", "message_type": "session_welcome" },
        "payload": { "session": { "id": session_id, "status": "connected", "keepalive_timeout_seconds": 10 } }
    })
    .to_string()
}

fn redemption_notification() -> String {
    json!({
        "metadata": { "message_id": "n1", "message_type": "notification" },
        "payload": {
            "subscription": { "id": "sub", "type": "channel.channel_points_custom_reward_redemption.add", "version": "1" },
            "event": {
                "id": "r-1",
                "user_id": "777",
                "user_login": "viewer",
                "user_name": "Viewer",
                "broadcaster_user_id": "4242",
                "status": "unfulfilled",
                "user_input": "hello",
                "redeemed_at": "2026-01-01T00:00:00Z",
                "reward": { "id": "rw", "title": "Hydrate", "cost": 100, "prompt": "Drink water" }
            }
        }
    })
    .to_string()
}

async fn eventsub_session(platform: Arc<Platform>, mut socket: WebSocket) {
    let index = platform.ws_connections.fetch_add(1, Ordering::SeqCst);
    if socket.send(Message::Text(welcome(&format!("session-{}", index)))).await.is_err() {
        return;
    }
    let script = if index == 0 && platform.reconnect_first.load(Ordering::SeqCst) {
        json!({
            "metadata": { "message_type": "session_reconnect" },
            "payload": { "session": { "id": "session-0", "reconnect_url": "wss://example.invalid/ws" } }
        })
        .to_string()
    } else {
        redemption_notification()
    };
    // Give the client time to register subscriptions before the next message.
    tokio::time::sleep(Duration::from_millis(100)).await;
    if socket.send(Message::Text(script)).await.is_err() {
        return;
    }
    while let Some(Ok(message)) = socket.next().await {
        if matches!(message, Message::Close(_)) {
            break;
        }
    }
}

async fn start_platform(expires_in: u64) -> (u16, Arc<Platform>) {
    let platform = Arc::new(Platform::default());
    platform.expires_in.store(expires_in, Ordering::SeqCst);
    let app = Router::new()
        .route("/oauth2/token", post(token))
        .route("/helix/users", get(users))
        .route(
            "/helix/eventsub/subscriptions",
            post(create_subscription).delete(delete_subscription),
        )
        .route("/ws", get(eventsub))
        .with_state(platform.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (port, platform)
}

fn local_config(port: u16) -> Config {
    Config::new("client-id", "client-secret")
        .with_local_endpoints("127.0.0.1", port)
        .with_redirect_port(0)
        .with_open_browser(false)
        .with_reconnect_delay(Duration::from_millis(50))
}

/// Poll `check` until it holds or the wait runs out.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Play the browser: hit the redirect listener with a code and return the page.
async fn redirect_browser(session: &Session, code: &str) -> String {
    assert!(eventually(|| async move { session.redirect_port().await.is_some() }).await);
    let port = session.redirect_port().await.unwrap();
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let request = format!("GET /?code={}&scope=chat%3Aread HTTP/1.1\r\nHost: localhost:{}\r\n\r\n", code, port);
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut page = String::new();
    stream.read_to_string(&mut page).await.unwrap();
    page
}

async fn authenticated_session(expires_in: u64) -> (Session, Arc<Platform>) {
    let (port, platform) = start_platform(expires_in).await;
    let session = Session::new(local_config(port)).unwrap();
    session.initialize().await.unwrap();
    let auth = tokio::spawn({
        let session = session.clone();
        async move { session.authenticate().await }
    });
    let page = redirect_browser(&session, "abc").await;
    assert!(page.contains("You can now close this window."));
    auth.await.unwrap().unwrap();
    (session, platform)
}

fn recorder() -> (Arc<Mutex<Vec<ChannelPointRewardRedemption>>>, RedemptionCallback) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: RedemptionCallback =
        Arc::new(move |r: ChannelPointRewardRedemption| sink.lock().unwrap().push(r));
    (seen, callback)
}

#[tokio::test]
async fn authorization_code_flow_resolves_broadcaster() {
    let (session, platform) = authenticated_session(14400).await;
    assert_eq!(session.auth_state().await, AuthState::Authenticated);
    assert_eq!(session.broadcaster_id().await.as_deref(), Some("4242"));
    assert_eq!(session.access_token().await.as_deref(), Some("access-0123456789"));
    assert_eq!(platform.last_code.lock().unwrap().as_deref(), Some("abc"));
    assert_eq!(platform.code_grants.load(Ordering::SeqCst), 1);

    // The code is single-use.
    assert!(session.exchange_code().await.is_err());
    session.shutdown().await;
}

#[tokio::test]
async fn refresh_happens_only_inside_threshold() {
    let (session, platform) = authenticated_session(299).await;
    assert!(session.check_expiry().await.unwrap());
    assert_eq!(platform.refresh_grants.load(Ordering::SeqCst), 1);
    assert_eq!(session.auth_state().await, AuthState::Authenticated);
    session.shutdown().await;

    let (session, platform) = authenticated_session(301).await;
    assert!(!session.check_expiry().await.unwrap());
    assert_eq!(platform.refresh_grants.load(Ordering::SeqCst), 0);
    session.shutdown().await;
}

#[tokio::test]
async fn refresh_swaps_tokens_only_on_success() {
    let (session, platform) = authenticated_session(100).await;

    platform.fail_refresh.store(true, Ordering::SeqCst);
    assert!(session.check_expiry().await.is_err());
    assert_eq!(session.access_token().await.as_deref(), Some("access-0123456789"));
    assert_eq!(session.auth_state().await, AuthState::Authenticated);

    platform.fail_refresh.store(false, Ordering::SeqCst);
    assert!(session.check_expiry().await.unwrap());
    assert_eq!(session.access_token().await.as_deref(), Some("access-refreshed"));
    assert_eq!(platform.refresh_grants.load(Ordering::SeqCst), 2);
    session.shutdown().await;
}

#[tokio::test]
async fn redemption_reaches_callback_once() {
    let (port, platform) = start_platform(14400).await;
    let controller = Controller::new(local_config(port)).unwrap();
    let ctl = &controller;
    let kind = SubscriptionKind::ChannelPointsCustomRewardRedemptionAdd;
    let (seen, callback) = recorder();
    let seen_ref = &seen;
    controller.subscribe(kind, Some(callback)).await;
    assert_eq!(controller.is_subscribed(kind).await, SubscriptionStatus::NotSubscribed);

    controller.start().await;
    let page = redirect_browser(controller.session(), "flow-code").await;
    assert!(page.starts_with("HTTP/1.1 200 OK"));
    assert!(eventually(|| async move { ctl.auth_state().await == AuthState::Authenticated }).await);
    assert_eq!(controller.is_subscribed(kind).await, SubscriptionStatus::NotSubscribed);

    controller.enable_websocket(true).await;
    assert!(eventually(|| async move { seen_ref.lock().unwrap().len() == 1 }).await);
    assert_eq!(controller.is_subscribed(kind).await, SubscriptionStatus::Subscribed);
    assert_eq!(
        controller.is_subscribed(SubscriptionKind::AutomodMessageHold).await,
        SubscriptionStatus::Subscribed
    );
    assert_eq!(controller.ws_state().await, WsState::Established);
    assert_eq!(
        controller.session().ws_session_id().await.as_deref(),
        Some("session-0")
    );

    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].id, "r-1");
        assert_eq!(seen[0].user_id, "777");
        assert_eq!(seen[0].reward.title, "Hydrate");
        assert_eq!(seen[0].reward.cost, 100);
        assert_eq!(seen[0].status, "unfulfilled");
    }
    assert_eq!(platform.creates.load(Ordering::SeqCst), 2);

    assert!(controller.unsubscribe(kind).await);
    assert_eq!(platform.deletes.load(Ordering::SeqCst), 1);

    controller.stop().await;
    assert!(!controller.is_running().await);
    assert!(!controller.is_websocket_enabled().await);
    assert_eq!(controller.ws_state().await, WsState::Closed);
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn session_reconnect_resubscribes_on_new_session() {
    let (port, platform) = start_platform(14400).await;
    platform.reconnect_first.store(true, Ordering::SeqCst);
    let controller = Controller::new(local_config(port)).unwrap();
    let ctl = &controller;
    let (seen, callback) = recorder();
    let seen_ref = &seen;
    controller
        .subscribe(SubscriptionKind::ChannelPointsCustomRewardRedemptionAdd, Some(callback))
        .await;

    controller.start().await;
    redirect_browser(controller.session(), "again").await;
    assert!(eventually(|| async move { ctl.auth_state().await == AuthState::Authenticated }).await);
    controller.enable_websocket(true).await;

    assert!(eventually(|| async move { seen_ref.lock().unwrap().len() == 1 }).await);
    assert_eq!(platform.ws_connections.load(Ordering::SeqCst), 2);
    assert_eq!(platform.creates.load(Ordering::SeqCst), 4);
    assert_eq!(
        controller.session().ws_session_id().await.as_deref(),
        Some("session-1")
    );
    controller.stop().await;
}

#[tokio::test]
async fn failed_authentication_is_recorded() {
    let (port, _platform) = start_platform(14400).await;
    let controller = Controller::new(local_config(port)).unwrap();
    let ctl = &controller;
    controller.start().await;

    assert!(eventually(|| async move { ctl.session().redirect_port().await.is_some() }).await);
    let redirect = controller.session().redirect_port().await.unwrap();
    let mut stream = TcpStream::connect(("127.0.0.1", redirect)).await.unwrap();
    stream
        .write_all(b"GET /?error=access_denied HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let mut page = String::new();
    stream.read_to_string(&mut page).await.unwrap();
    assert!(page.contains("You can now close this window."));

    assert!(eventually(|| async move { !ctl.is_running().await }).await);
    assert_eq!(controller.auth_state().await, AuthState::Unauthenticated);
    assert!(controller
        .last_error()
        .await
        .is_some_and(|e| e.contains("authentication failed")));
    controller.stop().await;
}

/// Accept one connection and consume the upgrade request head.
async fn accept_upgrade(listener: &TcpListener) -> TcpStream {
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    assert!(head.starts_with("GET /ws HTTP/1.1\r\n"));
    assert!(head.contains("Sec-WebSocket-Version: 13\r\n"));
    stream
}

async fn scripted_peer() -> (TcpListener, u16, WsClient) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let client = WsClient::new(SocketRegistry::new(DEFAULT_CAPACITY).unwrap());
    (listener, port, client)
}

#[tokio::test]
async fn handshake_without_accept_header_fails_closed() {
    let (listener, port, client) = scripted_peer().await;
    let peer = tokio::spawn(async move {
        let mut stream = accept_upgrade(&listener).await;
        stream
            .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
            .await
            .unwrap();
        stream
    });

    let result = client
        .connect(&WsEndpoint::new("127.0.0.1", port, "/ws", false))
        .await;
    assert!(result.is_err());
    assert_eq!(client.state().await, WsState::Closed);
    drop(peer.await.unwrap());
}

#[tokio::test]
async fn ping_is_answered_with_matching_pong() {
    let (listener, port, client) = scripted_peer().await;
    let peer = tokio::spawn(async move {
        let mut stream = accept_upgrade(&listener).await;
        stream
            .write_all(
                b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
                  Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n",
            )
            .await
            .unwrap();
        stream.write_all(&[0x89, 0x03, b'a', b'b', b'c']).await.unwrap();

        let mut header = [0u8; 2];
        stream.read_exact(&mut header).await.unwrap();
        let mut mask = [0u8; 4];
        stream.read_exact(&mut mask).await.unwrap();
        let mut payload = vec![0u8; (header[1] & 0x7f) as usize];
        stream.read_exact(&mut payload).await.unwrap();
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
        (header, payload)
    });

    client
        .connect(&WsEndpoint::new("127.0.0.1", port, "/ws", false))
        .await
        .unwrap();
    assert_eq!(client.state().await, WsState::Established);
    assert_eq!(client.receive().await.unwrap(), Inbound::Empty);

    let (header, payload) = peer.await.unwrap();
    assert_eq!(header[0], 0x8A);
    assert_eq!(header[1] & 0x80, 0x80);
    assert_eq!(payload, b"abc");
    client.discard().await;
}

#[tokio::test]
async fn text_and_close_frames_from_peer() {
    let (listener, port, client) = scripted_peer().await;
    let peer = tokio::spawn(async move {
        let mut stream = accept_upgrade(&listener).await;
        stream
            .write_all(b"HTTP/1.1 101 Switching Protocols\r\nsec-websocket-accept: x\r\n\r\n")
            .await
            .unwrap();
        let mut frame = vec![0x81, 0x05];
        frame.extend_from_slice(b"hello");
        frame.extend_from_slice(&[0x88, 0x02, 0x03, 0xE8]);
        stream.write_all(&frame).await.unwrap();
        stream
    });

    client
        .connect(&WsEndpoint::new("127.0.0.1", port, "/ws", false))
        .await
        .unwrap();
    assert_eq!(client.receive().await.unwrap(), Inbound::Text("hello".into()));
    assert_eq!(client.receive().await.unwrap(), Inbound::Closed);
    assert_eq!(client.state().await, WsState::Closed);
    drop(peer.await.unwrap());
}

const SWITCHING: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
    Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n";

/// Complete the upgrade, then write `chunks` with a pause between each.
async fn peer_writing(listener: TcpListener, chunks: Vec<Vec<u8>>) -> TcpStream {
    let mut stream = accept_upgrade(&listener).await;
    stream.write_all(SWITCHING).await.unwrap();
    for chunk in chunks {
        stream.write_all(&chunk).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    stream
}

#[tokio::test]
async fn frame_split_across_reads_is_reassembled() {
    let (listener, port, client) = scripted_peer().await;
    let peer = tokio::spawn(peer_writing(
        listener,
        vec![vec![0x81], vec![0x05, b'h', b'e'], b"llo".to_vec()],
    ));

    client
        .connect(&WsEndpoint::new("127.0.0.1", port, "/ws", false))
        .await
        .unwrap();
    assert_eq!(client.receive().await.unwrap(), Inbound::Text("hello".into()));
    assert_eq!(client.state().await, WsState::Established);
    client.discard().await;
    drop(peer.await.unwrap());
}

#[tokio::test]
async fn continuation_frame_drops_the_connection() {
    let (listener, port, client) = scripted_peer().await;
    let mut frames = vec![0x81, 0x02, b'o', b'k'];
    frames.extend_from_slice(&[0x80, 0x01, b'x']);
    let peer = tokio::spawn(peer_writing(listener, vec![frames]));

    client
        .connect(&WsEndpoint::new("127.0.0.1", port, "/ws", false))
        .await
        .unwrap();
    assert_eq!(client.receive().await.unwrap(), Inbound::Text("ok".into()));
    assert!(matches!(client.receive().await, Err(AppError::Protocol(_))));
    assert_eq!(client.state().await, WsState::Closed);
    assert!(client.receive().await.is_err());
    drop(peer.await.unwrap());
}

#[tokio::test]
async fn unfinished_text_frame_drops_the_connection() {
    let (listener, port, client) = scripted_peer().await;
    let peer = tokio::spawn(peer_writing(listener, vec![vec![0x01, 0x02, b'h', b'e']]));

    client
        .connect(&WsEndpoint::new("127.0.0.1", port, "/ws", false))
        .await
        .unwrap();
    assert!(matches!(client.receive().await, Err(AppError::Protocol(_))));
    assert_eq!(client.state().await, WsState::Closed);
    drop(peer.await.unwrap());
}

#[tokio::test]
async fn close_from_another_task_interrupts_receive() {
    let (listener, port, client) = scripted_peer().await;
    let peer = tokio::spawn(peer_writing(listener, Vec::new()));

    client
        .connect(&WsEndpoint::new("127.0.0.1", port, "/ws", false))
        .await
        .unwrap();
    let stream = peer.await.unwrap();

    let reader = client.clone();
    let pending = tokio::spawn(async move { reader.receive().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_secs(2), client.close())
        .await
        .expect("close blocked behind a pending receive");
    assert_eq!(client.state().await, WsState::Closed);
    let received = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .unwrap()
        .unwrap();
    assert!(received.is_err());
    drop(stream);
}
