//! End-to-end tests for the vocore server: real TCP listener, real
//! WebSocket client, no mocked transport. Every test mints its own
//! access token against a [`StaticSecretVerifier`]-style HMAC secret —
//! there's no external account service to stand up.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;
use vocore_protocol::{ClientEvent, ClientMessage, ServerEvent, ServerMessage};
use vocore_server::auth::Claims;
use vocore_server::config::Config;

const JWT_SECRET: &str = "integration-test-secret-0123456789abcdef";

struct TestServer {
    addr: std::net::SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

fn test_config() -> Config {
    Config {
        bind_address: "127.0.0.1:0".into(),
        jwt_secret: JWT_SECRET.to_string(),
        access_token_ttl: Duration::from_secs(900),
        refresh_token_ttl: Duration::from_secs(2_592_000),
        magic_code_ttl: Duration::from_secs(600),
        stun_servers: vec!["stun:stun.example.com:3478".into()],
        turn_host: None,
        turn_port: 3478,
        turn_secret: None,
        turn_credential_ttl: Duration::from_secs(86400),
        sfu_udp_port_min: 50000,
        sfu_udp_port_max: 50100,
        sfu_public_ip: None,
        ws_allowed_origins: vec![],
        trusted_proxy_cidrs: vec![],
        max_unauth_per_ip: 50,
        max_unauth_global: 500,
        unauth_timeout: Duration::from_millis(500),
        upload_max_bytes: 10 * 1024 * 1024,
        voice_join_cooldown: Duration::from_millis(0),
        voice_state_cooldown: Duration::from_millis(0),
    }
}

impl TestServer {
    async fn start() -> anyhow::Result<Self> {
        let config = test_config();

        let (router, _hub) = vocore_server::build_standalone_app(Arc::new(config)).await?;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
            )
            .with_graceful_shutdown(async {
                shutdown_rx.await.ok();
            })
            .await
            .ok();
        });

        tokio::time::sleep(Duration::from_millis(50)).await;

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn token_for(user_id: Uuid) -> String {
    let claims = Claims {
        user_id,
        session_version: 1,
        exp: Utc::now().timestamp() + 3600,
        iat: Utc::now().timestamp(),
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(JWT_SECRET.as_bytes())).unwrap()
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn send(ws: &mut WsStream, event: ClientEvent) {
    let msg = ClientMessage::event(event);
    ws.send(Message::Text(serde_json::to_string(&msg).unwrap().into()))
        .await
        .unwrap();
}

async fn recv(ws: &mut WsStream) -> ServerEvent {
    let raw = timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timed out waiting for a server message")
        .expect("stream ended")
        .expect("websocket error");
    match raw {
        Message::Text(text) => serde_json::from_str::<ServerMessage>(&text).unwrap().event,
        other => panic!("expected a text frame, got {other:?}"),
    }
}

/// Connects, sends IDENTIFY, and consumes HELLO + READY, returning the
/// stream positioned right after the handshake.
async fn identified_connection(ws_url: &str, user_id: Uuid) -> WsStream {
    let (mut ws, _) = connect_async(ws_url).await.expect("failed to connect");
    assert!(matches!(recv(&mut ws).await, ServerEvent::Hello));
    send(&mut ws, ClientEvent::Identify { token: token_for(user_id) }).await;
    assert!(matches!(recv(&mut ws).await, ServerEvent::Ready { .. }));
    ws
}

#[tokio::test]
async fn handshake_produces_hello_then_ready() {
    let server = TestServer::start().await.unwrap();
    let mut ws = identified_connection(&server.ws_url(), Uuid::new_v4()).await;
    send(&mut ws, ClientEvent::Ping).await;
    assert!(matches!(recv(&mut ws).await, ServerEvent::Pong));
}

#[tokio::test]
async fn unidentified_connection_is_dropped_after_timeout() {
    let server = TestServer::start().await.unwrap();
    let (mut ws, _) = connect_async(server.ws_url()).await.unwrap();
    assert!(matches!(recv(&mut ws).await, ServerEvent::Hello));
    // Never sends IDENTIFY; the server's unauth_timeout in the test config
    // is short enough that the connection should close on its own.
    let closed = timeout(Duration::from_secs(3), ws.next()).await;
    match closed {
        Ok(Some(Ok(_))) => panic!("expected the connection to close, not send another message"),
        _ => {}
    }
}

#[tokio::test]
async fn bad_token_is_rejected() {
    let server = TestServer::start().await.unwrap();
    let (mut ws, _) = connect_async(server.ws_url()).await.unwrap();
    assert!(matches!(recv(&mut ws).await, ServerEvent::Hello));
    send(&mut ws, ClientEvent::Identify { token: "not-a-real-token".to_string() }).await;
    let closed = timeout(Duration::from_secs(2), ws.next()).await;
    assert!(matches!(closed, Ok(Some(Ok(_))) | Ok(None)));
}

#[tokio::test]
async fn second_connection_for_same_user_evicts_the_first() {
    let server = TestServer::start().await.unwrap();
    let user_id = Uuid::new_v4();

    let mut first = identified_connection(&server.ws_url(), user_id).await;
    let _second = identified_connection(&server.ws_url(), user_id).await;

    let closed = timeout(Duration::from_secs(2), first.next()).await;
    match closed {
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {}
        other => panic!("expected the first connection to be closed on eviction, got {other:?}"),
    }
}

#[tokio::test]
async fn presence_update_is_broadcast_to_other_members() {
    let server = TestServer::start().await.unwrap();
    let mut alice = identified_connection(&server.ws_url(), Uuid::new_v4()).await;
    let mut bob = identified_connection(&server.ws_url(), Uuid::new_v4()).await;

    send(&mut alice, ClientEvent::SetPresence { status: vocore_protocol::PresenceStatus::Idle }).await;

    let event = recv(&mut bob).await;
    match event {
        ServerEvent::PresenceUpdate { status, .. } => {
            assert_eq!(status, vocore_protocol::PresenceStatus::Idle);
        }
        other => panic!("expected PRESENCE_UPDATE, got {other:?}"),
    }
}

#[tokio::test]
async fn voice_join_returns_rtc_ready_with_ice_servers() {
    let server = TestServer::start().await.unwrap();
    let mut ws = identified_connection(&server.ws_url(), Uuid::new_v4()).await;

    send(&mut ws, ClientEvent::VoiceJoin { muted: false, deafened: false }).await;

    // VOICE_STATE_UPDATE (self) then RTC_READY, in some order depending on
    // broadcast fanout timing; accept either first.
    let mut saw_rtc_ready = false;
    let mut saw_voice_state = false;
    for _ in 0..2 {
        match recv(&mut ws).await {
            ServerEvent::RtcReady { .. } => saw_rtc_ready = true,
            ServerEvent::VoiceStateUpdate { .. } => saw_voice_state = true,
            other => panic!("unexpected event during voice join: {other:?}"),
        }
    }
    assert!(saw_rtc_ready && saw_voice_state);
}

#[tokio::test]
async fn voice_state_toggle_is_rejected_outside_voice() {
    let server = TestServer::start().await.unwrap();
    let mut ws = identified_connection(&server.ws_url(), Uuid::new_v4()).await;

    send(&mut ws, ClientEvent::VoiceState { muted: Some(true), deafened: None }).await;

    match recv(&mut ws).await {
        ServerEvent::ServerError { code, .. } => {
            assert_eq!(code, vocore_protocol::ErrorCode::VoiceStateInvalidTransition);
        }
        other => panic!("expected SERVER_ERROR, got {other:?}"),
    }
}

#[tokio::test]
async fn typing_start_is_relayed_to_other_members() {
    let server = TestServer::start().await.unwrap();
    let mut alice = identified_connection(&server.ws_url(), Uuid::new_v4()).await;
    let mut bob = identified_connection(&server.ws_url(), Uuid::new_v4()).await;

    send(&mut alice, ClientEvent::TypingStart).await;
    match recv(&mut bob).await {
        ServerEvent::TypingStart { .. } => {}
        other => panic!("expected TYPING_START, got {other:?}"),
    }
}
