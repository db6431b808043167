#![allow(dead_code)]

//! Shared harness for the relay integration tests: an in-process relay over
//! the in-memory bus, a scripted mock ASR provider, and WebSocket client
//! helpers.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use murmur_relay::auth::TokenVerifier;
use murmur_relay::config::RelayConfig;
use murmur_relay::pubsub::PubSubBus;
use murmur_relay::service::{router, RelayState};

pub const SECRET: &str = "integration-secret";
pub const AUD: &str = "murmur-relay";
pub const ISS: &str = "https://auth.test";

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Serialize)]
struct Claims {
    user_id: String,
    tenant_id: String,
    email: String,
    role: String,
    exp: i64,
    iat: i64,
    aud: String,
    iss: String,
}

fn signed_token(user_id: &str, exp_offset: i64) -> String {
    let now = Utc::now().timestamp();
    let claims = Claims {
        user_id: user_id.to_string(),
        tenant_id: "t-1".to_string(),
        email: format!("{user_id}@example.com"),
        role: "member".to_string(),
        exp: now + exp_offset,
        iat: now,
        aud: AUD.to_string(),
        iss: ISS.to_string(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

pub fn token(user_id: &str) -> String {
    signed_token(user_id, 3600)
}

pub fn expired_token(user_id: &str) -> String {
    signed_token(user_id, -3600)
}

/// Provider-style interim/final result frames.
pub fn partial_msg(text: &str, start_s: f64, dur_s: f64) -> String {
    results_msg(text, start_s, dur_s, false)
}

pub fn final_msg(text: &str, start_s: f64, dur_s: f64) -> String {
    results_msg(text, start_s, dur_s, true)
}

fn results_msg(text: &str, start_s: f64, dur_s: f64, is_final: bool) -> String {
    format!(
        r#"{{"type":"Results","start":{start_s},"duration":{dur_s},"is_final":{is_final},"channel":{{"alternatives":[{{"transcript":"{text}","confidence":0.95,"words":[]}}]}}}}"#
    )
}

pub struct MockAsr {
    /// ws:// URL of the mock provider.
    pub url: String,
    /// Sizes of every binary frame the provider received, across sessions.
    pub audio_sizes: Arc<Mutex<Vec<usize>>>,
    /// Number of sessions the provider has accepted.
    pub sessions_accepted: Arc<Mutex<usize>>,
}

/// Script for one accepted provider connection.
#[derive(Clone)]
pub struct MockSession {
    /// Frames replayed after the first binary frame arrives.
    pub on_audio: Vec<String>,
    /// Frames replayed when CloseStream arrives, before closing.
    pub on_close: Vec<String>,
    /// Drop the connection right after replaying `on_audio`.
    pub drop_after_audio: bool,
}

impl MockSession {
    pub fn new(on_audio: Vec<String>, on_close: Vec<String>) -> Self {
        Self {
            on_audio,
            on_close,
            drop_after_audio: false,
        }
    }

    pub fn dropping(on_audio: Vec<String>) -> Self {
        Self {
            on_audio,
            on_close: Vec::new(),
            drop_after_audio: true,
        }
    }
}

/// Scripted STT provider: the n-th accepted connection plays the n-th
/// session script; extra connections reuse the last one.
pub async fn spawn_scripted_asr(sessions: Vec<MockSession>) -> MockAsr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let audio_sizes = Arc::new(Mutex::new(Vec::new()));
    let sessions_accepted = Arc::new(Mutex::new(0usize));

    let sizes = audio_sizes.clone();
    let accepted = sessions_accepted.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let script = {
                let mut n = accepted.lock().unwrap();
                let script = sessions
                    .get(*n)
                    .or_else(|| sessions.last())
                    .cloned()
                    .unwrap_or_else(|| MockSession::new(Vec::new(), Vec::new()));
                *n += 1;
                script
            };
            let sizes = sizes.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let mut script_sent = false;
                while let Some(Ok(msg)) = ws.next().await {
                    match msg {
                        Message::Binary(pcm) => {
                            sizes.lock().unwrap().push(pcm.len());
                            if !script_sent {
                                script_sent = true;
                                for frame in &script.on_audio {
                                    if ws.send(Message::Text(frame.clone())).await.is_err() {
                                        return;
                                    }
                                }
                                if script.drop_after_audio {
                                    return;
                                }
                            }
                        }
                        Message::Text(text) => {
                            if text.contains("CloseStream") {
                                for frame in &script.on_close {
                                    let _ = ws.send(Message::Text(frame.clone())).await;
                                }
                                let _ = ws.send(Message::Close(None)).await;
                            }
                        }
                        Message::Close(_) => return,
                        _ => {}
                    }
                }
            });
        }
    });

    MockAsr {
        url,
        audio_sizes,
        sessions_accepted,
    }
}

/// Single-script provider used by most tests.
pub async fn spawn_mock_asr(on_audio: Vec<String>, on_close: Vec<String>) -> MockAsr {
    spawn_scripted_asr(vec![MockSession::new(on_audio, on_close)]).await
}

pub fn test_config(asr_url: &str) -> RelayConfig {
    let mut cfg = RelayConfig::for_tests(SECRET, AUD, ISS);
    cfg.asr.provider_url = asr_url.to_string();
    cfg
}

/// Serves the relay on an ephemeral port over the in-memory bus.
pub async fn start_relay(cfg: RelayConfig) -> (RelayState, SocketAddr) {
    let verifier = TokenVerifier::from_config(&cfg.auth).unwrap();
    let state = RelayState::new(cfg, verifier, PubSubBus::in_memory(), None);
    let app = router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (state, addr)
}

pub async fn connect_subscriber(addr: SocketAddr, meeting: &str, token: &str) -> WsClient {
    let url = format!("ws://{addr}/api/v1/ws/meetings/{meeting}?token={token}");
    tokio_tungstenite::connect_async(url).await.unwrap().0
}

pub async fn connect_ingest(
    addr: SocketAddr,
    meeting: &str,
    token: &str,
    source: &str,
) -> WsClient {
    let url =
        format!("ws://{addr}/api/v1/ws/ingest/meetings/{meeting}?token={token}&source={source}");
    tokio_tungstenite::connect_async(url).await.unwrap().0
}

pub async fn recv_msg(ws: &mut WsClient) -> Message {
    tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timed out waiting for frame")
        .expect("connection ended unexpectedly")
        .expect("websocket error")
}

/// Next text frame parsed as JSON.
pub async fn next_json(ws: &mut WsClient) -> serde_json::Value {
    loop {
        match recv_msg(ws).await {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Close(frame) => panic!("unexpected close: {frame:?}"),
            _ => {}
        }
    }
}

/// Next `transcript.*` envelope, skipping status frames and pings.
pub async fn next_transcript(ws: &mut WsClient) -> serde_json::Value {
    loop {
        let value = next_json(ws).await;
        let kind = value["type"].as_str().unwrap_or_default();
        if kind.starts_with("transcript.") {
            return value;
        }
    }
}

/// Reads until the server closes, returning the close code and reason.
pub async fn expect_close(ws: &mut WsClient) -> (u16, String) {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for close");
        match msg {
            Some(Ok(Message::Close(Some(frame)))) => {
                return (u16::from(frame.code), frame.reason.into_owned())
            }
            Some(Ok(Message::Close(None))) => return (1005, String::new()),
            Some(Ok(_)) => {}
            Some(Err(_)) | None => panic!("connection ended without a close frame"),
        }
    }
}

/// Minimal HTTP GET against the relay, returning the raw response.
pub async fn http_get(addr: SocketAddr, path: &str) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request =
        format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

/// Polls until `probe` returns true or the deadline passes.
pub async fn wait_for(mut probe: impl FnMut() -> bool) {
    for _ in 0..200 {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}
