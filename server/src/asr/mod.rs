//! Streaming ASR session client.
//!
//! One `AsrClient` wraps one upstream speech-to-text session over a secure
//! WebSocket. Audio flows up as raw binary PCM frames; interim and final
//! results come back as JSON text frames and surface through an event
//! channel. A transient provider failure reconnects with the shared backoff
//! policy for a bounded number of attempts; a permanent failure emits a
//! fatal event and marks the client finalized.

mod wire;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AsrProviderConfig;
use crate::models::IngestHandshake;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
const BACKOFF_BASE: Duration = Duration::from_millis(250);
const BACKOFF_CAP: Duration = Duration::from_secs(10);
const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const AUDIO_QUEUE: usize = 32;

const FINALIZE_FRAME: &str = r#"{"type":"Finalize"}"#;
const CLOSE_STREAM_FRAME: &str = r#"{"type":"CloseStream"}"#;
const KEEPALIVE_FRAME: &str = r#"{"type":"KeepAlive"}"#;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum AsrError {
    #[error("ASR session is not connected")]
    NotConnected,

    #[error("ASR session already finalized")]
    Finalized,

    #[error("ASR connect failed: {0}")]
    Connect(String),
}

/// One transcript hypothesis from the provider, partial or final.
#[derive(Debug, Clone)]
pub struct AsrSegment {
    pub text: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub confidence: Option<f32>,
    pub speaker: Option<String>,
    /// Untouched provider payload, persisted with finals for debugging.
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone)]
pub enum AsrEvent {
    Partial(AsrSegment),
    Final(AsrSegment),
    Error { reason: String, fatal: bool },
}

/// Per-session provider parameters, fixed at handshake time.
#[derive(Debug, Clone)]
pub struct AsrSessionParams {
    pub model: String,
    pub language: String,
    pub sample_rate_hz: u32,
    pub channels: u16,
    pub endpointing_ms: u32,
}

impl AsrSessionParams {
    pub fn from_handshake(cfg: &AsrProviderConfig, handshake: &IngestHandshake) -> Self {
        Self {
            model: cfg.model.clone(),
            language: handshake.language.provider_code(&cfg.language_default),
            sample_rate_hz: handshake.sample_rate_hz,
            channels: handshake.channels,
            endpointing_ms: cfg.endpointing_ms,
        }
    }
}

/// Builds the provider session URL: scheme rewritten to a WebSocket scheme,
/// session parameters appended to the query.
fn session_url(cfg: &AsrProviderConfig, params: &AsrSessionParams) -> Result<String, AsrError> {
    let rewritten = cfg
        .provider_url
        .replace("https://", "wss://")
        .replace("http://", "ws://");
    let mut url =
        url::Url::parse(&rewritten).map_err(|e| AsrError::Connect(e.to_string()))?;
    url.query_pairs_mut()
        .append_pair("model", &params.model)
        .append_pair("language", &params.language)
        .append_pair("sample_rate", &params.sample_rate_hz.to_string())
        .append_pair("channels", &params.channels.to_string())
        .append_pair("encoding", "linear16")
        .append_pair("interim_results", "true")
        .append_pair("punctuate", "true")
        .append_pair("endpointing", &params.endpointing_ms.to_string())
        .append_pair("diarize", "true");
    Ok(url.to_string())
}

struct ConnectFailure {
    reason: String,
    fatal: bool,
}

async fn connect_provider(
    cfg: &AsrProviderConfig,
    params: &AsrSessionParams,
) -> Result<WsStream, ConnectFailure> {
    let url = session_url(cfg, params).map_err(|e| ConnectFailure {
        reason: e.to_string(),
        fatal: true,
    })?;
    let mut request = url.into_client_request().map_err(|e| ConnectFailure {
        reason: e.to_string(),
        fatal: true,
    })?;
    let auth = HeaderValue::from_str(&format!("Token {}", cfg.api_key)).map_err(|e| {
        ConnectFailure {
            reason: e.to_string(),
            fatal: true,
        }
    })?;
    request.headers_mut().insert(AUTHORIZATION, auth);

    match tokio_tungstenite::connect_async(request).await {
        Ok((stream, _response)) => Ok(stream),
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            let status = response.status();
            Err(ConnectFailure {
                reason: format!("provider refused with HTTP {status}"),
                // Credential and format rejections never heal on retry.
                fatal: status.as_u16() == 400 || status.as_u16() == 401 || status.as_u16() == 403,
            })
        }
        Err(e) => Err(ConnectFailure {
            reason: e.to_string(),
            fatal: false,
        }),
    }
}

/// Handle to a live ASR session. Cheap to share; `send_pcm` applies the
/// provider's natural backpressure through a bounded audio queue.
pub struct AsrClient {
    audio_tx: mpsc::Sender<Vec<u8>>,
    ready: Arc<AtomicBool>,
    finalized: Arc<AtomicBool>,
    drain: CancellationToken,
    done: CancellationToken,
    finalize_grace: Duration,
}

impl AsrClient {
    /// Opens the provider connection, failing fast if the provider refuses,
    /// and returns the client plus its event stream once ready for audio.
    pub async fn connect(
        cfg: &AsrProviderConfig,
        params: AsrSessionParams,
        finalize_grace: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<AsrEvent>), AsrError> {
        let stream = connect_provider(cfg, &params)
            .await
            .map_err(|f| AsrError::Connect(f.reason))?;
        info!(
            model = %params.model,
            language = %params.language,
            sample_rate = params.sample_rate_hz,
            "ASR session connected"
        );

        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_QUEUE);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ready = Arc::new(AtomicBool::new(true));
        let finalized = Arc::new(AtomicBool::new(false));
        let drain = CancellationToken::new();
        let done = CancellationToken::new();

        let driver = Driver {
            cfg: cfg.clone(),
            params,
            audio_rx,
            events_tx,
            ready: ready.clone(),
            finalized: finalized.clone(),
            drain: drain.clone(),
            done: done.clone(),
            finalize_grace,
        };
        tokio::spawn(driver.run(stream));

        Ok((
            Self {
                audio_tx,
                ready,
                finalized,
                drain,
                done,
                finalize_grace,
            },
            events_rx,
        ))
    }

    /// Pushes one raw PCM frame upstream. Errors while disconnected or after
    /// finalize; the caller drops the frame.
    pub async fn send_pcm(&self, frame: Vec<u8>) -> Result<(), AsrError> {
        if self.finalized.load(Ordering::Relaxed) {
            return Err(AsrError::Finalized);
        }
        if !self.ready.load(Ordering::Relaxed) {
            return Err(AsrError::NotConnected);
        }
        self.audio_tx
            .send(frame)
            .await
            .map_err(|_| AsrError::NotConnected)
    }

    /// Signals end-of-stream and waits a bounded grace period for trailing
    /// finals. Idempotent: the second call observes the same drained state.
    pub async fn finalize(&self) {
        self.finalized.store(true, Ordering::Relaxed);
        self.drain.cancel();
        let deadline = Instant::now() + self.finalize_grace + Duration::from_millis(250);
        let _ = timeout_at(deadline, self.done.cancelled()).await;
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Relaxed)
    }
}

enum SessionEnd {
    Drained,
    Transient(String),
    Fatal(String),
}

struct Driver {
    cfg: AsrProviderConfig,
    params: AsrSessionParams,
    audio_rx: mpsc::Receiver<Vec<u8>>,
    events_tx: mpsc::UnboundedSender<AsrEvent>,
    ready: Arc<AtomicBool>,
    finalized: Arc<AtomicBool>,
    drain: CancellationToken,
    done: CancellationToken,
    finalize_grace: Duration,
}

impl Driver {
    async fn run(mut self, initial: WsStream) {
        let mut stream = Some(initial);
        let mut attempts: u32 = 0;

        loop {
            let ws = match stream.take() {
                Some(ws) => ws,
                None => match connect_provider(&self.cfg, &self.params).await {
                    Ok(ws) => {
                        metrics::counter!("relay_asr_reconnects_total", 1);
                        info!("ASR session reconnected");
                        attempts = 0;
                        ws
                    }
                    Err(failure) => {
                        if failure.fatal {
                            self.emit_error(failure.reason, true);
                            break;
                        }
                        attempts += 1;
                        if attempts > MAX_RECONNECT_ATTEMPTS {
                            self.emit_error(
                                format!(
                                    "giving up after {MAX_RECONNECT_ATTEMPTS} reconnect attempts: {}",
                                    failure.reason
                                ),
                                true,
                            );
                            break;
                        }
                        let backoff = backoff_delay(attempts);
                        warn!(
                            error = %failure.reason,
                            attempt = attempts,
                            backoff_ms = backoff.as_millis() as u64,
                            "ASR reconnect failed, backing off"
                        );
                        tokio::select! {
                            _ = sleep(backoff) => {}
                            _ = self.drain.cancelled() => break,
                        }
                        continue;
                    }
                },
            };

            self.ready.store(true, Ordering::Relaxed);
            let end = self.stream_session(ws).await;
            self.ready.store(false, Ordering::Relaxed);

            match end {
                SessionEnd::Drained => break,
                SessionEnd::Fatal(reason) => {
                    self.emit_error(reason, true);
                    break;
                }
                SessionEnd::Transient(reason) => {
                    if self.finalized.load(Ordering::Relaxed) {
                        break;
                    }
                    self.emit_error(reason, false);
                    // Loop around with no stream; reconnect with backoff.
                }
            }
        }

        self.finalized.store(true, Ordering::Relaxed);
        self.done.cancel();
    }

    /// Runs one provider connection until drain, disconnect, or fatal error.
    async fn stream_session(&mut self, ws: WsStream) -> SessionEnd {
        let (mut write, mut read) = ws.split();
        let mut keepalive = interval(KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                frame = self.audio_rx.recv() => match frame {
                    Some(pcm) => {
                        if let Err(e) = write.send(WsMessage::Binary(pcm)).await {
                            return SessionEnd::Transient(format!("audio write failed: {e}"));
                        }
                    }
                    // Client handle dropped without finalize; end the stream.
                    None => {
                        let _ = write.send(WsMessage::Text(CLOSE_STREAM_FRAME.to_string())).await;
                        return self.drain_results(&mut read).await;
                    }
                },
                _ = self.drain.cancelled() => {
                    let _ = write.send(WsMessage::Text(FINALIZE_FRAME.to_string())).await;
                    let _ = write.send(WsMessage::Text(CLOSE_STREAM_FRAME.to_string())).await;
                    return self.drain_results(&mut read).await;
                }
                msg = read.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Some(end) = self.handle_text(&text) {
                            return end;
                        }
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        if write.send(WsMessage::Pong(payload)).await.is_err() {
                            return SessionEnd::Transient("pong write failed".to_string());
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        return SessionEnd::Transient("provider closed the stream".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return SessionEnd::Transient(format!("provider read failed: {e}"));
                    }
                    None => return SessionEnd::Transient("provider stream ended".to_string()),
                },
                _ = keepalive.tick() => {
                    if write.send(WsMessage::Text(KEEPALIVE_FRAME.to_string())).await.is_err() {
                        return SessionEnd::Transient("keepalive write failed".to_string());
                    }
                }
            }
        }
    }

    /// After end-of-stream was signalled, keep collecting trailing results
    /// until the provider closes or the grace period expires.
    async fn drain_results(
        &mut self,
        read: &mut futures::stream::SplitStream<WsStream>,
    ) -> SessionEnd {
        let deadline = Instant::now() + self.finalize_grace;
        loop {
            match timeout_at(deadline, read.next()).await {
                Err(_) => {
                    debug!("finalize grace expired with provider still open");
                    return SessionEnd::Drained;
                }
                Ok(Some(Ok(WsMessage::Text(text)))) => {
                    if let Some(SessionEnd::Fatal(reason)) = self.handle_text(&text) {
                        return SessionEnd::Fatal(reason);
                    }
                }
                Ok(Some(Ok(WsMessage::Close(_)))) | Ok(None) => return SessionEnd::Drained,
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(_))) => return SessionEnd::Drained,
            }
        }
    }

    fn handle_text(&self, text: &str) -> Option<SessionEnd> {
        match wire::parse_provider_text(text) {
            wire::ProviderEvent::Result { is_final, segment } => {
                let event = if is_final {
                    AsrEvent::Final(segment)
                } else {
                    AsrEvent::Partial(segment)
                };
                let _ = self.events_tx.send(event);
                None
            }
            wire::ProviderEvent::Error(reason) => Some(SessionEnd::Fatal(reason)),
            wire::ProviderEvent::Ignored => None,
        }
    }

    fn emit_error(&self, reason: String, fatal: bool) {
        warn!(reason = %reason, fatal, "ASR session error");
        let _ = self.events_tx.send(AsrEvent::Error { reason, fatal });
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE
        .checked_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .unwrap_or(BACKOFF_CAP)
        .min(BACKOFF_CAP);
    base.mul_f64(rand::thread_rng().gen_range(0.8..=1.2))
}
