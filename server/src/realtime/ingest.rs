//! Ingest side of the relay: one authenticated WebSocket per meeting
//! delivering framed PCM, bridged to a streaming ASR session.
//!
//! Finals are numbered in the order the ASR emits them and that order is
//! ground truth; partials ride a provisional lookahead number and are never
//! persisted. A broker or store failure degrades delivery but never tears
//! the ingest connection down.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::asr::{AsrClient, AsrEvent, AsrSegment, AsrSessionParams};
use crate::auth;
use crate::models::{
    transcript_channel, AudioSource, HandshakeAck, IngestClientFrame, IngestHandshake,
    RelayMessage, TranscriptSegment,
};
use crate::realtime::{self, close, WsQuery};
use crate::registry::IngestAttach;
use crate::service::RelayState;

/// GET /api/v1/ws/ingest/meetings/{meeting_id} — WebSocket upgrade for a
/// PCM-producing capture agent.
pub async fn ingest_meeting(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
    Path(meeting_id): Path<String>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    if state.is_draining() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let token = auth::bearer_token(&headers, query.token.as_deref());
    let source_param = query.source.unwrap_or_else(|| "mic".to_string());
    let tracker = state.tracker.clone();
    ws.on_upgrade(move |socket| {
        tracker.track_future(handle_ingest(socket, state, meeting_id, token, source_param))
    })
}

async fn handle_ingest(
    socket: WebSocket,
    state: RelayState,
    meeting_id: String,
    token: Option<String>,
    source_param: String,
) {
    let (mut sender, mut receiver) = socket.split();

    // 1. Admission. The handshake is already accepted, so auth failures are
    //    reported through a close frame, never an application frame.
    let principal = match token.as_deref().map(|t| state.verifier.verify(t)) {
        Some(Ok(principal)) => principal,
        Some(Err(e)) => {
            debug!(meeting_id, error = %e, "ingest auth failed");
            realtime::close_socket(&mut sender, close::AUTH_FAILED, "auth failed").await;
            return;
        }
        None => {
            realtime::close_socket(&mut sender, close::AUTH_FAILED, "auth failed").await;
            return;
        }
    };

    let Some(source) = AudioSource::parse_param(&source_param) else {
        realtime::close_socket(&mut sender, close::PROTOCOL_VIOLATION, "invalid source").await;
        return;
    };

    let meeting_ok = state
        .admission
        .check(&RelayState::admission_key_meeting(&meeting_id, source.as_str()));
    let principal_ok = state
        .admission
        .check(&RelayState::admission_key_principal(&principal.user_id));
    if !meeting_ok || !principal_ok {
        info!(meeting_id, user = %principal.user_id, "ingest rate limited");
        realtime::close_socket(&mut sender, close::TRY_AGAIN_LATER, "try again later").await;
        return;
    }

    // 2. Registration: at most one ingest per meeting.
    let session_id = Uuid::new_v4();
    if state.registry.attach_ingest(&meeting_id, session_id) == IngestAttach::ConflictExists {
        info!(meeting_id, "rejecting second ingest");
        realtime::close_socket(&mut sender, close::INGEST_EXISTS, "ingest exists").await;
        return;
    }
    metrics::counter!("relay_ingest_sessions_total", 1);

    // Everything past this point owns a registry slot.
    let end = run_session(
        &mut sender,
        &mut receiver,
        &state,
        &meeting_id,
        session_id,
        source,
    )
    .await;

    state.registry.detach_ingest(&meeting_id, session_id);
    state.bus.publish(
        &transcript_channel(&meeting_id),
        &RelayMessage::status(&meeting_id, "ingest_ended", "ingest ended"),
    );
    realtime::close_socket(&mut sender, end.code, &end.reason).await;
    info!(meeting_id, session = %session_id, code = end.code, "ingest session closed");
}

struct SessionEnd {
    code: u16,
    reason: String,
}

impl SessionEnd {
    fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

enum HandshakeOutcome {
    Valid(IngestHandshake),
    Invalid(String),
    Gone,
}

/// Awaits the handshake text frame within the configured window.
async fn await_handshake(
    receiver: &mut SplitStream<WebSocket>,
    state: &RelayState,
) -> HandshakeOutcome {
    let read = async {
        loop {
            match receiver.next().await {
                Some(Ok(Message::Text(text))) => {
                    return HandshakeOutcome::from_text(text.as_str(), state)
                }
                Some(Ok(Message::Binary(_))) => {
                    return HandshakeOutcome::Invalid("expected handshake before audio".to_string())
                }
                Some(Ok(Message::Close(_))) | None => return HandshakeOutcome::Gone,
                Some(Ok(_)) => continue,
                Some(Err(_)) => return HandshakeOutcome::Gone,
            }
        }
    };
    match tokio::time::timeout(state.cfg.handshake_timeout, read).await {
        Ok(outcome) => outcome,
        Err(_) => HandshakeOutcome::Invalid("handshake timeout".to_string()),
    }
}

impl HandshakeOutcome {
    fn from_text(text: &str, state: &RelayState) -> Self {
        let frame: IngestClientFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => return Self::Invalid(format!("malformed handshake: {e}")),
        };
        let handshake = match frame {
            IngestClientFrame::Handshake(hs) => hs,
            _ => return Self::Invalid("first frame must be the handshake".to_string()),
        };
        if handshake.sample_rate_hz != state.cfg.ingest_sample_rate_hz {
            return Self::Invalid(format!(
                "unsupported sample rate {} (expected {})",
                handshake.sample_rate_hz, state.cfg.ingest_sample_rate_hz
            ));
        }
        if handshake.channels != state.cfg.ingest_channels {
            return Self::Invalid(format!(
                "unsupported channel count {} (expected {})",
                handshake.channels, state.cfg.ingest_channels
            ));
        }
        Self::Valid(handshake)
    }
}

async fn send_json(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    value: &impl serde::Serialize,
) -> bool {
    match serde_json::to_string(value) {
        Ok(text) => sender.send(Message::Text(text.into())).await.is_ok(),
        Err(_) => false,
    }
}

/// Runs steps 3–7 of the ingest protocol. The caller owns registration and
/// teardown; this returns how the connection should be closed.
async fn run_session(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    receiver: &mut SplitStream<WebSocket>,
    state: &RelayState,
    meeting_id: &str,
    session_id: Uuid,
    source: AudioSource,
) -> SessionEnd {
    // 3. Handshake.
    let handshake = match await_handshake(receiver, state).await {
        HandshakeOutcome::Valid(hs) => hs,
        HandshakeOutcome::Invalid(reason) => {
            warn!(meeting_id, reason, "ingest handshake rejected");
            let _ = send_json(sender, &HandshakeAck::error(reason.clone())).await;
            return SessionEnd::new(close::PROTOCOL_VIOLATION, reason);
        }
        HandshakeOutcome::Gone => {
            return SessionEnd::new(close::NORMAL, "peer left before handshake")
        }
    };

    // 4. ASR attachment.
    let params = AsrSessionParams::from_handshake(&state.cfg.asr, &handshake);
    let (asr, mut asr_events) =
        match AsrClient::connect(&state.cfg.asr, params, state.cfg.finalize_grace).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(meeting_id, error = %e, "ASR attach failed");
                let _ = send_json(sender, &HandshakeAck::error("transcription unavailable")).await;
                return SessionEnd::new(close::INTERNAL_ERROR, "transcription unavailable");
            }
        };

    // 5. Ack.
    if !send_json(sender, &HandshakeAck::success(session_id.to_string())).await {
        asr.finalize().await;
        return SessionEnd::new(close::NORMAL, "peer left at ack");
    }

    let channel = transcript_channel(meeting_id);
    state.bus.publish(
        &channel,
        &RelayMessage::status(meeting_id, "ingest_started", "ingest started"),
    );
    info!(
        meeting_id,
        session = %session_id,
        source = %source,
        language = ?handshake.language,
        "ingest streaming"
    );

    // 6 + 7. Stream loop and concurrent ASR event pump.
    let mut draining = false;
    let end = loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(Message::Binary(pcm))) => {
                    if draining {
                        continue;
                    }
                    if pcm.len() > state.cfg.max_ingest_frame_bytes {
                        metrics::counter!("relay_oversized_frames_total", 1);
                        warn!(
                            meeting_id,
                            len = pcm.len(),
                            cap = state.cfg.max_ingest_frame_bytes,
                            "oversized PCM frame dropped"
                        );
                        continue;
                    }
                    if let Err(e) = asr.send_pcm(pcm.to_vec()).await {
                        // Transient: the frame is dropped, the session lives.
                        debug!(meeting_id, error = %e, "PCM frame dropped");
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<IngestClientFrame>(text.as_str()) {
                        Ok(IngestClientFrame::Finalize) => {
                            draining = true;
                            asr.finalize().await;
                        }
                        Ok(IngestClientFrame::Close) => {
                            break SessionEnd::new(close::NORMAL, "closed by client");
                        }
                        Ok(IngestClientFrame::Handshake(_)) => {
                            warn!(meeting_id, "duplicate handshake ignored");
                        }
                        Err(e) => {
                            warn!(meeting_id, error = %e, "unparseable control frame ignored");
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    break SessionEnd::new(close::NORMAL, "peer disconnected");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(meeting_id, error = %e, "ingest read failed");
                    break SessionEnd::new(close::NORMAL, "peer disconnected");
                }
            },
            event = asr_events.recv() => match event {
                Some(AsrEvent::Partial(segment)) => {
                    publish_partial(state, meeting_id, source, segment);
                }
                Some(AsrEvent::Final(segment)) => {
                    publish_final(state, meeting_id, source, segment);
                }
                Some(AsrEvent::Error { reason, fatal }) => {
                    let status = if fatal { "asr_failed" } else { "asr_degraded" };
                    state.bus.publish(
                        &channel,
                        &RelayMessage::status(meeting_id, status, reason),
                    );
                    if fatal {
                        break SessionEnd::new(close::INTERNAL_ERROR, "transcription failed");
                    }
                }
                // Driver finished: drained after finalize, or dead.
                None => break SessionEnd::new(close::NORMAL, "ingest complete"),
            },
            _ = state.ingest_shutdown.cancelled(), if !draining => {
                info!(meeting_id, "finalizing ingest for shutdown");
                draining = true;
                asr.finalize().await;
            }
        }
    };

    // 8. Teardown half owned here: make sure the ASR session is gone before
    //    the terminal status envelope goes out.
    if !asr.is_finalized() {
        asr.finalize().await;
    }
    // Flush any events the driver emitted before it closed.
    while let Ok(event) = asr_events.try_recv() {
        match event {
            AsrEvent::Partial(segment) => publish_partial(state, meeting_id, source, segment),
            AsrEvent::Final(segment) => publish_final(state, meeting_id, source, segment),
            AsrEvent::Error { .. } => {}
        }
    }
    end
}

fn publish_partial(state: &RelayState, meeting_id: &str, source: AudioSource, seg: AsrSegment) {
    // Provisional lookahead: the number the next final will take.
    let segment_no = state.registry.provisional_segment_no(meeting_id);
    let segment = TranscriptSegment::new(
        meeting_id,
        segment_no,
        source,
        seg.start_ms,
        seg.end_ms,
        seg.speaker,
        seg.text,
        seg.confidence,
        false,
    );
    state.bus.publish(
        &transcript_channel(meeting_id),
        &RelayMessage::TranscriptPartial(segment.envelope()),
    );
}

fn publish_final(state: &RelayState, meeting_id: &str, source: AudioSource, seg: AsrSegment) {
    let segment_no = state.registry.next_segment_no(meeting_id);
    let segment = TranscriptSegment::new(
        meeting_id,
        segment_no,
        source,
        seg.start_ms,
        seg.end_ms,
        seg.speaker,
        seg.text,
        seg.confidence,
        true,
    );

    // Persist concurrently with publish; a store failure is logged, never
    // allowed to suppress delivery.
    if let Some(store) = &state.store {
        let store = store.clone();
        let row = segment.clone();
        let raw = seg.raw;
        tokio::spawn(async move {
            if let Err(e) = store.append_final(&row, &raw).await {
                metrics::counter!("relay_store_append_failures_total", 1);
                warn!(
                    meeting_id = %row.meeting_id,
                    segment_no = row.segment_no,
                    error = %e,
                    "final segment not persisted"
                );
            }
        });
    }

    state.bus.publish(
        &transcript_channel(meeting_id),
        &RelayMessage::TranscriptFinal(segment.envelope()),
    );
}
