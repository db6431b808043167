//! Subscriber side of the relay: authenticated WebSocket consumers that
//! receive every envelope published on their meeting's channel.
//!
//! Each subscriber owns a bounded outbound queue; a consumer that stops
//! reading is closed with "slow consumer" instead of ever back-pressuring
//! the ingest path.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth;
use crate::models::{transcript_channel, RelayMessage};
use crate::realtime::{self, close, encode_envelope, WsQuery};
use crate::registry::SubscriberAttach;
use crate::service::RelayState;

/// GET /api/v1/ws/meetings/{meeting_id} — WebSocket upgrade for a
/// transcript subscriber.
pub async fn subscribe_meeting(
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
    let tracker = state.tracker.clone();
    ws.on_upgrade(move |socket| {
        tracker.track_future(handle_subscriber(socket, state, meeting_id, token))
    })
}

async fn handle_subscriber(
    socket: WebSocket,
    state: RelayState,
    meeting_id: String,
    token: Option<String>,
) {
    let (mut sender, mut receiver) = socket.split();

    // Admission. The WebSocket handshake is already complete, so a rejection
    // is a proper close frame, never a bare TCP drop.
    let principal = match token.as_deref().map(|t| state.verifier.verify(t)) {
        Some(Ok(principal)) => principal,
        Some(Err(e)) => {
            debug!(meeting_id, error = %e, "subscriber auth failed");
            realtime::close_socket(&mut sender, close::AUTH_FAILED, "auth failed").await;
            return;
        }
        None => {
            realtime::close_socket(&mut sender, close::AUTH_FAILED, "auth failed").await;
            return;
        }
    };

    if !state
        .admission
        .check(&RelayState::admission_key_principal(&principal.user_id))
    {
        realtime::close_socket(&mut sender, close::TRY_AGAIN_LATER, "try again later").await;
        return;
    }

    let session_id = Uuid::new_v4();
    match state.registry.attach_subscriber(&meeting_id, session_id) {
        SubscriberAttach::Attached => {}
        SubscriberAttach::OverLimit => {
            info!(meeting_id, user = %principal.user_id, "subscriber limit reached");
            realtime::close_socket(&mut sender, close::SUBSCRIBER_LIMIT, "connection limit").await;
            return;
        }
    }
    metrics::counter!("relay_subscriber_sessions_total", 1);
    info!(
        meeting_id,
        session = %session_id,
        user = %principal.user_id,
        "subscriber attached"
    );

    // Bridge the bus subscription into this session's bounded queue. The
    // pump owns the subscription, so aborting it also releases the
    // broker-side registration.
    let mut subscription = state.bus.subscribe(&transcript_channel(&meeting_id));
    let (out_tx, mut out_rx) = mpsc::channel::<RelayMessage>(state.cfg.subscriber_queue_len);
    let overflow = CancellationToken::new();
    let overflow_signal = overflow.clone();
    let pump = tokio::spawn(async move {
        loop {
            match subscription.recv().await {
                Ok(envelope) => match out_tx.try_send(envelope) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        overflow_signal.cancel();
                        break;
                    }
                    Err(TrySendError::Closed(_)) => break,
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged = n, "subscriber lagged behind the channel buffer");
                    overflow_signal.cancel();
                    break;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let idle = state.cfg.idle_timeout;
    let mut heartbeat = interval_at(Instant::now() + idle, idle);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_inbound = Instant::now();
    let mut pending_pings: u8 = 0;

    let close_info: Option<(u16, String)> = loop {
        tokio::select! {
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Close(_))) | None => break None,
                Some(Ok(_frame)) => {
                    // Any inbound frame (including the app-level "pong")
                    // proves the client is alive.
                    last_inbound = Instant::now();
                    pending_pings = 0;
                }
                Some(Err(e)) => {
                    debug!(meeting_id, error = %e, "subscriber read failed");
                    break None;
                }
            },
            envelope = out_rx.recv() => match envelope {
                Some(envelope) => {
                    let frame = encode_envelope(&envelope, state.cfg.envelope_max_bytes);
                    if sender.send(Message::Text(frame.into())).await.is_err() {
                        break None;
                    }
                }
                None => {
                    if overflow.is_cancelled() {
                        break Some((close::INTERNAL_ERROR, "slow consumer".to_string()));
                    }
                    break Some((close::INTERNAL_ERROR, "stream ended".to_string()));
                }
            },
            _ = overflow.cancelled() => {
                metrics::counter!("relay_slow_consumer_closes_total", 1);
                break Some((close::INTERNAL_ERROR, "slow consumer".to_string()));
            }
            _ = heartbeat.tick() => {
                if last_inbound.elapsed() >= idle {
                    if pending_pings >= 2 {
                        break Some((close::GOING_AWAY, "idle timeout".to_string()));
                    }
                    pending_pings += 1;
                    if sender.send(Message::Text("ping".into())).await.is_err() {
                        break None;
                    }
                }
            }
            _ = state.subscriber_shutdown.cancelled() => {
                // Flush anything already queued, then say goodbye.
                while let Ok(envelope) = out_rx.try_recv() {
                    let frame = encode_envelope(&envelope, state.cfg.envelope_max_bytes);
                    if sender.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                let status =
                    RelayMessage::status(&meeting_id, "shutting_down", "relay shutting down");
                let frame = encode_envelope(&status, state.cfg.envelope_max_bytes);
                let _ = sender.send(Message::Text(frame.into())).await;
                break Some((close::GOING_AWAY, "server shutdown".to_string()));
            }
        }
    };

    if let Some((code, reason)) = close_info {
        realtime::close_socket(&mut sender, code, &reason).await;
    }
    pump.abort();
    state.registry.detach_subscriber(&meeting_id, session_id);
    info!(meeting_id, session = %session_id, "subscriber detached");
}
