//! Relay wiring: shared state, admission control, routes, lifecycle.
//!
//! The process-wide singletons (verifier, registry, bus, store) live here
//! and are handed to sessions through the axum state. Shutdown runs in two
//! stages so ingests can flush trailing finals before their subscribers are
//! told goodbye.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::TokenVerifier;
use crate::config::RelayConfig;
use crate::health;
use crate::pubsub::PubSubBus;
use crate::realtime;
use crate::registry::{MeetingStats, SessionRegistry};
use crate::store::TranscriptStore;

/// Sliding-window connection-attempt limiter, keyed per `(meeting, source)`
/// tuple and per principal.
pub struct AdmissionLimiter {
    window: Duration,
    max_conns: usize,
    attempts: DashMap<String, VecDeque<Instant>>,
}

impl AdmissionLimiter {
    pub fn new(window: Duration, max_conns: u32) -> Self {
        Self {
            window,
            max_conns: max_conns.max(1) as usize,
            attempts: DashMap::new(),
        }
    }

    /// Records one attempt for `key` and reports whether it is admitted.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut window = self.attempts.entry(key.to_string()).or_default();
        while window
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            window.pop_front();
        }
        if window.len() >= self.max_conns {
            return false;
        }
        window.push_back(now);
        true
    }

    /// Drops windows with no attempt inside the window; called periodically.
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.attempts
            .retain(|_, w| w.back().is_some_and(|t| now.duration_since(*t) < self.window));
    }
}

/// Process-wide relay state shared with every session handler.
#[derive(Clone)]
pub struct RelayState {
    pub cfg: Arc<RelayConfig>,
    pub verifier: Arc<TokenVerifier>,
    pub registry: Arc<SessionRegistry>,
    pub bus: Arc<PubSubBus>,
    pub store: Option<Arc<TranscriptStore>>,
    pub admission: Arc<AdmissionLimiter>,
    draining: Arc<AtomicBool>,
    pub ingest_shutdown: CancellationToken,
    pub subscriber_shutdown: CancellationToken,
    pub tracker: TaskTracker,
}

impl RelayState {
    pub fn new(
        cfg: RelayConfig,
        verifier: TokenVerifier,
        bus: PubSubBus,
        store: Option<TranscriptStore>,
    ) -> Self {
        let admission = AdmissionLimiter::new(cfg.rate_limit_window, cfg.rate_limit_max_conns);
        let registry = SessionRegistry::new(
            cfg.max_subscribers_per_meeting,
            Duration::from_secs(1),
        );
        Self {
            cfg: Arc::new(cfg),
            verifier: Arc::new(verifier),
            registry,
            bus: Arc::new(bus),
            store: store.map(Arc::new),
            admission: Arc::new(admission),
            draining: Arc::new(AtomicBool::new(false)),
            ingest_shutdown: CancellationToken::new(),
            subscriber_shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// True once shutdown began; no new connections are admitted.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Relaxed)
    }

    pub fn admission_key_meeting(meeting_id: &str, source: &str) -> String {
        format!("meeting:{meeting_id}:{source}")
    }

    pub fn admission_key_principal(user_id: &str) -> String {
        format!("principal:{user_id}")
    }

    /// Two-stage graceful shutdown: finalize ingests, let trailing finals
    /// drain, then close subscribers and wait out the session tasks.
    pub async fn graceful_shutdown(&self) {
        info!("relay shutdown started, draining sessions");
        self.draining.store(true, Ordering::Relaxed);

        self.ingest_shutdown.cancel();
        tokio::time::sleep(self.cfg.finalize_grace).await;
        self.subscriber_shutdown.cancel();

        self.tracker.close();
        if tokio::time::timeout(self.cfg.shutdown_grace, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("session tasks outlived the shutdown grace, aborting");
        }
        self.bus.close();
        info!("relay shutdown complete");
    }
}

/// Builds the public route surface.
pub fn router(state: RelayState) -> Router {
    Router::new()
        .route(
            "/api/v1/ws/ingest/meetings/{meeting_id}",
            get(realtime::ingest::ingest_meeting),
        )
        .route(
            "/api/v1/ws/meetings/{meeting_id}",
            get(realtime::subscriber::subscribe_meeting),
        )
        .route(
            "/api/v1/ws/meetings/{meeting_id}/stats",
            get(meeting_stats),
        )
        .route("/api/v1/health", get(health::health))
        .route("/api/v1/health/live", get(health::liveness))
        .route("/api/v1/health/ready", get(health::readiness))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Read-only per-meeting stats for external collaborators.
async fn meeting_stats(
    State(state): State<RelayState>,
    Path(meeting_id): Path<String>,
) -> Json<MeetingStats> {
    Json(state.registry.stats(&meeting_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_admission_limiter_window() {
        let limiter = AdmissionLimiter::new(Duration::from_secs(10), 5);

        for _ in 0..5 {
            assert!(limiter.check("meeting:m1:mic"));
        }
        assert!(!limiter.check("meeting:m1:mic"));
        // A different key has its own window.
        assert!(limiter.check("meeting:m2:mic"));

        // Attempts expire once the window slides past them.
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(limiter.check("meeting:m1:mic"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_limiter_slides_not_resets() {
        let limiter = AdmissionLimiter::new(Duration::from_secs(10), 2);

        assert!(limiter.check("k"));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(limiter.check("k"));
        assert!(!limiter.check("k"));

        // First attempt ages out at t=10; the second is still inside.
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(limiter.check("k"));
        assert!(!limiter.check("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_cleanup_drops_idle_keys() {
        let limiter = AdmissionLimiter::new(Duration::from_secs(10), 5);
        assert!(limiter.check("idle"));
        tokio::time::advance(Duration::from_secs(20)).await;
        limiter.cleanup();
        assert!(limiter.attempts.is_empty());
    }
}
