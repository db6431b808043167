use axum::{routing::get, Router};
use std::net::SocketAddr;
use tokio::time::{interval, Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use murmur_relay::{
    auth::TokenVerifier, config::RelayConfig, metrics, pubsub::PubSubBus, service,
    store::TranscriptStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Default to warn in production, debug in development
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        {
            "debug".to_string()
        }

        #[cfg(not(debug_assertions))]
        {
            "warn".to_string()
        }
    });

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_level))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("Starting Murmur transcription relay");

    // Configuration errors are the only fatal startup condition.
    let cfg = RelayConfig::from_env()?;
    tracing::info!(
        sample_rate = cfg.ingest_sample_rate_hz,
        channels = cfg.ingest_channels,
        max_frame_bytes = cfg.max_ingest_frame_bytes,
        subscriber_cap = cfg.max_subscribers_per_meeting,
        "Relay configuration loaded"
    );

    // Initialize metrics
    let metrics_recorder = metrics::MetricsRecorder::new();
    let metrics_handle = metrics_recorder.handle().clone();
    tracing::info!("Metrics initialized");

    let verifier = TokenVerifier::from_config(&cfg.auth)?;
    tracing::info!(
        audience = %cfg.auth.audience,
        issuer = %cfg.auth.issuer,
        asymmetric = cfg.auth.public_key_path.is_some(),
        "Token verifier initialized"
    );

    // The broker reconnects in the background; a broker that is down at
    // boot only degrades health.
    let bus = PubSubBus::connect(&cfg.pubsub)?;
    tracing::info!(url = %cfg.pubsub.url, "Pub/sub bus started");

    let store = match &cfg.transcript_store_url {
        Some(url) => {
            let store = TranscriptStore::connect(url)?;
            tracing::info!("Transcript store configured");
            Some(store)
        }
        None => {
            tracing::warn!("TRANSCRIPT_STORE_URL not set, finals will not be persisted");
            None
        }
    };

    let port = cfg.port;
    let state = service::RelayState::new(cfg, verifier, bus, store);

    // Bring up the transcript schema without blocking boot.
    if let Some(store) = state.store.clone() {
        tokio::spawn(async move {
            if let Err(e) = store.ensure_schema().await {
                tracing::error!(error = %e, "Failed to ensure transcript schema");
            }
        });
    }

    // Spawn admission limiter cleanup worker (drop stale windows every 5 minutes)
    let admission = state.admission.clone();
    tokio::spawn(async move {
        let mut interval_timer = interval(Duration::from_secs(300));
        loop {
            interval_timer.tick().await;
            admission.cleanup();
            tracing::debug!("Admission limiter cleanup completed");
        }
    });
    tracing::info!("Admission limiter cleanup worker started");

    // Only expose metrics when explicitly enabled
    let metrics_router = if matches!(
        std::env::var("ENABLE_METRICS").as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes") | Ok("YES")
    ) {
        Router::new()
            .route("/metrics", get(metrics::metrics_handler))
            .with_state(metrics_handle)
    } else {
        Router::new()
    };

    let app = service::router(state.clone()).merge(metrics_router);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Relay listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // On SIGINT: stop admitting, finalize ingests, flush trailing finals,
    // close subscribers, then let serve() return.
    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown_state.graceful_shutdown().await;
        })
        .await?;

    Ok(())
}
