use axum::{http::StatusCode, response::IntoResponse};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct MetricsRecorder {
    handle: PrometheusHandle,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder");

        metrics::describe_counter!(
            "relay_ingest_sessions_total",
            "Total number of ingest sessions admitted"
        );
        metrics::describe_counter!(
            "relay_subscriber_sessions_total",
            "Total number of subscriber sessions admitted"
        );
        metrics::describe_counter!(
            "relay_oversized_frames_total",
            "PCM frames dropped for exceeding the frame size cap"
        );
        metrics::describe_counter!(
            "relay_publish_dropped_total",
            "Envelopes dropped because the broker was unreachable"
        );
        metrics::describe_counter!(
            "relay_asr_reconnects_total",
            "Reconnects to the upstream ASR provider"
        );
        metrics::describe_counter!(
            "relay_store_append_failures_total",
            "Final segments that failed to persist"
        );
        metrics::describe_counter!(
            "relay_slow_consumer_closes_total",
            "Subscribers closed for not draining their queue"
        );

        Self { handle }
    }

    pub fn handle(&self) -> &PrometheusHandle {
        &self.handle
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler for the Prometheus metrics endpoint
pub async fn metrics_handler(handle: axum::extract::State<PrometheusHandle>) -> impl IntoResponse {
    let metrics = handle.render();
    (StatusCode::OK, metrics)
}
