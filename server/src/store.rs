//! Durable append-only record of final transcript segments.

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

use crate::models::TranscriptSegment;

/// Postgres-backed transcript store. The pool connects lazily so a database
/// that is down at boot only degrades health instead of aborting startup.
pub struct TranscriptStore {
    pool: PgPool,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS transcript_segments (
    meeting_id   TEXT        NOT NULL,
    segment_no   BIGINT      NOT NULL,
    source       TEXT        NOT NULL,
    start_ms     BIGINT      NOT NULL,
    end_ms       BIGINT      NOT NULL,
    speaker      TEXT,
    text         TEXT        NOT NULL,
    confidence   REAL,
    is_final     BOOLEAN     NOT NULL,
    created_at   TIMESTAMPTZ NOT NULL,
    provider_raw JSONB,
    PRIMARY KEY (meeting_id, segment_no)
)
"#;

fn as_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

impl TranscriptStore {
    pub fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(600))
            .connect_lazy(database_url)
            .context("invalid TRANSCRIPT_STORE_URL")?;
        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .context("failed to create transcript schema")?;
        Ok(())
    }

    /// Appends one final segment. `(meeting_id, segment_no)` is unique and
    /// replays are idempotent: a duplicate append leaves the original row.
    pub async fn append_final(
        &self,
        segment: &TranscriptSegment,
        provider_raw: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO transcript_segments \
             (meeting_id, segment_no, source, start_ms, end_ms, speaker, text, \
              confidence, is_final, created_at, provider_raw) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11::jsonb) \
             ON CONFLICT (meeting_id, segment_no) DO NOTHING",
        )
        .bind(&segment.meeting_id)
        .bind(as_i64(segment.segment_no))
        .bind(segment.source.as_str())
        .bind(as_i64(segment.start_ms))
        .bind(as_i64(segment.end_ms))
        .bind(&segment.speaker)
        .bind(&segment.text)
        .bind(segment.confidence)
        .bind(segment.is_final)
        .bind(segment.created_at)
        .bind(provider_raw.to_string())
        .execute(&self.pool)
        .await
        .context("append_final insert failed")?;
        Ok(())
    }

    /// Connectivity probe for the health endpoint.
    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}
