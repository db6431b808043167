use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Full environment-driven configuration for the relay.
///
/// Missing ASR credentials or an unusable auth configuration are fatal at
/// startup; everything else falls back to documented defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub max_subscribers_per_meeting: usize,
    pub max_ingest_frame_bytes: usize,
    pub ingest_sample_rate_hz: u32,
    pub ingest_channels: u16,

    pub idle_timeout: Duration,
    pub handshake_timeout: Duration,
    pub finalize_grace: Duration,
    pub shutdown_grace: Duration,

    pub rate_limit_window: Duration,
    pub rate_limit_max_conns: u32,

    /// Outbound queue depth per subscriber before it is closed as a slow
    /// consumer.
    pub subscriber_queue_len: usize,
    /// Serialized envelope size cap; larger envelopes are truncated.
    pub envelope_max_bytes: usize,

    pub asr: AsrProviderConfig,
    pub pubsub: PubSubConfig,
    pub auth: AuthConfig,
    /// Postgres URL for the transcript store. When absent the relay runs
    /// without durable persistence and reports the store as unavailable.
    pub transcript_store_url: Option<String>,

    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct AsrProviderConfig {
    pub provider_url: String,
    pub api_key: String,
    pub model: String,
    pub language_default: String,
    pub endpointing_ms: u32,
}

#[derive(Debug, Clone)]
pub struct PubSubConfig {
    pub url: String,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub audience: String,
    pub issuer: String,
    pub public_key_path: Option<PathBuf>,
    pub hmac_secret: Option<String>,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(env_or(name, default))
}

impl RelayConfig {
    pub fn from_env() -> Result<Self> {
        let asr = AsrProviderConfig {
            provider_url: std::env::var("ASR_PROVIDER_URL")
                .unwrap_or_else(|_| "wss://api.deepgram.com/v1/listen".to_string()),
            api_key: std::env::var("ASR_API_KEY").context("ASR_API_KEY must be set")?,
            model: std::env::var("ASR_MODEL").unwrap_or_else(|_| "nova-2".to_string()),
            language_default: std::env::var("ASR_LANGUAGE_DEFAULT")
                .unwrap_or_else(|_| "en".to_string()),
            endpointing_ms: env_or("ASR_ENDPOINTING_MS", 300),
        };

        let pubsub = PubSubConfig {
            url: std::env::var("PUBSUB_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            password: std::env::var("PUBSUB_PASSWORD").ok(),
        };

        let auth = AuthConfig {
            audience: std::env::var("AUTH_AUDIENCE").context("AUTH_AUDIENCE must be set")?,
            issuer: std::env::var("AUTH_ISSUER").context("AUTH_ISSUER must be set")?,
            public_key_path: std::env::var("AUTH_PUBLIC_KEY_PATH").ok().map(PathBuf::from),
            hmac_secret: std::env::var("AUTH_HMAC_SECRET").ok(),
        };
        if auth.public_key_path.is_none() && auth.hmac_secret.is_none() {
            bail!("one of AUTH_PUBLIC_KEY_PATH or AUTH_HMAC_SECRET must be set");
        }

        Ok(Self {
            max_subscribers_per_meeting: env_or("MAX_SUBSCRIBERS_PER_MEETING", 20),
            max_ingest_frame_bytes: env_or("MAX_INGEST_FRAME_BYTES", 32_768),
            ingest_sample_rate_hz: env_or("INGEST_SAMPLE_RATE_HZ", 16_000),
            ingest_channels: env_or("INGEST_CHANNELS", 1),
            idle_timeout: env_secs("IDLE_TIMEOUT_S", 30),
            handshake_timeout: env_secs("HANDSHAKE_TIMEOUT_S", 10),
            finalize_grace: env_secs("FINALIZE_GRACE_S", 1),
            shutdown_grace: env_secs("SHUTDOWN_GRACE_S", 5),
            rate_limit_window: env_secs("RATE_LIMIT_WINDOW_S", 10),
            rate_limit_max_conns: env_or("RATE_LIMIT_MAX_CONNS", 5),
            subscriber_queue_len: 256,
            envelope_max_bytes: 64 * 1024,
            asr,
            pubsub,
            auth,
            transcript_store_url: std::env::var("TRANSCRIPT_STORE_URL").ok(),
            port: env_or("SERVER_PORT", 8080),
        })
    }

    /// Configuration suitable for in-process tests: no broker, no store,
    /// shared-secret auth.
    pub fn for_tests(hmac_secret: &str, audience: &str, issuer: &str) -> Self {
        Self {
            max_subscribers_per_meeting: 20,
            max_ingest_frame_bytes: 32_768,
            ingest_sample_rate_hz: 16_000,
            ingest_channels: 1,
            idle_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            finalize_grace: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(5),
            rate_limit_window: Duration::from_secs(10),
            rate_limit_max_conns: 100,
            subscriber_queue_len: 256,
            envelope_max_bytes: 64 * 1024,
            asr: AsrProviderConfig {
                provider_url: "ws://127.0.0.1:1".to_string(),
                api_key: "test-key".to_string(),
                model: "nova-2".to_string(),
                language_default: "en".to_string(),
                endpointing_ms: 300,
            },
            pubsub: PubSubConfig {
                url: "redis://127.0.0.1:6379".to_string(),
                password: None,
            },
            auth: AuthConfig {
                audience: audience.to_string(),
                issuer: issuer.to_string(),
                public_key_path: None,
                hmac_secret: Some(hmac_secret.to_string()),
            },
            transcript_store_url: None,
            port: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_default() {
        assert_eq!(env_or("MURMUR_UNSET_VARIABLE", 42u32), 42);
    }

    #[test]
    fn test_for_tests_defaults() {
        let cfg = RelayConfig::for_tests("s3cret", "murmur", "https://auth.murmur.dev");
        assert_eq!(cfg.max_subscribers_per_meeting, 20);
        assert_eq!(cfg.max_ingest_frame_bytes, 32_768);
        assert_eq!(cfg.ingest_sample_rate_hz, 16_000);
        assert_eq!(cfg.auth.hmac_secret.as_deref(), Some("s3cret"));
        assert!(cfg.transcript_store_url.is_none());
    }
}
