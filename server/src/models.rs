//! Wire and domain types shared across the relay.
//!
//! All fan-out envelopes are internally tagged on `type` so subscriber
//! decoders stay total: an unknown tag fails the whole decode instead of
//! producing a half-parsed map.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pub/sub channel carrying transcript envelopes for a meeting.
pub fn transcript_channel(meeting_id: &str) -> String {
    format!("meeting:{meeting_id}:transcript")
}

/// Which capture path produced the audio for a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioSource {
    Mic,
    #[serde(alias = "sys")]
    System,
}

impl AudioSource {
    /// Parses the `source` query parameter (`mic`, `sys`, `system`).
    pub fn parse_param(raw: &str) -> Option<Self> {
        match raw {
            "mic" => Some(Self::Mic),
            "sys" | "system" => Some(Self::System),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mic => "mic",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for AudioSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transcription language requested at handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Tr,
    En,
    #[default]
    Auto,
}

impl Language {
    /// Concrete language code for the ASR session; `auto` falls back to the
    /// configured default.
    pub fn provider_code(&self, default: &str) -> String {
        match self {
            Self::Tr => "tr".to_string(),
            Self::En => "en".to_string(),
            Self::Auto => default.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AiMode {
    #[default]
    Standard,
    Super,
}

/// First text frame on an ingest connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestHandshake {
    pub source: AudioSource,
    pub sample_rate_hz: u32,
    pub channels: u16,
    #[serde(default)]
    pub language: Language,
    #[serde(default)]
    pub ai_mode: AiMode,
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Text frames an ingest client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IngestClientFrame {
    Handshake(IngestHandshake),
    Finalize,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Success,
    Error,
}

/// Reply to the ingest handshake, sent exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "handshake_ack")]
pub struct HandshakeAck {
    pub status: AckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl HandshakeAck {
    pub fn success(session_id: String) -> Self {
        Self {
            status: AckStatus::Success,
            message: None,
            session_id: Some(session_id),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Error,
            message: Some(message.into()),
            session_id: None,
        }
    }
}

/// Envelope metadata; `source` labels the capture path, extra fields pass
/// through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMeta {
    pub source: AudioSource,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl EnvelopeMeta {
    pub fn for_source(source: AudioSource) -> Self {
        Self {
            source,
            extra: serde_json::Map::new(),
        }
    }
}

/// Transcript payload shared by partial and final envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEnvelope {
    pub meeting_id: String,
    pub segment_no: u64,
    pub start_ms: u64,
    pub end_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    pub ts: DateTime<Utc>,
    pub meta: EnvelopeMeta,
}

/// Fan-out envelope delivered to subscribers, tagged on `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RelayMessage {
    #[serde(rename = "transcript.partial")]
    TranscriptPartial(TranscriptEnvelope),
    #[serde(rename = "transcript.final")]
    TranscriptFinal(TranscriptEnvelope),
    #[serde(rename = "status")]
    Status {
        meeting_id: String,
        status: String,
        message: String,
        ts: DateTime<Utc>,
        meta: serde_json::Map<String, serde_json::Value>,
    },
    #[serde(rename = "ai.tip")]
    AiTip {
        meeting_id: String,
        tip: String,
        category: String,
        ts: DateTime<Utc>,
        meta: serde_json::Map<String, serde_json::Value>,
    },
    #[serde(rename = "error")]
    Error {
        code: String,
        message: String,
        ts: DateTime<Utc>,
    },
}

impl RelayMessage {
    pub fn status(meeting_id: &str, status: &str, message: impl Into<String>) -> Self {
        Self::Status {
            meeting_id: meeting_id.to_string(),
            status: status.to_string(),
            message: message.into(),
            ts: Utc::now(),
            meta: serde_json::Map::new(),
        }
    }

    pub fn meeting_id(&self) -> Option<&str> {
        match self {
            Self::TranscriptPartial(t) | Self::TranscriptFinal(t) => Some(&t.meeting_id),
            Self::Status { meeting_id, .. } | Self::AiTip { meeting_id, .. } => Some(meeting_id),
            Self::Error { .. } => None,
        }
    }
}

/// Final transcript segment as handed to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptSegment {
    pub meeting_id: String,
    pub segment_no: u64,
    pub source: AudioSource,
    pub start_ms: u64,
    pub end_ms: u64,
    pub speaker: Option<String>,
    pub text: String,
    pub confidence: Option<f32>,
    pub is_final: bool,
    pub created_at: DateTime<Utc>,
}

impl TranscriptSegment {
    /// Builds a segment, clamping `end_ms` up to `start_ms` so the
    /// `start_ms <= end_ms` invariant holds even for degenerate provider
    /// timings.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        meeting_id: &str,
        segment_no: u64,
        source: AudioSource,
        start_ms: u64,
        end_ms: u64,
        speaker: Option<String>,
        text: String,
        confidence: Option<f32>,
        is_final: bool,
    ) -> Self {
        Self {
            meeting_id: meeting_id.to_string(),
            segment_no,
            source,
            start_ms,
            end_ms: end_ms.max(start_ms),
            speaker,
            text,
            confidence,
            is_final,
            created_at: Utc::now(),
        }
    }

    pub fn envelope(&self) -> TranscriptEnvelope {
        TranscriptEnvelope {
            meeting_id: self.meeting_id.clone(),
            segment_no: self.segment_no,
            start_ms: self.start_ms,
            end_ms: self.end_ms,
            speaker: self.speaker.clone(),
            text: self.text.clone(),
            confidence: self.confidence,
            ts: self.created_at,
            meta: EnvelopeMeta::for_source(self.source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_parses() {
        let raw = r#"{"type":"handshake","source":"mic","sample_rate_hz":16000,"channels":1,"language":"en","ai_mode":"standard","device_id":"dev-1"}"#;
        let frame: IngestClientFrame = serde_json::from_str(raw).unwrap();
        match frame {
            IngestClientFrame::Handshake(hs) => {
                assert_eq!(hs.source, AudioSource::Mic);
                assert_eq!(hs.sample_rate_hz, 16000);
                assert_eq!(hs.channels, 1);
                assert_eq!(hs.language, Language::En);
            }
            other => panic!("expected handshake, got {other:?}"),
        }
    }

    #[test]
    fn test_control_frames_parse() {
        let fin: IngestClientFrame = serde_json::from_str(r#"{"type":"finalize"}"#).unwrap();
        assert_eq!(fin, IngestClientFrame::Finalize);
        let close: IngestClientFrame = serde_json::from_str(r#"{"type":"close"}"#).unwrap();
        assert_eq!(close, IngestClientFrame::Close);
    }

    #[test]
    fn test_source_aliases() {
        assert_eq!(AudioSource::parse_param("mic"), Some(AudioSource::Mic));
        assert_eq!(AudioSource::parse_param("sys"), Some(AudioSource::System));
        assert_eq!(AudioSource::parse_param("system"), Some(AudioSource::System));
        assert_eq!(AudioSource::parse_param("midi"), None);

        let hs: IngestHandshake =
            serde_json::from_str(r#"{"source":"sys","sample_rate_hz":16000,"channels":1}"#).unwrap();
        assert_eq!(hs.source, AudioSource::System);
        assert_eq!(hs.language, Language::Auto);
    }

    #[test]
    fn test_envelope_round_trip() {
        let msg = RelayMessage::TranscriptFinal(TranscriptEnvelope {
            meeting_id: "m1".into(),
            segment_no: 3,
            start_ms: 400,
            end_ms: 900,
            speaker: Some("0".into()),
            text: "world".into(),
            confidence: Some(0.97),
            ts: Utc::now(),
            meta: EnvelopeMeta::for_source(AudioSource::Mic),
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"transcript.final""#));
        let back: RelayMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn test_status_round_trip() {
        let msg = RelayMessage::status("m1", "asr_degraded", "provider reconnecting");
        let json = serde_json::to_string(&msg).unwrap();
        let back: RelayMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
        assert_eq!(back.meeting_id(), Some("m1"));
    }

    #[test]
    fn test_tip_and_error_envelopes_decode() {
        let tip = r#"{"type":"ai.tip","meeting_id":"m1","tip":"ask for numbers","category":"coaching","ts":"2026-08-01T10:00:00Z","meta":{}}"#;
        let decoded: RelayMessage = serde_json::from_str(tip).unwrap();
        assert!(matches!(decoded, RelayMessage::AiTip { .. }));

        let error = r#"{"type":"error","code":"bad_frame","message":"nope","ts":"2026-08-01T10:00:00Z"}"#;
        let decoded: RelayMessage = serde_json::from_str(error).unwrap();
        assert_eq!(decoded.meeting_id(), None);

        // Unknown tags fail the decode outright instead of half-parsing.
        let unknown = r#"{"type":"transcript.diff","meeting_id":"m1"}"#;
        assert!(serde_json::from_str::<RelayMessage>(unknown).is_err());
    }

    #[test]
    fn test_segment_end_clamped() {
        let seg = TranscriptSegment::new(
            "m1",
            1,
            AudioSource::System,
            500,
            200,
            None,
            "x".into(),
            None,
            true,
        );
        assert_eq!(seg.start_ms, 500);
        assert_eq!(seg.end_ms, 500);
    }

    #[test]
    fn test_handshake_ack_shape() {
        let ok = serde_json::to_value(HandshakeAck::success("s-1".into())).unwrap();
        assert_eq!(ok["type"], "handshake_ack");
        assert_eq!(ok["status"], "success");
        assert_eq!(ok["session_id"], "s-1");
        assert!(ok.get("message").is_none());

        let err = serde_json::to_value(HandshakeAck::error("wrong sample rate")).unwrap();
        assert_eq!(err["status"], "error");
        assert_eq!(err["message"], "wrong sample rate");
    }
}
