//! Provider wire format for the streaming STT session.
//!
//! The provider speaks JSON text frames downstream: `Results` messages carry
//! interim and final transcripts, `Metadata`/`UtteranceEnd`/`SpeechStarted`
//! are bookkeeping, and `Error` is terminal for the session. Empty
//! transcripts are suppressed before they reach the relay.

use serde::Deserialize;
use serde_json::Value;

use super::AsrSegment;

#[derive(Debug)]
pub(crate) enum ProviderEvent {
    Result { is_final: bool, segment: AsrSegment },
    Error(String),
    Ignored,
}

#[derive(Debug, Deserialize)]
struct ProviderMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    start: Option<f64>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    is_final: Option<bool>,
    #[serde(default)]
    channel: Option<ProviderChannel>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProviderChannel {
    #[serde(default)]
    alternatives: Vec<ProviderAlternative>,
}

#[derive(Debug, Deserialize)]
struct ProviderAlternative {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    words: Vec<ProviderWord>,
}

#[derive(Debug, Deserialize)]
struct ProviderWord {
    #[serde(default)]
    speaker: Option<u32>,
}

fn to_ms(seconds: f64) -> u64 {
    if seconds.is_finite() && seconds > 0.0 {
        (seconds * 1000.0).round() as u64
    } else {
        0
    }
}

/// Parses one provider text frame. Unknown message kinds and empty
/// transcripts are ignored rather than treated as errors so a provider-side
/// protocol addition never kills a live session.
pub(crate) fn parse_provider_text(text: &str) -> ProviderEvent {
    let raw: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return ProviderEvent::Ignored,
    };
    let msg: ProviderMessage = match serde_json::from_value(raw.clone()) {
        Ok(m) => m,
        Err(_) => return ProviderEvent::Ignored,
    };

    match msg.kind.as_str() {
        "Results" => {
            let Some(channel) = msg.channel else {
                return ProviderEvent::Ignored;
            };
            let Some(alt) = channel.alternatives.into_iter().next() else {
                return ProviderEvent::Ignored;
            };
            let text = alt.transcript.trim().to_string();
            if text.is_empty() {
                return ProviderEvent::Ignored;
            }

            let start_ms = to_ms(msg.start.unwrap_or(0.0));
            let end_ms = start_ms + to_ms(msg.duration.unwrap_or(0.0));
            let speaker = alt
                .words
                .first()
                .and_then(|w| w.speaker)
                .map(|s| s.to_string());

            ProviderEvent::Result {
                is_final: msg.is_final.unwrap_or(false),
                segment: AsrSegment {
                    text,
                    start_ms,
                    end_ms,
                    confidence: alt.confidence,
                    speaker,
                    raw,
                },
            }
        }
        "Error" => ProviderEvent::Error(
            msg.description
                .or(msg.message)
                .unwrap_or_else(|| "provider error".to_string()),
        ),
        // Metadata, UtteranceEnd, SpeechStarted and friends.
        _ => ProviderEvent::Ignored,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results_json(transcript: &str, is_final: bool) -> String {
        format!(
            r#"{{"type":"Results","start":1.5,"duration":0.5,"is_final":{is_final},
                "channel":{{"alternatives":[{{"transcript":"{transcript}","confidence":0.92,
                "words":[{{"word":"w","start":1.5,"end":2.0,"speaker":3}}]}}]}}}}"#
        )
    }

    #[test]
    fn test_parse_final_result() {
        match parse_provider_text(&results_json("hello world", true)) {
            ProviderEvent::Result { is_final, segment } => {
                assert!(is_final);
                assert_eq!(segment.text, "hello world");
                assert_eq!(segment.start_ms, 1500);
                assert_eq!(segment.end_ms, 2000);
                assert_eq!(segment.confidence, Some(0.92));
                assert_eq!(segment.speaker.as_deref(), Some("3"));
            }
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_partial_result() {
        match parse_provider_text(&results_json("hel", false)) {
            ProviderEvent::Result { is_final, segment } => {
                assert!(!is_final);
                assert_eq!(segment.text, "hel");
            }
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_transcript_suppressed() {
        assert!(matches!(
            parse_provider_text(&results_json("", true)),
            ProviderEvent::Ignored
        ));
        assert!(matches!(
            parse_provider_text(&results_json("   ", false)),
            ProviderEvent::Ignored
        ));
    }

    #[test]
    fn test_metadata_ignored() {
        assert!(matches!(
            parse_provider_text(r#"{"type":"Metadata","request_id":"r1"}"#),
            ProviderEvent::Ignored
        ));
        assert!(matches!(
            parse_provider_text(r#"{"type":"UtteranceEnd","last_word_end":2.0}"#),
            ProviderEvent::Ignored
        ));
    }

    #[test]
    fn test_error_message() {
        match parse_provider_text(r#"{"type":"Error","description":"bad encoding"}"#) {
            ProviderEvent::Error(reason) => assert_eq!(reason, "bad encoding"),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn test_garbage_ignored() {
        assert!(matches!(
            parse_provider_text("not json"),
            ProviderEvent::Ignored
        ));
        assert!(matches!(
            parse_provider_text(r#"{"no_type":true}"#),
            ProviderEvent::Ignored
        ));
    }

    #[test]
    fn test_raw_payload_preserved() {
        match parse_provider_text(&results_json("keep raw", true)) {
            ProviderEvent::Result { segment, .. } => {
                assert_eq!(segment.raw["type"], "Results");
            }
            other => panic!("expected result, got {other:?}"),
        }
    }
}
