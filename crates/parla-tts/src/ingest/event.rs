//! Business events carried in the speech event stream.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::Deserialize;

use crate::error::TtsError;

/// One decoded `data:` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechEvent {
    /// A chunk of encoded audio.
    Audio(Bytes),
    /// The server finished the utterance.
    Done,
    /// The server aborted with a message.
    Error(String),
    /// Anything else (unknown types, unparseable payloads).
    Ignored,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: Option<String>,
    audio: Option<String>,
    error: Option<serde_json::Value>,
    message: Option<String>,
}

impl SpeechEvent {
    /// Interpret a `data:` payload.
    ///
    /// Only malformed audio payloads are errors; unknown or unparseable
    /// events are ignored so that servers can add event types freely.
    pub fn parse(data: &str) -> Result<Self, TtsError> {
        let raw: RawEvent = match serde_json::from_str(data) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unparseable speech event");
                return Ok(Self::Ignored);
            }
        };

        match raw.kind.as_deref() {
            Some("audio" | "speech.audio.delta") => {
                let payload = raw
                    .audio
                    .ok_or_else(|| TtsError::Protocol("audio event without payload".into()))?;
                let bytes = STANDARD
                    .decode(payload.trim())
                    .map_err(|e| TtsError::Protocol(format!("invalid base64 audio: {e}")))?;
                Ok(Self::Audio(Bytes::from(bytes)))
            }
            Some("speech.audio.done") => Ok(Self::Done),
            Some("error") => Ok(Self::Error(error_message(raw.error, raw.message))),
            _ => Ok(Self::Ignored),
        }
    }
}

/// Servers send either `"error": "msg"` or `"error": {"message": "msg"}`.
fn error_message(error: Option<serde_json::Value>, message: Option<String>) -> String {
    let from_error = match error {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Object(obj)) => obj
            .get("message")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string),
        _ => None,
    };
    from_error
        .or(message)
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| "unknown speech server error".to_string())
}
