//! Speech playback error types.
//!
//! A single fetch outcome is shared by every caller that joined it, so
//! [`TtsError`] is `Clone` and carries messages rather than source errors.

use crate::notify::{Notification, Severity};
use crate::status::PlaybackPhase;

/// Errors raised while turning encoded speech into samples.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The stream completed without delivering any audio bytes.
    #[error("no audio data received")]
    Empty,

    /// No decoder is available for the container or codec.
    #[error("unsupported audio format: {0}")]
    Unsupported(String),

    /// The bytes are not valid audio of the expected format.
    #[error("malformed audio: {0}")]
    Malformed(String),

    /// Decoding succeeded but produced zero frames.
    #[error("audio contained no samples")]
    NoAudio,
}

/// Errors that can occur while fetching or playing speech.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TtsError {
    /// Network failure or non-success HTTP status from the synthesis endpoint.
    #[error("Speech request failed: {message}")]
    Transport {
        status: Option<u16>,
        message: String,
    },

    /// The server reported an error event, or sent a malformed chunk.
    #[error("Speech stream error: {0}")]
    Protocol(String),

    /// The received audio could not be decoded.
    #[error("Failed to decode speech audio: {0}")]
    Decode(#[from] DecodeError),

    /// The audio output device failed.
    #[error("Audio output failed: {0}")]
    Output(String),

    /// The operation was superseded or stopped. Never shown to users.
    #[error("Speech playback cancelled")]
    Cancelled,

    /// The host has no media transport surface. Ignored by callers.
    #[error("Media transport controls unavailable: {0}")]
    Capability(String),

    /// A control operation was issued in a phase that does not allow it.
    #[error("Cannot {operation} while {phase}")]
    InvalidTransition {
        operation: &'static str,
        phase: PlaybackPhase,
    },

    /// The engine has not been initialised, or was disposed.
    #[error("Playback engine is not running")]
    NotRunning,

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl TtsError {
    /// Build a transport error without an HTTP status.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            status: None,
            message: message.into(),
        }
    }

    /// Whether this error is a cancellation rather than a failure.
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The user-facing notification for this error, if it should be shown.
    ///
    /// Cancellation, capability, and caller misuse stay silent.
    pub fn notification(&self) -> Option<Notification> {
        let title = match self {
            Self::Transport { .. } => "Speech unavailable",
            Self::Protocol(_) => "Speech generation failed",
            Self::Decode(_) => "Speech could not be played",
            Self::Output(_) => "Audio output unavailable",
            Self::Cancelled
            | Self::Capability(_)
            | Self::InvalidTransition { .. }
            | Self::NotRunning
            | Self::Config(_) => return None,
        };
        let message = match self {
            // Server-provided messages are shown verbatim.
            Self::Protocol(message) => message.clone(),
            other => other.to_string(),
        };
        Some(Notification::new(title, message, Severity::Error))
    }
}

impl From<reqwest::Error> for TtsError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}
