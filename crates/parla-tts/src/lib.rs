//! Streaming text-to-speech playback.
//!
//! `parla-tts` turns `(text, voice)` pairs into audible speech from an
//! OpenAI-style synthesis endpoint that streams audio over server-sent
//! events. Playback starts as soon as the first audio is decoded, decoded
//! utterances are cached for instant replay, and concurrent requests for
//! the same utterance share one network fetch.
//!
//! The entry point is [`PlaybackEngine`]:
//!
//! ```no_run
//! # async fn run() -> Result<(), parla_tts::TtsError> {
//! use parla_tts::{PlaybackEngine, TtsConfig};
//!
//! let engine = PlaybackEngine::builder(TtsConfig::from_env()?).build()?;
//! engine.init()?;
//! engine.play("Buongiorno!", "it-IT-IsabellaNeural").await?;
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod cache;
pub mod config;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod inflight;
pub mod ingest;
pub mod notify;
pub mod output;
pub mod playback;
pub mod status;
pub mod transport_controls;

// Re-export key types for convenience
pub use audio::{AudioFormat, CachedAudio};
pub use cache::CacheStore;
pub use config::TtsConfig;
pub use engine::{EngineBuilder, PlaybackEngine};
pub use error::{DecodeError, TtsError};
pub use fingerprint::Fingerprint;
pub use inflight::InflightRegistry;
pub use ingest::{HttpSpeechTransport, SpeechRequest, SpeechTransport, StreamIngester};
pub use notify::{Notification, Notifier, Severity};
pub use output::{AudioOutput, ManualOutput, RodioOutput};
pub use playback::StrategyKind;
pub use status::{PlaybackPhase, PlaybackStatus, PositionState, StatusBus, Subscription, Utterance};
pub use transport_controls::{
    MediaTransport, TransportControlsAdapter, TransportHandlers, UnsupportedTransport,
};
