//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::AudioFormat;
use crate::error::TtsError;

/// Environment variable prefix for [`TtsConfig::from_env`].
pub const ENV_PREFIX: &str = "PARLA_TTS_";

/// Configuration for the speech engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Synthesis endpoint (OpenAI-compatible `/v1/audio/speech`).
    pub endpoint: String,

    /// Bearer token for the endpoint, if it requires one.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    /// Synthesis model name.
    pub model: String,

    /// Voice used when the caller does not pick one.
    pub default_voice: String,

    /// Audio encoding requested from and expected on the wire.
    pub audio_format: AudioFormat,

    /// Allow playback to start before the stream has finished.
    pub progressive: bool,

    /// A session still loading after this long is torn down.
    pub loading_timeout_secs: u64,

    /// Interval between position reports to the media transport.
    pub position_interval_ms: u64,

    /// TCP connect timeout for the synthesis endpoint.
    pub connect_timeout_secs: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:5050/v1/audio/speech".to_string(),
            api_key: None,
            model: "tts-1".to_string(),
            default_voice: "it-IT-IsabellaNeural".to_string(),
            audio_format: AudioFormat::Mp3,
            progressive: true,
            loading_timeout_secs: 15,
            position_interval_ms: 1_000,
            connect_timeout_secs: 10,
        }
    }
}

impl TtsConfig {
    /// Defaults overridden by `PARLA_TTS_*` environment variables.
    pub fn from_env() -> Result<Self, TtsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by values from `lookup`, keyed by full
    /// variable name.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, TtsError> {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = Self::default();
        if let Some(v) = get("ENDPOINT") {
            config.endpoint = v;
        }
        if let Some(v) = get("API_KEY") {
            config.api_key = Some(v);
        }
        if let Some(v) = get("MODEL") {
            config.model = v;
        }
        if let Some(v) = get("VOICE") {
            config.default_voice = v;
        }
        if let Some(v) = get("FORMAT") {
            config.audio_format = v.parse().map_err(TtsError::Config)?;
        }
        if let Some(v) = get("PROGRESSIVE") {
            config.progressive = parse_bool(&v)
                .ok_or_else(|| TtsError::Config(format!("{ENV_PREFIX}PROGRESSIVE: '{v}' is not a boolean")))?;
        }
        if let Some(v) = get("LOADING_TIMEOUT_SECS") {
            config.loading_timeout_secs = v.parse().map_err(|e| {
                TtsError::Config(format!("{ENV_PREFIX}LOADING_TIMEOUT_SECS: {e}"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<(), TtsError> {
        let url = reqwest::Url::parse(&self.endpoint)
            .map_err(|e| TtsError::Config(format!("endpoint '{}': {e}", self.endpoint)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(TtsError::Config(format!(
                "endpoint '{}' must use http or https",
                self.endpoint
            )));
        }
        if self.model.trim().is_empty() {
            return Err(TtsError::Config("model must not be empty".into()));
        }
        if self.loading_timeout_secs == 0 {
            return Err(TtsError::Config("loading timeout must be positive".into()));
        }
        if self.position_interval_ms == 0 {
            return Err(TtsError::Config("position interval must be positive".into()));
        }
        Ok(())
    }

    pub const fn loading_timeout(&self) -> Duration {
        Duration::from_secs(self.loading_timeout_secs)
    }

    pub const fn position_interval(&self) -> Duration {
        Duration::from_millis(self.position_interval_ms)
    }

    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
