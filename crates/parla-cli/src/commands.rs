//! Subcommands.

use clap::{Args, Subcommand};
use parla_tts::{AudioFormat, TtsConfig};

#[derive(Subcommand)]
pub enum Commands {
    /// Speak text on the default audio device
    Say(SayArgs),

    /// Download and decode speech without playing it
    Fetch(FetchArgs),
}

#[derive(Args, Debug)]
pub struct SayArgs {
    /// Text to speak
    pub text: String,

    /// Voice name (defaults to PARLA_TTS_VOICE)
    #[arg(long)]
    pub voice: Option<String>,

    /// Wire audio format: mp3, wav, flac or pcm
    #[arg(long)]
    pub format: Option<AudioFormat>,

    /// Wait for the whole utterance before playing
    #[arg(long)]
    pub buffered: bool,

    /// Speak the text this many times (replays come from the cache)
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub repeat: u32,
}

#[derive(Args, Debug)]
pub struct FetchArgs {
    /// Text to synthesize
    pub text: String,

    /// Voice name (defaults to PARLA_TTS_VOICE)
    #[arg(long)]
    pub voice: Option<String>,

    /// Wire audio format: mp3, wav, flac or pcm
    #[arg(long)]
    pub format: Option<AudioFormat>,
}

/// Apply command-line overrides on top of the environment configuration.
pub fn apply_overrides(
    mut config: TtsConfig,
    endpoint: Option<String>,
    format: Option<AudioFormat>,
    buffered: bool,
) -> TtsConfig {
    if let Some(endpoint) = endpoint {
        config.endpoint = endpoint;
    }
    if let Some(format) = format {
        config.audio_format = format;
    }
    if buffered {
        config.progressive = false;
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_win_over_environment() {
        let config = apply_overrides(
            TtsConfig::default(),
            Some("https://tts.example.com/v1/audio/speech".into()),
            Some(AudioFormat::Wav),
            true,
        );
        assert_eq!(config.endpoint, "https://tts.example.com/v1/audio/speech");
        assert_eq!(config.audio_format, AudioFormat::Wav);
        assert!(!config.progressive);
    }

    #[test]
    fn test_no_overrides_keeps_config() {
        let config = apply_overrides(TtsConfig::default(), None, None, false);
        assert_eq!(config, TtsConfig::default());
    }
}
