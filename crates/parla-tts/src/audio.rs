//! Audio value types shared by the decoder, cache, and playback strategies.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Sample rate of raw PCM responses from the synthesis endpoint.
pub const PCM_SAMPLE_RATE: u32 = 24_000;

/// Channel count of raw PCM responses from the synthesis endpoint.
pub const PCM_CHANNELS: u16 = 1;

/// Wire encoding of the synthesized audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Mp3,
    Wav,
    Flac,
    /// Raw signed 16-bit little-endian, 24 kHz mono.
    Pcm,
}

impl AudioFormat {
    /// Name used in requests and file hints.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Wav => "wav",
            Self::Flac => "flac",
            Self::Pcm => "pcm",
        }
    }

    /// Whether chunks of this format can be decoded before the stream ends.
    pub const fn is_incremental(self) -> bool {
        matches!(self, Self::Mp3 | Self::Pcm)
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mp3" => Ok(Self::Mp3),
            "wav" => Ok(Self::Wav),
            "flac" => Ok(Self::Flac),
            "pcm" => Ok(Self::Pcm),
            other => Err(format!("unknown audio format '{other}'")),
        }
    }
}

/// Fully decoded, randomly seekable audio for one utterance.
///
/// Immutable once constructed; shared as `Arc<CachedAudio>`.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedAudio {
    channel_data: Vec<Vec<f32>>,
    sample_rate: u32,
}

impl CachedAudio {
    /// Build from per-channel sample vectors. Channels are truncated to the
    /// shortest one so every frame is complete.
    pub fn new(mut channel_data: Vec<Vec<f32>>, sample_rate: u32) -> Self {
        let frames = channel_data.iter().map(Vec::len).min().unwrap_or(0);
        for channel in &mut channel_data {
            channel.truncate(frames);
        }
        Self {
            channel_data,
            sample_rate,
        }
    }

    /// Samples of one channel.
    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channel_data.get(index).map(Vec::as_slice)
    }

    pub fn channel_data(&self) -> &[Vec<f32>] {
        &self.channel_data
    }

    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> usize {
        self.channel_data.len()
    }

    /// Number of complete frames.
    pub fn frames(&self) -> usize {
        self.channel_data.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    pub fn duration(&self) -> Duration {
        frames_to_duration(self.frames() as u64, self.sample_rate)
    }

    /// Interleaved copy of all samples (frame-major).
    pub fn interleaved(&self) -> Vec<f32> {
        let channels = self.channels();
        let mut out = Vec::with_capacity(self.frames() * channels);
        for frame in 0..self.frames() {
            for channel in &self.channel_data {
                out.push(channel[frame]);
            }
        }
        out
    }
}

/// Convert a frame count to a duration at `sample_rate`.
#[allow(clippy::cast_precision_loss)]
pub fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(frames as f64 / f64::from(sample_rate))
}

/// Convert a duration to a whole frame count at `sample_rate`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn duration_to_frames(duration: Duration, sample_rate: u32) -> u64 {
    (duration.as_secs_f64() * f64::from(sample_rate)).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parsing_is_case_insensitive() {
        assert_eq!("MP3".parse::<AudioFormat>().unwrap(), AudioFormat::Mp3);
        assert_eq!(" pcm ".parse::<AudioFormat>().unwrap(), AudioFormat::Pcm);
        assert!("ogg".parse::<AudioFormat>().is_err());
    }

    #[test]
    fn only_streamable_formats_are_incremental() {
        assert!(AudioFormat::Mp3.is_incremental());
        assert!(AudioFormat::Pcm.is_incremental());
        assert!(!AudioFormat::Wav.is_incremental());
        assert!(!AudioFormat::Flac.is_incremental());
    }

    #[test]
    fn ragged_channels_are_truncated() {
        let audio = CachedAudio::new(vec![vec![0.1, 0.2, 0.3], vec![0.4, 0.5]], 8_000);
        assert_eq!(audio.frames(), 2);
        assert_eq!(audio.interleaved(), vec![0.1, 0.4, 0.2, 0.5]);
    }

    #[test]
    fn duration_follows_sample_rate() {
        let audio = CachedAudio::new(vec![vec![0.0; 12_000]], 24_000);
        assert_eq!(audio.duration(), Duration::from_millis(500));
        assert_eq!(duration_to_frames(Duration::from_millis(250), 24_000), 6_000);
    }
}
