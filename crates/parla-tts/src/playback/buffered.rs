use std::sync::Arc;
use std::time::Duration;

use super::{EndHook, PcmTrack, PlaybackStrategy, StrategyKind, TrackPlayer};
use crate::audio::CachedAudio;
use crate::error::TtsError;
use crate::output::AudioOutput;

/// Plays fully decoded audio. Used for cache hits and whenever the
/// output or format cannot play a growing stream.
pub struct BufferedStrategy {
    player: TrackPlayer,
}

impl BufferedStrategy {
    pub fn new(audio: &CachedAudio, on_end: EndHook) -> Self {
        Self {
            player: TrackPlayer::new(PcmTrack::from_audio(audio), on_end),
        }
    }
}

impl PlaybackStrategy for BufferedStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Buffered
    }

    fn start(&mut self, output: &dyn AudioOutput) -> Result<(), TtsError> {
        self.player.play_from(output, Duration::ZERO).map(|_| ())
    }

    fn pause(&mut self) -> Duration {
        self.player.halt()
    }

    fn resume(&mut self, output: &dyn AudioOutput, offset: Duration) -> Result<Duration, TtsError> {
        self.player.play_from(output, offset)
    }

    fn stop(&mut self) {
        self.player.halt();
    }

    fn position(&self) -> Duration {
        self.player.position()
    }

    fn duration(&self) -> Option<Duration> {
        self.player.duration()
    }

    fn generation(&self) -> u64 {
        self.player.generation()
    }
}

impl std::fmt::Debug for BufferedStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedStrategy")
            .field("track", self.player.track())
            .field("generation", &self.player.generation())
            .finish_non_exhaustive()
    }
}
