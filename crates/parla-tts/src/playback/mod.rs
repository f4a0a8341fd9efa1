//! Playback strategies.
//!
//! Both strategies play a [`PcmTrack`] through an [`AudioOutput`]; they
//! differ in how the track is filled:
//!
//! - [`ProgressiveStrategy`]: the track grows while the stream arrives,
//!   and playback starts at the first decoded frames.
//! - [`BufferedStrategy`]: the track is built from fully decoded audio.
//!
//! Every source a strategy starts gets a new generation number. The end
//! hook receives it, so a late end signal from a replaced source can be
//! told apart from the current one.

mod buffered;
mod progressive;
pub mod track;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

pub use buffered::BufferedStrategy;
pub use progressive::ProgressiveStrategy;
pub use track::{PcmTrack, TrackFormat, TrackReader};

use crate::audio::{duration_to_frames, frames_to_duration};
use crate::error::TtsError;
use crate::output::{AudioOutput, OutputHandle};

/// Called from the output thread when a source drains naturally, with
/// the source's generation.
pub type EndHook = Arc<dyn Fn(u64) + Send + Sync>;

/// Which strategy a session uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Progressive,
    Buffered,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Progressive => f.write_str("progressive"),
            Self::Buffered => f.write_str("buffered"),
        }
    }
}

/// Common control surface of the playback strategies.
pub trait PlaybackStrategy: Send {
    fn kind(&self) -> StrategyKind;

    /// Start a source from the beginning.
    fn start(&mut self, output: &dyn AudioOutput) -> Result<(), TtsError>;

    /// Stop the current source, keeping decoded audio. Returns the
    /// playback-clock position at which it stopped.
    fn pause(&mut self) -> Duration;

    /// Start a new source at `offset`. An offset at or past the end of a
    /// complete track restarts from zero. Returns the effective offset.
    fn resume(&mut self, output: &dyn AudioOutput, offset: Duration) -> Result<Duration, TtsError>;

    /// Stop the current source and any background work.
    fn stop(&mut self);

    /// Playback-clock position of the current (or last) source.
    fn position(&self) -> Duration;

    /// Total duration, once known.
    fn duration(&self) -> Option<Duration>;

    /// Generation of the most recently started source.
    fn generation(&self) -> u64;
}

// ── Shared track player ────────────────────────────────────────────

struct ActiveSource {
    handle: Box<dyn OutputHandle>,
    clock: Arc<AtomicU64>,
    stopped: Arc<AtomicBool>,
}

/// Source bookkeeping shared by both strategies.
pub(crate) struct TrackPlayer {
    track: Arc<PcmTrack>,
    on_end: EndHook,
    generation: u64,
    active: Option<ActiveSource>,
    rest_frame: u64,
}

impl TrackPlayer {
    pub(crate) fn new(track: Arc<PcmTrack>, on_end: EndHook) -> Self {
        Self {
            track,
            on_end,
            generation: 0,
            active: None,
            rest_frame: 0,
        }
    }

    pub(crate) const fn track(&self) -> &Arc<PcmTrack> {
        &self.track
    }

    /// Replace the current source with one starting at `offset`.
    pub(crate) fn play_from(
        &mut self,
        output: &dyn AudioOutput,
        offset: Duration,
    ) -> Result<Duration, TtsError> {
        self.halt();

        let format = self
            .track
            .format()
            .ok_or_else(|| TtsError::Output("track has no audio yet".into()))?;

        let offset = match self.track.duration() {
            Some(total) if offset >= total => Duration::ZERO,
            _ => offset,
        };
        let start_frame = duration_to_frames(offset, format.sample_rate);

        self.generation += 1;
        let generation = self.generation;
        let on_end = Arc::clone(&self.on_end);
        let reader = TrackReader::new(
            Arc::clone(&self.track),
            start_frame,
            Some(Box::new(move || on_end(generation))),
        )?;
        let clock = reader.clock();
        let stopped = reader.stop_flag();

        let handle = output.play(reader)?;
        self.active = Some(ActiveSource {
            handle,
            clock,
            stopped,
        });
        self.rest_frame = start_frame;
        Ok(offset)
    }

    /// Stop the current source, remembering where it was.
    pub(crate) fn halt(&mut self) -> Duration {
        if let Some(mut active) = self.active.take() {
            active.stopped.store(true, Ordering::Release);
            active.handle.stop();
            self.rest_frame = active.clock.load(Ordering::Acquire);
        }
        self.position()
    }

    pub(crate) fn position(&self) -> Duration {
        let frames = self
            .active
            .as_ref()
            .map_or(self.rest_frame, |a| a.clock.load(Ordering::Acquire));
        self.track
            .format()
            .map_or(Duration::ZERO, |f| frames_to_duration(frames, f.sample_rate))
    }

    pub(crate) fn duration(&self) -> Option<Duration> {
        self.track.duration()
    }

    pub(crate) const fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for TrackPlayer {
    fn drop(&mut self) {
        self.halt();
    }
}
