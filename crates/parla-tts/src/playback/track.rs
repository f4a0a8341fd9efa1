//! Growable PCM track and the reader that plays it.
//!
//! A [`PcmTrack`] holds interleaved `f32` samples. Progressive playback
//! appends to it while the stream is still arriving; buffered playback
//! builds it complete from cached audio. A [`TrackReader`] is the source
//! handed to the output device. It counts the frames the device actually
//! pulled, which is the playback clock used for pause offsets.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::watch;

use crate::audio::{CachedAudio, frames_to_duration};
use crate::decoder::PlanarBlock;
use crate::error::{DecodeError, TtsError};

/// Samples copied out of the track per reader refill.
const READ_BLOCK_FRAMES: usize = 1_024;

/// Sample layout of a track, fixed by the first block appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Debug, Default)]
struct TrackData {
    samples: Vec<f32>,
    format: Option<TrackFormat>,
    finished: bool,
    error: Option<TtsError>,
}

/// Snapshot of how much audio a track holds.
#[derive(Debug, Clone, Default)]
pub struct TrackProgress {
    pub frames: u64,
    pub format: Option<TrackFormat>,
    pub finished: bool,
    pub error: Option<TtsError>,
}

enum ReadStatus {
    Data,
    Pending,
    Ended,
}

/// Interleaved samples, appended over time and read by [`TrackReader`]s.
pub struct PcmTrack {
    data: RwLock<TrackData>,
    progress: watch::Sender<TrackProgress>,
}

impl PcmTrack {
    /// An empty track that will be filled progressively.
    pub fn new() -> Arc<Self> {
        let (progress, _) = watch::channel(TrackProgress::default());
        Arc::new(Self {
            data: RwLock::new(TrackData::default()),
            progress,
        })
    }

    /// A complete track holding `audio`.
    pub fn from_audio(audio: &CachedAudio) -> Arc<Self> {
        let track = Self::new();
        if let Ok(channels) = u16::try_from(audio.channels()) {
            track.push_interleaved(audio.sample_rate(), channels, &audio.interleaved());
        }
        track.finish();
        track
    }

    /// Append interleaved frames. The first append fixes the format;
    /// later blocks with a different layout are dropped.
    pub fn push_interleaved(&self, sample_rate: u32, channels: u16, samples: &[f32]) {
        if channels == 0 || samples.is_empty() {
            return;
        }
        let format = TrackFormat {
            sample_rate,
            channels,
        };

        let snapshot = {
            let mut data = self.write();
            if data.finished {
                return;
            }
            match data.format {
                None => data.format = Some(format),
                Some(existing) if existing != format => {
                    tracing::warn!(?existing, incoming = ?format, "Dropping block with mismatched layout");
                    return;
                }
                Some(_) => {}
            }
            let whole = samples.len() - samples.len() % usize::from(channels);
            data.samples.extend_from_slice(&samples[..whole]);
            Self::snapshot(&data)
        };
        self.progress.send_replace(snapshot);
    }

    /// Append a decoded planar block.
    pub fn push_planar(&self, block: &PlanarBlock<'_>) {
        let Ok(channels) = u16::try_from(block.channels) else {
            return;
        };
        self.push_interleaved(block.sample_rate, channels, &block.interleaved());
    }

    /// Mark the track complete. No-op if it already ended.
    pub fn finish(&self) {
        self.terminate(None);
    }

    /// Mark the track as ended by a failure. No-op if it already ended.
    pub fn fail(&self, error: TtsError) {
        self.terminate(Some(error));
    }

    fn terminate(&self, error: Option<TtsError>) {
        let snapshot = {
            let mut data = self.write();
            if data.finished {
                return;
            }
            data.finished = true;
            data.error = error;
            Self::snapshot(&data)
        };
        self.progress.send_replace(snapshot);
    }

    pub fn progress(&self) -> TrackProgress {
        self.progress.borrow().clone()
    }

    pub fn format(&self) -> Option<TrackFormat> {
        self.read().format
    }

    pub fn is_finished(&self) -> bool {
        self.read().finished
    }

    pub fn frames(&self) -> u64 {
        Self::snapshot(&self.read()).frames
    }

    /// Audio currently held.
    pub fn buffered(&self) -> Duration {
        let data = self.read();
        data.format.map_or(Duration::ZERO, |f| {
            frames_to_duration(Self::snapshot(&data).frames, f.sample_rate)
        })
    }

    /// Total duration, known once the track is finished.
    pub fn duration(&self) -> Option<Duration> {
        if self.is_finished() {
            Some(self.buffered())
        } else {
            None
        }
    }

    /// Wait until the track has audible frames.
    ///
    /// Fails with the track's error, or with [`DecodeError::Empty`] if it
    /// finished without any audio.
    pub async fn ready(&self) -> Result<TrackFormat, TtsError> {
        let mut rx = self.progress.subscribe();
        loop {
            let progress = rx.borrow_and_update().clone();
            if progress.frames > 0 {
                if let Some(format) = progress.format {
                    return Ok(format);
                }
            }
            if let Some(error) = progress.error {
                return Err(error);
            }
            if progress.finished {
                return Err(DecodeError::Empty.into());
            }
            if rx.changed().await.is_err() {
                return Err(TtsError::Cancelled);
            }
        }
    }

    /// Copy up to `max_frames` whole frames starting at sample `offset`.
    fn read_at(&self, offset: usize, max_frames: usize, out: &mut Vec<f32>) -> ReadStatus {
        let data = self.read();
        let channels = data.format.map_or(1, |f| usize::from(f.channels));
        if offset < data.samples.len() {
            let end = data.samples.len().min(offset + max_frames * channels);
            out.extend_from_slice(&data.samples[offset..end]);
            ReadStatus::Data
        } else if data.finished {
            ReadStatus::Ended
        } else {
            ReadStatus::Pending
        }
    }

    fn snapshot(data: &TrackData) -> TrackProgress {
        let channels = data.format.map_or(1, |f| usize::from(f.channels));
        TrackProgress {
            frames: (data.samples.len() / channels) as u64,
            format: data.format,
            finished: data.finished,
            error: data.error.clone(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, TrackData> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, TrackData> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for PcmTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcmTrack")
            .field("progress", &self.progress())
            .finish()
    }
}

// ── Reader ─────────────────────────────────────────────────────────

/// Callback fired once when a reader drains the finished track.
pub type EndCallback = Box<dyn FnOnce() + Send + 'static>;

/// Pull source over a [`PcmTrack`], starting at a frame offset.
///
/// When the reader catches up with a track that is still growing it
/// emits silence without advancing the clock. When it reaches the end of
/// a finished track it fires its end callback and stops. Setting the stop
/// flag ends it immediately without firing the callback.
pub struct TrackReader {
    track: Arc<PcmTrack>,
    format: TrackFormat,
    start_frame: u64,
    next_read: usize,
    buffer: Vec<f32>,
    buffer_pos: usize,
    emitted: u64,
    silence: u16,
    clock: Arc<AtomicU64>,
    stopped: Arc<AtomicBool>,
    on_end: Option<EndCallback>,
    done: bool,
}

impl TrackReader {
    /// Reader starting at `start_frame`. Fails if the track has no format
    /// yet.
    pub fn new(
        track: Arc<PcmTrack>,
        start_frame: u64,
        on_end: Option<EndCallback>,
    ) -> Result<Self, TtsError> {
        let format = track
            .format()
            .ok_or_else(|| TtsError::Output("track has no audio yet".into()))?;
        let offset = usize::try_from(start_frame)
            .map_err(|_| TtsError::Output("start offset out of range".into()))?;
        Ok(Self {
            track,
            format,
            start_frame,
            next_read: offset * usize::from(format.channels),
            buffer: Vec::with_capacity(READ_BLOCK_FRAMES * usize::from(format.channels)),
            buffer_pos: 0,
            emitted: 0,
            silence: 0,
            clock: Arc::new(AtomicU64::new(start_frame)),
            stopped: Arc::new(AtomicBool::new(false)),
            on_end,
            done: false,
        })
    }

    pub const fn format(&self) -> TrackFormat {
        self.format
    }

    /// Shared frame counter: absolute frame index of the next frame the
    /// device will receive.
    pub fn clock(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.clock)
    }

    /// Shared flag that halts the reader.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stopped)
    }

    pub fn position_frames(&self) -> u64 {
        self.clock.load(Ordering::Acquire)
    }

    fn end(&mut self) -> Option<f32> {
        self.done = true;
        if !self.stopped.load(Ordering::Acquire) {
            if let Some(on_end) = self.on_end.take() {
                on_end();
            }
        }
        None
    }
}

impl Iterator for TrackReader {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.done || self.stopped.load(Ordering::Acquire) {
            self.done = true;
            return None;
        }

        // Finish an underrun frame before reading again.
        if self.silence > 0 {
            self.silence -= 1;
            return Some(0.0);
        }

        if self.buffer_pos >= self.buffer.len() {
            self.buffer.clear();
            self.buffer_pos = 0;
            match self
                .track
                .read_at(self.next_read, READ_BLOCK_FRAMES, &mut self.buffer)
            {
                ReadStatus::Data => self.next_read += self.buffer.len(),
                ReadStatus::Pending => {
                    self.silence = self.format.channels - 1;
                    return Some(0.0);
                }
                ReadStatus::Ended => return self.end(),
            }
        }

        let sample = self.buffer[self.buffer_pos];
        self.buffer_pos += 1;
        self.emitted += 1;
        self.clock.store(
            self.start_frame + self.emitted / u64::from(self.format.channels),
            Ordering::Release,
        );
        Some(sample)
    }
}

impl rodio::Source for TrackReader {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        self.format.channels
    }

    fn sample_rate(&self) -> u32 {
        self.format.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}
