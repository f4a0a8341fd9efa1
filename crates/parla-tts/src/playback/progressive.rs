use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::{EndHook, PcmTrack, PlaybackStrategy, StrategyKind, TrackPlayer};
use crate::audio::{AudioFormat, PCM_CHANNELS, PCM_SAMPLE_RATE};
use crate::decoder::{self, ChunkReader, PcmAssembler};
use crate::error::TtsError;
use crate::inflight::ChunkCursor;
use crate::output::AudioOutput;

/// Plays a stream while it is still arriving.
///
/// A feed task drains the fetch's chunk cursor into a decoder that
/// appends to the track; the output reads the track as it grows.
pub struct ProgressiveStrategy {
    player: TrackPlayer,
    feed: CancellationToken,
}

impl ProgressiveStrategy {
    /// Start feeding `chunks` into a new track. Must be called from
    /// within a tokio runtime.
    pub fn spawn(chunks: ChunkCursor, format: AudioFormat, on_end: EndHook) -> Self {
        let track = PcmTrack::new();
        let feed = CancellationToken::new();
        spawn_feed(Arc::clone(&track), chunks, format, feed.clone());
        Self {
            player: TrackPlayer::new(track, on_end),
            feed,
        }
    }

    /// The track being filled.
    pub fn track(&self) -> Arc<PcmTrack> {
        Arc::clone(self.player.track())
    }
}

impl PlaybackStrategy for ProgressiveStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Progressive
    }

    fn start(&mut self, output: &dyn AudioOutput) -> Result<(), TtsError> {
        self.player.play_from(output, Duration::ZERO).map(|_| ())
    }

    fn pause(&mut self) -> Duration {
        // The feed keeps running so the rest of the stream is buffered.
        self.player.halt()
    }

    fn resume(&mut self, output: &dyn AudioOutput, offset: Duration) -> Result<Duration, TtsError> {
        self.player.play_from(output, offset)
    }

    fn stop(&mut self) {
        self.feed.cancel();
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

impl Drop for ProgressiveStrategy {
    fn drop(&mut self) {
        self.feed.cancel();
    }
}

impl std::fmt::Debug for ProgressiveStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressiveStrategy")
            .field("track", self.player.track())
            .field("generation", &self.player.generation())
            .finish_non_exhaustive()
    }
}

// ── Feed ───────────────────────────────────────────────────────────

fn spawn_feed(
    track: Arc<PcmTrack>,
    chunks: ChunkCursor,
    format: AudioFormat,
    stop: CancellationToken,
) {
    if format == AudioFormat::Pcm {
        tokio::spawn(feed_pcm(track, chunks, stop));
        return;
    }

    // Container formats decode on a blocking thread, fed through a
    // channel. Dropping the sender is end of input for the decoder.
    let (tx, rx) = mpsc::channel::<Bytes>();
    tokio::spawn(forward_chunks(Arc::clone(&track), chunks, tx, stop));
    tokio::task::spawn_blocking(move || {
        let result = decoder::decode_reader(ChunkReader::new(rx), format, |block| {
            track.push_planar(block);
        });
        match result {
            Ok(frames) => {
                tracing::debug!(frames, "Progressive decode finished");
                track.finish();
            }
            Err(e) => {
                tracing::debug!(error = %e, "Progressive decode failed");
                track.fail(e.into());
            }
        }
    });
}

async fn feed_pcm(track: Arc<PcmTrack>, mut chunks: ChunkCursor, stop: CancellationToken) {
    let mut assembler = PcmAssembler::new();
    loop {
        let next = tokio::select! {
            biased;
            () = stop.cancelled() => {
                track.fail(TtsError::Cancelled);
                return;
            }
            next = chunks.next_chunk() => next,
        };
        match next {
            Some(Ok(chunk)) => {
                let samples = assembler.push(&chunk);
                track.push_interleaved(PCM_SAMPLE_RATE, PCM_CHANNELS, &samples);
            }
            Some(Err(e)) => {
                track.fail(e);
                return;
            }
            None => {
                track.finish();
                return;
            }
        }
    }
}

async fn forward_chunks(
    track: Arc<PcmTrack>,
    mut chunks: ChunkCursor,
    tx: mpsc::Sender<Bytes>,
    stop: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            () = stop.cancelled() => {
                track.fail(TtsError::Cancelled);
                return;
            }
            next = chunks.next_chunk() => next,
        };
        match next {
            Some(Ok(chunk)) => {
                if tx.send(chunk).is_err() {
                    // Decoder gave up; it reports its own error.
                    return;
                }
            }
            Some(Err(e)) => {
                track.fail(e);
                return;
            }
            None => return,
        }
    }
}
