use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::fingerprint::Fingerprint;
use crate::inflight::InflightTicket;
use crate::playback::{PlaybackStrategy, StrategyKind};
use crate::status::{PlaybackPhase, Utterance};

/// The single active playback.
pub(crate) struct Session {
    pub(crate) id: u64,
    pub(crate) utterance: Utterance,
    pub(crate) fingerprint: Fingerprint,
    pub(crate) phase: PlaybackPhase,
    pub(crate) kind: StrategyKind,
    pub(crate) strategy: Option<Box<dyn PlaybackStrategy>>,
    /// Playback-clock position captured by the last pause.
    pub(crate) pause_offset: Duration,
    /// Cancelled on teardown; gates the `play` call that created it.
    pub(crate) cancel: CancellationToken,
    /// Interest in the fetch this session is waiting on.
    pub(crate) ticket: Option<InflightTicket>,
}

impl Session {
    pub(crate) fn new(
        id: u64,
        utterance: Utterance,
        kind: StrategyKind,
        ticket: Option<InflightTicket>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            fingerprint: utterance.fingerprint(),
            utterance,
            phase: PlaybackPhase::Loading,
            kind,
            strategy: None,
            pause_offset: Duration::ZERO,
            cancel,
            ticket,
        }
    }

    /// Whether a source generation belongs to this session's current
    /// source.
    pub(crate) fn is_current_source(&self, generation: u64) -> bool {
        self.strategy
            .as_ref()
            .is_some_and(|s| s.generation() == generation)
    }

    /// Stop audio, cancel the waiting `play`, and release fetch interest.
    pub(crate) fn teardown(mut self) {
        self.cancel.cancel();
        if let Some(mut strategy) = self.strategy.take() {
            strategy.stop();
        }
        drop(self.ticket.take());
        tracing::debug!(
            session = self.id,
            fingerprint = %self.fingerprint.short(),
            "Session torn down"
        );
    }
}
