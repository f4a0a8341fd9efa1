//! OS media-transport integration.
//!
//! A [`MediaTransport`] is whatever surface the host offers for
//! play/pause/stop keys and "now playing" metadata. The
//! [`TransportControlsAdapter`] binds one to a [`PlaybackEngine`]:
//!
//! - transport commands are routed to engine controls;
//! - every status update is mirrored onto the transport;
//! - position is reported periodically while playing, and once with a
//!   zero rate when playback pauses.
//!
//! Hosts without such a surface use [`UnsupportedTransport`]; the adapter
//! then stays inert and playback is unaffected.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::engine::PlaybackEngine;
use crate::error::TtsError;
use crate::status::{PlaybackPhase, PlaybackStatus, PositionState, Subscription};

/// Callback invoked by the transport when the user presses a key.
pub type ControlHandler = Arc<dyn Fn() + Send + Sync>;

/// Handlers a transport calls for its play, pause and stop commands.
#[derive(Clone)]
pub struct TransportHandlers {
    pub on_play: ControlHandler,
    pub on_pause: ControlHandler,
    pub on_stop: ControlHandler,
}

impl fmt::Debug for TransportHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandlers").finish_non_exhaustive()
    }
}

/// Host media-transport surface.
pub trait MediaTransport: Send + Sync {
    /// Install command handlers. Fails with [`TtsError::Capability`] when
    /// the host has no transport surface.
    fn register(&self, handlers: TransportHandlers) -> Result<(), TtsError>;

    /// Reflect the engine's status (phase and "now playing" metadata).
    fn update_playback(&self, status: &PlaybackStatus);

    /// Report where playback is.
    fn update_position(&self, position: PositionState);

    /// Remove the handlers installed by `register`.
    fn unregister(&self);
}

/// Transport for hosts without media keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedTransport;

impl MediaTransport for UnsupportedTransport {
    fn register(&self, _handlers: TransportHandlers) -> Result<(), TtsError> {
        Err(TtsError::Capability("no media transport on this host".into()))
    }

    fn update_playback(&self, _status: &PlaybackStatus) {}

    fn update_position(&self, _position: PositionState) {}

    fn unregister(&self) {}
}

// ── Adapter ────────────────────────────────────────────────────────

/// Keeps a [`MediaTransport`] in sync with an engine until dropped.
pub struct TransportControlsAdapter {
    transport: Arc<dyn MediaTransport>,
    subscription: Option<Subscription>,
    ticker: CancellationToken,
}

impl TransportControlsAdapter {
    /// Register handlers on `transport` and start mirroring `engine`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach(
        engine: &PlaybackEngine,
        transport: Arc<dyn MediaTransport>,
        interval: Duration,
    ) -> Self {
        let ticker = CancellationToken::new();

        if let Err(e) = transport.register(handlers(engine)) {
            tracing::debug!(error = %e, "Media transport unavailable, controls disabled");
            return Self {
                transport,
                subscription: None,
                ticker,
            };
        }

        transport.update_playback(&engine.status());
        let mirror = Arc::clone(&transport);
        let observed = engine.clone();
        let subscription = engine.subscribe(move |status| {
            mirror.update_playback(status);
            // The ticker only reports while playing; a pause freezes the
            // host's position with a zero rate.
            if status.phase == PlaybackPhase::Paused {
                if let Some(position) = observed.position() {
                    mirror.update_position(position);
                }
            }
        });

        tokio::spawn(report_position(
            engine.clone(),
            Arc::clone(&transport),
            interval,
            ticker.clone(),
        ));

        tracing::debug!("Media transport controls attached");
        Self {
            transport,
            subscription: Some(subscription),
            ticker,
        }
    }

    /// Whether the transport accepted registration.
    pub const fn is_active(&self) -> bool {
        self.subscription.is_some()
    }
}

impl Drop for TransportControlsAdapter {
    fn drop(&mut self) {
        self.ticker.cancel();
        if self.subscription.take().is_some() {
            self.transport.unregister();
        }
    }
}

impl fmt::Debug for TransportControlsAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportControlsAdapter")
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

fn handlers(engine: &PlaybackEngine) -> TransportHandlers {
    let play = engine.clone();
    let pause = engine.clone();
    let stop = engine.clone();
    TransportHandlers {
        on_play: Arc::new(move || {
            let result = match play.phase() {
                PlaybackPhase::Paused => play.resume(),
                PlaybackPhase::Playing => play.restart(),
                PlaybackPhase::Idle | PlaybackPhase::Loading => Ok(()),
            };
            log_control("play", result);
        }),
        on_pause: Arc::new(move || log_control("pause", pause.pause())),
        on_stop: Arc::new(move || stop.stop()),
    }
}

fn log_control(command: &str, result: Result<(), TtsError>) {
    if let Err(e) = result {
        tracing::debug!(command, error = %e, "Transport command ignored");
    }
}

async fn report_position(
    engine: PlaybackEngine,
    transport: Arc<dyn MediaTransport>,
    interval: Duration,
    stop: CancellationToken,
) {
    let mut ticks = tokio::time::interval(interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = ticks.tick() => {}
        }
        if engine.phase() != PlaybackPhase::Playing {
            continue;
        }
        if let Some(position) = engine.position() {
            transport.update_position(position);
        }
    }
}
