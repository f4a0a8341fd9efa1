//! Playback engine: the single-session state machine.
//!
//! ```text
//! Idle ──play──▶ Loading ──first audio──▶ Playing ◀──resume── Paused
//!                   │                        │ ──pause──────────▲
//!                   └── stop / error / timeout / natural end ──▶ Idle
//! ```
//!
//! At most one session exists. `play` always replaces it; the previous
//! session's audio stops and its fetch interest is released. Engine state
//! sits behind a short `std::sync::Mutex` that is never held across an
//! `.await`; status updates are published after the lock is released.
//!
//! Natural completion is detected on the audio thread and marshalled back
//! through a channel to the engine's signal loop, started by [`init`].
//!
//! [`init`]: PlaybackEngine::init

pub mod global;
mod session;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::audio::CachedAudio;
use crate::cache::CacheStore;
use crate::config::TtsConfig;
use crate::error::TtsError;
use crate::fingerprint::Fingerprint;
use crate::inflight::{FetchHandle, InflightRegistry, InflightTicket};
use crate::ingest::{HttpSpeechTransport, SpeechRequest, SpeechTransport, StreamIngester};
use crate::notify::{Notifier, TracingNotifier};
use crate::output::{AudioOutput, RodioOutput};
use crate::playback::{
    BufferedStrategy, EndHook, PlaybackStrategy, ProgressiveStrategy, StrategyKind,
};
use crate::status::{
    PlaybackPhase, PlaybackStatus, PositionState, StatusBus, Subscription, Utterance,
};

use session::Session;

// ── Builder ────────────────────────────────────────────────────────

/// Assembles a [`PlaybackEngine`] from its ports.
pub struct EngineBuilder {
    config: TtsConfig,
    transport: Option<Arc<dyn SpeechTransport>>,
    output: Option<Arc<dyn AudioOutput>>,
    notifier: Arc<dyn Notifier>,
}

impl EngineBuilder {
    pub fn new(config: TtsConfig) -> Self {
        Self {
            config,
            transport: None,
            output: None,
            notifier: Arc::new(TracingNotifier),
        }
    }

    /// Speech transport. Defaults to HTTP against `config.endpoint`.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn SpeechTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Audio output. Defaults to the system's default device.
    #[must_use]
    pub fn output(mut self, output: Arc<dyn AudioOutput>) -> Self {
        self.output = Some(output);
        self
    }

    /// Notification sink. Defaults to [`TracingNotifier`].
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn build(self) -> Result<PlaybackEngine, TtsError> {
        self.config.validate()?;

        let transport = match self.transport {
            Some(t) => t,
            None => Arc::new(HttpSpeechTransport::new(&self.config)?),
        };
        let output = match self.output {
            Some(o) => o,
            None => Arc::new(RodioOutput::spawn()?),
        };

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        Ok(PlaybackEngine {
            inner: Arc::new(EngineInner {
                config: self.config,
                ingester: StreamIngester::new(transport),
                output,
                notifier: self.notifier,
                cache: CacheStore::new(),
                inflight: InflightRegistry::new(),
                bus: StatusBus::new(),
                state: Mutex::new(EngineState::default()),
                signal_tx,
                signal_rx: Mutex::new(Some(signal_rx)),
                lifecycle: CancellationToken::new(),
                next_session: AtomicU64::new(0),
            }),
        })
    }
}

// ── Engine ─────────────────────────────────────────────────────────

/// Signals delivered to the engine from outside its control path.
#[derive(Debug, Clone, Copy)]
enum EngineSignal {
    /// A source played to its natural end.
    SourceEnded { session: u64, generation: u64 },
}

#[derive(Default)]
struct EngineState {
    session: Option<Session>,
    running: bool,
    disposed: bool,
}

impl EngineState {
    fn phase(&self) -> PlaybackPhase {
        self.session
            .as_ref()
            .map_or(PlaybackPhase::Idle, |s| s.phase)
    }

    fn current_mut(&mut self, session_id: u64) -> Result<&mut Session, TtsError> {
        self.session
            .as_mut()
            .filter(|s| s.id == session_id)
            .ok_or(TtsError::Cancelled)
    }
}

struct EngineInner {
    config: TtsConfig,
    ingester: StreamIngester,
    output: Arc<dyn AudioOutput>,
    notifier: Arc<dyn Notifier>,
    cache: CacheStore,
    inflight: InflightRegistry,
    bus: StatusBus,
    state: Mutex<EngineState>,
    signal_tx: mpsc::UnboundedSender<EngineSignal>,
    signal_rx: Mutex<Option<mpsc::UnboundedReceiver<EngineSignal>>>,
    lifecycle: CancellationToken,
    next_session: AtomicU64,
}

/// Where a session's audio comes from.
enum AudioSource {
    Cached(Arc<CachedAudio>),
    Fetching(FetchHandle),
}

/// Handle to the playback engine. Cheap to clone.
#[derive(Clone)]
pub struct PlaybackEngine {
    inner: Arc<EngineInner>,
}

impl PlaybackEngine {
    pub fn builder(config: TtsConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Start the engine's signal loop. Must be called from within a tokio
    /// runtime before the first `play`. Calling it again is a no-op.
    pub fn init(&self) -> Result<(), TtsError> {
        let mut state = self.lock_state();
        if state.disposed {
            return Err(TtsError::NotRunning);
        }
        if state.running {
            return Ok(());
        }
        let rx = self
            .inner
            .signal_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(TtsError::NotRunning)?;
        state.running = true;
        drop(state);

        let weak = Arc::downgrade(&self.inner);
        let lifecycle = self.inner.lifecycle.clone();
        tokio::spawn(run_signal_loop(weak, rx, lifecycle));
        tracing::debug!("Playback engine initialized");
        Ok(())
    }

    /// Stop playback and shut the engine down. Later `play` calls fail
    /// with [`TtsError::NotRunning`].
    pub fn dispose(&self) {
        self.stop();
        {
            let mut state = self.lock_state();
            state.running = false;
            state.disposed = true;
        }
        self.inner.lifecycle.cancel();
        tracing::debug!("Playback engine disposed");
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().running
    }

    // ── Controls ───────────────────────────────────────────────────

    /// Speak `text` with `voice`, replacing whatever is playing.
    ///
    /// Resolves once the utterance is fully fetched and playing, or when
    /// it is superseded or stopped (both `Ok`). Genuine failures are
    /// reported to the notifier, return the engine to idle, and are
    /// returned.
    pub async fn play(&self, text: &str, voice: &str) -> Result<(), TtsError> {
        self.ensure_running()?;
        if text.trim().is_empty() {
            tracing::debug!("Ignoring empty utterance");
            self.stop();
            return Ok(());
        }

        let utterance = Utterance::new(text, voice);
        let fingerprint = utterance.fingerprint();

        // Register interest before tearing down the previous session, so
        // replaying the line that is loading joins its fetch.
        let (source, ticket) = match self.resolve(&utterance, fingerprint) {
            Ok(audio) => (AudioSource::Cached(audio), None),
            Err(ticket) => (AudioSource::Fetching(ticket.handle()), Some(ticket)),
        };
        let kind = match source {
            AudioSource::Fetching(_) if self.progressive_allowed() => StrategyKind::Progressive,
            _ => StrategyKind::Buffered,
        };

        let (session_id, cancel) = self.begin_session(utterance, kind, ticket);

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(TtsError::Cancelled),
            result = self.drive(session_id, source) => result,
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancellation() => {
                tracing::debug!(session = session_id, "Playback superseded or stopped");
                Ok(())
            }
            Err(e) => {
                self.fail_session(session_id, &e);
                Err(e)
            }
        }
    }

    /// Fetch and decode an utterance into the cache without playing it.
    pub async fn preload(&self, text: &str, voice: &str) -> Result<Arc<CachedAudio>, TtsError> {
        self.ensure_running()?;
        let utterance = Utterance::new(text, voice);
        match self.resolve(&utterance, utterance.fingerprint()) {
            Ok(audio) => Ok(audio),
            Err(ticket) => ticket.completion().await,
        }
    }

    /// Pause the playing utterance at its current playback-clock position.
    pub fn pause(&self) -> Result<(), TtsError> {
        let mut state = self.lock_state();
        let phase = state.phase();
        let Some(session) = state
            .session
            .as_mut()
            .filter(|s| s.phase == PlaybackPhase::Playing)
        else {
            return Err(invalid("pause", phase));
        };
        let Some(strategy) = session.strategy.as_mut() else {
            return Err(invalid("pause", phase));
        };

        session.pause_offset = strategy.pause();
        session.phase = PlaybackPhase::Paused;
        tracing::debug!(
            session = session.id,
            offset_ms = session.pause_offset.as_millis(),
            "Paused"
        );
        self.commit(state);
        Ok(())
    }

    /// Resume a paused utterance where it stopped. A pause at the very
    /// end restarts from the beginning.
    pub fn resume(&self) -> Result<(), TtsError> {
        self.reposition("resume", &[PlaybackPhase::Paused], None)
    }

    /// Play the current utterance again from the start, without
    /// re-fetching.
    pub fn restart(&self) -> Result<(), TtsError> {
        self.reposition(
            "restart",
            &[PlaybackPhase::Playing, PlaybackPhase::Paused],
            Some(Duration::ZERO),
        )
    }

    /// Stop playback and cancel any fetch it was waiting on. Idempotent.
    pub fn stop(&self) {
        let mut state = self.lock_state();
        let Some(session) = state.session.take() else {
            return;
        };
        tracing::debug!(session = session.id, "Stopping playback");
        session.teardown();
        self.settle_idle(state);
    }

    // ── Observation ────────────────────────────────────────────────

    pub fn status(&self) -> PlaybackStatus {
        self.inner.bus.current()
    }

    pub fn phase(&self) -> PlaybackPhase {
        self.lock_state().phase()
    }

    /// Register a status listener. See [`StatusBus::subscribe`].
    #[must_use = "dropping the subscription unsubscribes the listener"]
    pub fn subscribe(
        &self,
        listener: impl Fn(&PlaybackStatus) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.bus.subscribe(listener)
    }

    pub fn watch(&self) -> watch::Receiver<PlaybackStatus> {
        self.inner.bus.watch()
    }

    /// Position of the current utterance, if one has started playing.
    pub fn position(&self) -> Option<PositionState> {
        let state = self.lock_state();
        let session = state.session.as_ref()?;
        let strategy = session.strategy.as_ref()?;
        match session.phase {
            PlaybackPhase::Playing => Some(PositionState {
                position: strategy.position(),
                duration: strategy.duration(),
                rate: 1.0,
            }),
            PlaybackPhase::Paused => Some(PositionState {
                position: session.pause_offset,
                duration: strategy.duration(),
                rate: 0.0,
            }),
            PlaybackPhase::Idle | PlaybackPhase::Loading => None,
        }
    }

    /// Strategy of the current session.
    pub fn strategy_kind(&self) -> Option<StrategyKind> {
        self.lock_state().session.as_ref().map(|s| s.kind)
    }

    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    pub fn inflight(&self) -> &InflightRegistry {
        &self.inner.inflight
    }

    pub fn config(&self) -> &TtsConfig {
        &self.inner.config
    }

    // ── Internals ──────────────────────────────────────────────────

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_running(&self) -> Result<(), TtsError> {
        if self.lock_state().running {
            Ok(())
        } else {
            Err(TtsError::NotRunning)
        }
    }

    fn progressive_allowed(&self) -> bool {
        self.inner.config.progressive
            && self.inner.config.audio_format.is_incremental()
            && self.inner.output.supports_progressive()
    }

    /// Cached audio, or a ticket for the (possibly newly started) fetch.
    fn resolve(
        &self,
        utterance: &Utterance,
        fingerprint: Fingerprint,
    ) -> Result<Arc<CachedAudio>, InflightTicket> {
        if let Some(audio) = self.inner.cache.get(&fingerprint) {
            tracing::debug!(fingerprint = %fingerprint.short(), "Cache hit");
            return Ok(audio);
        }

        let ticket = self.inner.inflight.acquire_or_join(fingerprint);
        if ticket.is_owner() {
            // A fetch may have settled between the cache check and the
            // registration.
            if let Some(audio) = self.inner.cache.get(&fingerprint) {
                return Ok(audio);
            }
            let config = &self.inner.config;
            self.inner.ingester.spawn_fetch(
                SpeechRequest::new(
                    &utterance.text,
                    &utterance.voice,
                    &config.model,
                    config.audio_format,
                ),
                Arc::clone(ticket.entry()),
                self.inner.inflight.clone(),
                self.inner.cache.clone(),
                config.audio_format,
            );
        }
        Err(ticket)
    }

    /// Replace the current session with a new loading one.
    fn begin_session(
        &self,
        utterance: Utterance,
        kind: StrategyKind,
        ticket: Option<InflightTicket>,
    ) -> (u64, CancellationToken) {
        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = self.inner.lifecycle.child_token();

        let mut state = self.lock_state();
        if let Some(previous) = state.session.take() {
            tracing::debug!(previous = previous.id, session = id, "Replacing session");
            previous.teardown();
        }
        tracing::debug!(
            session = id,
            fingerprint = %utterance.fingerprint().short(),
            strategy = %kind,
            "Loading"
        );
        state.session = Some(Session::new(id, utterance, kind, ticket, cancel.clone()));
        self.commit(state);

        self.arm_watchdog(id, cancel.clone());
        (id, cancel)
    }

    /// Bring a loading session to audible output.
    async fn drive(&self, session_id: u64, source: AudioSource) -> Result<(), TtsError> {
        let fetch = match source {
            AudioSource::Cached(audio) => return self.start_buffered(session_id, &audio),
            AudioSource::Fetching(fetch) => fetch,
        };

        let kind = self.lock_state().current_mut(session_id)?.kind;
        if kind == StrategyKind::Buffered {
            let audio = fetch.completion().await?;
            return self.start_buffered(session_id, &audio);
        }

        let strategy = ProgressiveStrategy::spawn(
            fetch.chunks(),
            self.inner.config.audio_format,
            self.end_hook(session_id),
        );
        let track = strategy.track();
        self.lock_state().current_mut(session_id)?.strategy = Some(Box::new(strategy));

        track.ready().await?;
        self.start_installed(session_id)?;

        // Stay attached until the stream is complete so stream errors
        // after the first audio are still reported.
        fetch.completion().await.map(|_| ())
    }

    fn start_buffered(&self, session_id: u64, audio: &CachedAudio) -> Result<(), TtsError> {
        let mut strategy = BufferedStrategy::new(audio, self.end_hook(session_id));
        let mut state = self.lock_state();
        let session = state.current_mut(session_id)?;
        strategy.start(self.inner.output.as_ref())?;
        session.strategy = Some(Box::new(strategy));
        session.phase = PlaybackPhase::Playing;
        session.ticket = None;
        tracing::debug!(session = session_id, strategy = "buffered", "Playing");
        self.commit(state);
        Ok(())
    }

    fn start_installed(&self, session_id: u64) -> Result<(), TtsError> {
        let mut state = self.lock_state();
        let session = state.current_mut(session_id)?;
        let strategy = session
            .strategy
            .as_mut()
            .ok_or_else(|| TtsError::Output("no playback strategy installed".into()))?;
        strategy.start(self.inner.output.as_ref())?;
        session.phase = PlaybackPhase::Playing;
        tracing::debug!(session = session_id, strategy = "progressive", "Playing");
        self.commit(state);
        Ok(())
    }

    /// Start a new source for the current session at `offset` (or at the
    /// pause offset when `None`).
    fn reposition(
        &self,
        operation: &'static str,
        from: &[PlaybackPhase],
        offset: Option<Duration>,
    ) -> Result<(), TtsError> {
        let mut state = self.lock_state();
        let phase = state.phase();
        let Some(session) = state
            .session
            .as_mut()
            .filter(|s| from.contains(&s.phase))
        else {
            return Err(invalid(operation, phase));
        };
        let session_id = session.id;
        let offset = offset.unwrap_or(session.pause_offset);
        let Some(strategy) = session.strategy.as_mut() else {
            return Err(invalid(operation, phase));
        };

        match strategy.resume(self.inner.output.as_ref(), offset) {
            Ok(effective) => {
                session.pause_offset = Duration::ZERO;
                session.phase = PlaybackPhase::Playing;
                tracing::debug!(
                    session = session_id,
                    offset_ms = effective.as_millis(),
                    "{operation}"
                );
                self.commit(state);
                Ok(())
            }
            Err(e) => {
                drop(state);
                self.fail_session(session_id, &e);
                Err(e)
            }
        }
    }

    /// Tear down `session_id` after a genuine failure and notify the user.
    fn fail_session(&self, session_id: u64, error: &TtsError) {
        let mut state = self.lock_state();
        if !state.session.as_ref().is_some_and(|s| s.id == session_id) {
            // Superseded in the meantime; the failure no longer matters.
            return;
        }
        if let Some(session) = state.session.take() {
            session.teardown();
        }
        self.settle_idle(state);

        tracing::warn!(session = session_id, error = %error, "Playback failed");
        if let Some(notification) = error.notification() {
            self.inner.notifier.notify(notification);
        }
    }

    fn end_hook(&self, session_id: u64) -> EndHook {
        let tx = self.inner.signal_tx.clone();
        Arc::new(move |generation| {
            let _ = tx.send(EngineSignal::SourceEnded {
                session: session_id,
                generation,
            });
        })
    }

    fn handle_signal(&self, signal: EngineSignal) {
        match signal {
            EngineSignal::SourceEnded {
                session,
                generation,
            } => {
                let mut state = self.lock_state();
                let finished = state.session.as_ref().is_some_and(|s| {
                    s.id == session
                        && s.phase == PlaybackPhase::Playing
                        && s.is_current_source(generation)
                });
                if !finished {
                    tracing::trace!(session, generation, "Ignoring stale end signal");
                    return;
                }
                if let Some(done) = state.session.take() {
                    tracing::debug!(session, "Playback finished");
                    done.teardown();
                }
                self.settle_idle(state);
            }
        }
    }

    /// Clear a session that is still loading after the configured timeout.
    fn arm_watchdog(&self, session_id: u64, cancel: CancellationToken) {
        let weak = Arc::downgrade(&self.inner);
        let timeout = self.inner.config.loading_timeout();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(timeout) => {
                    if let Some(inner) = weak.upgrade() {
                        PlaybackEngine { inner }.expire_loading(session_id, timeout);
                    }
                }
            }
        });
    }

    fn expire_loading(&self, session_id: u64, timeout: Duration) {
        let mut state = self.lock_state();
        let stuck = state
            .session
            .as_ref()
            .is_some_and(|s| s.id == session_id && s.phase == PlaybackPhase::Loading);
        if !stuck {
            return;
        }
        tracing::warn!(
            session = session_id,
            timeout_secs = timeout.as_secs(),
            "Speech still loading after timeout, clearing session"
        );
        if let Some(session) = state.session.take() {
            session.teardown();
        }
        self.settle_idle(state);
    }

    /// Release output routing and publish the idle status.
    ///
    /// The release happens under the state lock so it cannot overtake a
    /// session started by a concurrent `play`.
    fn settle_idle(&self, state: MutexGuard<'_, EngineState>) {
        if state.session.is_none() {
            self.inner.output.release();
        }
        self.commit(state);
    }

    /// Publish the status derived from `state`, after releasing the lock.
    fn commit(&self, state: MutexGuard<'_, EngineState>) {
        let status = PlaybackStatus {
            phase: state.phase(),
            utterance: state.session.as_ref().map(|s| s.utterance.clone()),
            fingerprint: state.session.as_ref().map(|s| s.fingerprint),
            revision: self.inner.bus.next_revision(),
        };
        drop(state);
        self.inner.bus.publish(status);
    }
}

impl std::fmt::Debug for PlaybackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackEngine")
            .field("phase", &self.phase())
            .field("cache", &self.inner.cache)
            .field("inflight", &self.inner.inflight.len())
            .finish_non_exhaustive()
    }
}

const fn invalid(operation: &'static str, phase: PlaybackPhase) -> TtsError {
    TtsError::InvalidTransition { operation, phase }
}

async fn run_signal_loop(
    engine: Weak<EngineInner>,
    mut rx: mpsc::UnboundedReceiver<EngineSignal>,
    lifecycle: CancellationToken,
) {
    loop {
        let signal = tokio::select! {
            biased;
            () = lifecycle.cancelled() => break,
            signal = rx.recv() => signal,
        };
        let Some(signal) = signal else { break };
        let Some(inner) = engine.upgrade() else { break };
        PlaybackEngine { inner }.handle_signal(signal);
    }
    tracing::debug!("Engine signal loop stopped");
}
