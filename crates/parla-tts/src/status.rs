//! Shared playback status and its broadcast bus.
//!
//! Any number of consumers observe one status. Listeners registered with
//! [`StatusBus::subscribe`] are called synchronously on every accepted
//! update; async consumers can hold a [`StatusBus::watch`] receiver.
//! Every status carries a revision and updates with a revision at or
//! below the current one are dropped, so consumers never observe
//! transitions out of order.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use crate::fingerprint::Fingerprint;

/// Engine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackPhase {
    #[default]
    Idle,
    Loading,
    Playing,
    Paused,
}

impl PlaybackPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Playing => "playing",
            Self::Paused => "paused",
        }
    }
}

impl fmt::Display for PlaybackPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What is being spoken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Utterance {
    pub text: String,
    pub voice: String,
}

impl Utterance {
    pub fn new(text: impl Into<String>, voice: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice: voice.into(),
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::new(&self.voice, &self.text)
    }
}

/// Snapshot of the engine, as seen by consumers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackStatus {
    pub phase: PlaybackPhase,
    pub utterance: Option<Utterance>,
    pub fingerprint: Option<Fingerprint>,
    pub revision: u64,
}

impl PlaybackStatus {
    pub const fn is_active(&self) -> bool {
        !matches!(self.phase, PlaybackPhase::Idle)
    }

    /// Whether this status concerns `fingerprint`, for consumers that
    /// render per-utterance controls.
    pub fn is_for(&self, fingerprint: &Fingerprint) -> bool {
        self.fingerprint.as_ref() == Some(fingerprint)
    }
}

/// Where playback is within the current utterance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionState {
    pub position: Duration,
    /// Known once the whole utterance has been received.
    pub duration: Option<Duration>,
    /// 1.0 while playing, 0.0 while paused.
    pub rate: f32,
}

// ── Bus ────────────────────────────────────────────────────────────

type Listener = Arc<dyn Fn(&PlaybackStatus) + Send + Sync>;

struct BusInner {
    listeners: Mutex<Vec<(u64, Listener)>>,
    latest: watch::Sender<PlaybackStatus>,
    next_listener: AtomicU64,
    next_revision: AtomicU64,
}

impl BusInner {
    fn lock_listeners(&self) -> MutexGuard<'_, Vec<(u64, Listener)>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Broadcasts [`PlaybackStatus`] to every subscriber.
///
/// Cloning shares the same bus.
#[derive(Clone)]
pub struct StatusBus {
    inner: Arc<BusInner>,
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBus {
    pub fn new() -> Self {
        let (latest, _) = watch::channel(PlaybackStatus::default());
        Self {
            inner: Arc::new(BusInner {
                listeners: Mutex::new(Vec::new()),
                latest,
                next_listener: AtomicU64::new(0),
                next_revision: AtomicU64::new(0),
            }),
        }
    }

    /// Reserve the next revision number. Revisions are taken while the
    /// producer holds its own state lock, so they follow transition order.
    pub fn next_revision(&self) -> u64 {
        self.inner.next_revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Publish `status` unless a newer revision was already published.
    ///
    /// Listeners run on the calling thread after the bus lock is released.
    /// Returns whether the status was accepted.
    pub fn publish(&self, status: PlaybackStatus) -> bool {
        let accepted = self.inner.latest.send_if_modified(|current| {
            if status.revision > current.revision {
                *current = status.clone();
                true
            } else {
                false
            }
        });
        if !accepted {
            tracing::trace!(revision = status.revision, "Dropped stale status");
            return false;
        }

        let listeners: Vec<Listener> = self
            .inner
            .lock_listeners()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(&status);
        }
        true
    }

    /// The latest accepted status.
    pub fn current(&self) -> PlaybackStatus {
        self.inner.latest.borrow().clone()
    }

    /// Register a listener. It stays registered until the returned
    /// subscription is dropped or unsubscribed.
    #[must_use = "dropping the subscription unsubscribes the listener"]
    pub fn subscribe(
        &self,
        listener: impl Fn(&PlaybackStatus) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.lock_listeners().push((id, Arc::new(listener)));
        Subscription {
            bus: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Receiver for async consumers; always holds the latest status.
    pub fn watch(&self) -> watch::Receiver<PlaybackStatus> {
        self.inner.latest.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lock_listeners().len()
    }
}

/// Keeps a listener registered on a [`StatusBus`].
pub struct Subscription {
    bus: Weak<BusInner>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.lock_listeners().retain(|(id, _)| *id != self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(bus: &StatusBus, phase: PlaybackPhase) -> PlaybackStatus {
        PlaybackStatus {
            phase,
            utterance: None,
            fingerprint: None,
            revision: bus.next_revision(),
        }
    }

    fn recorder(bus: &StatusBus) -> (Arc<Mutex<Vec<PlaybackPhase>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let sub = bus.subscribe(move |status| s.lock().unwrap().push(status.phase));
        (seen, sub)
    }

    #[test]
    fn every_subscriber_sees_each_update() {
        let bus = StatusBus::new();
        let (a, _sa) = recorder(&bus);
        let (b, _sb) = recorder(&bus);

        bus.publish(status(&bus, PlaybackPhase::Loading));
        bus.publish(status(&bus, PlaybackPhase::Playing));

        let expected = vec![PlaybackPhase::Loading, PlaybackPhase::Playing];
        assert_eq!(*a.lock().unwrap(), expected);
        assert_eq!(*b.lock().unwrap(), expected);
    }

    #[test]
    fn stale_revisions_are_dropped() {
        let bus = StatusBus::new();
        let (seen, _sub) = recorder(&bus);

        let older = status(&bus, PlaybackPhase::Loading);
        let newer = status(&bus, PlaybackPhase::Idle);
        assert!(bus.publish(newer));
        assert!(!bus.publish(older));

        assert_eq!(*seen.lock().unwrap(), vec![PlaybackPhase::Idle]);
        assert_eq!(bus.current().phase, PlaybackPhase::Idle);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let bus = StatusBus::new();
        let (seen, sub) = recorder(&bus);
        assert_eq!(bus.listener_count(), 1);

        sub.unsubscribe();
        assert_eq!(bus.listener_count(), 0);
        bus.publish(status(&bus, PlaybackPhase::Loading));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn listeners_may_reenter_the_bus() {
        let bus = StatusBus::new();
        let inner = bus.clone();
        let _sub = bus.subscribe(move |_| {
            let _ = inner.current();
            let _ = inner.listener_count();
        });
        assert!(bus.publish(status(&bus, PlaybackPhase::Playing)));
    }

    #[tokio::test]
    async fn watch_receivers_see_latest() {
        let bus = StatusBus::new();
        let mut rx = bus.watch();
        bus.publish(status(&bus, PlaybackPhase::Paused));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().phase, PlaybackPhase::Paused);
    }

    #[test]
    fn status_serializes_for_ui() {
        let fp = Fingerprint::new("v", "Ciao");
        let status = PlaybackStatus {
            phase: PlaybackPhase::Playing,
            utterance: Some(Utterance::new("Ciao", "v")),
            fingerprint: Some(fp),
            revision: 3,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["phase"], "playing");
        assert_eq!(json["utterance"]["text"], "Ciao");
        assert_eq!(json["fingerprint"], fp.to_string());
        assert!(status.is_for(&fp));
    }
}
