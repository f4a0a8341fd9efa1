//! In-progress fetch registry.
//!
//! At most one network fetch runs per [`Fingerprint`]. The first caller
//! becomes the owner and must start the fetch; later callers join it and
//! share its chunks and its decoded result. Interest is counted through
//! [`InflightTicket`]s: when the last ticket of an unsettled entry is
//! dropped the fetch is cancelled and the entry removed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::{Bytes, BytesMut};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::audio::CachedAudio;
use crate::error::TtsError;
use crate::fingerprint::Fingerprint;

/// Result of a fetch: decoded audio, or the reason it failed.
pub type FetchOutcome = Result<Arc<CachedAudio>, TtsError>;

// ── Entry ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum StreamState {
    Open,
    Complete,
    Failed(TtsError),
}

#[derive(Debug, Clone)]
struct Progress {
    chunks: usize,
    stream: StreamState,
    outcome: Option<FetchOutcome>,
}

/// One in-progress fetch.
///
/// Holds the raw chunk log (replayed to late joiners), the stream state,
/// and the final outcome once settled.
pub struct InflightEntry {
    id: u64,
    fingerprint: Fingerprint,
    chunks: Mutex<Vec<Bytes>>,
    progress: watch::Sender<Progress>,
    cancel: CancellationToken,
    interest: AtomicUsize,
}

impl InflightEntry {
    fn new(id: u64, fingerprint: Fingerprint) -> Self {
        let (progress, _) = watch::channel(Progress {
            chunks: 0,
            stream: StreamState::Open,
            outcome: None,
        });
        Self {
            id,
            fingerprint,
            chunks: Mutex::new(Vec::new()),
            progress,
            cancel: CancellationToken::new(),
            interest: AtomicUsize::new(1),
        }
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    pub const fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Token cancelled when nobody is interested in this fetch any more.
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Append a received audio chunk and wake chunk cursors.
    pub fn push_chunk(&self, chunk: Bytes) {
        let count = {
            let mut chunks = self.lock_chunks();
            chunks.push(chunk);
            chunks.len()
        };
        self.progress.send_modify(|p| p.chunks = count);
    }

    /// Mark the chunk stream as complete. No more chunks follow.
    pub fn finish_stream(&self) {
        self.progress.send_if_modified(|p| {
            if matches!(p.stream, StreamState::Open) {
                p.stream = StreamState::Complete;
                true
            } else {
                false
            }
        });
    }

    /// Mark the chunk stream as failed.
    pub fn fail_stream(&self, error: TtsError) {
        self.progress.send_if_modified(|p| {
            if matches!(p.stream, StreamState::Open) {
                p.stream = StreamState::Failed(error);
                true
            } else {
                false
            }
        });
    }

    /// All chunks received so far, concatenated.
    pub fn concat(&self) -> Bytes {
        let chunks = self.lock_chunks();
        let mut buf = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
        for chunk in chunks.iter() {
            buf.extend_from_slice(chunk);
        }
        buf.freeze()
    }

    pub fn chunk_count(&self) -> usize {
        self.lock_chunks().len()
    }

    pub fn is_settled(&self) -> bool {
        self.progress.borrow().outcome.is_some()
    }

    fn chunk(&self, index: usize) -> Option<Bytes> {
        self.lock_chunks().get(index).cloned()
    }

    fn lock_chunks(&self) -> MutexGuard<'_, Vec<Bytes>> {
        self.chunks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Registry ───────────────────────────────────────────────────────

#[derive(Default)]
struct RegistryShared {
    entries: Mutex<HashMap<Fingerprint, Arc<InflightEntry>>>,
    next_id: AtomicU64,
}

impl RegistryShared {
    fn lock(&self) -> MutexGuard<'_, HashMap<Fingerprint, Arc<InflightEntry>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove `entry` unless it has already been replaced by a newer fetch.
    fn remove_if_current(
        entries: &mut HashMap<Fingerprint, Arc<InflightEntry>>,
        entry: &InflightEntry,
    ) -> bool {
        if entries
            .get(&entry.fingerprint)
            .is_some_and(|current| current.id == entry.id)
        {
            entries.remove(&entry.fingerprint);
            true
        } else {
            false
        }
    }
}

/// Registry of in-progress fetches, keyed by fingerprint.
///
/// Cloning shares the same registry.
#[derive(Clone, Default)]
pub struct InflightRegistry {
    shared: Arc<RegistryShared>,
}

impl InflightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the running fetch for `fingerprint`, or register a new one.
    ///
    /// When the returned ticket [`is_owner`](InflightTicket::is_owner), the
    /// caller must start the fetch and eventually call [`settle`](Self::settle).
    pub fn acquire_or_join(&self, fingerprint: Fingerprint) -> InflightTicket {
        let mut entries = self.shared.lock();

        if let Some(entry) = entries.get(&fingerprint) {
            entry.interest.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(fingerprint = %fingerprint.short(), entry = entry.id, "Joined in-flight fetch");
            return InflightTicket {
                entry: Arc::clone(entry),
                registry: Arc::downgrade(&self.shared),
                owner: false,
            };
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = Arc::new(InflightEntry::new(id, fingerprint));
        entries.insert(fingerprint, Arc::clone(&entry));
        tracing::debug!(fingerprint = %fingerprint.short(), entry = id, "Registered in-flight fetch");

        InflightTicket {
            entry,
            registry: Arc::downgrade(&self.shared),
            owner: true,
        }
    }

    /// Publish the final outcome of a fetch and remove its entry.
    ///
    /// Removal happens before publication so that a caller arriving after a
    /// failure starts a fresh fetch instead of inheriting the error.
    pub fn settle(&self, entry: &InflightEntry, outcome: FetchOutcome) {
        {
            let mut entries = self.shared.lock();
            RegistryShared::remove_if_current(&mut entries, entry);
        }

        match &outcome {
            Ok(_) => entry.finish_stream(),
            Err(e) => entry.fail_stream(e.clone()),
        }
        entry.progress.send_modify(|p| {
            if p.outcome.is_none() {
                p.outcome = Some(outcome);
            }
        });
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.shared.lock().contains_key(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.shared.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.lock().is_empty()
    }
}

// ── Ticket ─────────────────────────────────────────────────────────

/// A counted interest in an in-progress fetch.
///
/// Dropping the last ticket of an unsettled fetch cancels it.
pub struct InflightTicket {
    entry: Arc<InflightEntry>,
    registry: Weak<RegistryShared>,
    owner: bool,
}

impl InflightTicket {
    /// Whether this caller created the entry and must start the fetch.
    pub const fn is_owner(&self) -> bool {
        self.owner
    }

    pub const fn entry(&self) -> &Arc<InflightEntry> {
        &self.entry
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.entry.fingerprint
    }

    /// A view of the fetch that does not count as interest.
    pub fn handle(&self) -> FetchHandle {
        FetchHandle {
            entry: Arc::clone(&self.entry),
        }
    }

    /// Wait for the fetch to settle.
    pub async fn completion(&self) -> FetchOutcome {
        self.handle().completion().await
    }

    /// Cursor over the raw chunks, replaying from the first one.
    pub fn chunks(&self) -> ChunkCursor {
        self.handle().chunks()
    }
}

impl Drop for InflightTicket {
    fn drop(&mut self) {
        let Some(shared) = self.registry.upgrade() else {
            return;
        };
        let mut entries = shared.lock();
        if self.entry.interest.fetch_sub(1, Ordering::SeqCst) == 1 && !self.entry.is_settled() {
            self.entry.cancel.cancel();
            if RegistryShared::remove_if_current(&mut entries, &self.entry) {
                tracing::debug!(
                    fingerprint = %self.entry.fingerprint.short(),
                    entry = self.entry.id,
                    "Last interest released, fetch cancelled"
                );
            }
        }
    }
}

impl std::fmt::Debug for InflightTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflightTicket")
            .field("fingerprint", &self.entry.fingerprint)
            .field("entry", &self.entry.id)
            .field("owner", &self.owner)
            .finish()
    }
}

// ── Fetch handle ───────────────────────────────────────────────────

/// Observes a fetch without keeping it alive.
///
/// Whoever holds the [`InflightTicket`] decides how long the fetch runs;
/// a handle only reads its chunks and outcome.
#[derive(Clone)]
pub struct FetchHandle {
    entry: Arc<InflightEntry>,
}

impl FetchHandle {
    pub fn fingerprint(&self) -> Fingerprint {
        self.entry.fingerprint
    }

    /// Wait for the fetch to settle.
    pub async fn completion(&self) -> FetchOutcome {
        let mut rx = self.entry.progress.subscribe();
        loop {
            let outcome = rx.borrow_and_update().outcome.clone();
            if let Some(outcome) = outcome {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return Err(TtsError::Cancelled);
            }
        }
    }

    /// Cursor over the raw chunks, replaying from the first one.
    pub fn chunks(&self) -> ChunkCursor {
        ChunkCursor {
            entry: Arc::clone(&self.entry),
            rx: self.entry.progress.subscribe(),
            next: 0,
        }
    }
}

// ── Chunk cursor ───────────────────────────────────────────────────

enum CursorStep {
    Chunk,
    Wait,
    End,
    Fail(TtsError),
}

/// Pull-based reader over a fetch's chunk log.
///
/// Yields every chunk in arrival order, then `None` once the stream has
/// completed, or the stream error once it has failed.
pub struct ChunkCursor {
    entry: Arc<InflightEntry>,
    rx: watch::Receiver<Progress>,
    next: usize,
}

impl ChunkCursor {
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, TtsError>> {
        loop {
            let step = {
                let progress = self.rx.borrow_and_update();
                if self.next < progress.chunks {
                    CursorStep::Chunk
                } else {
                    match &progress.stream {
                        StreamState::Open => CursorStep::Wait,
                        StreamState::Complete => CursorStep::End,
                        StreamState::Failed(e) => CursorStep::Fail(e.clone()),
                    }
                }
            };

            match step {
                CursorStep::Chunk => {
                    let chunk = self.entry.chunk(self.next);
                    self.next += 1;
                    if let Some(chunk) = chunk {
                        return Some(Ok(chunk));
                    }
                }
                CursorStep::End => return None,
                CursorStep::Fail(e) => return Some(Err(e)),
                CursorStep::Wait => {
                    if self.rx.changed().await.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}
