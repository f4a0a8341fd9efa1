//! Process-wide cache of decoded utterances.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::audio::CachedAudio;
use crate::fingerprint::Fingerprint;

/// Map from fingerprint to decoded audio.
///
/// Entries are never evicted; cloning the store shares the same map.
#[derive(Clone, Default)]
pub struct CacheStore {
    entries: Arc<Mutex<HashMap<Fingerprint, Arc<CachedAudio>>>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<CachedAudio>> {
        self.lock().get(fingerprint).cloned()
    }

    /// Store decoded audio. Overwrites any previous entry for the fingerprint.
    pub fn put(&self, fingerprint: Fingerprint, audio: Arc<CachedAudio>) {
        self.lock().insert(fingerprint, audio);
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.lock().contains_key(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Fingerprint, Arc<CachedAudio>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("entries", &self.len())
            .finish()
    }
}
