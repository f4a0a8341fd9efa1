use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{AudioOutput, OutputHandle};
use crate::error::TtsError;
use crate::playback::TrackReader;

#[derive(Default)]
struct ManualState {
    sources: Vec<(u64, TrackReader)>,
    next_id: u64,
    started: u64,
    releases: u64,
}

/// Output that pulls samples only when [`render`](Self::render) is called.
///
/// The playback clock therefore advances exactly by the frames rendered,
/// which makes it suitable for offline rendering and deterministic tests.
#[derive(Clone)]
pub struct ManualOutput {
    state: Arc<Mutex<ManualState>>,
    progressive: bool,
}

impl ManualOutput {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            progressive: true,
        }
    }

    /// An output that reports no support for growing sources.
    pub fn without_progressive() -> Self {
        Self {
            progressive: false,
            ..Self::new()
        }
    }

    /// Pull up to `frames` frames from every active source. Returns the
    /// interleaved samples of the most recently started one. Sources that
    /// end are removed.
    pub fn render(&self, frames: usize) -> Vec<f32> {
        let mut state = self.lock();
        let mut newest = Vec::new();
        let count = state.sources.len();

        let mut ended = Vec::new();
        for (index, (id, source)) in state.sources.iter_mut().enumerate() {
            let wanted = frames * usize::from(source.format().channels);
            let mut out = Vec::with_capacity(wanted);
            for _ in 0..wanted {
                match source.next() {
                    Some(sample) => out.push(sample),
                    None => {
                        ended.push(*id);
                        break;
                    }
                }
            }
            if index + 1 == count {
                newest = out;
            }
        }
        state.sources.retain(|(id, _)| !ended.contains(id));
        newest
    }

    /// Stop every active source.
    pub fn stop_all(&self) {
        self.lock().sources.clear();
    }

    pub fn active_sources(&self) -> usize {
        self.lock().sources.len()
    }

    /// Number of sources ever started.
    pub fn started(&self) -> u64 {
        self.lock().started
    }

    /// Number of times output routing was released.
    pub fn releases(&self) -> u64 {
        self.lock().releases
    }

    fn lock(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ManualOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioOutput for ManualOutput {
    fn supports_progressive(&self) -> bool {
        self.progressive
    }

    fn play(&self, source: TrackReader) -> Result<Box<dyn OutputHandle>, TtsError> {
        let mut state = self.lock();
        state.next_id += 1;
        state.started += 1;
        let id = state.next_id;
        state.sources.push((id, source));
        Ok(Box::new(ManualHandle {
            state: Arc::clone(&self.state),
            id,
        }))
    }

    fn release(&self) {
        self.lock().releases += 1;
    }
}

struct ManualHandle {
    state: Arc<Mutex<ManualState>>,
    id: u64,
}

impl OutputHandle for ManualHandle {
    fn stop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.sources.retain(|(id, _)| *id != self.id);
    }
}
