//! Audio output port.
//!
//! The engine hands [`TrackReader`]s to an [`AudioOutput`] and keeps the
//! returned [`OutputHandle`] to stop them. Implementations:
//!
//! - [`RodioOutput`]: the default output device, driven from a dedicated
//!   audio thread.
//! - [`ManualOutput`]: renders only when asked; for headless use.

mod device;
mod manual;

pub use device::RodioOutput;
pub use manual::ManualOutput;

use crate::error::TtsError;
use crate::playback::TrackReader;

/// Something that can play track readers.
pub trait AudioOutput: Send + Sync {
    /// Whether a source may keep growing after it started playing.
    fn supports_progressive(&self) -> bool {
        true
    }

    /// Start playing `source` immediately.
    ///
    /// The engine calls this with its state lock held, so it must return
    /// once the source is queued rather than wait for any audio.
    fn play(&self, source: TrackReader) -> Result<Box<dyn OutputHandle>, TtsError>;

    /// Release transient output routing once nothing is playing.
    ///
    /// Sources are stopped through their own [`OutputHandle`]; a release
    /// must leave sources started through other handles untouched.
    fn release(&self) {}
}

/// Handle to one playing source.
pub trait OutputHandle: Send {
    /// Stop the source. Idempotent.
    fn stop(&mut self);
}
