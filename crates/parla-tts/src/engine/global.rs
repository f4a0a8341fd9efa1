//! Process-wide engine slot.
//!
//! Hosts that cannot thread a [`PlaybackEngine`] through their call graph
//! install one at start-up and look it up from anywhere.

use std::sync::OnceLock;

use super::PlaybackEngine;
use crate::error::TtsError;

static GLOBAL: OnceLock<PlaybackEngine> = OnceLock::new();

/// Install `engine` as the process-wide engine. Fails if one is already
/// installed.
pub fn install(engine: PlaybackEngine) -> Result<(), TtsError> {
    GLOBAL
        .set(engine)
        .map_err(|_| TtsError::Config("a global playback engine is already installed".into()))
}

/// The installed engine, if any.
pub fn get() -> Option<&'static PlaybackEngine> {
    GLOBAL.get()
}
