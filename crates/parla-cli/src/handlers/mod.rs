//! Command handlers.
//!
//! Each handler has the signature
//! `pub async fn execute(config: TtsConfig, args) -> Result<()>`: it builds
//! whatever engine pieces it needs from the resolved configuration, runs
//! the command and formats output for the terminal.

pub mod fetch;
pub mod say;
