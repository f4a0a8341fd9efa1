//! Fetch command handler.
//!
//! Downloads and decodes one utterance without touching an audio device,
//! then prints what was received.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use parla_tts::{ManualOutput, PlaybackEngine, TtsConfig};

use crate::commands::FetchArgs;

/// Execute the fetch command.
pub async fn execute(config: TtsConfig, args: FetchArgs) -> Result<()> {
    let voice = args.voice.unwrap_or_else(|| config.default_voice.clone());
    let endpoint = config.endpoint.clone();

    // Nothing is played, so no device is opened.
    let engine = PlaybackEngine::builder(config)
        .output(Arc::new(ManualOutput::new()))
        .build()
        .context("invalid speech configuration")?;
    engine.init()?;

    let started = Instant::now();
    let audio = engine
        .preload(&args.text, &voice)
        .await
        .with_context(|| format!("failed to fetch speech from {endpoint}"))?;

    println!("Voice:       {voice}");
    println!("Duration:    {:.2}s", audio.duration().as_secs_f64());
    println!("Channels:    {}", audio.channels());
    println!("Sample rate: {} Hz", audio.sample_rate());
    println!("Frames:      {}", audio.frames());
    println!("Fetched in:  {:.2}s", started.elapsed().as_secs_f64());

    engine.dispose();
    Ok(())
}
