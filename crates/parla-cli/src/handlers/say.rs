//! Say command handler.
//!
//! Plays text on the default device. The terminal acts as the media
//! transport: status and position go to stderr, and single-letter
//! commands on stdin pause, resume, restart or stop playback.

use std::sync::Arc;

use anyhow::{Context, Result};
use parla_tts::{MediaTransport, PlaybackEngine, TransportControlsAdapter, TtsConfig};
use tokio::sync::mpsc;

use crate::commands::SayArgs;
use crate::terminal::{KEY_HELP, KeyCommand, TerminalTransport, spawn_line_reader};

enum Outcome {
    Finished,
    Interrupted,
}

struct Input {
    lines: mpsc::UnboundedReceiver<String>,
    open: bool,
}

/// Execute the say command.
pub async fn execute(config: TtsConfig, args: SayArgs) -> Result<()> {
    let voice = args.voice.unwrap_or_else(|| config.default_voice.clone());
    let interval = config.position_interval();

    let mut input = Input {
        lines: spawn_line_reader(std::io::BufReader::new(std::io::stdin()))
            .context("failed to read keyboard commands")?,
        open: true,
    };

    let engine = PlaybackEngine::builder(config)
        .build()
        .context("failed to start the speech engine")?;
    engine.init()?;

    let terminal = Arc::new(TerminalTransport::new());
    let transport: Arc<dyn MediaTransport> = terminal.clone();
    let controls = TransportControlsAdapter::attach(&engine, transport, interval);
    eprintln!("{KEY_HELP}");

    let mut result = Ok(());
    for round in 1..=args.repeat {
        tracing::debug!(round, repeat = args.repeat, "Speaking");
        match speak(&engine, &terminal, &args.text, &voice, &mut input).await {
            Ok(Outcome::Finished) => {}
            Ok(Outcome::Interrupted) => break,
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }

    drop(controls);
    engine.dispose();
    result
}

/// Play one round and wait until playback is over.
async fn speak(
    engine: &PlaybackEngine,
    terminal: &TerminalTransport,
    text: &str,
    voice: &str,
    input: &mut Input,
) -> Result<Outcome> {
    let mut status = engine.watch();
    let play = engine.play(text, voice);
    tokio::pin!(play);
    let mut pending = true;
    let mut stopped = false;

    loop {
        tokio::select! {
            result = &mut play, if pending => {
                pending = false;
                result.context("speech playback failed")?;
            }
            changed = status.changed(), if !pending => {
                if changed.is_err() {
                    return Ok(Outcome::Finished);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                engine.stop();
                eprintln!();
                return Ok(Outcome::Interrupted);
            }
            line = input.lines.recv(), if input.open => match line {
                Some(line) => stopped |= handle_key(engine, terminal, &line),
                None => input.open = false,
            },
        }

        if !pending && !status.borrow_and_update().is_active() {
            return Ok(if stopped {
                Outcome::Interrupted
            } else {
                Outcome::Finished
            });
        }
    }
}

/// Route one input line. Returns whether the user asked to stop.
fn handle_key(engine: &PlaybackEngine, terminal: &TerminalTransport, line: &str) -> bool {
    match KeyCommand::parse(line) {
        Some(KeyCommand::Restart) => {
            if let Err(e) = engine.restart() {
                eprintln!("{e}");
            }
            false
        }
        Some(command) => {
            terminal.press(command);
            command == KeyCommand::Stop
        }
        None => {
            eprintln!("{KEY_HELP}");
            false
        }
    }
}
