//! Terminal as a media transport.
//!
//! Status and position are written to stderr; keyboard commands typed on
//! stdin are routed to the handlers the engine registered, the way media
//! keys would be.

use std::fmt::Write as _;
use std::io::{BufRead, Write as _};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use parla_tts::{
    MediaTransport, PlaybackPhase, PlaybackStatus, PositionState, TransportHandlers, TtsError,
};
use tokio::sync::mpsc;

/// A command typed on stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCommand {
    Pause,
    Play,
    Stop,
    Restart,
}

impl KeyCommand {
    /// Parse one input line: `p`, `r`, `s` or `0`.
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "p" => Some(Self::Pause),
            "r" => Some(Self::Play),
            "s" => Some(Self::Stop),
            "0" => Some(Self::Restart),
            _ => None,
        }
    }
}

pub const KEY_HELP: &str = "[p] pause  [r] resume  [0] restart  [s] stop";

/// Forward lines from `reader` on a dedicated thread.
///
/// The thread is detached so a pending read never holds up runtime
/// shutdown. It ends at end of input or once the receiver is gone.
pub fn spawn_line_reader<R>(reader: R) -> std::io::Result<mpsc::UnboundedReceiver<String>>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    thread::Builder::new()
        .name("parla-keys".into())
        .spawn(move || {
            for line in reader.lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })?;
    Ok(rx)
}

/// Media transport backed by the terminal.
#[derive(Default)]
pub struct TerminalTransport {
    handlers: Mutex<Option<TransportHandlers>>,
}

impl TerminalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoke the registered handler for `command`. Returns `false` when
    /// nothing handled it. Media keys have no restart, so `Restart` is
    /// left to the caller.
    pub fn press(&self, command: KeyCommand) -> bool {
        let Some(handlers) = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        else {
            return false;
        };
        match command {
            KeyCommand::Pause => (handlers.on_pause)(),
            KeyCommand::Play => (handlers.on_play)(),
            KeyCommand::Stop => (handlers.on_stop)(),
            KeyCommand::Restart => return false,
        }
        true
    }
}

impl MediaTransport for TerminalTransport {
    fn register(&self, handlers: TransportHandlers) -> Result<(), TtsError> {
        *self.handlers.lock().unwrap_or_else(PoisonError::into_inner) = Some(handlers);
        Ok(())
    }

    fn update_playback(&self, status: &PlaybackStatus) {
        eprintln!("\r{}", status_line(status));
    }

    fn update_position(&self, position: PositionState) {
        eprint!("\r  {}", position_line(&position));
        let _ = std::io::stderr().flush();
    }

    fn unregister(&self) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

fn status_line(status: &PlaybackStatus) -> String {
    let symbol = match status.phase {
        PlaybackPhase::Idle => "■",
        PlaybackPhase::Loading => "…",
        PlaybackPhase::Playing => "▶",
        PlaybackPhase::Paused => "⏸",
    };
    let mut line = format!("{symbol} {}", status.phase);
    if let Some(utterance) = &status.utterance {
        let _ = write!(line, ": \"{}\" ({})", utterance.text, utterance.voice);
    }
    line
}

fn position_line(position: &PositionState) -> String {
    match position.duration {
        Some(total) => format!("{} / {}", clock(position.position), clock(total)),
        None => format!("{} / …", clock(position.position)),
    }
}

fn clock(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}:{:02}.{}", secs / 60, secs % 60, duration.subsec_millis() / 100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parla_tts::Utterance;

    fn counting_handlers() -> (TransportHandlers, Arc<[AtomicUsize; 3]>) {
        let counts = Arc::new([AtomicUsize::new(0), AtomicUsize::new(0), AtomicUsize::new(0)]);
        let handler = |index: usize| {
            let counts = Arc::clone(&counts);
            Arc::new(move || {
                counts[index].fetch_add(1, Ordering::SeqCst);
            }) as Arc<dyn Fn() + Send + Sync>
        };
        (
            TransportHandlers {
                on_play: handler(0),
                on_pause: handler(1),
                on_stop: handler(2),
            },
            counts,
        )
    }

    #[tokio::test]
    async fn test_line_reader_forwards_until_end_of_input() {
        let input = std::io::Cursor::new(b"p\nr\n".to_vec());
        let mut lines = spawn_line_reader(input).unwrap();

        assert_eq!(lines.recv().await.as_deref(), Some("p"));
        assert_eq!(lines.recv().await.as_deref(), Some("r"));
        assert_eq!(lines.recv().await, None);
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(KeyCommand::parse("p\n"), Some(KeyCommand::Pause));
        assert_eq!(KeyCommand::parse(" r "), Some(KeyCommand::Play));
        assert_eq!(KeyCommand::parse("s"), Some(KeyCommand::Stop));
        assert_eq!(KeyCommand::parse("0"), Some(KeyCommand::Restart));
        assert_eq!(KeyCommand::parse("x"), None);
    }

    #[test]
    fn test_press_routes_to_handlers() {
        let terminal = TerminalTransport::new();
        assert!(!terminal.press(KeyCommand::Pause));

        let (handlers, counts) = counting_handlers();
        terminal.register(handlers).unwrap();
        assert!(terminal.press(KeyCommand::Pause));
        assert!(terminal.press(KeyCommand::Play));
        assert!(!terminal.press(KeyCommand::Restart));
        assert!(terminal.press(KeyCommand::Stop));

        assert_eq!(counts[0].load(Ordering::SeqCst), 1);
        assert_eq!(counts[1].load(Ordering::SeqCst), 1);
        assert_eq!(counts[2].load(Ordering::SeqCst), 1);

        terminal.unregister();
        assert!(!terminal.press(KeyCommand::Stop));
    }

    #[test]
    fn test_status_line() {
        let status = PlaybackStatus {
            phase: PlaybackPhase::Playing,
            utterance: Some(Utterance::new("Ciao", "it-IT-IsabellaNeural")),
            fingerprint: None,
            revision: 1,
        };
        assert_eq!(status_line(&status), "▶ playing: \"Ciao\" (it-IT-IsabellaNeural)");
        assert_eq!(status_line(&PlaybackStatus::default()), "■ idle");
    }

    #[test]
    fn test_position_line() {
        let position = PositionState {
            position: Duration::from_millis(61_500),
            duration: Some(Duration::from_secs(90)),
            rate: 1.0,
        };
        assert_eq!(position_line(&position), "1:01.5 / 1:30.0");
    }
}
