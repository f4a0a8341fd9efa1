//! Default output device via `rodio`, confined to a dedicated thread.
//!
//! `rodio::OutputStream` is `!Send` on some platforms. The stream and its
//! sinks live on one OS thread for their whole lifetime; [`RodioOutput`]
//! is the `Send + Sync` proxy that routes every operation through an
//! [`OutputCommand`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread;

use rodio::{OutputStream, Sink};

use super::{AudioOutput, OutputHandle};
use crate::error::TtsError;
use crate::playback::TrackReader;

// ── Commands ───────────────────────────────────────────────────────

enum OutputCommand {
    /// Start a sink playing `source`.
    Play {
        id: u64,
        source: TrackReader,
        reply: mpsc::Sender<Result<(), TtsError>>,
    },

    /// Stop and drop one sink (fire-and-forget).
    Stop { id: u64 },

    /// Drop sinks whose sources have finished.
    Prune,

    /// Shut down the audio thread, releasing the device.
    Shutdown,
}

// ── Handle (Send + Sync proxy) ─────────────────────────────────────

/// Plays track readers on the default output device.
pub struct RodioOutput {
    cmd_tx: mpsc::Sender<OutputCommand>,
    next_id: AtomicU64,
    thread: Option<thread::JoinHandle<()>>,
}

impl RodioOutput {
    /// Spawn the audio thread and open the default output device.
    ///
    /// Device errors are reported back through a one-shot init channel.
    pub fn spawn() -> Result<Self, TtsError> {
        let (cmd_tx, cmd_rx) = mpsc::channel::<OutputCommand>();
        let (init_tx, init_rx) = mpsc::channel::<Result<(), TtsError>>();

        let thread = thread::Builder::new()
            .name("parla-audio".into())
            .spawn(move || Self::run(&cmd_rx, &init_tx))
            .map_err(|e| TtsError::Output(format!("failed to spawn audio thread: {e}")))?;

        init_rx
            .recv()
            .map_err(|_| TtsError::Output("audio thread exited during start-up".into()))??;

        Ok(Self {
            cmd_tx,
            next_id: AtomicU64::new(0),
            thread: Some(thread),
        })
    }

    fn run(cmd_rx: &mpsc::Receiver<OutputCommand>, init_tx: &mpsc::Sender<Result<(), TtsError>>) {
        let (stream, stream_handle) = match OutputStream::try_default() {
            Ok(pair) => pair,
            Err(e) => {
                let _ = init_tx.send(Err(TtsError::Output(e.to_string())));
                return;
            }
        };
        if init_tx.send(Ok(())).is_err() {
            return;
        }
        tracing::info!("Audio output initialized on default device");

        let mut sinks: HashMap<u64, Sink> = HashMap::new();

        while let Ok(cmd) = cmd_rx.recv() {
            match cmd {
                OutputCommand::Play { id, source, reply } => {
                    sinks.retain(|_, sink| !sink.empty());
                    let result = Sink::try_new(&stream_handle)
                        .map(|sink| {
                            sink.append(source);
                            sinks.insert(id, sink);
                        })
                        .map_err(|e| TtsError::Output(e.to_string()));
                    let _ = reply.send(result);
                }
                OutputCommand::Stop { id } => {
                    if let Some(sink) = sinks.remove(&id) {
                        sink.stop();
                    }
                }
                OutputCommand::Prune => {
                    sinks.retain(|_, sink| !sink.empty());
                }
                OutputCommand::Shutdown => break,
            }
        }

        drop(sinks);
        drop(stream);
        tracing::debug!("Audio thread shutting down");
    }
}

impl AudioOutput for RodioOutput {
    fn play(&self, source: TrackReader) -> Result<Box<dyn OutputHandle>, TtsError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (reply, rx) = mpsc::channel();
        self.cmd_tx
            .send(OutputCommand::Play { id, source, reply })
            .map_err(|_| TtsError::Output("audio thread is not running".into()))?;
        // Bounded by one command round-trip: the audio thread only creates
        // a sink and appends the source before replying.
        rx.recv()
            .map_err(|_| TtsError::Output("audio thread is not running".into()))??;

        Ok(Box::new(RodioHandle {
            cmd_tx: self.cmd_tx.clone(),
            id,
        }))
    }

    fn release(&self) {
        let _ = self.cmd_tx.send(OutputCommand::Prune);
    }
}

impl Drop for RodioOutput {
    fn drop(&mut self) {
        // The thread may already be gone.
        let _ = self.cmd_tx.send(OutputCommand::Shutdown);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

struct RodioHandle {
    cmd_tx: mpsc::Sender<OutputCommand>,
    id: u64,
}

impl OutputHandle for RodioHandle {
    fn stop(&mut self) {
        let _ = self.cmd_tx.send(OutputCommand::Stop { id: self.id });
    }
}
