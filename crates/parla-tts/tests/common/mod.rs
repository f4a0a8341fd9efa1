//! Shared fakes for the engine integration tests.
//!
//! Nothing here touches audio hardware or the network: speech arrives
//! through [`ScriptedTransport`], audio is pulled with
//! [`ManualOutput::render`](parla_tts::ManualOutput::render), and
//! notifications are captured by [`RecordingNotifier`].

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream;
use parla_tts::ingest::ByteStream;
use parla_tts::{
    AudioFormat, AudioOutput, ManualOutput, Notification, Notifier, PlaybackEngine, PlaybackPhase,
    SpeechRequest, SpeechTransport, TtsConfig, TtsError,
};
use tokio::sync::mpsc;

pub const VOICE: &str = "it-IT-IsabellaNeural";

/// Sample rate of the raw PCM format.
pub const RATE: usize = 24_000;

// ── Scripted speech server ─────────────────────────────────────────

enum Script {
    /// Every request gets the same complete body.
    Canned(String),
    /// Every request hands a [`ServerConnection`] to the test.
    Live(mpsc::UnboundedSender<ServerConnection>),
}

/// Speech transport driven by the test.
pub struct ScriptedTransport {
    script: Script,
    opened: AtomicUsize,
    requests: Mutex<Vec<SpeechRequest>>,
}

impl ScriptedTransport {
    /// Answer every request with `body`.
    pub fn canned(body: String) -> Arc<Self> {
        Arc::new(Self {
            script: Script::Canned(body),
            opened: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Hand every request to the test as a [`ServerConnection`].
    pub fn live() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerConnection>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            script: Script::Live(tx),
            opened: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        });
        (transport, rx)
    }

    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<SpeechRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechTransport for ScriptedTransport {
    async fn open(&self, request: &SpeechRequest) -> Result<ByteStream, TtsError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        match &self.script {
            Script::Canned(body) => {
                let chunk: Result<Bytes, TtsError> = Ok(Bytes::from(body.clone()));
                Ok(stream::iter(vec![chunk]).boxed())
            }
            Script::Live(connections) => {
                let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
                connections
                    .send(ServerConnection {
                        request: request.clone(),
                        tx,
                    })
                    .map_err(|_| TtsError::transport("test server is gone"))?;
                Ok(stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|bytes| (Ok(bytes), rx))
                })
                .boxed())
            }
        }
    }
}

/// One open response stream. Dropping it ends the body.
pub struct ServerConnection {
    pub request: SpeechRequest,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ServerConnection {
    pub fn audio(&self, audio: &[u8]) {
        self.raw(&audio_event(audio));
    }

    pub fn done(&self) {
        self.raw(&done_event());
    }

    pub fn error(&self, message: &str) {
        self.raw(&error_event(message));
    }

    /// Send raw body bytes. Ignored once the client hung up.
    pub fn raw(&self, body: &str) {
        let _ = self.tx.send(Bytes::from(body.to_owned()));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub async fn next_connection(rx: &mut mpsc::UnboundedReceiver<ServerConnection>) -> ServerConnection {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no request reached the speech server")
        .expect("speech transport dropped")
}

// ── Wire helpers ───────────────────────────────────────────────────

pub fn audio_event(audio: &[u8]) -> String {
    format!(
        "data: {{\"type\":\"speech.audio.delta\",\"audio\":\"{}\"}}\n\n",
        STANDARD.encode(audio)
    )
}

pub fn done_event() -> String {
    "data: {\"type\":\"speech.audio.done\"}\n\n".to_string()
}

pub fn error_event(message: &str) -> String {
    format!("data: {{\"type\":\"error\",\"error\":\"{message}\"}}\n\n")
}

/// Complete event stream carrying `audio` in one chunk.
pub fn speech_body(audio: &[u8]) -> String {
    audio_event(audio) + &done_event()
}

/// Raw s16le PCM holding `frames` frames of a constant `level`.
pub fn pcm(frames: usize, level: i16) -> Vec<u8> {
    std::iter::repeat_n(level.to_le_bytes(), frames)
        .flatten()
        .collect()
}

/// Silent MPEG-1 Layer III stream: 25 frames, 48 kHz mono, 64 kbit/s.
pub const MP3_SILENCE: &[u8] = include_bytes!("../fixtures/silence-48k-mono.mp3");

/// Size of one frame in [`MP3_SILENCE`].
pub const MP3_FRAME_LEN: usize = 192;

/// Decoded frames per MPEG-1 Layer III frame.
pub const MP3_FRAME_SAMPLES: usize = 1_152;

/// PCM for `millis` of audio at half scale.
pub fn pcm_millis(millis: usize) -> Vec<u8> {
    pcm(RATE * millis / 1000, i16::MAX / 2)
}

// ── Notifier ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn notifications(&self) -> Vec<Notification> {
        self.seen.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.seen.lock().unwrap().push(notification);
    }
}

// ── Engine harness ─────────────────────────────────────────────────

pub fn config(format: AudioFormat, progressive: bool) -> TtsConfig {
    TtsConfig {
        audio_format: format,
        progressive,
        ..TtsConfig::default()
    }
}

pub struct Harness {
    pub engine: PlaybackEngine,
    pub output: ManualOutput,
    pub notifier: Arc<RecordingNotifier>,
}

/// Initialised engine over `transport` with a manual output.
pub fn harness(config: TtsConfig, transport: Arc<ScriptedTransport>) -> Harness {
    harness_with_output(config, transport, ManualOutput::new())
}

pub fn harness_with_output(
    config: TtsConfig,
    transport: Arc<ScriptedTransport>,
    output: ManualOutput,
) -> Harness {
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = PlaybackEngine::builder(config)
        .transport(transport)
        .output(Arc::new(output.clone()) as Arc<dyn AudioOutput>)
        .notifier(Arc::clone(&notifier) as Arc<dyn Notifier>)
        .build()
        .unwrap();
    engine.init().unwrap();
    Harness {
        engine,
        output,
        notifier,
    }
}

/// Wait until the engine reports `phase`.
pub async fn wait_for_phase(engine: &PlaybackEngine, phase: PlaybackPhase) {
    let mut rx = engine.watch();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if rx.borrow_and_update().phase == phase {
                return;
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("engine never reached {phase}, stuck at {}", engine.phase()));
}

/// Poll `condition` until it holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

/// Spawn `play` so the test can drive the server meanwhile.
pub fn spawn_play(
    engine: &PlaybackEngine,
    text: &str,
) -> tokio::task::JoinHandle<Result<(), TtsError>> {
    let engine = engine.clone();
    let text = text.to_string();
    tokio::spawn(async move { engine.play(&text, VOICE).await })
}
