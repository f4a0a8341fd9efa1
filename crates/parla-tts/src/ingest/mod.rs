//! Speech stream ingestion.
//!
//! Layers, outermost first:
//!
//! - [`SpeechTransport`]: opens the HTTP request, yields raw bytes.
//! - [`sse::data_frames`]: SSE line framing.
//! - [`SpeechEvent`]: business events (audio, done, error).
//! - [`StreamIngester`]: audio chunks until completion, plus the owner
//!   fetch task that fills the inflight entry and the cache.

pub mod event;
pub mod sse;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audio::AudioFormat;
use crate::cache::CacheStore;
use crate::config::TtsConfig;
use crate::decoder;
use crate::error::{DecodeError, TtsError};
use crate::inflight::{FetchOutcome, InflightEntry, InflightRegistry};

pub use event::SpeechEvent;

/// Raw response body.
pub type ByteStream = BoxStream<'static, Result<Bytes, TtsError>>;

/// Encoded audio chunks of one utterance.
pub type AudioChunkStream = BoxStream<'static, Result<Bytes, TtsError>>;

// ── Request ────────────────────────────────────────────────────────

/// Body of a synthesis request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpeechRequest {
    pub input: String,
    pub voice: String,
    pub model: String,
    pub stream_format: &'static str,
    /// Only sent when it differs from the server default (mp3).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<AudioFormat>,
}

impl SpeechRequest {
    pub fn new(
        text: impl Into<String>,
        voice: impl Into<String>,
        model: impl Into<String>,
        format: AudioFormat,
    ) -> Self {
        Self {
            input: text.into(),
            voice: voice.into(),
            model: model.into(),
            stream_format: "sse",
            response_format: (format != AudioFormat::Mp3).then_some(format),
        }
    }
}

// ── Transport port ─────────────────────────────────────────────────

/// Opens synthesis requests.
///
/// Implementations return the response body as a byte stream; dropping
/// the stream must abort the underlying connection.
#[async_trait]
pub trait SpeechTransport: Send + Sync {
    async fn open(&self, request: &SpeechRequest) -> Result<ByteStream, TtsError>;
}

/// [`SpeechTransport`] over HTTP via `reqwest`.
pub struct HttpSpeechTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpSpeechTransport {
    pub fn new(config: &TtsConfig) -> Result<Self, TtsError> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| TtsError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl SpeechTransport for HttpSpeechTransport {
    async fn open(&self, request: &SpeechRequest) -> Result<ByteStream, TtsError> {
        let mut builder = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = body.trim();
            return Err(TtsError::Transport {
                status: Some(status.as_u16()),
                message: if detail.is_empty() {
                    format!("HTTP {status}")
                } else {
                    format!("HTTP {status}: {detail}")
                },
            });
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TtsError::from))
            .boxed())
    }
}

// ── Ingester ───────────────────────────────────────────────────────

/// Reads speech event streams into audio chunks.
#[derive(Clone)]
pub struct StreamIngester {
    transport: Arc<dyn SpeechTransport>,
}

impl StreamIngester {
    pub fn new(transport: Arc<dyn SpeechTransport>) -> Self {
        Self { transport }
    }

    /// Open `request` and return its audio chunks.
    ///
    /// The stream ends after the server's completion event (or at end of
    /// body), and yields a single error on a server error event, a
    /// transport failure, or cancellation.
    pub async fn open(
        &self,
        request: &SpeechRequest,
        cancel: CancellationToken,
    ) -> Result<AudioChunkStream, TtsError> {
        let bytes = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(TtsError::Cancelled),
            opened = self.transport.open(request) => opened?,
        };
        Ok(audio_chunks(sse::data_frames(bytes), cancel).boxed())
    }

    /// Spawn the owner task for an inflight entry.
    ///
    /// Reads the whole stream into the entry regardless of how many
    /// consumers are listening, decodes the result, stores it in `cache`
    /// and settles the entry.
    pub fn spawn_fetch(
        &self,
        request: SpeechRequest,
        entry: Arc<InflightEntry>,
        registry: InflightRegistry,
        cache: CacheStore,
        format: AudioFormat,
    ) -> JoinHandle<()> {
        let ingester = self.clone();
        tokio::spawn(async move {
            let fingerprint = entry.fingerprint();
            let started = Instant::now();
            tracing::info!(
                fingerprint = %fingerprint.short(),
                voice = %request.voice,
                chars = request.input.chars().count(),
                "Fetching speech"
            );

            let outcome = ingester.ingest(&request, &entry, format).await;
            match &outcome {
                Ok(audio) => {
                    cache.put(fingerprint, Arc::clone(audio));
                    tracing::info!(
                        fingerprint = %fingerprint.short(),
                        chunks = entry.chunk_count(),
                        audio_ms = audio.duration().as_millis(),
                        elapsed_ms = started.elapsed().as_millis(),
                        "Speech fetched and cached"
                    );
                }
                Err(e) if e.is_cancellation() => {
                    tracing::debug!(fingerprint = %fingerprint.short(), "Speech fetch cancelled");
                }
                Err(e) => {
                    tracing::warn!(fingerprint = %fingerprint.short(), error = %e, "Speech fetch failed");
                }
            }
            registry.settle(&entry, outcome);
        })
    }

    async fn ingest(
        &self,
        request: &SpeechRequest,
        entry: &InflightEntry,
        format: AudioFormat,
    ) -> FetchOutcome {
        let mut chunks = self.open(request, entry.cancel_token().clone()).await?;
        while let Some(chunk) = chunks.next().await {
            entry.push_chunk(chunk?);
        }
        drop(chunks);
        entry.finish_stream();

        let bytes = entry.concat();
        let audio = tokio::task::spawn_blocking(move || decoder::decode(&bytes, format))
            .await
            .map_err(|e| DecodeError::Malformed(format!("decoder task failed: {e}")))??;
        Ok(Arc::new(audio))
    }
}

/// Turn SSE payloads into audio chunks, stopping at the first terminal
/// event. Cancellation is checked before every frame.
fn audio_chunks<S>(
    frames: S,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<Bytes, TtsError>> + Send
where
    S: Stream<Item = Result<String, TtsError>> + Send + 'static,
{
    let state = Some((frames.boxed(), cancel));

    futures_util::stream::unfold(state, |state| async move {
        let (mut frames, cancel) = state?;
        loop {
            let frame = tokio::select! {
                biased;
                () = cancel.cancelled() => return Some((Err(TtsError::Cancelled), None)),
                frame = frames.next() => frame,
            };

            let data = match frame {
                None => {
                    tracing::debug!("Speech stream ended without completion event");
                    return None;
                }
                Some(Err(e)) => return Some((Err(e), None)),
                Some(Ok(data)) => data,
            };

            match SpeechEvent::parse(&data) {
                Ok(SpeechEvent::Audio(bytes)) if bytes.is_empty() => {}
                Ok(SpeechEvent::Audio(bytes)) => {
                    return Some((Ok(bytes), Some((frames, cancel))));
                }
                Ok(SpeechEvent::Done) => return None,
                Ok(SpeechEvent::Error(message)) => {
                    return Some((Err(TtsError::Protocol(message)), None));
                }
                Ok(SpeechEvent::Ignored) => {}
                Err(e) => return Some((Err(e), None)),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use futures_util::stream;

    struct CannedTransport {
        body: Vec<&'static str>,
    }

    #[async_trait]
    impl SpeechTransport for CannedTransport {
        async fn open(&self, _request: &SpeechRequest) -> Result<ByteStream, TtsError> {
            let chunks: Vec<Result<Bytes, TtsError>> = self
                .body
                .iter()
                .map(|s| Ok(Bytes::from_static(s.as_bytes())))
                .collect();
            Ok(stream::iter(chunks).boxed())
        }
    }

    fn ingester(body: Vec<&'static str>) -> StreamIngester {
        StreamIngester::new(Arc::new(CannedTransport { body }))
    }

    fn request() -> SpeechRequest {
        SpeechRequest::new("Ciao", "it-IT-IsabellaNeural", "tts-1", AudioFormat::Mp3)
    }

    #[test]
    fn request_body_shape() {
        let json = serde_json::to_value(request()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "input": "Ciao",
                "voice": "it-IT-IsabellaNeural",
                "model": "tts-1",
                "stream_format": "sse",
            })
        );

        let pcm = SpeechRequest::new("x", "v", "tts-1", AudioFormat::Pcm);
        assert_eq!(serde_json::to_value(pcm).unwrap()["response_format"], "pcm");
    }

    #[tokio::test]
    async fn yields_audio_until_done() {
        let a = STANDARD.encode(b"one");
        let b = STANDARD.encode(b"two");
        let body = format!(
            "data: {{\"type\":\"speech.audio.delta\",\"audio\":\"{a}\"}}\n\n\
             data: {{\"type\":\"audio\",\"audio\":\"{b}\"}}\n\n\
             data: {{\"type\":\"speech.audio.done\"}}\n\n\
             data: {{\"type\":\"audio\",\"audio\":\"{a}\"}}\n\n"
        );
        let body: &'static str = Box::leak(body.into_boxed_str());

        let chunks: Vec<_> = ingester(vec![body])
            .open(&request(), CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;
        let chunks: Vec<Bytes> = chunks.into_iter().map(Result::unwrap).collect();
        assert_eq!(chunks, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
    }

    #[tokio::test]
    async fn error_event_becomes_protocol_error() {
        let chunks: Vec<_> = ingester(vec!["data: {\"type\":\"error\",\"error\":\"voice not found\"}\n"])
            .open(&request(), CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(chunks.len(), 1);
        assert!(matches!(&chunks[0], Err(TtsError::Protocol(m)) if m == "voice not found"));
    }

    #[tokio::test]
    async fn cancelled_token_yields_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = ingester(vec!["data: {}\n"]).open(&request(), cancel).await;
        assert!(matches!(result, Err(TtsError::Cancelled)));
    }

    #[tokio::test]
    async fn owner_task_caches_and_settles() {
        let pcm = STANDARD.encode([0u8, 64, 0, 64]);
        let body = format!(
            "data: {{\"type\":\"audio\",\"audio\":\"{pcm}\"}}\n\ndata: {{\"type\":\"speech.audio.done\"}}\n\n"
        );
        let body: &'static str = Box::leak(body.into_boxed_str());

        let registry = InflightRegistry::new();
        let cache = CacheStore::new();
        let fingerprint = crate::fingerprint::Fingerprint::new("v", "x");
        let ticket = registry.acquire_or_join(fingerprint);

        ingester(vec![body])
            .spawn_fetch(
                SpeechRequest::new("x", "v", "tts-1", AudioFormat::Pcm),
                Arc::clone(ticket.entry()),
                registry.clone(),
                cache.clone(),
                AudioFormat::Pcm,
            )
            .await
            .unwrap();

        let audio = ticket.completion().await.unwrap();
        assert_eq!(audio.frames(), 2);
        assert!(Arc::ptr_eq(&cache.get(&fingerprint).unwrap(), &audio));
        assert!(registry.is_empty());
    }
}
