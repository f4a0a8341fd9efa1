//! Integration tests for `HttpSpeechTransport` against a local server.
//!
//! A one-shot HTTP/1.1 server on `127.0.0.1` answers with a canned
//! response, so the full request/SSE path runs without external network.
//!
//! # What is tested
//!
//! - Request shape: method, path, headers and JSON body
//! - SSE audio events split across writes are reassembled into chunks
//! - Non-success statuses become transport errors carrying the status

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use futures_util::StreamExt;
use parla_tts::{
    AudioFormat, HttpSpeechTransport, SpeechRequest, StreamIngester, TtsConfig, TtsError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ── Helpers ────────────────────────────────────────────────────────

struct CapturedRequest {
    head: String,
    body: serde_json::Value,
}

/// Serve one connection: read the request, then write `parts` in order.
async fn serve_once(parts: Vec<String>) -> (String, JoinHandle<CapturedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        let mut raw = Vec::new();
        let mut buf = [0u8; 4096];
        let header_end = loop {
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0, "client closed before sending a request");
            raw.extend_from_slice(&buf[..n]);
            if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let head = String::from_utf8_lossy(&raw[..header_end]).to_string();
        let length: usize = head
            .lines()
            .find_map(|l| {
                let (name, value) = l.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse().unwrap())
            })
            .unwrap_or(0);
        while raw.len() < header_end + length {
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0, "client closed mid-body");
            raw.extend_from_slice(&buf[..n]);
        }
        let body = serde_json::from_slice(&raw[header_end..header_end + length]).unwrap();

        for part in parts {
            socket.write_all(part.as_bytes()).await.unwrap();
            socket.flush().await.unwrap();
        }
        socket.shutdown().await.unwrap();

        CapturedRequest { head, body }
    });

    (format!("http://{addr}/v1/audio/speech"), handle)
}

fn ingester(endpoint: String, api_key: Option<&str>) -> StreamIngester {
    let config = TtsConfig {
        endpoint,
        api_key: api_key.map(str::to_string),
        ..TtsConfig::default()
    };
    StreamIngester::new(Arc::new(HttpSpeechTransport::new(&config).unwrap()))
}

fn sse_head() -> String {
    "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n".to_string()
}

// ── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn streams_audio_chunks_over_http() {
    let one = STANDARD.encode(b"first chunk");
    let two = STANDARD.encode(b"second chunk");
    let event_two = format!("data: {{\"type\":\"audio\",\"audio\":\"{two}\"}}\n\n");
    let (head, tail) = event_two.split_at(20);

    let (endpoint, server) = serve_once(vec![
        sse_head(),
        ": keep-alive\n\n".to_string(),
        format!("data: {{\"type\":\"speech.audio.delta\",\"audio\":\"{one}\"}}\n\n"),
        head.to_string(),
        tail.to_string(),
        "data: {\"type\":\"speech.audio.done\"}\n\n".to_string(),
    ])
    .await;

    let request = SpeechRequest::new("Ciao", "it-IT-IsabellaNeural", "tts-1", AudioFormat::Mp3);
    let chunks: Vec<_> = ingester(endpoint, Some("secret"))
        .open(&request, CancellationToken::new())
        .await
        .unwrap()
        .collect()
        .await;
    let chunks: Vec<_> = chunks.into_iter().map(Result::unwrap).collect();
    assert_eq!(chunks, vec![&b"first chunk"[..], &b"second chunk"[..]]);

    let captured = server.await.unwrap();
    assert!(captured.head.starts_with("POST /v1/audio/speech HTTP/1.1"));
    let head = captured.head.to_ascii_lowercase();
    assert!(head.contains("accept: text/event-stream"));
    assert!(head.contains("authorization: bearer secret"));
    assert_eq!(
        captured.body,
        serde_json::json!({
            "input": "Ciao",
            "voice": "it-IT-IsabellaNeural",
            "model": "tts-1",
            "stream_format": "sse",
        })
    );
}

#[tokio::test]
async fn error_status_becomes_transport_error() {
    let body = "model overloaded";
    let (endpoint, server) = serve_once(vec![format!(
        "HTTP/1.1 500 Internal Server Error\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    )])
    .await;

    let request = SpeechRequest::new("Ciao", "it-IT-IsabellaNeural", "tts-1", AudioFormat::Pcm);
    let result = ingester(endpoint, None)
        .open(&request, CancellationToken::new())
        .await;

    match result {
        Err(TtsError::Transport { status, message }) => {
            assert_eq!(status, Some(500));
            assert!(message.contains("model overloaded"), "{message}");
        }
        Err(other) => panic!("expected a transport error, got {other:?}"),
        Ok(_) => panic!("expected a transport error, got a stream"),
    }

    let captured = server.await.unwrap();
    assert_eq!(captured.body["response_format"], "pcm");
    assert!(!captured.head.to_ascii_lowercase().contains("authorization"));
}
