//! Server-Sent Events framing.
//!
//! Turns a raw byte stream into the payloads of its `data:` lines. Lines
//! can be split across network reads, so incomplete lines are carried
//! over in a buffer until their newline arrives.

use bytes::{Bytes, BytesMut};
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};

use crate::error::TtsError;

/// State threaded through the `unfold` stream.
struct FrameState {
    stream: BoxStream<'static, Result<Bytes, TtsError>>,
    buf: BytesMut,
    eof: bool,
}

/// Extract `data:` payloads from an SSE byte stream.
///
/// Comments, blank lines, and other SSE fields are skipped. A final line
/// without a trailing newline is still delivered when the stream ends.
/// An upstream error is yielded once and ends the stream.
pub fn data_frames<S>(byte_stream: S) -> impl Stream<Item = Result<String, TtsError>> + Send
where
    S: Stream<Item = Result<Bytes, TtsError>> + Send + 'static,
{
    let state = FrameState {
        stream: byte_stream.boxed(),
        buf: BytesMut::new(),
        eof: false,
    };

    futures_util::stream::unfold(state, |mut st| async move {
        loop {
            let line = if let Some(line_end) = find_newline(&st.buf) {
                let line = st.buf.split_to(line_end + 1);
                Some(line)
            } else if st.eof {
                if st.buf.is_empty() {
                    return None;
                }
                Some(st.buf.split())
            } else {
                None
            };

            if let Some(line) = line {
                if let Some(data) = data_payload(&line) {
                    return Some((Ok(data), st));
                }
                continue;
            }

            // Need more data from upstream.
            match st.stream.next().await {
                Some(Ok(chunk)) => st.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    st.eof = true;
                    st.buf.clear();
                    return Some((Err(e), st));
                }
                None => st.eof = true,
            }
        }
    })
}

fn find_newline(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == b'\n')
}

/// The payload of a `data:` line, without the field name and the single
/// optional leading space.
fn data_payload(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches(['\n', '\r']);
    let value = line.strip_prefix("data:")?;
    let value = value.strip_prefix(' ').unwrap_or(value);
    if value.trim().is_empty() {
        return None;
    }
    Some(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    async fn collect(chunks: Vec<&'static str>) -> Vec<Result<String, TtsError>> {
        let input = stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c.as_bytes()))));
        data_frames(input).collect().await
    }

    fn ok(frames: Vec<Result<String, TtsError>>) -> Vec<String> {
        frames.into_iter().map(Result::unwrap).collect()
    }

    #[tokio::test]
    async fn yields_data_lines_only() {
        let frames = collect(vec![
            ": keep-alive\n",
            "event: speech\n",
            "data: {\"type\":\"speech.audio.done\"}\n\n",
        ])
        .await;
        assert_eq!(ok(frames), vec!["{\"type\":\"speech.audio.done\"}"]);
    }

    #[tokio::test]
    async fn reassembles_lines_split_across_reads() {
        let frames = collect(vec!["da", "ta: {\"a\":", "1}\r", "\ndata: x\n"]).await;
        assert_eq!(ok(frames), vec!["{\"a\":1}", "x"]);
    }

    #[tokio::test]
    async fn flushes_unterminated_final_line() {
        let frames = collect(vec!["data: one\n", "data: two"]).await;
        assert_eq!(ok(frames), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn accepts_data_without_space() {
        let frames = collect(vec!["data:compact\n"]).await;
        assert_eq!(ok(frames), vec!["compact"]);
    }

    #[tokio::test]
    async fn upstream_error_ends_stream() {
        let input = stream::iter(vec![
            Ok(Bytes::from_static(b"data: first\n")),
            Err(TtsError::transport("connection reset")),
            Ok(Bytes::from_static(b"data: never\n")),
        ]);
        let frames: Vec<_> = data_frames(input).collect().await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_deref().unwrap(), "first");
        assert!(matches!(frames[1], Err(TtsError::Transport { .. })));
    }
}
