use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use futures::stream::Stream;

use strand_core::error::{Result, StrandError};

/// Incremental parser for `text/event-stream` bodies.
///
/// Bytes are buffered until a blank line closes an event, so multi-byte
/// characters split across network chunks decode correctly.
#[derive(Default)]
pub struct SseParser {
    buffer: BytesMut,
}

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes into the parser and extract complete events.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some((end, sep_len)) = find_boundary(&self.buffer) {
            let block = self.buffer.split_to(end);
            self.buffer.advance(sep_len);

            let text = String::from_utf8_lossy(&block);
            if let Some(event) = parse_block(&text) {
                events.push(event);
            }
        }

        events
    }
}

/// Position and length of the first blank-line separator.
fn find_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event_type = None;
    let mut data_lines = Vec::new();

    for line in block.lines() {
        let line = line.trim_end_matches('\r');
        if line.starts_with(':') {
            continue;
        }
        if let Some(val) = line.strip_prefix("event:") {
            event_type = Some(val.trim_start().to_string());
        } else if let Some(val) = line.strip_prefix("data:") {
            data_lines.push(val.strip_prefix(' ').unwrap_or(val).to_string());
        }
    }

    if data_lines.is_empty() {
        None
    } else {
        Some(SseEvent {
            event_type,
            data: data_lines.join("\n"),
        })
    }
}

/// A stream of SSE events over a byte stream. Transport errors are surfaced
/// as `ProviderStream` instead of silently ending the stream.
pub struct SseStream<S> {
    inner: S,
    parser: SseParser,
    pending: VecDeque<SseEvent>,
    finished: bool,
}

impl<S> SseStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            parser: SseParser::new(),
            pending: VecDeque::new(),
            finished: false,
        }
    }
}

impl<S, B, E> Stream for SseStream<S>
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    type Item = Result<SseEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if this.finished {
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.pending.extend(this.parser.feed(bytes.as_ref()));
                }
                Poll::Ready(Some(Err(e))) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(StrandError::ProviderStream(e.to_string()))));
                }
                Poll::Ready(None) => {
                    this.finished = true;
                    // Flush a trailing event that lacked its final blank line.
                    this.pending.extend(this.parser.feed(b"\n\n"));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_sse_parser_basic() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"event: message\ndata: {\"x\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type.as_deref(), Some("message"));
        assert_eq!(events[0].data, "{\"x\":1}");
    }

    #[test]
    fn test_sse_parser_chunked_utf8() {
        let mut parser = SseParser::new();
        let payload = "data: héllo\n\n".as_bytes();
        // Split inside the two-byte 'é'
        let split = payload.iter().position(|&b| b == 0xC3).unwrap() + 1;
        assert!(parser.feed(&payload[..split]).is_empty());
        let events = parser.feed(&payload[split..]);
        assert_eq!(events[0].data, "héllo");
    }

    #[test]
    fn test_sse_parser_crlf_and_comments() {
        let mut parser = SseParser::new();
        let events = parser.feed(b": keepalive\r\ndata: [DONE]\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert!(events[0].is_done());
    }

    #[tokio::test]
    async fn sse_stream_flushes_trailing_event() {
        let chunks: Vec<std::result::Result<Vec<u8>, String>> = vec![
            Ok(b"data: a\n\ndata: ".to_vec()),
            Ok(b"b".to_vec()),
        ];
        let events: Vec<_> = SseStream::new(futures::stream::iter(chunks))
            .collect::<Vec<_>>()
            .await;
        let data: Vec<_> = events.into_iter().map(|e| e.unwrap().data).collect();
        assert_eq!(data, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn sse_stream_reports_transport_error() {
        let chunks: Vec<std::result::Result<Vec<u8>, String>> =
            vec![Ok(b"data: a\n\n".to_vec()), Err("reset".into())];
        let events: Vec<_> = SseStream::new(futures::stream::iter(chunks)).collect().await;
        assert!(events[0].is_ok());
        assert!(matches!(events[1], Err(StrandError::ProviderStream(_))));
    }
}
