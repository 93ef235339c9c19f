//! Line framing and the single-producer stream task shared by both wire formats.
//!
//! A response body arrives as arbitrary byte chunks; [`LineBuffer`] turns it
//! into complete lines and [`spawn_producer`] feeds each line through a
//! wire-specific parser into a [`ChunkReceiver`].

use std::fmt::Display;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use agentflow_core::types::StreamChunk;

use crate::ChunkReceiver;

/// What a wire parser makes of one line.
#[derive(Debug, PartialEq)]
pub enum LineEvent {
    /// Keep-alives, comments, blank lines, payloads without content.
    Skip,
    /// Deliver this chunk. Terminal chunks (`done` or `error`) end the stream.
    Chunk(StreamChunk),
}

/// Accumulates body bytes and yields complete lines.
///
/// Bytes are buffered raw so multi-byte UTF-8 sequences split across network
/// chunks decode correctly.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Next complete line without its `\n` / `\r\n` terminator.
    pub fn next_line(&mut self) -> Option<String> {
        let newline_pos = self.buffer.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
        let text = String::from_utf8_lossy(&line[..newline_pos]);
        Some(text.trim_end_matches('\r').to_string())
    }

    /// Unterminated trailing data left at EOF, if any.
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        let text = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
        if text.trim().is_empty() { None } else { Some(text) }
    }
}

/// Payload of an SSE `data:` line, or `None` for any other line.
pub fn sse_data(line: &str) -> Option<&str> {
    let value = line.strip_prefix("data:")?;
    Some(value.strip_prefix(' ').unwrap_or(value))
}

/// Spawn the producer task for one stream call.
///
/// The task reads `body`, frames lines, and sends whatever `parse` yields.
/// It stops and closes the channel after a terminal chunk, at EOF, after a
/// body read error (delivered as an error chunk), when the receiver is
/// dropped, or when `cancel` fires (no further chunk is sent).
pub fn spawn_producer<S, E, F>(
    provider: String,
    body: S,
    cancel: CancellationToken,
    mut parse: F,
) -> ChunkReceiver
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
    F: FnMut(&str) -> LineEvent + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let mut body = Box::pin(body);
        let mut lines = LineBuffer::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(provider, "Stream cancelled");
                    return;
                }
                next = body.next() => next,
            };

            match next {
                Some(Ok(bytes)) => {
                    lines.push(&bytes);
                    while let Some(line) = lines.next_line() {
                        if !dispatch(&tx, &cancel, &mut parse, &line).await {
                            return;
                        }
                    }
                }
                Some(Err(e)) => {
                    debug!(provider, %e, "Stream read failed");
                    emit(&tx, &cancel, StreamChunk::failed(format!("stream read: {e}"))).await;
                    return;
                }
                None => {
                    if let Some(line) = lines.take_remainder() {
                        dispatch(&tx, &cancel, &mut parse, &line).await;
                    }
                    debug!(provider, "Stream reached EOF");
                    return;
                }
            }
        }
    });

    rx
}

/// Parse and deliver one line. Returns `false` when the producer must stop.
async fn dispatch<F>(
    tx: &mpsc::Sender<StreamChunk>,
    cancel: &CancellationToken,
    parse: &mut F,
    line: &str,
) -> bool
where
    F: FnMut(&str) -> LineEvent,
{
    match parse(line) {
        LineEvent::Skip => {
            trace!(line, "Skipping stream line");
            true
        }
        LineEvent::Chunk(chunk) => {
            let terminal = chunk.is_terminal();
            emit(tx, cancel, chunk).await && !terminal
        }
    }
}

/// Send a chunk unless cancelled or the receiver is gone.
async fn emit(
    tx: &mpsc::Sender<StreamChunk>,
    cancel: &CancellationToken,
    chunk: StreamChunk,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(chunk) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(
        parts: Vec<Result<&'static str, &'static str>>,
    ) -> impl Stream<Item = Result<Bytes, String>> {
        futures::stream::iter(parts.into_iter().map(|p| {
            p.map(|s| Bytes::from_static(s.as_bytes()))
                .map_err(String::from)
        }))
    }

    /// Each line is content; "END" finishes; "BAD" fails.
    fn parse_test_line(line: &str) -> LineEvent {
        match line {
            "" => LineEvent::Skip,
            "END" => LineEvent::Chunk(StreamChunk::finished("")),
            "BAD" => LineEvent::Chunk(StreamChunk::failed("bad line")),
            other => LineEvent::Chunk(StreamChunk::delta(other)),
        }
    }

    async fn drain(mut rx: ChunkReceiver) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.push(chunk);
        }
        out
    }

    #[test]
    fn test_line_buffer_splits_across_pushes() {
        let mut buf = LineBuffer::default();
        buf.push(b"hel");
        assert_eq!(buf.next_line(), None);
        buf.push(b"lo\r\nwor");
        assert_eq!(buf.next_line().as_deref(), Some("hello"));
        assert_eq!(buf.next_line(), None);
        buf.push(b"ld\n\n");
        assert_eq!(buf.next_line().as_deref(), Some("world"));
        assert_eq!(buf.next_line().as_deref(), Some(""));
        assert_eq!(buf.take_remainder(), None);
    }

    #[test]
    fn test_line_buffer_utf8_split() {
        let text = "héllo\n".as_bytes();
        let mut buf = LineBuffer::default();
        // Split in the middle of the two-byte 'é'
        buf.push(&text[..2]);
        buf.push(&text[2..]);
        assert_eq!(buf.next_line().as_deref(), Some("héllo"));
    }

    #[test]
    fn test_line_buffer_remainder() {
        let mut buf = LineBuffer::default();
        buf.push(b"a\ntail");
        assert_eq!(buf.next_line().as_deref(), Some("a"));
        assert_eq!(buf.take_remainder().as_deref(), Some("tail"));
        assert_eq!(buf.take_remainder(), None);
    }

    #[test]
    fn test_sse_data() {
        assert_eq!(sse_data("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(sse_data("data:[DONE]"), Some("[DONE]"));
        assert_eq!(sse_data(": keep-alive"), None);
        assert_eq!(sse_data("event: ping"), None);
    }

    #[tokio::test]
    async fn test_producer_stops_at_terminal_chunk() {
        let rx = spawn_producer(
            "test".into(),
            body(vec![Ok("a\nb\n"), Ok("END\nafter\n")]),
            CancellationToken::new(),
            parse_test_line,
        );
        let chunks = drain(rx).await;
        let contents: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "b", ""]);
        assert!(chunks.last().unwrap().done);
    }

    #[tokio::test]
    async fn test_producer_eof_closes_without_done() {
        let rx = spawn_producer(
            "test".into(),
            body(vec![Ok("a\n\n"), Ok("tail")]),
            CancellationToken::new(),
            parse_test_line,
        );
        let chunks = drain(rx).await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].content, "tail");
        assert!(chunks.iter().all(|c| !c.done && !c.is_error()));
    }

    #[tokio::test]
    async fn test_producer_parse_error_ends_stream() {
        let rx = spawn_producer(
            "test".into(),
            body(vec![Ok("a\nBAD\nb\n")]),
            CancellationToken::new(),
            parse_test_line,
        );
        let chunks = drain(rx).await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].error.as_deref(), Some("bad line"));
    }

    #[tokio::test]
    async fn test_producer_read_error_becomes_chunk() {
        let rx = spawn_producer(
            "test".into(),
            body(vec![Ok("a\n"), Err("connection reset")]),
            CancellationToken::new(),
            parse_test_line,
        );
        let chunks = drain(rx).await;
        assert_eq!(chunks.len(), 2);
        let err = chunks[1].error.as_deref().unwrap();
        assert!(err.contains("connection reset"), "got: {err}");
    }

    #[tokio::test]
    async fn test_producer_cancelled_before_read() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let rx = spawn_producer(
            "test".into(),
            body(vec![Ok("a\nEND\n")]),
            cancel,
            parse_test_line,
        );
        assert!(drain(rx).await.is_empty());
    }

    #[tokio::test]
    async fn test_producer_cancelled_mid_stream() {
        let cancel = CancellationToken::new();
        let pending = futures::stream::iter(vec![Ok::<_, String>(Bytes::from_static(b"a\n"))])
            .chain(futures::stream::pending());
        let mut rx = spawn_producer("test".into(), pending, cancel.clone(), parse_test_line);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.content, "a");

        cancel.cancel();
        let closed = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .expect("producer should exit promptly");
        assert!(closed.is_none());
    }
}
