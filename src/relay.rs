//! Server-Sent-Events relay from the upstream API to the client.
//!
//! The upstream sends `data: <json>` lines in arbitrarily sized network
//! chunks. [`SseRelay`] buffers partial lines, normalizes each payload into
//! the `{"choices":[{"delta":{"content":...}}]}` shape and re-frames it as
//! `data: <payload>\n\n`. Exactly one `data: [DONE]` terminates a normally
//! finished stream.

use crate::error::ProxyError;
use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;

pub const DATA_PREFIX: &str = "data: ";
pub const DONE_SENTINEL: &str = "[DONE]";

/// Known upstream payload shapes, tried in order.
#[derive(Debug, PartialEq)]
pub enum UpstreamChunk {
    /// `{choices:[{delta:{content}}]}`, already in the outbound shape
    Delta,
    /// `{choices:[{content}]}`
    ChoiceContent(String),
    /// top-level `content` or `text`
    Flat(String),
    /// Valid JSON in some other shape
    Unknown,
    /// Not JSON at all
    Malformed,
}

impl UpstreamChunk {
    pub fn classify(payload: &str) -> Self {
        let value: Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(_) => return UpstreamChunk::Malformed,
        };

        let first_choice = value
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first());

        if let Some(choice) = first_choice {
            if choice
                .get("delta")
                .is_some_and(|delta| delta.get("content").is_some())
            {
                return UpstreamChunk::Delta;
            }
            if let Some(content) = choice.get("content").and_then(Value::as_str) {
                return UpstreamChunk::ChoiceContent(content.to_string());
            }
        }

        for key in ["content", "text"] {
            if let Some(content) = value.get(key).and_then(Value::as_str) {
                return UpstreamChunk::Flat(content.to_string());
            }
        }

        UpstreamChunk::Unknown
    }
}

pub fn delta_payload(content: &str) -> String {
    json!({"choices": [{"delta": {"content": content}}]}).to_string()
}

/// Rewrite one `data:` payload into the outbound delta shape.
///
/// Payloads that match no known shape, including malformed JSON, are
/// returned unchanged.
pub fn normalize_payload(payload: &str) -> String {
    match UpstreamChunk::classify(payload) {
        UpstreamChunk::ChoiceContent(content) | UpstreamChunk::Flat(content) => {
            delta_payload(&content)
        }
        UpstreamChunk::Delta | UpstreamChunk::Unknown | UpstreamChunk::Malformed => {
            payload.to_string()
        }
    }
}

pub fn sse_event(payload: &str) -> Bytes {
    Bytes::from(format!("{}{}\n\n", DATA_PREFIX, payload))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// No event sent downstream yet
    Open,
    /// At least one event sent downstream
    Relaying,
    /// Terminal event queued, nothing more will be produced
    Closing,
    Closed,
}

/// Per-connection relay state machine.
#[derive(Debug)]
pub struct SseRelay {
    buffer: Vec<u8>,
    state: RelayState,
    events: usize,
    tag: String,
}

impl Default for SseRelay {
    fn default() -> Self {
        Self::new("-")
    }
}

impl SseRelay {
    /// `tag` identifies the connection in log lines (usually the request id).
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            buffer: Vec::new(),
            state: RelayState::Open,
            events: 0,
            tag: tag.into(),
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, RelayState::Closing | RelayState::Closed)
    }

    /// Feed one upstream chunk; returns the events ready to send.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        let mut out = Vec::new();
        if self.is_finished() {
            return out;
        }
        self.buffer.extend_from_slice(chunk);

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.process_line(&line[..line.len() - 1], &mut out);
            if self.is_finished() {
                self.buffer.clear();
                break;
            }
        }
        out
    }

    /// Upstream ended normally: flush the trailing line and terminate.
    pub fn finish(&mut self) -> Vec<Bytes> {
        let mut out = Vec::new();
        if self.is_finished() {
            return out;
        }
        let rest = std::mem::take(&mut self.buffer);
        if !rest.is_empty() {
            self.process_line(&rest, &mut out);
        }
        if !self.is_finished() {
            out.push(sse_event(DONE_SENTINEL));
            self.state = RelayState::Closing;
        }
        log::debug!(
            "[{}] Upstream stream ended after {} events",
            self.tag,
            self.events
        );
        out
    }

    /// Upstream failed mid-stream. An inline error event is only produced if
    /// nothing has been sent yet.
    pub fn fail(&mut self, reason: &str) -> Vec<Bytes> {
        let mut out = Vec::new();
        if self.is_finished() {
            return out;
        }
        log::error!("[{}] Upstream stream error: {}", self.tag, reason);
        if self.state == RelayState::Open {
            let error = ProxyError::Stream(reason.to_string()).to_json();
            out.push(sse_event(&error.to_string()));
            out.push(sse_event(DONE_SENTINEL));
        }
        self.buffer.clear();
        self.state = RelayState::Closing;
        out
    }

    /// All queued events have been handed to the client.
    pub fn close(&mut self) {
        self.state = RelayState::Closed;
    }

    fn process_line(&mut self, raw: &[u8], out: &mut Vec<Bytes>) {
        let line = String::from_utf8_lossy(raw);
        let line = line.strip_suffix('\r').unwrap_or(&line);
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            return;
        };
        let payload = payload.trim();

        if payload == DONE_SENTINEL {
            out.push(sse_event(DONE_SENTINEL));
            self.state = RelayState::Closing;
            return;
        }

        if payload.is_empty() {
            return;
        }

        out.push(sse_event(&normalize_payload(payload)));
        self.events += 1;
        self.state = RelayState::Relaying;
    }
}

impl Drop for SseRelay {
    fn drop(&mut self) {
        if !self.is_finished() {
            log::info!(
                "[{}] Client disconnected after {} events, relay torn down",
                self.tag,
                self.events
            );
        }
    }
}

pub type RelayStream = Pin<Box<dyn Stream<Item = Result<Bytes, actix_web::Error>>>>;

/// Turn an upstream byte stream into the normalized outbound event stream.
///
/// The returned stream never yields an error: upstream failures become an
/// inline error event (or a silent close) as decided by [`SseRelay::fail`].
/// Dropping it drops the upstream stream too.
pub fn relay<S, E>(upstream: S, tag: impl Into<String>) -> RelayStream
where
    S: Stream<Item = Result<Bytes, E>> + 'static,
    E: Display + 'static,
{
    let upstream = Box::pin(upstream);
    let init = (upstream, SseRelay::new(tag), VecDeque::<Bytes>::new());

    let events = stream::unfold(init, |(mut upstream, mut relay, mut pending)| async move {
        loop {
            if let Some(event) = pending.pop_front() {
                return Some((Ok(event), (upstream, relay, pending)));
            }
            if relay.is_finished() {
                relay.close();
                return None;
            }
            match upstream.next().await {
                Some(Ok(chunk)) => pending.extend(relay.push(&chunk)),
                Some(Err(e)) => pending.extend(relay.fail(&e.to_string())),
                None => pending.extend(relay.finish()),
            }
        }
    });
    Box::pin(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    const UPSTREAM: &str = concat!(
        ": OPENROUTER PROCESSING\n",
        "\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n",
        "\n",
        "data: {\"choices\":[{\"content\":\"lo \"}]}\r\n",
        "\r\n",
        "data: {\"text\":\"wörld\"}\n",
        "\n",
        "data: {\"choices\":\n",
        "\n",
        "event: ping\n",
        "data: [DONE]\n",
        "\n",
    );

    fn run(chunks: &[&[u8]]) -> Vec<String> {
        let mut relay = SseRelay::new("test");
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(relay.push(chunk));
        }
        out.extend(relay.finish());
        out.into_iter()
            .map(|b| String::from_utf8(b.to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn test_classify_shapes() {
        assert_eq!(
            UpstreamChunk::classify(r#"{"choices":[{"delta":{"content":"a"}}]}"#),
            UpstreamChunk::Delta
        );
        assert_eq!(
            UpstreamChunk::classify(r#"{"choices":[{"content":"a"}]}"#),
            UpstreamChunk::ChoiceContent("a".into())
        );
        assert_eq!(
            UpstreamChunk::classify(r#"{"content":"a"}"#),
            UpstreamChunk::Flat("a".into())
        );
        assert_eq!(
            UpstreamChunk::classify(r#"{"text":"a"}"#),
            UpstreamChunk::Flat("a".into())
        );
        assert_eq!(
            UpstreamChunk::classify(r#"{"usage":{"total_tokens":3}}"#),
            UpstreamChunk::Unknown
        );
        assert_eq!(
            UpstreamChunk::classify(r#"{"choices":"#),
            UpstreamChunk::Malformed
        );
    }

    #[test]
    fn test_reshaping() {
        assert_eq!(
            normalize_payload(r#"{"choices":[{"content":"hi"}]}"#),
            r#"{"choices":[{"delta":{"content":"hi"}}]}"#
        );
        assert_eq!(
            normalize_payload(r#"{"text":"hi"}"#),
            r#"{"choices":[{"delta":{"content":"hi"}}]}"#
        );
        assert_eq!(
            normalize_payload(r#"{"content":"hi"}"#),
            r#"{"choices":[{"delta":{"content":"hi"}}]}"#
        );
        let already = r#"{"id":"gen-1","choices":[{"index":0,"delta":{"role":"assistant","content":"hi"}}]}"#;
        assert_eq!(normalize_payload(already), already);
    }

    #[test]
    fn test_malformed_json_forwarded_raw() {
        let events = run(&[b"data: {\"choices\":\n\n"]);
        assert_eq!(
            events,
            vec!["data: {\"choices\":\n\n".to_string(), "data: [DONE]\n\n".to_string()]
        );
    }

    #[test]
    fn test_whole_stream() {
        let events = run(&[UPSTREAM.as_bytes()]);
        assert_eq!(
            events,
            vec![
                "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"lo \"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"wörld\"}}]}\n\n",
                "data: {\"choices\":\n\n",
                "data: [DONE]\n\n",
            ]
        );
    }

    #[test]
    fn test_split_points_do_not_change_output() {
        let bytes = UPSTREAM.as_bytes();
        let expected = run(&[bytes]);
        for split in 0..=bytes.len() {
            let (a, b) = bytes.split_at(split);
            assert_eq!(run(&[a, b]), expected, "split at {}", split);
        }
        let singles: Vec<&[u8]> = bytes.chunks(1).collect();
        assert_eq!(run(&singles), expected);
        for size in [2, 3, 7, 13] {
            let chunks: Vec<&[u8]> = bytes.chunks(size).collect();
            assert_eq!(run(&chunks), expected, "chunk size {}", size);
        }
    }

    #[test]
    fn test_exactly_one_done() {
        let events = run(&[b"data: {\"text\":\"a\"}\n\ndata: [DONE]\n\ndata: [DONE]\n\n"]);
        assert_eq!(events.iter().filter(|e| e.contains("[DONE]")).count(), 1);

        let events = run(&[b"data: {\"text\":\"a\"}\n\n"]);
        assert_eq!(events.iter().filter(|e| e.contains("[DONE]")).count(), 1);
        assert_eq!(events.last().unwrap(), "data: [DONE]\n\n");
    }

    #[test]
    fn test_data_after_done_ignored() {
        let mut relay = SseRelay::new("test");
        let first = relay.push(b"data: [DONE]\n\ndata: {\"text\":\"late\"}\n\n");
        assert_eq!(first.len(), 1);
        assert!(relay.push(b"data: {\"text\":\"later\"}\n").is_empty());
        assert!(relay.finish().is_empty());
    }

    #[test]
    fn test_trailing_line_without_newline_flushed() {
        let events = run(&[b"data: {\"content\":\"tail\"}"]);
        assert_eq!(
            events,
            vec![
                "data: {\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}\n\n".to_string(),
                "data: [DONE]\n\n".to_string(),
            ]
        );
        let events = run(&[b"data: [DONE]"]);
        assert_eq!(events, vec!["data: [DONE]\n\n".to_string()]);
    }

    #[test]
    fn test_lines_without_prefix_dropped() {
        let events = run(&[b"id: 1\nevent: message\nretry: 10\ndata:{\"text\":\"x\"}\n"]);
        assert_eq!(events, vec!["data: [DONE]\n\n".to_string()]);
    }

    #[test]
    fn test_fail_before_first_event_emits_inline_error() {
        let mut relay = SseRelay::new("test");
        let events = relay.fail("connection reset");
        assert_eq!(events.len(), 2);
        let first = String::from_utf8(events[0].to_vec()).unwrap();
        assert!(first.starts_with("data: {\"error\""));
        assert!(first.contains("connection reset"));
        let payload: Value = serde_json::from_str(first["data: ".len()..].trim()).unwrap();
        assert_eq!(payload["error"]["type"], "stream_error");
        assert_eq!(events[1].as_ref(), b"data: [DONE]\n\n");
        assert!(relay.is_finished());
    }

    #[test]
    fn test_fail_after_events_closes_silently() {
        let mut relay = SseRelay::new("test");
        assert_eq!(relay.push(b"data: {\"text\":\"a\"}\n").len(), 1);
        assert_eq!(relay.state(), RelayState::Relaying);
        assert!(relay.fail("connection reset").is_empty());
        assert!(relay.finish().is_empty());
    }

    #[tokio::test]
    async fn test_relay_stream_end_to_end() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"con")),
            Ok(Bytes::from_static(b"tent\":\"hi\"}]}\n\nda")),
            Ok(Bytes::from_static(b"ta: [DONE]\n\n")),
            Ok(Bytes::from_static(b"data: {\"text\":\"ignored\"}\n\n")),
        ];
        let out: Vec<Bytes> = relay(stream::iter(chunks), "t")
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(
            out,
            vec![
                Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n"),
                Bytes::from_static(b"data: [DONE]\n\n"),
            ]
        );
    }

    #[tokio::test]
    async fn test_relay_stream_upstream_error_mid_stream() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"data: {\"text\":\"a\"}\n\n")),
            Err(std::io::Error::other("reset")),
            Ok(Bytes::from_static(b"data: {\"text\":\"b\"}\n\n")),
        ];
        let out: Vec<Bytes> = relay(stream::iter(chunks), "t")
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(
            out,
            vec![Bytes::from_static(
                b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n"
            )]
        );
    }

    #[tokio::test]
    async fn test_client_disconnect_drops_upstream() {
        let (tx, rx) = futures::channel::mpsc::unbounded::<Result<Bytes, std::io::Error>>();
        tx.unbounded_send(Ok(Bytes::from_static(b"data: {\"text\":\"hi\"}\n\n")))
            .unwrap();

        let mut events = relay(rx, "disconnect");
        let first = events.next().await.unwrap().unwrap();
        assert_eq!(first, sse_event(&delta_payload("hi")));
        assert!(!tx.is_closed());

        drop(events);
        assert!(tx.is_closed());
        assert!(
            tx.unbounded_send(Ok(Bytes::from_static(b"data: [DONE]\n\n")))
                .is_err()
        );
        assert!(!String::from_utf8_lossy(&first).contains(DONE_SENTINEL));
    }
}
