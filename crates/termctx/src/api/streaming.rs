//! Server-Sent Events (SSE) streaming for the OpenRouter chat completions API.
//!
//! [`OpenRouterClient::chat_stream`] returns a [`SseStream`] that yields
//! [`StreamEvent`]s as they come off the wire. Dropping the stream drops the
//! underlying HTTP response, which aborts the request; that is how a
//! cancelled query stops costing tokens.

use std::collections::VecDeque;
use std::pin::Pin;

use futures::Stream;
use serde::Deserialize;
use tracing::{debug, trace, warn};

use crate::{ApiErrorResponse, ChatRequest, OpenRouterClient, UsageInfo};

/// A single event from an SSE stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// An incremental text content delta.
    TextDelta(String),
    /// Token usage information (sent in the final chunk).
    Usage(UsageInfo),
    /// The provider reported an error in-band, after the HTTP status.
    Error(String),
    /// The stream is complete. Always the last event.
    Done,
}

/// Incremental stream of [`StreamEvent`]s. Transport failures surface as
/// `Err` items and end the stream.
pub type SseStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, String>> + Send>>;

/// Raw SSE data chunk from the OpenRouter API.
#[derive(Deserialize, Debug)]
struct StreamChunk {
    choices: Option<Vec<StreamChoice>>,
    usage: Option<UsageInfo>,
    error: Option<ApiErrorResponse>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamDelta {
    content: Option<String>,
}

/// Splits a byte stream into lines.
///
/// Works on bytes rather than `String` so a multi-byte character split
/// across two network chunks is reassembled before decoding.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buf: Vec<u8>,
}

impl SseLineBuffer {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete line, without its terminator.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buf.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&line).trim_end().to_string())
    }

    /// Whatever is left after the final newline.
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        let rest = String::from_utf8_lossy(&rest).trim().to_string();
        (!rest.is_empty()).then_some(rest)
    }
}

/// Parse one SSE line. Returns `true` when the line terminates the stream.
pub fn parse_sse_line(line: &str, events: &mut Vec<StreamEvent>) -> bool {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return false;
    }
    let Some(data) = line.strip_prefix("data:") else {
        trace!("Ignoring SSE field: {line}");
        return false;
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return true;
    }
    parse_sse_data(data, events);
    false
}

/// Parse a single SSE `data:` payload into stream events.
fn parse_sse_data(data: &str, events: &mut Vec<StreamEvent>) {
    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => {
            if let Some(err) = chunk.error {
                events.push(StreamEvent::Error(err.message));
            }
            if let Some(usage) = chunk.usage {
                events.push(StreamEvent::Usage(usage));
            }
            for choice in chunk.choices.unwrap_or_default() {
                if let Some(content) = choice.delta.and_then(|d| d.content)
                    && !content.is_empty()
                {
                    events.push(StreamEvent::TextDelta(content));
                }
                if let Some(reason) = choice.finish_reason {
                    trace!("Stream finish_reason: {reason}");
                }
            }
        }
        Err(e) => {
            warn!("Failed to parse SSE chunk: {e}; data: {data}");
        }
    }
}

struct SseState {
    resp: reqwest::Response,
    lines: SseLineBuffer,
    pending: VecDeque<StreamEvent>,
    finished: bool,
}

impl SseState {
    fn drain_lines(&mut self) {
        let mut events = Vec::new();
        while let Some(line) = self.lines.next_line() {
            if parse_sse_line(&line, &mut events) {
                self.finish(events);
                return;
            }
        }
        self.pending.extend(events);
    }

    fn finish(&mut self, mut events: Vec<StreamEvent>) {
        events.push(StreamEvent::Done);
        self.pending.extend(events);
        self.finished = true;
    }
}

impl OpenRouterClient {
    /// Send a chat completion request with SSE streaming.
    ///
    /// Fails up front on transport errors and non-success statuses, so the
    /// caller can retry before anything has been relayed. After that, events
    /// arrive incrementally and the stream always ends with
    /// [`StreamEvent::Done`] unless a read error cuts it short.
    pub async fn chat_stream(&self, body: &ChatRequest) -> Result<SseStream, String> {
        let mut stream_body =
            serde_json::to_value(body).map_err(|e| format!("failed to serialize request: {e}"))?;
        stream_body["stream"] = serde_json::Value::Bool(true);

        debug!(
            "Sending streaming chat request: model={}, messages={}",
            body.model,
            body.messages.len()
        );

        let resp = self
            .post()
            .json(&stream_body)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(format!("OpenRouter API HTTP {status}: {text}"));
        }

        let state = SseState {
            resp,
            lines: SseLineBuffer::default(),
            pending: VecDeque::new(),
            finished: false,
        };

        let stream = futures::stream::unfold(state, |mut st| async move {
            loop {
                if let Some(event) = st.pending.pop_front() {
                    return Some((Ok(event), st));
                }
                if st.finished {
                    return None;
                }
                match st.resp.chunk().await {
                    Ok(Some(bytes)) => {
                        st.lines.push(&bytes);
                        st.drain_lines();
                    }
                    Ok(None) => {
                        let mut events = Vec::new();
                        if let Some(rest) = st.lines.take_remainder() {
                            parse_sse_line(&rest, &mut events);
                        }
                        debug!("Stream ended by server");
                        st.finish(events);
                    }
                    Err(e) => {
                        st.finished = true;
                        return Some((Err(format!("failed to read streaming chunk: {e}")), st));
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(lines: &[&str]) -> (Vec<StreamEvent>, bool) {
        let mut events = Vec::new();
        for line in lines {
            if parse_sse_line(line, &mut events) {
                return (events, true);
            }
        }
        (events, false)
    }

    #[test]
    fn text_deltas_are_extracted() {
        let (events, done) = parse_all(&[
            r#"data: {"choices":[{"delta":{"content":"Hello "}}]}"#,
            r#"data: {"choices":[{"delta":{"content":"world"},"finish_reason":"stop"}]}"#,
            "data: [DONE]",
        ]);
        assert!(done);
        assert_eq!(
            events,
            vec![
                StreamEvent::TextDelta("Hello ".into()),
                StreamEvent::TextDelta("world".into()),
            ]
        );
    }

    #[test]
    fn comments_blank_lines_and_empty_deltas_are_skipped() {
        let (events, done) = parse_all(&[
            ": OPENROUTER PROCESSING",
            "",
            r#"data: {"choices":[{"delta":{"content":""}}]}"#,
            r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#,
            "event: ping",
        ]);
        assert!(!done);
        assert!(events.is_empty());
    }

    #[test]
    fn usage_and_inline_errors_are_reported() {
        let (events, _) = parse_all(&[
            r#"data: {"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":2,"total_tokens":12}}"#,
            r#"data: {"error":{"message":"provider overloaded"}}"#,
        ]);
        assert!(matches!(&events[0], StreamEvent::Usage(u) if u.total_tokens == Some(12)));
        assert_eq!(events[1], StreamEvent::Error("provider overloaded".into()));
    }

    #[test]
    fn malformed_payload_is_ignored() {
        let (events, done) = parse_all(&["data: {not json"]);
        assert!(events.is_empty());
        assert!(!done);
    }

    #[test]
    fn data_prefix_without_space_is_accepted() {
        let (_, done) = parse_all(&["data:[DONE]"]);
        assert!(done);
    }

    #[test]
    fn line_buffer_reassembles_split_utf8() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"안녕\"}}]}\n";
        let bytes = line.as_bytes();
        // Split inside the first Hangul syllable.
        let cut = line.find('안').unwrap() + 1;

        let mut buffer = SseLineBuffer::default();
        buffer.push(&bytes[..cut]);
        assert!(buffer.next_line().is_none());
        buffer.push(&bytes[cut..]);

        let mut events = Vec::new();
        let decoded = buffer.next_line().unwrap();
        parse_sse_line(&decoded, &mut events);
        assert_eq!(events, vec![StreamEvent::TextDelta("안녕".into())]);
        assert!(buffer.take_remainder().is_none());
    }

    #[test]
    fn line_buffer_handles_crlf_and_remainder() {
        let mut buffer = SseLineBuffer::default();
        buffer.push(b"data: a\r\ndata: b\r\ndata: [DO");
        assert_eq!(buffer.next_line().as_deref(), Some("data: a"));
        assert_eq!(buffer.next_line().as_deref(), Some("data: b"));
        assert!(buffer.next_line().is_none());
        buffer.push(b"NE]");
        assert_eq!(buffer.take_remainder().as_deref(), Some("data: [DONE]"));
    }
}
