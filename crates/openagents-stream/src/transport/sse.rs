//! Server-sent events transport over `reqwest`.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use tracing::debug;

use super::{StreamTransport, SubscribeParams, TransportConnection, TransportMessage};
use crate::error::{Result, StreamError};

pub const DEFAULT_SSE_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Incremental SSE frame parser. Output does not depend on chunk boundaries.
#[derive(Debug, Default)]
pub struct SseFrameParser {
    line_buffer: Vec<u8>,
    event_name: Option<String>,
    data_lines: Vec<String>,
}

impl SseFrameParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<TransportMessage> {
        self.line_buffer.extend_from_slice(chunk);
        let mut dispatched = Vec::new();

        while let Some(position) = self.line_buffer.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.line_buffer.drain(..=position).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(message) = self.process_line(&line) {
                dispatched.push(message);
            }
        }

        dispatched
    }

    fn process_line(&mut self, line: &str) -> Option<TransportMessage> {
        if line.is_empty() {
            let name = self.event_name.take();
            if self.data_lines.is_empty() {
                return None;
            }
            let data = std::mem::take(&mut self.data_lines).join("\n");
            return Some(TransportMessage::new(name, data));
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event_name = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            _ => {}
        }
        None
    }
}

/// Live-event transport that GETs an SSE endpoint with the captured query.
#[derive(Debug, Clone)]
pub struct SseTransport {
    http: reqwest::Client,
    connect_timeout: Duration,
}

impl SseTransport {
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            connect_timeout: DEFAULT_SSE_CONNECT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

impl Default for SseTransport {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

#[async_trait]
impl StreamTransport for SseTransport {
    async fn connect(&self, params: &SubscribeParams) -> Result<Box<dyn TransportConnection>> {
        let request = self
            .http
            .get(&params.endpoint)
            .query(&params.query)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send();

        let response = tokio::time::timeout(self.connect_timeout, request)
            .await
            .map_err(|_| {
                StreamError::Transport(format!(
                    "connection timeout after {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(|error| StreamError::Request(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StreamError::Http {
                status: status.as_u16(),
                body,
            });
        }
        debug!(endpoint = %params.endpoint, "sse stream opened");

        let chunks = response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|error| error.to_string())
            })
            .boxed();

        Ok(Box::new(SseConnection {
            chunks,
            parser: SseFrameParser::new(),
            pending: VecDeque::new(),
        }))
    }
}

struct SseConnection {
    chunks: BoxStream<'static, std::result::Result<Vec<u8>, String>>,
    parser: SseFrameParser,
    pending: VecDeque<TransportMessage>,
}

#[async_trait]
impl TransportConnection for SseConnection {
    async fn next_message(&mut self) -> Option<Result<TransportMessage>> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Some(Ok(message));
            }
            match self.chunks.next().await {
                Some(Ok(chunk)) => self.pending.extend(self.parser.push(&chunk)),
                Some(Err(error)) => return Some(Err(StreamError::Read(error))),
                None => return None,
            }
        }
    }

    async fn close(&mut self) {
        self.pending.clear();
        self.chunks = stream::empty().boxed();
    }
}

#[cfg(test)]
mod tests {
    use super::SseFrameParser;
    use crate::transport::TransportMessage;

    const WIRE: &str = ": keepalive\r\n\
event: stability\r\n\
data: {\"type\":\"stability\",\"level\":\"high\"}\r\n\
\r\n\
data: line one\n\
data: line two\n\
\n\
event: orphan\n\
\n\
data\n\
\n";

    fn expected() -> Vec<TransportMessage> {
        vec![
            TransportMessage::new(
                Some("stability".to_string()),
                "{\"type\":\"stability\",\"level\":\"high\"}".to_string(),
            ),
            TransportMessage::new(None, "line one\nline two".to_string()),
            TransportMessage::new(None, String::new()),
        ]
    }

    #[test]
    fn parses_named_multiline_and_empty_data_frames() {
        let mut parser = SseFrameParser::new();
        assert_eq!(parser.push(WIRE.as_bytes()), expected());
    }

    #[test]
    fn frames_split_across_every_byte_boundary_parse_identically() {
        let mut parser = SseFrameParser::new();
        let mut messages = Vec::new();
        for byte in WIRE.as_bytes() {
            messages.extend(parser.push(std::slice::from_ref(byte)));
        }
        assert_eq!(messages, expected());
    }

    #[test]
    fn incomplete_frame_is_held_until_blank_line() {
        let mut parser = SseFrameParser::new();
        assert!(parser.push(b"data: {\"type\":\"phi\"").is_empty());
        assert!(parser.push(b",\"value\":1}\n").is_empty());
        let messages = parser.push(b"\n");
        assert_eq!(
            messages,
            vec![TransportMessage::new(
                None,
                "{\"type\":\"phi\",\"value\":1}".to_string()
            )]
        );
    }
}
