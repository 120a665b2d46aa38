//! Incremental splitter for prose interleaved with single-line JSON envelopes.
//!
//! Chat bodies arrive as arbitrary byte chunks. Only complete lines (terminated by
//! `\n` or `\r\n`) are classified, so the output never depends on where a chunk
//! boundary happens to fall. A line is an envelope candidate when, trimmed, it starts
//! with `{`, ends with `}` and contains `"type"`; candidates that fail strict JSON
//! parsing are kept as prose so no user-visible content is lost.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Structured record kind.
///
/// When an object carries several recognizable fields the first match in this
/// order wins: `reasoning`, `diff`, `workspace.deliberation_trace`, `ethics`, `tab`.
/// Objects with none of those fields fall back to their `type` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EnvelopeKind {
    Reasoning,
    Diff,
    WorkspaceDeliberation,
    Ethics,
    TabHint,
    Unknown,
}

impl EnvelopeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reasoning => "reasoning",
            Self::Diff => "diff",
            Self::WorkspaceDeliberation => "workspaceDeliberation",
            Self::Ethics => "ethics",
            Self::TabHint => "tabHint",
            Self::Unknown => "unknown",
        }
    }

    fn from_type_tag(tag: &str) -> Self {
        match tag {
            "reasoning" => Self::Reasoning,
            "diff" => Self::Diff,
            "workspace" | "workspace_deliberation" | "workspaceDeliberation"
            | "deliberation_trace" => Self::WorkspaceDeliberation,
            "ethics" => Self::Ethics,
            "tab" | "tab_hint" | "tabHint" => Self::TabHint,
            _ => Self::Unknown,
        }
    }
}

/// One decoded record. Never mutated after emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub payload: Value,
    pub received_at_seq: u64,
}

/// Observer invoked synchronously, once per envelope, in stream order.
pub type EnvelopeObserver = Box<dyn FnMut(&Envelope) + Send>;

/// Per-request decoder state. Create one per chat request and drop it afterwards.
pub struct EnvelopeDecoder {
    line_buffer: Vec<u8>,
    scanned: usize,
    visible_text: String,
    next_seq: u64,
    observer: Option<EnvelopeObserver>,
}

impl EnvelopeDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            line_buffer: Vec::new(),
            scanned: 0,
            visible_text: String::new(),
            next_seq: 1,
            observer: None,
        }
    }

    #[must_use]
    pub fn with_observer<F>(observer: F) -> Self
    where
        F: FnMut(&Envelope) + Send + 'static,
    {
        let mut decoder = Self::new();
        decoder.observer = Some(Box::new(observer));
        decoder
    }

    pub fn set_observer<F>(&mut self, observer: F)
    where
        F: FnMut(&Envelope) + Send + 'static,
    {
        self.observer = Some(Box::new(observer));
    }

    /// Feed a chunk. Returns the envelopes completed by this chunk, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Envelope> {
        self.line_buffer.extend_from_slice(chunk);
        let mut emitted = Vec::new();

        while let Some(offset) = self.line_buffer[self.scanned..]
            .iter()
            .position(|byte| *byte == b'\n')
        {
            let end = self.scanned + offset + 1;
            let line: Vec<u8> = self.line_buffer.drain(..end).collect();
            self.scanned = 0;
            if let Some(envelope) = self.process_line(&line) {
                emitted.push(envelope);
            }
        }
        self.scanned = self.line_buffer.len();

        emitted
    }

    /// Flush any unterminated tail as prose.
    pub fn finalize(&mut self) {
        if self.line_buffer.is_empty() {
            return;
        }
        let tail = std::mem::take(&mut self.line_buffer);
        self.scanned = 0;
        self.visible_text.push_str(&String::from_utf8_lossy(&tail));
    }

    /// Accumulated prose. Only ever grows.
    #[must_use]
    pub fn visible_text(&self) -> &str {
        &self.visible_text
    }

    #[must_use]
    pub fn into_visible_text(self) -> String {
        self.visible_text
    }

    /// Bytes held back waiting for a line terminator.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.line_buffer.len()
    }

    fn process_line(&mut self, line: &[u8]) -> Option<Envelope> {
        let text = String::from_utf8_lossy(line);
        let trimmed = text.trim();

        if is_envelope_candidate(trimmed) {
            match serde_json::from_str::<Value>(trimmed) {
                Ok(Value::Object(object)) => {
                    let (kind, payload) = classify_object(object);
                    let envelope = Envelope {
                        kind,
                        payload,
                        received_at_seq: self.next_seq,
                    };
                    self.next_seq += 1;
                    if let Some(observer) = self.observer.as_mut() {
                        observer(&envelope);
                    }
                    return Some(envelope);
                }
                Ok(_) => {}
                Err(error) => {
                    debug!(%error, "envelope candidate failed to parse; keeping as prose");
                }
            }
        }

        self.visible_text.push_str(&text);
        None
    }
}

impl Default for EnvelopeDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EnvelopeDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvelopeDecoder")
            .field("pending_bytes", &self.line_buffer.len())
            .field("visible_len", &self.visible_text.len())
            .field("next_seq", &self.next_seq)
            .field("has_observer", &self.observer.is_some())
            .finish()
    }
}

/// Cheap pre-filter; not a JSON validity check.
#[must_use]
pub fn is_envelope_candidate(trimmed_line: &str) -> bool {
    trimmed_line.starts_with('{')
        && trimmed_line.ends_with('}')
        && trimmed_line.contains("\"type\"")
}

fn classify_object(mut object: Map<String, Value>) -> (EnvelopeKind, Value) {
    if let Some(reasoning) = object.remove("reasoning") {
        return (EnvelopeKind::Reasoning, reasoning);
    }
    if let Some(diff) = object.remove("diff") {
        return (EnvelopeKind::Diff, diff);
    }
    if let Some(trace) = object
        .get_mut("workspace")
        .and_then(Value::as_object_mut)
        .and_then(|workspace| workspace.remove("deliberation_trace"))
    {
        return (EnvelopeKind::WorkspaceDeliberation, trace);
    }
    if let Some(ethics) = object.remove("ethics") {
        return (EnvelopeKind::Ethics, ethics);
    }
    if let Some(tab) = object.remove("tab") {
        return (EnvelopeKind::TabHint, tab);
    }

    let kind = object
        .get("type")
        .and_then(Value::as_str)
        .map_or(EnvelopeKind::Unknown, EnvelopeKind::from_type_tag);
    (kind, Value::Object(object))
}
