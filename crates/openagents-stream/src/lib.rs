//! Streaming consumption layer for OpenAgents live runs.
//!
//! Two independent inbound paths:
//! - Chat responses: a byte stream of prose interleaved with newline-delimited
//!   JSON envelopes, split by [`EnvelopeDecoder`].
//! - Live events: a reconnecting subscription whose messages are normalized into
//!   a bounded [`CanonicalEventLog`], with risk signals driving the
//!   [`StabilityMitigationController`].
//!
//! [`LiveSession`] wires the live path together.

pub mod chat_stream;
pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod event;
pub mod event_log;
pub mod lifecycle;
pub mod metric_series;
pub mod mitigation;
pub mod session;
pub mod transport;

pub use chat_stream::{ChatStreamClient, ChatTranscript, decode_chunk_stream};
pub use client::{ClientNotification, EventAdapter, ReconnectingStreamClient, SubscribeOptions};
pub use config::{ConfigError, StreamConfig};
pub use envelope::{Envelope, EnvelopeDecoder, EnvelopeKind, EnvelopeObserver};
pub use error::{Result, StreamError};
pub use event::{CanonicalEvent, RiskLevel, UnknownRiskLevel, adapt_live_message};
pub use event_log::{CanonicalEventLog, LogEntry};
pub use lifecycle::{
    BackoffPolicy, ConnectionState, ConnectionStatus, ErrorOutcome, Generation, StreamLifecycle,
};
pub use metric_series::MetricSeriesBuffer;
pub use mitigation::{
    Adjustment, MitigationConfig, MitigationState, StabilityMitigationController, WeightVector,
};
pub use session::{LiveSession, SessionState};
pub use transport::{
    MemoryFeed, MemoryTransport, SseFrameParser, SseTransport, StreamTransport, SubscribeParams,
    TransportConnection, TransportMessage,
};
