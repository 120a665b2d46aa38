//! Transport seam for the live-event stream.
//!
//! A successful [`StreamTransport::connect`] is the transport "open" event. A
//! connection yields named string-payload messages until it errors or the peer
//! closes it; both end the connection and hand control back to the reconnect loop.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod memory;
pub mod sse;

pub use memory::{MemoryFeed, MemoryTransport};
pub use sse::{SseFrameParser, SseTransport};

/// Captured subscription parameters. Re-sent unchanged on every reconnect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeParams {
    pub endpoint: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
}

impl SubscribeParams {
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            query: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_param(key, value);
        self
    }

    pub fn set_param(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.query.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }
}

/// One inbound message: optional event name plus its string payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportMessage {
    pub name: Option<String>,
    pub data: String,
}

impl TransportMessage {
    #[must_use]
    pub fn new(name: Option<String>, data: String) -> Self {
        Self { name, data }
    }
}

#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn connect(&self, params: &SubscribeParams) -> Result<Box<dyn TransportConnection>>;
}

#[async_trait]
pub trait TransportConnection: Send {
    /// Next message; `None` once the peer has closed the stream.
    async fn next_message(&mut self) -> Option<Result<TransportMessage>>;

    async fn close(&mut self);
}
