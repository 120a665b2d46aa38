//! Scripted in-process transport.
//!
//! Each `connect` consumes the next scripted outcome: a refusal, or an accepted
//! connection fed through a [`MemoryFeed`]. Dropping the feed closes the stream.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{StreamTransport, SubscribeParams, TransportConnection, TransportMessage};
use crate::error::{Result, StreamError};

enum MemoryFrame {
    Message(TransportMessage),
    Error(String),
}

enum ScriptedConnect {
    Refuse(String),
    Accept(mpsc::UnboundedReceiver<MemoryFrame>),
}

/// Sender side of one accepted scripted connection.
#[derive(Debug, Clone)]
pub struct MemoryFeed {
    tx: mpsc::UnboundedSender<MemoryFrame>,
}

impl MemoryFeed {
    /// Deliver a message. Returns `false` once the connection is gone.
    pub fn send(&self, message: TransportMessage) -> bool {
        self.tx.send(MemoryFrame::Message(message)).is_ok()
    }

    pub fn send_json(&self, value: &Value) -> bool {
        self.send(TransportMessage::new(None, value.to_string()))
    }

    /// Fail the connection with a transport error.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.tx.send(MemoryFrame::Error(reason.into())).is_ok()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Default)]
pub struct MemoryTransport {
    script: Mutex<VecDeque<ScriptedConnect>>,
    connects: Mutex<Vec<SubscribeParams>>,
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse_next(&self, reason: impl Into<String>) {
        self.lock_script()
            .push_back(ScriptedConnect::Refuse(reason.into()));
    }

    #[must_use]
    pub fn accept_next(&self) -> MemoryFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock_script().push_back(ScriptedConnect::Accept(rx));
        MemoryFeed { tx }
    }

    /// Params of every connect attempt so far, in order.
    #[must_use]
    pub fn connect_log(&self) -> Vec<SubscribeParams> {
        self.connects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.connects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<ScriptedConnect>> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StreamTransport for MemoryTransport {
    async fn connect(&self, params: &SubscribeParams) -> Result<Box<dyn TransportConnection>> {
        self.connects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(params.clone());

        let next = self.lock_script().pop_front();
        match next {
            Some(ScriptedConnect::Accept(rx)) => Ok(Box::new(MemoryConnection { rx })),
            Some(ScriptedConnect::Refuse(reason)) => Err(StreamError::Transport(reason)),
            None => Err(StreamError::Transport(
                "no scripted connection available".to_string(),
            )),
        }
    }
}

struct MemoryConnection {
    rx: mpsc::UnboundedReceiver<MemoryFrame>,
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    async fn next_message(&mut self) -> Option<Result<TransportMessage>> {
        match self.rx.recv().await? {
            MemoryFrame::Message(message) => Some(Ok(message)),
            MemoryFrame::Error(error) => Some(Err(StreamError::Transport(error))),
        }
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}
