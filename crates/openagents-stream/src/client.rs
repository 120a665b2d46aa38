//! Reconnecting live-event client.
//!
//! One spawned task owns each subscription: it connects, pumps messages through
//! the adapter into the [`CanonicalEventLog`], and sleeps out backoff delays.
//! Every effect is applied under the lifecycle lock after checking the task's
//! generation, so once `stop()` or a new `subscribe()` returns, nothing from the
//! previous connection can touch the log or the status again.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::event::{CanonicalEvent, adapt_live_message};
use crate::event_log::CanonicalEventLog;
use crate::lifecycle::{
    BackoffPolicy, ConnectionStatus, ErrorOutcome, Generation, StreamLifecycle,
};
use crate::transport::{StreamTransport, SubscribeParams, TransportConnection, TransportMessage};

const NOTIFICATION_CAPACITY: usize = 256;

/// Maps one transport message to a canonical event; `None` drops it.
pub type EventAdapter = Arc<dyn Fn(&TransportMessage) -> Option<CanonicalEvent> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientNotification {
    Status(ConnectionStatus),
    Appended { seq: u64 },
    /// Sent once when reconnect attempts are exhausted.
    Terminal { attempts: u32, last_error: String },
}

#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Appended to the log on every successful open.
    pub bootstrap: Vec<CanonicalEvent>,
}

struct Shared {
    lifecycle: Mutex<StreamLifecycle<SubscribeParams>>,
    transport: Arc<dyn StreamTransport>,
    adapter: EventAdapter,
    log: CanonicalEventLog,
    notifications: broadcast::Sender<ClientNotification>,
}

pub struct ReconnectingStreamClient {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectingStreamClient {
    #[must_use]
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        log: CanonicalEventLog,
        policy: BackoffPolicy,
    ) -> Self {
        Self::with_adapter(transport, log, policy, Arc::new(adapt_live_message))
    }

    #[must_use]
    pub fn with_adapter(
        transport: Arc<dyn StreamTransport>,
        log: CanonicalEventLog,
        policy: BackoffPolicy,
        adapter: EventAdapter,
    ) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                lifecycle: Mutex::new(StreamLifecycle::new(policy)),
                transport,
                adapter,
                log,
                notifications,
            }),
            task: Mutex::new(None),
        }
    }

    /// Start a subscription. Must be called from within a tokio runtime.
    ///
    /// Refused with [`crate::StreamError::AlreadyActive`] while connecting or open.
    /// From backoff, disconnected or idle, any previous connection is superseded.
    pub fn subscribe(&self, params: SubscribeParams, options: SubscribeOptions) -> Result<Generation> {
        let generation = {
            let mut lifecycle = self.shared.lifecycle();
            let generation = lifecycle.begin(params.clone())?;
            self.shared.publish_status(&lifecycle);
            generation
        };
        info!(
            generation = generation.value(),
            endpoint = %params.endpoint,
            "live stream subscribe"
        );

        let task = tokio::spawn(run_subscription(
            Arc::clone(&self.shared),
            generation,
            params,
            options,
        ));
        if let Some(previous) = self.lock_task().replace(task) {
            previous.abort();
        }
        Ok(generation)
    }

    /// Cancel the subscription, its transport and any pending backoff timer.
    pub fn stop(&self) {
        let generation = {
            let mut lifecycle = self.shared.lifecycle();
            let generation = lifecycle.stop();
            self.shared.publish_status(&lifecycle);
            generation
        };
        if let Some(task) = self.lock_task().take() {
            task.abort();
        }
        info!(generation = generation.value(), "live stream stopped");
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.shared.lifecycle().status()
    }

    #[must_use]
    pub fn params(&self) -> Option<SubscribeParams> {
        self.shared.lifecycle().params().cloned()
    }

    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.shared.lifecycle().last_error().map(str::to_string)
    }

    #[must_use]
    pub fn log(&self) -> &CanonicalEventLog {
        &self.shared.log
    }

    #[must_use]
    pub fn notifications(&self) -> broadcast::Receiver<ClientNotification> {
        self.shared.notifications.subscribe()
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ReconnectingStreamClient {
    fn drop(&mut self) {
        self.shared.lifecycle().stop();
        if let Some(task) = self.lock_task().take() {
            task.abort();
        }
    }
}

impl Shared {
    fn lifecycle(&self) -> MutexGuard<'_, StreamLifecycle<SubscribeParams>> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_status(&self, lifecycle: &StreamLifecycle<SubscribeParams>) {
        let _ = self
            .notifications
            .send(ClientNotification::Status(lifecycle.status()));
    }

    fn open(&self, generation: Generation, bootstrap: &[CanonicalEvent]) -> bool {
        let mut lifecycle = self.lifecycle();
        if !lifecycle.mark_open(generation) {
            return false;
        }
        self.publish_status(&lifecycle);
        for event in bootstrap {
            let seq = self.log.append(event.clone());
            let _ = self.notifications.send(ClientNotification::Appended { seq });
        }
        info!(
            generation = generation.value(),
            bootstrap = bootstrap.len(),
            "live stream open"
        );
        true
    }

    fn append_if_current(&self, generation: Generation, event: CanonicalEvent) -> bool {
        let lifecycle = self.lifecycle();
        if !lifecycle.is_current(generation) {
            return false;
        }
        let kind = event.kind_str();
        let seq = self.log.append(event);
        debug!(generation = generation.value(), seq, kind, "event appended");
        let _ = self.notifications.send(ClientNotification::Appended { seq });
        true
    }

    fn fail(&self, generation: Generation, error: String) -> ErrorOutcome {
        let mut lifecycle = self.lifecycle();
        let outcome = lifecycle.mark_error(generation, error);
        match &outcome {
            ErrorOutcome::Retry { attempt, delay, .. } => {
                warn!(
                    generation = generation.value(),
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = lifecycle.last_error().unwrap_or_default(),
                    "live stream transport error; backing off"
                );
                self.publish_status(&lifecycle);
            }
            ErrorOutcome::GiveUp {
                attempts,
                last_error,
            } => {
                warn!(
                    generation = generation.value(),
                    attempts,
                    error = %last_error,
                    "live stream reconnect attempts exhausted"
                );
                self.publish_status(&lifecycle);
                let _ = self.notifications.send(ClientNotification::Terminal {
                    attempts: *attempts,
                    last_error: last_error.clone(),
                });
            }
            ErrorOutcome::Stale => {
                debug!(generation = generation.value(), "stale transport error ignored");
            }
        }
        outcome
    }

    fn retry_due(&self, generation: Generation) -> Option<(Generation, SubscribeParams)> {
        let mut lifecycle = self.lifecycle();
        let next = lifecycle.retry_due(generation);
        match &next {
            Some((next_generation, _)) => {
                debug!(
                    generation = next_generation.value(),
                    "backoff elapsed; reconnecting"
                );
                self.publish_status(&lifecycle);
            }
            None => debug!(generation = generation.value(), "stale backoff timer ignored"),
        }
        next
    }

    /// Pump messages until the connection ends. `None` means the generation was
    /// superseded mid-stream.
    async fn pump(
        &self,
        generation: Generation,
        connection: &mut dyn TransportConnection,
    ) -> Option<String> {
        loop {
            match connection.next_message().await {
                Some(Ok(message)) => {
                    let Some(event) = (self.adapter)(&message) else {
                        continue;
                    };
                    if !self.append_if_current(generation, event) {
                        return None;
                    }
                }
                Some(Err(error)) => return Some(error.to_string()),
                None => return Some("stream closed by peer".to_string()),
            }
        }
    }
}

async fn run_subscription(
    shared: Arc<Shared>,
    mut generation: Generation,
    mut params: SubscribeParams,
    options: SubscribeOptions,
) {
    loop {
        let error = match shared.transport.connect(&params).await {
            Ok(mut connection) => {
                if !shared.open(generation, &options.bootstrap) {
                    connection.close().await;
                    return;
                }
                let ended = shared.pump(generation, connection.as_mut()).await;
                connection.close().await;
                match ended {
                    Some(error) => error,
                    None => return,
                }
            }
            Err(error) => error.to_string(),
        };

        match shared.fail(generation, error) {
            ErrorOutcome::Retry { delay, .. } => {
                tokio::time::sleep(delay).await;
                match shared.retry_due(generation) {
                    Some((next_generation, next_params)) => {
                        generation = next_generation;
                        params = next_params;
                    }
                    None => return,
                }
            }
            ErrorOutcome::GiveUp { .. } | ErrorOutcome::Stale => return,
        }
    }
}
