//! Connection lifecycle for one logical subscription.
//!
//! Pure state: no I/O, no timers. The async driver in [`crate::client`] feeds it
//! transport outcomes tagged with the [`Generation`] they belong to; anything tagged
//! with a superseded generation is rejected, which is what makes `stop()` and a
//! fresh `subscribe()` cancel every in-flight callback of the previous connection.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};

pub const DEFAULT_RECONNECT_BASE_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 8_000;
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    BackoffWait,
    Disconnected,
}

impl ConnectionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::BackoffWait => "backoff_wait",
            Self::Disconnected => "disconnected",
        }
    }

    /// States in which a new `subscribe` is refused.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }
}

/// Identity of one connection attempt. Strictly increasing per lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

/// Reconnect indicator for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub attempt: u32,
    pub next_retry_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_RECONNECT_BASE_MS,
            max_delay_ms: DEFAULT_RECONNECT_MAX_MS,
            max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
        }
    }
}

impl BackoffPolicy {
    /// `min(base * 2^(attempt - 1), max)` for a 1-based attempt.
    #[must_use]
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(32);
        let scaled = self
            .base_delay_ms
            .max(1)
            .saturating_mul(1_u64 << exponent);
        scaled.min(self.max_delay_ms.max(self.base_delay_ms.max(1)))
    }

    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.delay_ms(attempt))
    }
}

/// What the driver should do after a transport error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorOutcome {
    /// Wait `delay`, then call [`StreamLifecycle::retry_due`] with the same generation.
    Retry {
        generation: Generation,
        attempt: u32,
        delay: Duration,
    },
    /// Attempts exhausted; the lifecycle is now `Disconnected`.
    GiveUp { attempts: u32, last_error: String },
    /// The error belongs to a superseded generation and was ignored.
    Stale,
}

#[derive(Debug, Clone)]
pub struct StreamLifecycle<P> {
    policy: BackoffPolicy,
    state: ConnectionState,
    generation: u64,
    attempt: u32,
    next_retry_ms: Option<u64>,
    params: Option<P>,
    last_error: Option<String>,
}

impl<P: Clone> StreamLifecycle<P> {
    #[must_use]
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Idle,
            generation: 0,
            attempt: 0,
            next_retry_ms: None,
            params: None,
            last_error: None,
        }
    }

    /// Capture `params` and move to `Connecting` under a fresh generation.
    ///
    /// Refused while `Connecting` or `Open`. From `BackoffWait` the pending retry is
    /// superseded.
    pub fn begin(&mut self, params: P) -> Result<Generation> {
        if self.state.is_active() {
            return Err(StreamError::AlreadyActive { state: self.state });
        }
        self.params = Some(params);
        self.attempt = 0;
        self.last_error = None;
        Ok(self.enter_connecting())
    }

    #[must_use]
    pub fn is_current(&self, generation: Generation) -> bool {
        generation.0 == self.generation
    }

    /// Transport opened. Returns `false` for stale generations.
    pub fn mark_open(&mut self, generation: Generation) -> bool {
        if !self.is_current(generation) || self.state != ConnectionState::Connecting {
            return false;
        }
        self.state = ConnectionState::Open;
        self.attempt = 0;
        self.next_retry_ms = None;
        self.last_error = None;
        true
    }

    pub fn mark_error(&mut self, generation: Generation, error: impl Into<String>) -> ErrorOutcome {
        if !self.is_current(generation) || !self.state.is_active() {
            return ErrorOutcome::Stale;
        }
        let error = error.into();
        self.attempt = self.attempt.saturating_add(1);
        self.last_error = Some(error.clone());

        if self.attempt > self.policy.max_attempts {
            self.state = ConnectionState::Disconnected;
            self.next_retry_ms = None;
            return ErrorOutcome::GiveUp {
                attempts: self.attempt,
                last_error: error,
            };
        }

        let delay_ms = self.policy.delay_ms(self.attempt);
        self.state = ConnectionState::BackoffWait;
        self.next_retry_ms = Some(delay_ms);
        ErrorOutcome::Retry {
            generation,
            attempt: self.attempt,
            delay: Duration::from_millis(delay_ms),
        }
    }

    /// Backoff timer fired. Returns the new generation and the captured params, or
    /// `None` if the timer was superseded.
    pub fn retry_due(&mut self, generation: Generation) -> Option<(Generation, P)> {
        if !self.is_current(generation) || self.state != ConnectionState::BackoffWait {
            return None;
        }
        let params = self.params.clone()?;
        Some((self.enter_connecting(), params))
    }

    /// Invalidate every outstanding generation and return to `Idle`.
    pub fn stop(&mut self) -> Generation {
        self.generation += 1;
        self.state = ConnectionState::Idle;
        self.attempt = 0;
        self.next_retry_ms = None;
        Generation(self.generation)
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    #[must_use]
    pub fn params(&self) -> Option<&P> {
        self.params.as_ref()
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    #[must_use]
    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    #[must_use]
    pub fn current_generation(&self) -> Generation {
        Generation(self.generation)
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            attempt: self.attempt,
            next_retry_ms: self.next_retry_ms,
        }
    }

    fn enter_connecting(&mut self) -> Generation {
        self.generation += 1;
        self.state = ConnectionState::Connecting;
        self.next_retry_ms = None;
        Generation(self.generation)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{BackoffPolicy, ConnectionState, ErrorOutcome, StreamLifecycle};
    use crate::error::StreamError;

    fn lifecycle() -> StreamLifecycle<&'static str> {
        StreamLifecycle::new(BackoffPolicy::default())
    }

    #[test]
    fn five_consecutive_errors_schedule_capped_delays_then_give_up() {
        let mut lifecycle = lifecycle();
        let mut generation = match lifecycle.begin("params") {
            Ok(generation) => generation,
            Err(error) => panic!("begin failed: {error}"),
        };

        let mut delays = Vec::new();
        for _ in 0..4 {
            match lifecycle.mark_error(generation, "socket closed") {
                ErrorOutcome::Retry { delay, .. } => delays.push(delay),
                other => panic!("expected retry, got {other:?}"),
            }
            assert_eq!(lifecycle.state(), ConnectionState::BackoffWait);
            let (next, params) = match lifecycle.retry_due(generation) {
                Some(next) => next,
                None => panic!("retry should be due"),
            };
            assert_eq!(params, "params");
            assert!(next > generation);
            generation = next;
        }

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(1_000),
                Duration::from_millis(2_000),
                Duration::from_millis(4_000),
                Duration::from_millis(8_000),
            ]
        );

        let outcome = lifecycle.mark_error(generation, "socket closed");
        assert_eq!(
            outcome,
            ErrorOutcome::GiveUp {
                attempts: 5,
                last_error: "socket closed".to_string()
            }
        );
        assert_eq!(lifecycle.state(), ConnectionState::Disconnected);
        assert_eq!(lifecycle.retry_due(generation), None);
    }

    #[test]
    fn open_resets_attempt_counter() {
        let mut lifecycle = lifecycle();
        let generation = lifecycle.begin("p").unwrap_or_else(|error| panic!("{error}"));
        let _ = lifecycle.mark_error(generation, "boom");
        let (generation, _) = lifecycle
            .retry_due(generation)
            .unwrap_or_else(|| panic!("retry should be due"));
        assert!(lifecycle.mark_open(generation));
        assert_eq!(lifecycle.attempt(), 0);
        assert_eq!(lifecycle.state(), ConnectionState::Open);

        match lifecycle.mark_error(generation, "dropped") {
            ErrorOutcome::Retry { attempt, delay, .. } => {
                assert_eq!(attempt, 1);
                assert_eq!(delay, Duration::from_millis(1_000));
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn subscribe_during_backoff_supersedes_pending_timer() {
        let mut lifecycle = lifecycle();
        let first = lifecycle.begin("first").unwrap_or_else(|error| panic!("{error}"));
        let _ = lifecycle.mark_error(first, "boom");

        let second = lifecycle
            .begin("second")
            .unwrap_or_else(|error| panic!("{error}"));
        assert!(second > first);
        assert_eq!(lifecycle.retry_due(first), None);
        assert_eq!(lifecycle.state(), ConnectionState::Connecting);
        assert!(!lifecycle.mark_open(first));
        assert_eq!(lifecycle.mark_error(first, "late"), ErrorOutcome::Stale);
        assert!(lifecycle.mark_open(second));
        assert_eq!(lifecycle.params(), Some(&"second"));
    }

    #[test]
    fn begin_is_refused_while_connecting_or_open() {
        let mut lifecycle = lifecycle();
        let generation = lifecycle.begin("p").unwrap_or_else(|error| panic!("{error}"));
        assert!(matches!(
            lifecycle.begin("again"),
            Err(StreamError::AlreadyActive {
                state: ConnectionState::Connecting
            })
        ));
        assert!(lifecycle.mark_open(generation));
        assert!(matches!(
            lifecycle.begin("again"),
            Err(StreamError::AlreadyActive {
                state: ConnectionState::Open
            })
        ));
        assert_eq!(lifecycle.params(), Some(&"p"));
    }

    #[test]
    fn stop_invalidates_outstanding_generation() {
        let mut lifecycle = lifecycle();
        let generation = lifecycle.begin("p").unwrap_or_else(|error| panic!("{error}"));
        let _ = lifecycle.mark_error(generation, "boom");
        lifecycle.stop();

        assert_eq!(lifecycle.state(), ConnectionState::Idle);
        assert!(!lifecycle.is_current(generation));
        assert_eq!(lifecycle.retry_due(generation), None);
        assert_eq!(lifecycle.status().next_retry_ms, None);
        assert!(lifecycle.begin("p").is_ok());
    }

    #[test]
    fn delay_is_capped_and_never_zero() {
        let policy = BackoffPolicy {
            base_delay_ms: 0,
            max_delay_ms: 0,
            max_attempts: 100,
        };
        assert_eq!(policy.delay_ms(1), 1);
        assert_eq!(policy.delay_ms(90), 1);

        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_ms(0), 1_000);
        assert_eq!(policy.delay_ms(60), 8_000);
    }
}
