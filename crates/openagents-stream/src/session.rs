//! Live session: one reconnecting client plus the state derived from its log.
//!
//! An observer task follows the log by sequence cursor after each `Appended`
//! notification. Risk signals drive the mitigation controller and metrics land
//! in per-series buffers. The controller's `steps` and weights are folded back
//! into the query of the next subscription.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::client::{ClientNotification, ReconnectingStreamClient, SubscribeOptions};
use crate::config::StreamConfig;
use crate::error::Result;
use crate::event::CanonicalEvent;
use crate::event_log::{CanonicalEventLog, LogEntry};
use crate::lifecycle::{ConnectionStatus, Generation};
use crate::metric_series::MetricSeriesBuffer;
use crate::mitigation::{
    Adjustment, MitigationConfig, MitigationState, StabilityMitigationController, WeightVector,
};
use crate::transport::{StreamTransport, SubscribeParams};

pub const STEPS_PARAM: &str = "steps";
pub const GWT_PARAM: &str = "gwt";
pub const CAUSAL_PARAM: &str = "causal";
pub const PP_PARAM: &str = "pp";

/// State derived from the event log. Pure; the session wraps it in a lock.
#[derive(Debug, Clone)]
pub struct SessionState {
    cursor: u64,
    metric_capacity: usize,
    controller: StabilityMitigationController,
    series: BTreeMap<String, MetricSeriesBuffer>,
    adjustments: Vec<Adjustment>,
}

impl SessionState {
    #[must_use]
    pub fn new(mitigation: MitigationConfig, metric_capacity: usize) -> Self {
        Self {
            cursor: 0,
            metric_capacity,
            controller: StabilityMitigationController::new(mitigation),
            series: BTreeMap::new(),
            adjustments: Vec::new(),
        }
    }

    /// Apply entries newer than the cursor, in order. Returns the mitigations fired.
    pub fn ingest(&mut self, entries: &[LogEntry], now_ms: u64) -> Vec<Adjustment> {
        let mut fired = Vec::new();
        for entry in entries {
            if entry.seq <= self.cursor {
                continue;
            }
            self.cursor = entry.seq;
            match &entry.event {
                CanonicalEvent::RiskSignal { level, .. } => {
                    if let Some(adjustment) = self.controller.on_risk_signal(*level, now_ms) {
                        fired.push(adjustment);
                    }
                }
                CanonicalEvent::Metric { series, value, .. } => {
                    let capacity = self.metric_capacity;
                    self.series
                        .entry(series.clone())
                        .or_insert_with(|| MetricSeriesBuffer::new(capacity))
                        .push(*value);
                }
                _ => {}
            }
        }
        self.adjustments.extend(fired.iter().copied());
        fired
    }

    /// Highest log sequence number applied so far.
    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    #[must_use]
    pub fn steps(&self) -> u32 {
        self.controller.steps()
    }

    #[must_use]
    pub fn weights(&self) -> WeightVector {
        self.controller.weights()
    }

    #[must_use]
    pub fn mitigation_state(&self) -> MitigationState {
        self.controller.state()
    }

    #[must_use]
    pub fn series(&self, name: &str) -> Option<&MetricSeriesBuffer> {
        self.series.get(name)
    }

    pub fn series_names(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    #[must_use]
    pub fn adjustments(&self) -> &[Adjustment] {
        &self.adjustments
    }

    /// `base` with the current steps and weights set as query parameters.
    #[must_use]
    pub fn subscribe_params(&self, base: &SubscribeParams) -> SubscribeParams {
        let weights = self.weights();
        let mut params = base.clone();
        params.set_param(STEPS_PARAM, self.steps().to_string());
        params.set_param(GWT_PARAM, format_weight(weights.gwt));
        params.set_param(CAUSAL_PARAM, format_weight(weights.causal));
        params.set_param(PP_PARAM, format_weight(weights.pp));
        params
    }
}

fn format_weight(weight: f64) -> String {
    format!("{weight:.4}")
}

fn now_ms() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default()
}

pub struct LiveSession {
    client: ReconnectingStreamClient,
    state: Arc<Mutex<SessionState>>,
    observer: Mutex<Option<JoinHandle<()>>>,
}

impl LiveSession {
    #[must_use]
    pub fn new(transport: Arc<dyn StreamTransport>, config: &StreamConfig) -> Self {
        let log = CanonicalEventLog::new(config.event_log_capacity);
        let client = ReconnectingStreamClient::new(transport, log, config.backoff_policy());
        Self::with_client(client, config)
    }

    #[must_use]
    pub fn with_client(client: ReconnectingStreamClient, config: &StreamConfig) -> Self {
        Self {
            client,
            state: Arc::new(Mutex::new(SessionState::new(
                config.mitigation_config(),
                config.metric_capacity,
            ))),
            observer: Mutex::new(None),
        }
    }

    /// Subscribe with `base` plus the current steps and weights. Must be called
    /// from within a tokio runtime.
    pub fn start(&self, base: &SubscribeParams, options: SubscribeOptions) -> Result<Generation> {
        self.ensure_observer();
        let params = self.subscribe_params(base);
        self.client.subscribe(params, options)
    }

    pub fn stop(&self) {
        self.client.stop();
        self.sync();
    }

    /// Apply any log entries the observer has not seen yet.
    pub fn sync(&self) -> Vec<Adjustment> {
        apply_pending(self.client.log(), &self.state)
    }

    #[must_use]
    pub fn client(&self) -> &ReconnectingStreamClient {
        &self.client
    }

    #[must_use]
    pub fn log(&self) -> &CanonicalEventLog {
        self.client.log()
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.client.status()
    }

    #[must_use]
    pub fn notifications(&self) -> broadcast::Receiver<ClientNotification> {
        self.client.notifications()
    }

    #[must_use]
    pub fn weights(&self) -> WeightVector {
        self.lock_state().weights()
    }

    #[must_use]
    pub fn steps(&self) -> u32 {
        self.lock_state().steps()
    }

    #[must_use]
    pub fn mitigation_state(&self) -> MitigationState {
        self.lock_state().mitigation_state()
    }

    /// Copy of one metric series, oldest sample first.
    #[must_use]
    pub fn series(&self, name: &str) -> Option<Vec<f64>> {
        self.lock_state().series(name).map(MetricSeriesBuffer::values)
    }

    #[must_use]
    pub fn adjustments(&self) -> Vec<Adjustment> {
        self.lock_state().adjustments().to_vec()
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionState {
        self.lock_state().clone()
    }

    #[must_use]
    pub fn subscribe_params(&self, base: &SubscribeParams) -> SubscribeParams {
        self.lock_state().subscribe_params(base)
    }

    fn ensure_observer(&self) {
        let mut observer = self
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if observer.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let notifications = self.client.notifications();
        let log = self.client.log().clone();
        let state = Arc::clone(&self.state);
        *observer = Some(tokio::spawn(observe(notifications, log, state)));
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        if let Some(task) = self
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

fn apply_pending(log: &CanonicalEventLog, state: &Mutex<SessionState>) -> Vec<Adjustment> {
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    let entries = log.entries_after(state.cursor());
    if entries.is_empty() {
        return Vec::new();
    }
    state.ingest(&entries, now_ms())
}

async fn observe(
    mut notifications: broadcast::Receiver<ClientNotification>,
    log: CanonicalEventLog,
    state: Arc<Mutex<SessionState>>,
) {
    loop {
        match notifications.recv().await {
            Ok(ClientNotification::Appended { seq }) => {
                let fired = apply_pending(&log, &state);
                if !fired.is_empty() {
                    debug!(seq, mitigations = fired.len(), "session applied mitigations");
                }
            }
            Ok(ClientNotification::Status(_) | ClientNotification::Terminal { .. }) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "session observer lagged; catching up from log");
                apply_pending(&log, &state);
            }
            Err(RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SessionState;
    use crate::event::{CanonicalEvent, RiskLevel};
    use crate::event_log::LogEntry;
    use crate::mitigation::MitigationConfig;
    use crate::transport::SubscribeParams;

    fn entry(seq: u64, event: CanonicalEvent) -> LogEntry {
        LogEntry { seq, event }
    }

    fn risk(level: RiskLevel) -> CanonicalEvent {
        CanonicalEvent::RiskSignal {
            run_id: "run-1".to_string(),
            level,
        }
    }

    fn metric(series: &str, value: f64) -> CanonicalEvent {
        CanonicalEvent::Metric {
            run_id: "run-1".to_string(),
            series: series.to_string(),
            value,
        }
    }

    #[test]
    fn routes_metrics_into_bounded_series() {
        let mut state = SessionState::new(MitigationConfig::default(), 2);
        let entries: Vec<LogEntry> = [1.0, 2.0, 3.0]
            .into_iter()
            .zip(1_u64..)
            .map(|(value, seq)| entry(seq, metric("phi", value)))
            .collect();
        state.ingest(&entries, 0);
        state.ingest(&[entry(4, metric("attention", 0.5))], 0);

        assert_eq!(state.series("phi").map(|s| s.values()), Some(vec![2.0, 3.0]));
        assert_eq!(state.series("attention").map(|s| s.values()), Some(vec![0.5]));
        assert_eq!(state.series_names().collect::<Vec<_>>(), vec!["attention", "phi"]);
        assert_eq!(state.cursor(), 4);
    }

    #[test]
    fn already_applied_entries_are_skipped() {
        let mut state = SessionState::new(MitigationConfig::default(), 8);
        let entries = vec![entry(1, risk(RiskLevel::High))];
        assert_eq!(state.ingest(&entries, 0).len(), 1);
        assert!(state.ingest(&entries, 0).is_empty());
        assert_eq!(state.mitigation_state().mitigation_count, 1);
    }

    #[test]
    fn escalation_feeds_back_into_subscribe_params() {
        let mut state = SessionState::new(MitigationConfig::default(), 8);
        let base = SubscribeParams::new("http://localhost/live").with_param("runId", "run-1");

        let before = state.subscribe_params(&base);
        assert_eq!(before.param("steps"), Some("50"));
        assert_eq!(before.param("gwt"), Some("0.4000"));

        let fired = state.ingest(
            &[
                entry(1, risk(RiskLevel::Nominal)),
                entry(2, risk(RiskLevel::High)),
                entry(3, risk(RiskLevel::High)),
                entry(4, risk(RiskLevel::Critical)),
            ],
            1_000,
        );
        assert_eq!(fired.len(), 2);
        assert_eq!(state.steps(), 32);
        assert_eq!(state.adjustments().len(), 2);

        let after = state.subscribe_params(&base);
        assert_eq!(after.param("runId"), Some("run-1"));
        assert_eq!(after.param("steps"), Some("32"));
        assert_eq!(after.param("gwt"), Some("0.3610"));
        assert_eq!(after.param("pp"), Some("0.2430"));
        assert_eq!(after.param("causal"), Some("0.3960"));
    }
}
