//! Bounded, ordered log of canonical events.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::event::CanonicalEvent;

pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 200;

/// One appended event and its log sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub event: CanonicalEvent,
}

#[derive(Debug)]
struct LogInner {
    capacity: usize,
    entries: VecDeque<LogEntry>,
    next_seq: u64,
    evicted: u64,
}

/// Shared handle to a FIFO ring of [`CanonicalEvent`]s.
///
/// Past capacity the oldest entry is evicted regardless of kind, so a
/// `RunStart`/`RunEnd` pair can be split under sustained load. Reads return
/// copies taken under the lock and never observe a partial append.
#[derive(Debug, Clone)]
pub struct CanonicalEventLog {
    inner: Arc<RwLock<LogInner>>,
}

impl CanonicalEventLog {
    /// Create a log. A zero capacity is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(RwLock::new(LogInner {
                capacity,
                entries: VecDeque::with_capacity(capacity),
                next_seq: 1,
                evicted: 0,
            })),
        }
    }

    /// Append and return the assigned sequence number.
    pub fn append(&self, event: CanonicalEvent) -> u64 {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        if inner.entries.len() == inner.capacity {
            inner.entries.pop_front();
            inner.evicted += 1;
        }
        inner.entries.push_back(LogEntry { seq, event });
        seq
    }

    /// Point-in-time copy, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.read(|inner| inner.entries.iter().cloned().collect())
    }

    /// Retained entries with `seq > after`, oldest first.
    #[must_use]
    pub fn entries_after(&self, after: u64) -> Vec<LogEntry> {
        self.read(|inner| {
            inner
                .entries
                .iter()
                .filter(|entry| entry.seq > after)
                .cloned()
                .collect()
        })
    }

    /// Newest entry matching `predicate`.
    pub fn latest_by_type<F>(&self, predicate: F) -> Option<LogEntry>
    where
        F: Fn(&CanonicalEvent) -> bool,
    {
        self.read(|inner| {
            inner
                .entries
                .iter()
                .rev()
                .find(|entry| predicate(&entry.event))
                .cloned()
        })
    }

    /// Most recent `RunStart` with no later `RunEnd` for the same run, else the most
    /// recent `RunStart` at all.
    #[must_use]
    pub fn last_run_id(&self) -> Option<String> {
        self.read(|inner| {
            let mut ended: HashSet<&str> = HashSet::new();
            let mut newest_start: Option<&str> = None;
            for entry in inner.entries.iter().rev() {
                match &entry.event {
                    CanonicalEvent::RunEnd { run_id, .. } => {
                        ended.insert(run_id.as_str());
                    }
                    CanonicalEvent::RunStart { run_id } => {
                        if !ended.contains(run_id.as_str()) {
                            return Some(run_id.clone());
                        }
                        newest_start.get_or_insert(run_id.as_str());
                    }
                    _ => {}
                }
            }
            newest_start.map(str::to_string)
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read(|inner| inner.entries.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.read(|inner| inner.capacity)
    }

    /// Entries dropped by eviction since creation.
    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.read(|inner| inner.evicted)
    }

    /// Sequence number of the newest entry, if any were ever appended.
    #[must_use]
    pub fn head_seq(&self) -> Option<u64> {
        self.read(|inner| inner.next_seq.checked_sub(1).filter(|seq| *seq > 0))
    }

    fn read<T>(&self, f: impl FnOnce(&LogInner) -> T) -> T {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&inner)
    }
}

impl Default for CanonicalEventLog {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_LOG_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::CanonicalEventLog;
    use crate::event::{CanonicalEvent, RiskLevel};

    fn start(run_id: &str) -> CanonicalEvent {
        CanonicalEvent::RunStart {
            run_id: run_id.to_string(),
        }
    }

    fn end(run_id: &str) -> CanonicalEvent {
        CanonicalEvent::RunEnd {
            run_id: run_id.to_string(),
            success: true,
        }
    }

    fn risk(level: RiskLevel) -> CanonicalEvent {
        CanonicalEvent::RiskSignal {
            run_id: "r".to_string(),
            level,
        }
    }

    #[test]
    fn overflow_evicts_oldest_and_keeps_order() {
        let capacity = 10;
        let log = CanonicalEventLog::new(capacity);
        for index in 0..capacity + 5 {
            log.append(start(&format!("run-{index}")));
        }

        let snapshot = log.snapshot();
        assert_eq!(snapshot.len(), capacity);
        assert_eq!(log.evicted(), 5);
        let ids: Vec<&str> = snapshot.iter().map(|entry| entry.event.run_id()).collect();
        let expected: Vec<String> = (5..capacity + 5).map(|index| format!("run-{index}")).collect();
        assert_eq!(ids, expected.iter().map(String::as_str).collect::<Vec<_>>());
        assert!(snapshot.windows(2).all(|pair| pair[0].seq < pair[1].seq));
    }

    #[test]
    fn append_returns_monotonic_sequence_numbers() {
        let log = CanonicalEventLog::new(2);
        assert_eq!(log.head_seq(), None);
        assert_eq!(log.append(start("a")), 1);
        assert_eq!(log.append(start("b")), 2);
        assert_eq!(log.append(start("c")), 3);
        assert_eq!(log.head_seq(), Some(3));
        assert_eq!(
            log.entries_after(1)
                .iter()
                .map(|entry| entry.seq)
                .collect::<Vec<_>>(),
            vec![2, 3]
        );
    }

    #[test]
    fn latest_by_type_returns_newest_match() {
        let log = CanonicalEventLog::default();
        log.append(risk(RiskLevel::Elevated));
        log.append(start("a"));
        log.append(risk(RiskLevel::Critical));
        log.append(end("a"));

        let latest = log
            .latest_by_type(|event| matches!(event, CanonicalEvent::RiskSignal { .. }))
            .map(|entry| entry.event);
        assert_eq!(latest, Some(risk(RiskLevel::Critical)));
        assert!(
            log.latest_by_type(|event| matches!(event, CanonicalEvent::Patch { .. }))
                .is_none()
        );
    }

    #[test]
    fn last_run_id_prefers_open_run() {
        let log = CanonicalEventLog::default();
        assert_eq!(log.last_run_id(), None);

        log.append(start("a"));
        log.append(start("b"));
        log.append(end("b"));
        assert_eq!(log.last_run_id().as_deref(), Some("a"));

        log.append(end("a"));
        assert_eq!(log.last_run_id().as_deref(), Some("b"));

        log.append(start("c"));
        assert_eq!(log.last_run_id().as_deref(), Some("c"));
    }

    #[test]
    fn snapshot_is_consistent_under_concurrent_appends() {
        let log = CanonicalEventLog::new(64);
        let writer = log.clone();
        let handle = thread::spawn(move || {
            for index in 0..2_000 {
                writer.append(start(&format!("run-{index}")));
            }
        });

        for _ in 0..200 {
            let snapshot = log.snapshot();
            assert!(snapshot.len() <= 64);
            assert!(snapshot.windows(2).all(|pair| pair[1].seq == pair[0].seq + 1));
        }

        assert!(handle.join().is_ok());
        assert_eq!(log.len(), 64);
        assert_eq!(log.head_seq(), Some(2_000));
    }
}
