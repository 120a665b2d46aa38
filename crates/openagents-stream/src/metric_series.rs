//! Fixed-capacity rolling window of numeric samples.

use std::collections::VecDeque;

pub const DEFAULT_METRIC_CAPACITY: usize = 50;

/// Rolling numeric window, oldest sample first.
///
/// Pushing past capacity drops the oldest sample. No statistics are kept here;
/// callers derive whatever aggregate they render from [`MetricSeriesBuffer::values`].
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSeriesBuffer {
    capacity: usize,
    samples: VecDeque<f64>,
}

impl MetricSeriesBuffer {
    /// Create a buffer. A zero capacity is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    #[must_use]
    pub fn values(&self) -> Vec<f64> {
        self.samples.iter().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().copied()
    }

    #[must_use]
    pub fn latest(&self) -> Option<f64> {
        self.samples.back().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

impl Default for MetricSeriesBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_METRIC_CAPACITY)
    }
}
