//! Debounced stability mitigation.
//!
//! One adjustment per genuine escalation into `high`/`critical`, gated by a
//! cooldown. A `high -> critical` move overrides the cooldown. Sustained risk at
//! the same level never retriggers.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::event::RiskLevel;

pub const DEFAULT_MITIGATION_COOLDOWN_MS: u64 = 30_000;
pub const DEFAULT_STEPS: u32 = 50;

pub const WEIGHT_MIN: f64 = 0.05;
pub const WEIGHT_MAX: f64 = 0.8;

const STEP_RETAIN_RATIO: f64 = 0.8;
const GWT_SCALE: f64 = 0.95;
const PP_SCALE: f64 = 0.90;

/// Operating weights. Every observable value sums to 1 with each component in
/// `[WEIGHT_MIN, WEIGHT_MAX]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightVector {
    pub gwt: f64,
    pub causal: f64,
    pub pp: f64,
}

impl WeightVector {
    /// Build a vector, projecting it onto the bounded simplex.
    #[must_use]
    pub fn new(gwt: f64, causal: f64, pp: f64) -> Self {
        Self::from_array(project_to_bounds([gwt, causal, pp]))
    }

    #[must_use]
    pub fn sum(&self) -> f64 {
        self.gwt + self.causal + self.pp
    }

    #[must_use]
    pub fn is_normalized(&self, tolerance: f64) -> bool {
        (self.sum() - 1.0).abs() <= tolerance
            && self
                .as_array()
                .iter()
                .all(|weight| (WEIGHT_MIN - tolerance..=WEIGHT_MAX + tolerance).contains(weight))
    }

    /// Shift weight away from `gwt` and `pp` into `causal`.
    #[must_use]
    pub fn mitigated(&self) -> Self {
        let gwt = (self.gwt * GWT_SCALE).clamp(WEIGHT_MIN, WEIGHT_MAX);
        let pp = (self.pp * PP_SCALE).clamp(WEIGHT_MIN, WEIGHT_MAX);
        let causal = (1.0 - gwt - pp).max(WEIGHT_MIN);
        Self::new(gwt, causal, pp)
    }

    fn as_array(&self) -> [f64; 3] {
        [self.gwt, self.causal, self.pp]
    }

    fn from_array([gwt, causal, pp]: [f64; 3]) -> Self {
        Self { gwt, causal, pp }
    }
}

impl Default for WeightVector {
    fn default() -> Self {
        Self {
            gwt: 0.4,
            causal: 0.3,
            pp: 0.3,
        }
    }
}

/// Clamp into bounds, then spread the residual over components that still have room.
fn project_to_bounds(values: [f64; 3]) -> [f64; 3] {
    let mut weights = values.map(|value| {
        if value.is_finite() {
            value.clamp(WEIGHT_MIN, WEIGHT_MAX)
        } else {
            WEIGHT_MIN
        }
    });

    for _ in 0..8 {
        let residual = 1.0 - weights.iter().sum::<f64>();
        if residual.abs() < 1e-12 {
            break;
        }
        let free: Vec<usize> = (0..weights.len())
            .filter(|&index| {
                (residual > 0.0 && weights[index] < WEIGHT_MAX)
                    || (residual < 0.0 && weights[index] > WEIGHT_MIN)
            })
            .collect();
        if free.is_empty() {
            break;
        }
        let share = residual / free.len() as f64;
        for index in free {
            weights[index] = (weights[index] + share).clamp(WEIGHT_MIN, WEIGHT_MAX);
        }
    }

    // Absorb rounding drift in causal so the sum is exact.
    let causal = 1.0 - weights[0] - weights[2];
    if (WEIGHT_MIN..=WEIGHT_MAX).contains(&causal) {
        weights[1] = causal;
    }
    weights
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MitigationConfig {
    pub cooldown_ms: u64,
    pub initial_steps: u32,
}

impl Default for MitigationConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: DEFAULT_MITIGATION_COOLDOWN_MS,
            initial_steps: DEFAULT_STEPS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MitigationState {
    pub last_mitigation_at_ms: Option<u64>,
    pub mitigation_count: u64,
    pub last_observed_risk: RiskLevel,
}

/// Record of one applied mitigation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    pub at_ms: u64,
    pub from_level: RiskLevel,
    pub to_level: RiskLevel,
    pub steps_before: u32,
    pub steps_after: u32,
    pub weights_before: WeightVector,
    pub weights_after: WeightVector,
    pub mitigation_count: u64,
}

#[derive(Debug, Clone)]
pub struct StabilityMitigationController {
    config: MitigationConfig,
    state: MitigationState,
    steps: u32,
    weights: WeightVector,
}

impl StabilityMitigationController {
    #[must_use]
    pub fn new(config: MitigationConfig) -> Self {
        Self::with_weights(config, WeightVector::default())
    }

    #[must_use]
    pub fn with_weights(config: MitigationConfig, weights: WeightVector) -> Self {
        Self {
            steps: config.initial_steps.max(1),
            config,
            state: MitigationState::default(),
            weights: WeightVector::new(weights.gwt, weights.causal, weights.pp),
        }
    }

    pub fn on_risk_signal(&mut self, level: RiskLevel, now_ms: u64) -> Option<Adjustment> {
        let previous = self.state.last_observed_risk;
        self.state.last_observed_risk = level;

        if !level.is_high_or_worse() || level <= previous {
            return None;
        }

        let critical_override = previous == RiskLevel::High && level == RiskLevel::Critical;
        let cooled_down = self
            .state
            .last_mitigation_at_ms
            .is_none_or(|last| now_ms.saturating_sub(last) >= self.config.cooldown_ms);
        if !cooled_down && !critical_override {
            debug!(
                from = %previous,
                to = %level,
                now_ms,
                "escalation within mitigation cooldown; suppressed"
            );
            return None;
        }

        Some(self.apply(previous, level, now_ms))
    }

    fn apply(&mut self, from_level: RiskLevel, to_level: RiskLevel, now_ms: u64) -> Adjustment {
        let steps_before = self.steps;
        let weights_before = self.weights;

        self.steps = ((f64::from(self.steps) * STEP_RETAIN_RATIO).floor() as u32).max(1);
        self.weights = self.weights.mitigated();
        self.state.last_mitigation_at_ms = Some(
            self.state
                .last_mitigation_at_ms
                .map_or(now_ms, |last| last.max(now_ms)),
        );
        self.state.mitigation_count = self.state.mitigation_count.saturating_add(1);

        info!(
            from = %from_level,
            to = %to_level,
            steps = self.steps,
            gwt = self.weights.gwt,
            causal = self.weights.causal,
            pp = self.weights.pp,
            count = self.state.mitigation_count,
            "stability mitigation applied"
        );

        Adjustment {
            at_ms: now_ms,
            from_level,
            to_level,
            steps_before,
            steps_after: self.steps,
            weights_before,
            weights_after: self.weights,
            mitigation_count: self.state.mitigation_count,
        }
    }

    #[must_use]
    pub fn state(&self) -> MitigationState {
        self.state
    }

    #[must_use]
    pub fn steps(&self) -> u32 {
        self.steps
    }

    #[must_use]
    pub fn weights(&self) -> WeightVector {
        self.weights
    }

    #[must_use]
    pub fn config(&self) -> MitigationConfig {
        self.config
    }
}

impl Default for StabilityMitigationController {
    fn default() -> Self {
        Self::new(MitigationConfig::default())
    }
}
