//! Canonical event vocabulary and the default live-message adapter.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::transport::TransportMessage;

/// Ordered risk severity: `Nominal < Elevated < High < Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Nominal,
    Elevated,
    High,
    Critical,
}

impl RiskLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nominal => "nominal",
            Self::Elevated => "elevated",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    #[must_use]
    pub fn is_high_or_worse(self) -> bool {
        self >= Self::High
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRiskLevel(pub String);

impl fmt::Display for UnknownRiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown risk level: {}", self.0)
    }
}

impl std::error::Error for UnknownRiskLevel {}

impl FromStr for RiskLevel {
    type Err = UnknownRiskLevel;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "nominal" => Ok(Self::Nominal),
            "elevated" => Ok(Self::Elevated),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(UnknownRiskLevel(value.to_string())),
        }
    }
}

/// Normalized upstream event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CanonicalEvent {
    RunStart {
        run_id: String,
    },
    RunEnd {
        run_id: String,
        success: bool,
    },
    Trace {
        run_id: String,
        summary: String,
        json: Value,
    },
    Patch {
        run_id: String,
        original: String,
        modified: String,
        language: String,
    },
    RiskSignal {
        run_id: String,
        level: RiskLevel,
    },
    Metric {
        run_id: String,
        series: String,
        value: f64,
    },
}

impl CanonicalEvent {
    #[must_use]
    pub fn run_id(&self) -> &str {
        match self {
            Self::RunStart { run_id }
            | Self::RunEnd { run_id, .. }
            | Self::Trace { run_id, .. }
            | Self::Patch { run_id, .. }
            | Self::RiskSignal { run_id, .. }
            | Self::Metric { run_id, .. } => run_id,
        }
    }

    #[must_use]
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::RunStart { .. } => "run_start",
            Self::RunEnd { .. } => "run_end",
            Self::Trace { .. } => "trace",
            Self::Patch { .. } => "patch",
            Self::RiskSignal { .. } => "risk_signal",
            Self::Metric { .. } => "metric",
        }
    }
}

/// Maps one live-stream message to a canonical event. Unknown types yield `None`.
///
/// The event type comes from the JSON `type` field, falling back to the SSE event name.
#[must_use]
pub fn adapt_live_message(message: &TransportMessage) -> Option<CanonicalEvent> {
    let object = match serde_json::from_str::<Value>(&message.data) {
        Ok(Value::Object(object)) => object,
        Ok(_) => {
            debug!(name = ?message.name, "live message payload is not an object; dropped");
            return None;
        }
        Err(error) => {
            debug!(name = ?message.name, %error, "live message payload is not json; dropped");
            return None;
        }
    };

    let event_type = object
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| message.name.clone())?;
    let run_id = string_field(&object, &["runId", "run_id"]).unwrap_or_default();

    let event = match event_type.as_str() {
        "run:start" => {
            if run_id.is_empty() {
                return None;
            }
            CanonicalEvent::RunStart { run_id }
        }
        "run:end" => {
            if run_id.is_empty() {
                return None;
            }
            let success = object
                .get("success")
                .and_then(Value::as_bool)
                .unwrap_or_else(|| {
                    matches!(
                        string_field(&object, &["status"]).as_deref(),
                        Some("success" | "succeeded" | "ok" | "completed")
                    )
                });
            CanonicalEvent::RunEnd { run_id, success }
        }
        "stability" => {
            let level = string_field(&object, &["level", "risk", "riskLevel"])?
                .parse::<RiskLevel>()
                .ok()?;
            CanonicalEvent::RiskSignal { run_id, level }
        }
        "phi" | "attention" => {
            let value = object.get("value").and_then(Value::as_f64)?;
            CanonicalEvent::Metric {
                run_id,
                series: event_type.clone(),
                value,
            }
        }
        "patch" | "diff" => CanonicalEvent::Patch {
            run_id,
            original: string_field(&object, &["original", "before"]).unwrap_or_default(),
            modified: string_field(&object, &["modified", "after"]).unwrap_or_default(),
            language: string_field(&object, &["language", "lang"])
                .unwrap_or_else(|| "plaintext".to_string()),
        },
        "trace" | "tool" | "ethics" => {
            let summary = string_field(&object, &["summary", "name", "message"])
                .unwrap_or_else(|| event_type.clone());
            CanonicalEvent::Trace {
                run_id,
                summary,
                json: Value::Object(object),
            }
        }
        other if other.starts_with("cips:") => {
            let summary =
                string_field(&object, &["summary", "message"]).unwrap_or_else(|| other.to_string());
            CanonicalEvent::Trace {
                run_id,
                summary,
                json: Value::Object(object),
            }
        }
        other => {
            debug!(event_type = other, "unrecognized live event type; dropped");
            return None;
        }
    };

    Some(event)
}

fn string_field(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}
