//! Delegate output: the common result shape of one execution attempt.
//!
//! The core does not interpret artifacts. It only reads `success`,
//! `metrics` (for the quality gate) and `units_consumed` (for the budget).

use serde::{Deserialize, Serialize};

use super::gate::{MetricValue, Metrics};

/// Something produced or observed while executing a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Artifact {
    Stdout(String),
    Stderr(String),
    FilePath(String),
    Url(String),
    Json(serde_json::Value),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DelegateOutput {
    pub success: bool,

    #[serde(default)]
    pub metrics: Metrics,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,

    /// Resource units (tokens, cost) charged to the budget.
    #[serde(default)]
    pub units_consumed: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DelegateOutput {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: MetricValue) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn with_units(mut self, units: u64) -> Self {
        self.units_consumed = units;
        self
    }
}
