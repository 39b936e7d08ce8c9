//! Quality-gate results and threshold evaluation.
//!
//! Evaluation here is pure: metrics + thresholds in, verdict out. Calling
//! a gate through the circuit breaker and persisting the verdict is the
//! supervisor's job.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::phase::Phase;

/// A single measurement reported by a delegate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Bool(bool),
    Number(f64),
}

impl MetricValue {
    pub fn as_f64(self) -> f64 {
        match self {
            MetricValue::Number(n) => n,
            MetricValue::Bool(true) => 1.0,
            MetricValue::Bool(false) => 0.0,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Bool(b) => write!(f, "{b}"),
            MetricValue::Number(n) => write!(f, "{n}"),
        }
    }
}

/// Named measurements, ordered by name so feedback is deterministic.
pub type Metrics = BTreeMap<String, MetricValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Reject,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => f.write_str("pass"),
            Verdict::Reject => f.write_str("reject"),
        }
    }
}

/// Declared bound for one metric. Any combination may be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricThreshold {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub expect: Option<bool>,
}

impl MetricThreshold {
    pub fn min(value: f64) -> Self {
        Self {
            min: Some(value),
            ..Self::default()
        }
    }

    pub fn max(value: f64) -> Self {
        Self {
            max: Some(value),
            ..Self::default()
        }
    }

    pub fn expect(value: bool) -> Self {
        Self {
            expect: Some(value),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min.is_none() && self.max.is_none() && self.expect.is_none()
    }

    fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(min) = self.min {
            parts.push(format!(">= {min}"));
        }
        if let Some(max) = self.max {
            parts.push(format!("<= {max}"));
        }
        if let Some(expect) = self.expect {
            parts.push(format!("== {expect}"));
        }
        parts.join(" and ")
    }

    fn admits(&self, value: MetricValue) -> bool {
        if let Some(expect) = self.expect {
            match value {
                MetricValue::Bool(b) if b == expect => {}
                _ => return false,
            }
        }
        let n = value.as_f64();
        if self.min.is_some_and(|min| n < min) {
            return false;
        }
        if self.max.is_some_and(|max| n > max) {
            return false;
        }
        true
    }
}

/// Thresholds of one phase, keyed by metric name.
pub type GateThresholds = BTreeMap<String, MetricThreshold>;

/// One entry per failing metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionReason {
    pub metric: String,
    /// `None` when the delegate did not report the metric at all.
    pub measured: Option<MetricValue>,
    pub threshold: String,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.measured {
            Some(v) => write!(f, "{} = {} (required {})", self.metric, v, self.threshold),
            None => write!(f, "{} missing (required {})", self.metric, self.threshold),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGateResult {
    pub task_id: TaskId,
    pub phase: Phase,
    pub metrics: Metrics,
    pub verdict: Verdict,
    pub reasons: Vec<RejectionReason>,
    pub evaluated_at: DateTime<Utc>,
}

impl QualityGateResult {
    /// Check `metrics` against `thresholds`. No thresholds means pass.
    pub fn evaluate(
        task_id: TaskId,
        phase: Phase,
        metrics: &Metrics,
        thresholds: &GateThresholds,
        now: DateTime<Utc>,
    ) -> Self {
        let reasons: Vec<RejectionReason> = thresholds
            .iter()
            .filter(|(_, t)| !t.is_empty())
            .filter_map(|(name, threshold)| {
                let measured = metrics.get(name).copied();
                let ok = measured.is_some_and(|v| threshold.admits(v));
                (!ok).then(|| RejectionReason {
                    metric: name.clone(),
                    measured,
                    threshold: threshold.describe(),
                })
            })
            .collect();

        let verdict = if reasons.is_empty() {
            Verdict::Pass
        } else {
            Verdict::Reject
        };

        Self {
            task_id,
            phase,
            metrics: metrics.clone(),
            verdict,
            reasons,
            evaluated_at: now,
        }
    }

    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }

    pub fn reason_lines(&self) -> Vec<String> {
        self.reasons.iter().map(ToString::to_string).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn thresholds() -> GateThresholds {
        let mut t = GateThresholds::new();
        t.insert("coverage".into(), MetricThreshold::min(80.0));
        t.insert("critical_bugs".into(), MetricThreshold::max(0.0));
        t.insert("lint_clean".into(), MetricThreshold::expect(true));
        t
    }

    fn eval(metrics: Metrics) -> QualityGateResult {
        QualityGateResult::evaluate(
            TaskId::from_ulid(Ulid::new()),
            Phase::Execute,
            &metrics,
            &thresholds(),
            Utc::now(),
        )
    }

    #[test]
    fn all_thresholds_met_passes() {
        let mut m = Metrics::new();
        m.insert("coverage".into(), MetricValue::Number(91.0));
        m.insert("critical_bugs".into(), MetricValue::Number(0.0));
        m.insert("lint_clean".into(), MetricValue::Bool(true));

        let result = eval(m);
        assert!(result.passed());
        assert!(result.reasons.is_empty());
    }

    #[test]
    fn each_failing_metric_gets_one_reason() {
        let mut m = Metrics::new();
        m.insert("coverage".into(), MetricValue::Number(60.0));
        m.insert("critical_bugs".into(), MetricValue::Number(2.0));

        let result = eval(m);
        assert_eq!(result.verdict, Verdict::Reject);
        assert_eq!(result.reasons.len(), 3);

        let coverage = &result.reasons[0];
        assert_eq!(result.reasons[1].metric, "critical_bugs");
        assert_eq!(coverage.metric, "coverage");
        assert_eq!(coverage.measured, Some(MetricValue::Number(60.0)));
        assert_eq!(coverage.threshold, ">= 80");
        assert_eq!(coverage.to_string(), "coverage = 60 (required >= 80)");

        let lint = &result.reasons[2];
        assert_eq!(lint.measured, None);
        assert!(lint.to_string().contains("missing"));
    }

    #[test]
    fn no_thresholds_always_passes() {
        let result = QualityGateResult::evaluate(
            TaskId::from_ulid(Ulid::new()),
            Phase::Plan,
            &Metrics::new(),
            &GateThresholds::new(),
            Utc::now(),
        );
        assert!(result.passed());
    }

    #[test]
    fn metric_values_deserialize_untagged() {
        let m: Metrics = serde_json::from_str(r#"{"coverage": 72.5, "ok": true}"#).unwrap();
        assert_eq!(m["coverage"], MetricValue::Number(72.5));
        assert_eq!(m["ok"], MetricValue::Bool(true));
    }
}
