//! Budget ledger: resource units consumed in one accounting period.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStatus {
    Ok,
    Warning,
    Exhausted,
}

impl BudgetStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BudgetStatus::Ok => "ok",
            BudgetStatus::Warning => "warning",
            BudgetStatus::Exhausted => "exhausted",
        }
    }
}

impl fmt::Display for BudgetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BudgetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(BudgetStatus::Ok),
            "warning" => Ok(BudgetStatus::Warning),
            "exhausted" => Ok(BudgetStatus::Exhausted),
            other => Err(format!("unknown budget status `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetLedger {
    /// Index of the accounting period (`unix_secs / period_secs`).
    pub period_id: i64,
    pub consumed_units: u64,
    pub limit_units: u64,
    pub status: BudgetStatus,
    pub updated_at: DateTime<Utc>,
}

impl BudgetLedger {
    pub fn new(period_id: i64, limit_units: u64, now: DateTime<Utc>) -> Self {
        Self {
            period_id,
            consumed_units: 0,
            limit_units,
            status: BudgetStatus::Ok,
            updated_at: now,
        }
    }

    /// Status implied by the consumed units.
    ///
    /// A zero limit disables the budget (always `Ok`).
    pub fn classify(&self, warning_fraction: f64) -> BudgetStatus {
        if self.limit_units == 0 {
            return BudgetStatus::Ok;
        }
        if self.consumed_units >= self.limit_units {
            BudgetStatus::Exhausted
        } else if self.consumed_units as f64 >= self.limit_units as f64 * warning_fraction {
            BudgetStatus::Warning
        } else {
            BudgetStatus::Ok
        }
    }

    pub fn remaining(&self) -> u64 {
        self.limit_units.saturating_sub(self.consumed_units)
    }

    pub fn blocks_claims(&self) -> bool {
        self.status == BudgetStatus::Exhausted
    }
}

/// Period index for `now` with periods of `period_secs` seconds.
pub fn period_of(now: DateTime<Utc>, period_secs: u64) -> i64 {
    let len = i64::try_from(period_secs.max(1)).unwrap_or(i64::MAX);
    now.timestamp().div_euclid(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    #[rstest]
    #[case(0, BudgetStatus::Ok)]
    #[case(79, BudgetStatus::Ok)]
    #[case(80, BudgetStatus::Warning)]
    #[case(99, BudgetStatus::Warning)]
    #[case(100, BudgetStatus::Exhausted)]
    #[case(250, BudgetStatus::Exhausted)]
    fn classify_by_fraction(#[case] consumed: u64, #[case] expected: BudgetStatus) {
        let mut ledger = BudgetLedger::new(0, 100, Utc::now());
        ledger.consumed_units = consumed;
        assert_eq!(ledger.classify(0.8), expected);
    }

    #[test]
    fn zero_limit_never_exhausts() {
        let mut ledger = BudgetLedger::new(0, 0, Utc::now());
        ledger.consumed_units = 1_000;
        assert_eq!(ledger.classify(0.8), BudgetStatus::Ok);
    }

    #[test]
    fn period_index_is_floor_division() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(period_of(t, 86_400), t.timestamp() / 86_400);
        assert_eq!(
            period_of(t + chrono::Duration::seconds(86_399), 86_400),
            period_of(t, 86_400)
        );
        assert_eq!(
            period_of(t + chrono::Duration::seconds(86_400), 86_400),
            period_of(t, 86_400) + 1
        );
    }
}
