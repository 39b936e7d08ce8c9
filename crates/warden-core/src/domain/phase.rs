use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Ordered lifecycle stage of a task.
///
/// The derived `Ord` follows declaration order, which is the only order a
/// task may move through. Phases are never skipped and never go back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Brainstorm,
    Spec,
    Plan,
    Execute,
    Status,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Brainstorm,
        Phase::Spec,
        Phase::Plan,
        Phase::Execute,
        Phase::Status,
    ];

    pub fn first() -> Self {
        Phase::Brainstorm
    }

    pub fn next(self) -> Option<Self> {
        match self {
            Phase::Brainstorm => Some(Phase::Spec),
            Phase::Spec => Some(Phase::Plan),
            Phase::Plan => Some(Phase::Execute),
            Phase::Execute => Some(Phase::Status),
            Phase::Status => None,
        }
    }

    pub fn is_last(self) -> bool {
        self.next().is_none()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Brainstorm => "brainstorm",
            Phase::Spec => "spec",
            Phase::Plan => "plan",
            Phase::Execute => "execute",
            Phase::Status => "status",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown phase `{s}`"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Phase::Brainstorm, Some(Phase::Spec))]
    #[case(Phase::Spec, Some(Phase::Plan))]
    #[case(Phase::Plan, Some(Phase::Execute))]
    #[case(Phase::Execute, Some(Phase::Status))]
    #[case(Phase::Status, None)]
    fn next_follows_declared_order(#[case] phase: Phase, #[case] expected: Option<Phase>) {
        assert_eq!(phase.next(), expected);
        if let Some(next) = expected {
            assert!(next > phase);
        }
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("PLAN".parse::<Phase>().unwrap(), Phase::Plan);
        assert_eq!(" execute ".parse::<Phase>().unwrap(), Phase::Execute);
        assert!("deploy".parse::<Phase>().is_err());
    }
}
