//! Domain model (ids, tasks, phases, gate results, ledgers, events).
//!
//! I/O を含まない。状態遷移は `transition::apply` の純粋関数に集約する。

pub mod budget;
pub mod events;
pub mod gate;
pub mod ids;
pub mod outcome;
pub mod phase;
pub mod task;
pub mod transition;
pub mod worker;

pub use budget::{BudgetLedger, BudgetStatus, period_of};
pub use events::{EntityType, EventRecord, NewEvent};
pub use gate::{
    GateThresholds, MetricThreshold, MetricValue, Metrics, QualityGateResult, RejectionReason,
    Verdict,
};
pub use ids::{ClaimToken, TaskId, WorkerId};
pub use outcome::{Artifact, DelegateOutput};
pub use phase::Phase;
pub use task::{Task, TaskSpec, TaskStatus, parse_priority, shard_key};
pub use transition::{TaskEvent, Transition};
pub use worker::{WorkerRecord, WorkerState};
