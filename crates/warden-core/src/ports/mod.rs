//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! app 層はここの trait だけに依存し、SQLite / JSONL / in-memory の
//! 実装は `impls` に置きます。
//!
//! # 設計原則
//! - Task Store が source of truth（正本）
//! - Event Store は監査専用で、現在状態の正本にはしない
//! - 共有状態への書き込みはすべて lock layer を通す

pub mod clock;
pub mod delegate;
pub mod dispatch;
pub mod event_sink;
pub mod id_generator;
pub mod state_store;
pub mod task_store;

// 主要な trait を再エクスポート
pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::delegate::Delegate;
pub use self::dispatch::DispatchStrategy;
pub use self::event_sink::{EventQuery, EventSink};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::state_store::{BreakerStateStore, BudgetStore, WorkerRegistry};
pub use self::task_store::{AgeBoostPolicy, ClaimFilter, ShardSpec, TaskQuery, TaskStore};
