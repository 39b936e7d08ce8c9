//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **WardenBuilder**: アプリケーションの構築とワイヤリング
//! - **Runtime**: category -> delegate の解決と実行
//! - **WorkerPool**: タスク実行ループ（claim→execute→review）
//! - **Supervisor**: phase gate の評価と遷移
//! - **StalenessWatchdog**: 期限切れ lease の回収と age boost
//! - **BudgetWatchdog**: 期間ごとの使用量上限
//! - **StatusService**: 現在状態と履歴のクエリ

pub mod budget_loop;
pub mod builder;
pub mod reaper_loop;
pub mod runtime;
pub mod status;
pub mod supervisor;
pub mod worker_loop;

#[cfg(test)]
mod scenarios;

// 主要な型を再エクスポート
pub use self::budget_loop::BudgetWatchdog;
pub use self::builder::{BuildError, Warden, WardenBuilder};
pub use self::reaper_loop::{StalenessWatchdog, TickReport};
pub use self::runtime::{DelegateRegistry, Runtime};
pub use self::status::{PoolReport, StatusService, TaskReport};
pub use self::supervisor::{QualityGate, ReviewOutcome, Supervisor, ThresholdGate};
pub use self::worker_loop::{PoolCommand, PoolControl, PoolSettings, WorkerContext, WorkerPool};
