//! warden-core
//!
//! Coordination core for a pool of task workers: a durable task store with
//! exclusive leases, phase gates, stale-lease recovery, circuit breakers and
//! a budget watchdog.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, phase, gate, budget, events, worker）と純粋な状態遷移
//! - **ports**: 抽象化レイヤー（TaskStore, EventSink, Delegate, DispatchStrategy, Clock, など）
//! - **app**: アプリケーションロジック（builder, worker_loop, supervisor, reaper_loop, budget_loop, status）
//! - **impls**: 実装（SqliteStore, JsonlEventLog, in-memory 版, dispatch）
//! - **lock**: ファイルロックと PathGuard（symlink / path traversal 対策）
//! - **breaker**: operation key ごとの circuit breaker
//! - **config**: TOML 設定
//! - **error**: CoreError
//! - **observability**: ステータス集計

pub mod app;
pub mod breaker;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod lock;
pub mod observability;
pub mod ports;

pub use error::CoreError;
