//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **MemoryStore**: 単一プロセス用の正本（テスト・開発用）
//! - **SqliteStore**: プール全体で共有する正本
//! - **MemoryEventLog** / **JsonlEventLog**: イベントログ
//! - **DirectDispatch** / **RoutedDispatch**: DispatchStrategy

pub mod dispatch;
pub mod jsonl_events;
mod journal;
pub mod memory_events;
pub mod memory_store;
pub mod sqlite_store;

// 主要な型を再エクスポート
pub use self::dispatch::{DirectDispatch, RoutedDispatch};
pub use self::jsonl_events::JsonlEventLog;
pub use self::memory_events::MemoryEventLog;
pub use self::memory_store::MemoryStore;
pub use self::sqlite_store::SqliteStore;
