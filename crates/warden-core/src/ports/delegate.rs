//! Delegate port - タスクの実作業を行う外部実行者
//!
//! core は delegate の中身を知らない。呼び出しは circuit breaker で包まれ、
//! 呼び出し側が渡す timeout で打ち切られる。

use async_trait::async_trait;

use crate::domain::{DelegateOutput, Task};
use crate::error::CoreError;

#[async_trait]
pub trait Delegate: Send + Sync {
    /// Execute the task's current phase.
    ///
    /// `Ok` with `success = false` is a task failure. `Err` is an execution
    /// error of the delegate itself and counts against its breaker.
    async fn execute(&self, task: &Task) -> Result<DelegateOutput, CoreError>;
}
