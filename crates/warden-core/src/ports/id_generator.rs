//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: Clock の時刻 + 乱数で ULID を生成

use std::sync::Arc;

use ulid::Ulid;

use crate::domain::{ClaimToken, TaskId};
use crate::ports::Clock;

/// IdGenerator は task id と claim token を生成
///
/// claim token は claim ごとに新しく発行されるため、古い lease の token と
/// 衝突してはならない。
pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;

    fn generate_claim_token(&self) -> ClaimToken;
}

/// ULID ベースの ID 生成器
///
/// timestamp 部分は Clock から取るので、ManualClock を使うと時刻部分は決定的になる。
pub struct UlidGenerator {
    clock: Arc<dyn Clock>,
}

impl UlidGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0);
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl IdGenerator for UlidGenerator {
    fn generate_task_id(&self) -> TaskId {
        TaskId::from(self.next())
    }

    fn generate_claim_token(&self) -> ClaimToken {
        ClaimToken::from(self.next())
    }
}
