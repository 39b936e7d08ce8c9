//! DispatchStrategy port - task category から delegate 名へのマッピング
//!
//! # 実装
//! - DirectDispatch: category == delegate 名
//! - RoutedDispatch: 設定の routing テーブルで解決

use crate::error::CoreError;

/// DispatchStrategy は category を delegate 名に解決
///
/// delegate の選択は category だけで決まり、実行者の実体には依存しない。
pub trait DispatchStrategy: Send + Sync {
    fn select_delegate(&self, category: &str) -> Result<String, CoreError>;
}
