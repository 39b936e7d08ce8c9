//! Runtime - category から delegate を解決して実行する
//!
//! # フロー
//! 1. DispatchStrategy で category -> delegate 名
//! 2. DelegateRegistry から delegate を取得
//! 3. `Delegate::execute` (breaker と timeout は呼び出し側の WorkerPool が担当)

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::domain::{DelegateOutput, Task};
use crate::error::CoreError;
use crate::ports::{Delegate, DispatchStrategy};

/// Registry of delegates (name -> delegate).
///
/// Built during initialization, read-only afterwards, so no lock is needed.
#[derive(Default)]
pub struct DelegateRegistry {
    delegates: BTreeMap<String, Arc<dyn Delegate>>,
}

impl DelegateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a delegate. Names are unique.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        delegate: Arc<dyn Delegate>,
    ) -> Result<(), CoreError> {
        let name = name.into();
        if self.delegates.contains_key(&name) {
            return Err(CoreError::InvalidConfig(format!(
                "delegate `{name}` registered twice"
            )));
        }
        self.delegates.insert(name, delegate);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Delegate>> {
        self.delegates.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.delegates.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.delegates.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.delegates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delegates.is_empty()
    }
}

/// Resolves a task to its delegate and runs it.
pub struct Runtime {
    registry: Arc<DelegateRegistry>,
    dispatch: Arc<dyn DispatchStrategy>,
}

impl Runtime {
    pub fn new(registry: Arc<DelegateRegistry>, dispatch: Arc<dyn DispatchStrategy>) -> Self {
        Self { registry, dispatch }
    }

    pub fn registry(&self) -> &DelegateRegistry {
        &self.registry
    }

    /// Name of the delegate that handles `task`.
    pub fn delegate_name(&self, task: &Task) -> Result<String, CoreError> {
        let name = self.dispatch.select_delegate(&task.category)?;
        if !self.registry.contains(&name) {
            return Err(CoreError::Delegate(format!(
                "no delegate `{name}` for category `{}`",
                task.category
            )));
        }
        Ok(name)
    }

    /// Execute one task with the delegate named `name`.
    pub async fn execute(&self, name: &str, task: &Task) -> Result<DelegateOutput, CoreError> {
        let delegate = self
            .registry
            .get(name)
            .ok_or_else(|| CoreError::Delegate(format!("no delegate `{name}`")))?;
        delegate.execute(task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskId, TaskSpec};
    use crate::impls::DirectDispatch;
    use async_trait::async_trait;
    use chrono::Utc;

    struct OkDelegate;

    #[async_trait]
    impl Delegate for OkDelegate {
        async fn execute(&self, _task: &Task) -> Result<DelegateOutput, CoreError> {
            Ok(DelegateOutput::success().with_units(7))
        }
    }

    fn task(category: &str) -> Task {
        Task::new(
            TaskId::from_ulid(ulid::Ulid::new()),
            &TaskSpec::new(category, "ref"),
            0,
            3,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn runtime_executes_registered_delegate() {
        let mut reg = DelegateRegistry::new();
        reg.register("ok", Arc::new(OkDelegate)).unwrap();
        let rt = Runtime::new(Arc::new(reg), Arc::new(DirectDispatch::new()));

        let t = task("ok");
        let name = rt.delegate_name(&t).unwrap();
        let out = rt.execute(&name, &t).await.unwrap();
        assert!(out.success);
        assert_eq!(out.units_consumed, 7);
    }

    #[tokio::test]
    async fn runtime_errors_when_delegate_missing() {
        let rt = Runtime::new(Arc::new(DelegateRegistry::new()), Arc::new(DirectDispatch::new()));
        let err = rt.delegate_name(&task("missing")).unwrap_err();
        assert!(err.to_string().contains("delegate"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut reg = DelegateRegistry::new();
        reg.register("ok", Arc::new(OkDelegate)).unwrap();
        assert!(reg.register("ok", Arc::new(OkDelegate)).is_err());
        assert_eq!(reg.len(), 1);
    }
}
