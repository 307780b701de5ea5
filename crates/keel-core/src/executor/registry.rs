//! Executor registry — a named collection of available [`PhaseExecutor`]
//! implementations, grounded on `gator-core::harness::HarnessRegistry`
//! (same `HashMap<String, Box<dyn Trait>>` shape, generalized from harness
//! name to `phase.executor` name).

use std::collections::HashMap;

use super::trait_def::PhaseExecutor;

#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Box<dyn PhaseExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: impl PhaseExecutor + 'static) -> Option<Box<dyn PhaseExecutor>> {
        let name = executor.name().to_string();
        self.executors.insert(name, Box::new(executor))
    }

    pub fn get(&self, name: &str) -> Option<&dyn PhaseExecutor> {
        self.executors.get(name).map(|b| b.as_ref())
    }

    pub fn list(&self) -> Vec<&str> {
        self.executors.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("executors", &self.executors.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::trait_def::{ExecutorContext, PhaseExecutor};
    use crate::errors::EngineError;
    use crate::fabric::ProgressEvent;
    use async_trait::async_trait;
    use futures::Stream;
    use keel_db::models::Phase;
    use std::pin::Pin;

    struct FakeExecutor(String);

    #[async_trait]
    impl PhaseExecutor for FakeExecutor {
        fn name(&self) -> &str {
            &self.0
        }

        async fn execute(
            &self,
            _ctx: &ExecutorContext,
            _phase: &Phase,
        ) -> Result<Pin<Box<dyn Stream<Item = Result<ProgressEvent, EngineError>> + Send>>, EngineError>
        {
            Ok(Box::pin(futures::stream::empty()))
        }
    }

    #[test]
    fn registry_starts_empty() {
        let registry = ExecutorRegistry::new();
        assert!(registry.is_empty());
    }

    #[test]
    fn register_and_get() {
        let mut registry = ExecutorRegistry::new();
        registry.register(FakeExecutor("validate".into()));
        assert!(registry.get("validate").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn register_replaces_existing() {
        let mut registry = ExecutorRegistry::new();
        registry.register(FakeExecutor("apply".into()));
        let old = registry.register(FakeExecutor("apply".into()));
        assert!(old.is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn list_returns_all_names() {
        let mut registry = ExecutorRegistry::new();
        registry.register(FakeExecutor("a".into()));
        registry.register(FakeExecutor("b".into()));
        let mut names = registry.list();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }
}
