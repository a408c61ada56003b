//! Named workflow factories
//!
//! A registry maps names to factories that build a [`WorkflowDefinition`] on
//! demand. Loading through the registry is never cached; caching happens per
//! execution in [`ExecutionHandle::get_subflow`](super::ExecutionHandle::get_subflow).

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;

use super::handle::{Loader, SubflowRef};
use super::WorkflowDefinition;
use crate::error::{KilnError, Result};

#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    factories: BTreeMap<String, Loader>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a factory under `name`
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Arc<WorkflowDefinition>>> + Send + 'static,
    {
        let name = name.into();
        let loader: Loader = Arc::new(move || factory().boxed());
        if self.factories.insert(name.clone(), loader).is_some() {
            tracing::debug!(workflow = %name, "Replaced registered workflow");
        }
        self
    }

    /// Register an already-built definition under its own name
    pub fn register_definition(&mut self, definition: Arc<WorkflowDefinition>) -> &mut Self {
        let name = definition.name().to_string();
        self.register(name, move || {
            let definition = definition.clone();
            async move { Ok(definition) }
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Build the named workflow. `Ok(None)` if nothing is registered under it.
    pub async fn load(&self, name: &str) -> Result<Option<Arc<WorkflowDefinition>>> {
        let Some(factory) = self.factories.get(name) else {
            return Ok(None);
        };
        factory()
            .await
            .map(Some)
            .map_err(|e| KilnError::WorkflowLoad {
                name: name.to_string(),
                reason: format!("{:#}", e),
            })
    }

    /// Lookup by name, erroring when absent
    pub async fn get(&self, name: &str) -> Result<Arc<WorkflowDefinition>> {
        self.load(name)
            .await?
            .ok_or_else(|| KilnError::WorkflowNotFound {
                name: name.to_string(),
            })
    }

    /// Deferred reference for use as another workflow's subflow
    pub fn subflow_ref(&self, name: &str) -> Option<SubflowRef> {
        self.factories
            .get(name)
            .map(|factory| SubflowRef::from_loader(name, factory.clone()))
    }
}

impl std::fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflows", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowSpec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn factories_run_on_every_load() {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();

        let mut registry = WorkflowRegistry::new();
        registry.register("coder", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                WorkflowSpec::new("coder")
                    .handler(|_, _| async { Ok(()) })
                    .define()
                    .map_err(anyhow::Error::from)
            }
        });

        let a = registry.get("coder").await.unwrap();
        let b = registry.get("coder").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_names() {
        let registry = WorkflowRegistry::new();
        assert!(registry.load("ghost").await.unwrap().is_none());
        assert!(registry.subflow_ref("ghost").is_none());
        assert!(matches!(
            registry.get("ghost").await.unwrap_err(),
            KilnError::WorkflowNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn failing_factory_is_workflow_load_error() {
        let mut registry = WorkflowRegistry::new();
        registry.register("broken", || async { Err(anyhow::anyhow!("no such module")) });

        let err = registry.load("broken").await.unwrap_err();
        match &err {
            KilnError::WorkflowLoad { name, reason } => {
                assert_eq!(name, "broken");
                assert!(reason.contains("no such module"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.code(), Some("KILN-034"));
        assert!(err.to_string().contains("Workflow 'broken' failed to load"));
    }

    #[test]
    fn names_are_sorted() {
        let mut registry = WorkflowRegistry::new();
        for name in ["zeta", "alpha", "mid"] {
            let def = WorkflowSpec::new(name)
                .handler(|_, _| async { Ok(()) })
                .define()
                .unwrap();
            registry.register_definition(def);
        }
        assert_eq!(registry.names().collect::<Vec<_>>(), ["alpha", "mid", "zeta"]);
        assert_eq!(registry.len(), 3);
    }
}
