//! Subflow references and the per-execution handle

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::OnceCell;

use super::WorkflowDefinition;
use crate::error::{KilnError, Result};

/// Future produced by a subflow loader or registry factory
pub type DefinitionFuture = BoxFuture<'static, anyhow::Result<Arc<WorkflowDefinition>>>;

pub(crate) type Loader = Arc<dyn Fn() -> DefinitionFuture + Send + Sync>;

/// Named, deferred loader for a subflow
#[derive(Clone)]
pub struct SubflowRef {
    name: String,
    loader: Loader,
}

impl SubflowRef {
    pub fn new<F, Fut>(name: impl Into<String>, loader: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Arc<WorkflowDefinition>>> + Send + 'static,
    {
        Self {
            name: name.into(),
            loader: Arc::new(move || loader().boxed()),
        }
    }

    /// Reference to a definition that is already built
    pub fn from_definition(definition: Arc<WorkflowDefinition>) -> Self {
        let name = definition.name().to_string();
        Self::new(name, move || {
            let definition = definition.clone();
            async move { Ok(definition) }
        })
    }

    pub(crate) fn from_loader(name: impl Into<String>, loader: Loader) -> Self {
        Self {
            name: name.into(),
            loader,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the loader. Not memoised; see [`ExecutionHandle::get_subflow`].
    pub async fn load(&self) -> anyhow::Result<Arc<WorkflowDefinition>> {
        (self.loader)().await
    }
}

impl fmt::Debug for SubflowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubflowRef")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Passed to every handler; resolves the workflow's subflows by name
#[derive(Clone)]
pub struct ExecutionHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    workflow: String,
    subflows: Arc<[SubflowRef]>,
    loaded: Vec<OnceCell<Arc<WorkflowDefinition>>>,
}

impl ExecutionHandle {
    pub(crate) fn new(workflow: &str, subflows: Arc<[SubflowRef]>) -> Self {
        let loaded = subflows.iter().map(|_| OnceCell::new()).collect();
        Self {
            inner: Arc::new(HandleInner {
                workflow: workflow.to_string(),
                subflows,
                loaded,
            }),
        }
    }

    /// Name of the workflow this handle belongs to
    pub fn workflow_name(&self) -> &str {
        &self.inner.workflow
    }

    pub fn subflow_names(&self) -> impl Iterator<Item = &str> {
        self.inner.subflows.iter().map(SubflowRef::name)
    }

    /// Resolve a declared subflow by exact (case-sensitive) name.
    ///
    /// The first successful load is cached for the rest of this execution, so
    /// later calls return the same `Arc`. An undeclared name is `Ok(None)`;
    /// what to do about it is the caller's decision.
    pub async fn get_subflow(&self, name: &str) -> Result<Option<Arc<WorkflowDefinition>>> {
        let Some(index) = self.inner.subflows.iter().position(|s| s.name == name) else {
            tracing::debug!(
                workflow = %self.inner.workflow,
                subflow = name,
                "Subflow not declared"
            );
            return Ok(None);
        };

        let subflow = &self.inner.subflows[index];
        let definition = self.inner.loaded[index]
            .get_or_try_init(|| async {
                tracing::debug!(
                    workflow = %self.inner.workflow,
                    subflow = name,
                    "Loading subflow"
                );
                let definition = subflow.load().await?;
                if definition.name() != name {
                    tracing::warn!(
                        subflow = name,
                        loaded = definition.name(),
                        "Subflow loader returned a differently named workflow"
                    );
                }
                Ok::<_, anyhow::Error>(definition)
            })
            .await
            .map_err(|e| KilnError::SubflowLoad {
                parent: self.inner.workflow.clone(),
                name: name.to_string(),
                reason: format!("{:#}", e),
            })?;

        Ok(Some(definition.clone()))
    }
}

impl fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("workflow", &self.inner.workflow)
            .field("subflows", &self.inner.subflows)
            .finish()
    }
}
