//! Execution Context Manager
//!
//! Gives code running inside a workflow execution read-only access to a
//! [`ContextSnapshot`] without threading it through every signature.
//!
//! The scope lives in a `tokio::task_local!`, so it is attached to the future
//! being polled rather than to a global or to the call stack:
//!
//! - everything polled inside [`ContextScope::run`] sees the scope, including
//!   branches of `join!` / `join_all` / `select!` (fan-out and fan-in);
//! - interleaved executions on the same thread each see their own scope;
//! - work moved to another task must be wrapped with [`carry`], [`spawn`] or
//!   [`spawn_blocking`]. A bare `tokio::spawn` starts outside any scope.
//!
//! Outside a scope, the accessors return [`DEFAULT_AGENT`], the default
//! [`RetryConfig`] and "nothing disabled".

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::prefs::{PreferencesSource, DEFAULT_AGENT};
use crate::retry::RetryConfig;

tokio::task_local! {
    static CURRENT: Arc<ContextScope>;
}

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// Immutable configuration captured when a scope opens
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextSnapshot {
    preferred_agent: String,
    retry: RetryConfig,
    disabled_workflows: BTreeSet<String>,
}

impl ContextSnapshot {
    pub fn new(
        preferred_agent: impl Into<String>,
        retry: RetryConfig,
        disabled_workflows: BTreeSet<String>,
    ) -> Self {
        let preferred_agent = preferred_agent.into();
        let max_attempts = retry.max_attempts;
        Self {
            preferred_agent: if preferred_agent.is_empty() {
                DEFAULT_AGENT.to_string()
            } else {
                preferred_agent
            },
            retry: retry.with_max_attempts(max_attempts),
            disabled_workflows,
        }
    }

    pub fn preferred_agent(&self) -> &str {
        &self.preferred_agent
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn disabled_workflows(&self) -> &BTreeSet<String> {
        &self.disabled_workflows
    }

    pub fn is_workflow_disabled(&self, name: &str) -> bool {
        self.disabled_workflows.contains(name)
    }
}

impl Default for ContextSnapshot {
    fn default() -> Self {
        Self::new(DEFAULT_AGENT, RetryConfig::default(), BTreeSet::new())
    }
}

/// One dynamic extent in which a snapshot is visible
#[derive(Debug)]
pub struct ContextScope {
    id: u64,
    parent_id: Option<u64>,
    depth: usize,
    workflow: Option<String>,
    lineage: Vec<String>,
    snapshot: Arc<ContextSnapshot>,
    source: Option<Arc<dyn PreferencesSource>>,
}

impl ContextScope {
    pub fn new(snapshot: ContextSnapshot) -> Self {
        Self {
            id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
            parent_id: None,
            depth: 0,
            workflow: None,
            lineage: Vec::new(),
            snapshot: Arc::new(snapshot),
            source: None,
        }
    }

    /// Scope seeded from `source` right now, remembering the source so nested
    /// executions can re-read it
    pub fn from_source(source: Arc<dyn PreferencesSource>) -> Self {
        let snapshot = source.snapshot();
        Self {
            source: Some(source),
            ..Self::new(snapshot)
        }
    }

    /// Label the scope with the workflow it runs
    pub fn with_workflow(mut self, name: impl Into<String>) -> Self {
        self.workflow = Some(name.into());
        self
    }

    /// Run `fut` with this scope as the nearest enclosing one.
    /// The scope ends when `fut` completes, whatever its output.
    pub async fn run<F: Future>(self, fut: F) -> F::Output {
        let scope = Arc::new(self.nest());
        tracing::debug!(
            scope = scope.id,
            parent = ?scope.parent_id,
            depth = scope.depth,
            workflow = scope.workflow.as_deref().unwrap_or("-"),
            "Entering context scope"
        );
        CURRENT.scope(scope, fut).await
    }

    /// Synchronous variant of [`ContextScope::run`]
    pub fn run_sync<R>(self, f: impl FnOnce() -> R) -> R {
        CURRENT.sync_scope(Arc::new(self.nest()), f)
    }

    fn nest(mut self) -> Self {
        let _ = CURRENT.try_with(|parent| {
            self.parent_id = Some(parent.id);
            self.depth = parent.depth + 1;
            self.lineage = parent.lineage.clone();
        });
        self.lineage.extend(self.workflow.clone());
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn parent_id(&self) -> Option<u64> {
        self.parent_id
    }

    /// 0 for a top-level scope, 1 for a scope opened inside it, ...
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn workflow(&self) -> Option<&str> {
        self.workflow.as_deref()
    }

    /// Workflows running in this scope and its ancestors, outermost first
    pub fn lineage(&self) -> &[String] {
        &self.lineage
    }

    pub fn snapshot(&self) -> &Arc<ContextSnapshot> {
        &self.snapshot
    }

    pub fn source(&self) -> Option<&Arc<dyn PreferencesSource>> {
        self.source.as_ref()
    }
}

/// The nearest enclosing scope
pub fn current() -> Option<Arc<ContextScope>> {
    CURRENT.try_with(Arc::clone).ok()
}

/// Snapshot of the nearest enclosing scope
pub fn snapshot() -> Option<Arc<ContextSnapshot>> {
    CURRENT.try_with(|s| s.snapshot.clone()).ok()
}

pub fn is_in_context() -> bool {
    CURRENT.try_with(|_| ()).is_ok()
}

/// Whether `workflow` is already executing in the current scope or an enclosing one
pub fn is_running(workflow: &str) -> bool {
    CURRENT
        .try_with(|s| s.lineage.iter().any(|w| w == workflow))
        .unwrap_or(false)
}

fn read<R>(
    what: &str,
    f: impl FnOnce(&ContextSnapshot) -> R,
    fallback: impl FnOnce() -> R,
) -> R {
    match CURRENT.try_with(|s| f(&s.snapshot)) {
        Ok(value) => value,
        Err(_) => {
            tracing::debug!("{} read outside any context scope, using default", what);
            fallback()
        }
    }
}

pub fn preferred_agent() -> String {
    read(
        "preferred_agent",
        |s| s.preferred_agent().to_string(),
        || DEFAULT_AGENT.to_string(),
    )
}

pub fn retry_config() -> RetryConfig {
    read(
        "retry_config",
        |s| s.retry_config().clone(),
        RetryConfig::default,
    )
}

pub fn is_workflow_disabled(name: &str) -> bool {
    read(
        "is_workflow_disabled",
        |s| s.is_workflow_disabled(name),
        || false,
    )
}

/// Wrap `fut` so it runs in the current scope wherever it is polled
pub fn carry<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    let scope = current();
    async move {
        match scope {
            Some(scope) => CURRENT.scope(scope, fut).await,
            None => fut.await,
        }
    }
}

/// `tokio::spawn` that keeps the current scope
pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(carry(fut))
}

/// `tokio::task::spawn_blocking` that keeps the current scope
pub fn spawn_blocking<F, R>(f: F) -> JoinHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let scope = current();
    tokio::task::spawn_blocking(move || match scope {
        Some(scope) => CURRENT.sync_scope(scope, f),
        None => f(),
    })
}
