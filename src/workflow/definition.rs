//! Workflow definitions and execution

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tracing::instrument;

use super::args::{parse_args, ArgSpec, ParsedArgs};
use super::handle::{ExecutionHandle, SubflowRef};
use crate::context::{self, ContextScope};
use crate::error::{KilnError, Result};
use crate::prefs::{self, PreferencesSource};

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Deepest scope an execution may open; deeper nesting is a runaway recursion
pub const MAX_NESTING_DEPTH: usize = 32;

/// Workflow body: receives coerced args and the execution handle
pub type Handler = Arc<dyn Fn(ParsedArgs, ExecutionHandle) -> HandlerFuture + Send + Sync>;

/// Builder consumed by [`define_workflow`]
#[derive(Default)]
pub struct WorkflowSpec {
    name: String,
    description: String,
    args: BTreeMap<String, ArgSpec>,
    subflows: Vec<SubflowRef>,
    handler: Option<Handler>,
    auto_start: bool,
}

impl WorkflowSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn arg(mut self, name: impl Into<String>, spec: ArgSpec) -> Self {
        self.args.insert(name.into(), spec);
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = (String, ArgSpec)>) -> Self {
        self.args.extend(args);
        self
    }

    pub fn subflow(mut self, subflow: SubflowRef) -> Self {
        self.subflows.push(subflow);
        self
    }

    pub fn subflows(mut self, subflows: impl IntoIterator<Item = SubflowRef>) -> Self {
        self.subflows.extend(subflows);
        self
    }

    pub fn handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ParsedArgs, ExecutionHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handler = Some(Arc::new(move |args: ParsedArgs, handle: ExecutionHandle| {
            handler(args, handle).boxed()
        }));
        self
    }

    pub fn boxed_handler(mut self, handler: Handler) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    /// Shorthand for [`define_workflow`]
    pub fn define(self) -> Result<Arc<WorkflowDefinition>> {
        define_workflow(self)
    }
}

/// Validate a spec and freeze it into a definition
pub fn define_workflow(spec: WorkflowSpec) -> Result<Arc<WorkflowDefinition>> {
    let name = spec.name.trim().to_string();
    if name.is_empty() {
        return Err(KilnError::Definition {
            reason: "workflow name is missing or empty".to_string(),
        });
    }

    let Some(handler) = spec.handler else {
        return Err(KilnError::Definition {
            reason: format!("workflow '{}' has no handler", name),
        });
    };

    for (arg, arg_spec) in &spec.args {
        if let Some(default) = &arg_spec.default {
            arg_spec
                .arg_type
                .coerce(default)
                .map_err(|reason| KilnError::Definition {
                    reason: format!(
                        "default for '{}.{}' is not a {}: {}",
                        name, arg, arg_spec.arg_type, reason
                    ),
                })?;
        }
    }

    for (i, subflow) in spec.subflows.iter().enumerate() {
        if spec.subflows[..i].iter().any(|s| s.name() == subflow.name()) {
            return Err(KilnError::Definition {
                reason: format!(
                    "workflow '{}' declares subflow '{}' twice",
                    name,
                    subflow.name()
                ),
            });
        }
    }

    Ok(Arc::new(WorkflowDefinition {
        name,
        description: spec.description,
        args_schema: spec.args,
        subflows: spec.subflows.into(),
        handler,
        auto_start: spec.auto_start,
    }))
}

/// Immutable, executable workflow
pub struct WorkflowDefinition {
    name: String,
    description: String,
    args_schema: BTreeMap<String, ArgSpec>,
    subflows: Arc<[SubflowRef]>,
    handler: Handler,
    auto_start: bool,
}

impl WorkflowDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn args_schema(&self) -> &BTreeMap<String, ArgSpec> {
        &self.args_schema
    }

    pub fn subflows(&self) -> &[SubflowRef] {
        &self.subflows
    }

    pub fn auto_start(&self) -> bool {
        self.auto_start
    }

    /// Run the workflow.
    ///
    /// Nested inside another execution, the snapshot is re-read from the
    /// enclosing scope's preferences source; otherwise from [`prefs::global`].
    pub async fn execute(&self, raw_args: Value) -> Result<()> {
        let source = context::current()
            .and_then(|scope| scope.source().cloned())
            .unwrap_or_else(prefs::global);
        self.execute_with(source, raw_args).await
    }

    /// Run the workflow against an explicit preferences source
    #[instrument(name = "workflow", skip_all, fields(workflow = %self.name))]
    pub async fn execute_with(
        &self,
        source: Arc<dyn PreferencesSource>,
        raw_args: Value,
    ) -> Result<()> {
        let depth = context::current().map_or(0, |scope| scope.depth() + 1);
        if depth > MAX_NESTING_DEPTH {
            return Err(KilnError::NestingTooDeep {
                workflow: self.name.clone(),
                depth,
                limit: MAX_NESTING_DEPTH,
            });
        }

        let args = parse_args(&self.name, &self.args_schema, &raw_args)?;
        let handle = ExecutionHandle::new(&self.name, self.subflows.clone());
        let scope = ContextScope::from_source(source).with_workflow(self.name.clone());

        let started = Instant::now();
        let outcome = scope.run((self.handler)(args, handle)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => {
                tracing::debug!(elapsed_ms, "Workflow completed");
                Ok(())
            }
            Err(source) => {
                tracing::warn!(elapsed_ms, "Workflow failed: {:#}", source);
                Err(KilnError::Handler {
                    workflow: self.name.clone(),
                    source,
                })
            }
        }
    }
}

impl fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("args_schema", &self.args_schema)
            .field("subflows", &self.subflows)
            .field("auto_start", &self.auto_start)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::OnceLock;

    fn noop() -> WorkflowSpec {
        WorkflowSpec::new("noop").handler(|_, _| async { Ok(()) })
    }

    #[test]
    fn rejects_empty_name() {
        let err = WorkflowSpec::new("  ")
            .handler(|_, _| async { Ok(()) })
            .define()
            .unwrap_err();
        assert!(matches!(err, KilnError::Definition { .. }));
    }

    #[test]
    fn rejects_missing_handler() {
        let err = WorkflowSpec::new("coder").define().unwrap_err();
        assert!(err.to_string().contains("no handler"));
    }

    #[test]
    fn rejects_bad_default() {
        let err = noop()
            .arg("count", ArgSpec::number().default_value("lots"))
            .define()
            .unwrap_err();
        assert!(err.to_string().contains("noop.count"));
    }

    #[test]
    fn rejects_duplicate_subflows() {
        let sub = noop().define().unwrap();
        let err = WorkflowSpec::new("parent")
            .subflow(SubflowRef::from_definition(sub.clone()))
            .subflow(SubflowRef::from_definition(sub))
            .handler(|_, _| async { Ok(()) })
            .define()
            .unwrap_err();
        assert!(err.to_string().contains("twice"));
    }

    #[test]
    fn trims_name() {
        let def = WorkflowSpec::new(" coder ")
            .description("Writes code")
            .auto_start(true)
            .handler(|_, _| async { Ok(()) })
            .define()
            .unwrap();
        assert_eq!(def.name(), "coder");
        assert_eq!(def.description(), "Writes code");
        assert!(def.auto_start());
    }

    #[tokio::test]
    async fn arg_errors_surface_before_handler() {
        let def = noop()
            .arg("count", ArgSpec::number())
            .define()
            .unwrap();

        let err = def.execute(json!({"count": "x"})).await.unwrap_err();
        assert!(matches!(err, KilnError::ArgValidation { .. }));
    }

    #[tokio::test]
    async fn nesting_limit_stops_runaway_recursion() {
        let slot: Arc<OnceLock<Arc<WorkflowDefinition>>> = Arc::new(OnceLock::new());
        let deepest = Arc::new(AtomicUsize::new(0));

        let this = slot.clone();
        let seen = deepest.clone();
        let def = WorkflowSpec::new("again")
            .handler(move |_, _| {
                let this = this.clone();
                let seen = seen.clone();
                async move {
                    seen.fetch_max(context::current().unwrap().depth(), Ordering::SeqCst);
                    if let Some(this) = this.get() {
                        this.execute(json!({})).await?;
                    }
                    Ok(())
                }
            })
            .define()
            .unwrap();
        slot.set(def.clone()).unwrap();

        let err = def.execute(json!({})).await.unwrap_err();
        assert!(!context::is_in_context());
        assert_eq!(deepest.load(Ordering::SeqCst), MAX_NESTING_DEPTH);

        let root = std::iter::successors(
            Some(&err as &(dyn std::error::Error + 'static)),
            |e| e.source(),
        )
        .last()
        .unwrap();
        match root.downcast_ref::<KilnError>() {
            Some(KilnError::NestingTooDeep {
                workflow,
                depth,
                limit,
            }) => {
                assert_eq!(workflow, "again");
                assert_eq!(*depth, MAX_NESTING_DEPTH + 1);
                assert_eq!(*limit, MAX_NESTING_DEPTH);
            }
            other => panic!("unexpected root error: {other:?}"),
        }
    }
}
