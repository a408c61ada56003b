//! Workflow Registry & Composition
//!
//! - [`WorkflowSpec`] / [`define_workflow`]: declare a workflow
//! - [`WorkflowDefinition::execute`]: parse args, open a context scope, run the handler
//! - [`ExecutionHandle::get_subflow`]: lazy, per-execution subflow resolution
//! - [`WorkflowRegistry`]: named factories for in-process composition

pub mod args;
mod definition;
mod handle;
mod registry;

pub use args::{ArgSpec, ArgType, ParsedArgs};
pub use definition::{
    define_workflow, Handler, HandlerFuture, WorkflowDefinition, WorkflowSpec, MAX_NESTING_DEPTH,
};
pub use handle::{DefinitionFuture, ExecutionHandle, SubflowRef};
pub use registry::WorkflowRegistry;
