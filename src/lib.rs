//! Kiln - composable workflow runtime for agent orchestration
//!
//! - [`prefs`]: process-wide preferences (agent, retry, enablement)
//! - [`context`]: ambient per-execution snapshot of those preferences
//! - [`workflow`]: definitions, argument parsing, lazy subflows
//! - [`inventory`]: builtin / user / archived discovery and reconciliation
//! - [`manifest`]: YAML workflow and tool-server manifests

pub mod context;
pub mod error;
pub mod inventory;
pub mod manifest;
pub mod prefs;
pub mod retry;
pub mod session;
pub mod workflow;

pub use context::{ContextScope, ContextSnapshot};
pub use error::{FixSuggestion, KilnError};
pub use inventory::{build_inventory, Inventory, InventoryEntry, InventoryRoots, Source};
pub use manifest::{ManifestCatalog, WorkflowManifest};
pub use prefs::{Preferences, PreferencesSource, PreferencesStore};
pub use retry::{with_retry, RetryConfig};
pub use session::{delete_session, load_session, save_session, Session};
pub use workflow::{
    define_workflow, ArgSpec, ExecutionHandle, ParsedArgs, SubflowRef, WorkflowDefinition,
    WorkflowRegistry, WorkflowSpec,
};
