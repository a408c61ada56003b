//! Error types with fix suggestions
//!
//! Error code ranges:
//! - KILN-000-009: Definition errors
//! - KILN-010-019: Argument errors
//! - KILN-020-029: Handler / step errors
//! - KILN-030-039: Loading and lookup errors
//! - KILN-040-049: Preferences errors
//! - KILN-050-059: Session errors

use thiserror::Error;

pub type Result<T> = std::result::Result<T, KilnError>;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

#[derive(Error, Debug)]
pub enum KilnError {
    // ═══════════════════════════════════════════
    // DEFINITION ERRORS (000-009)
    // ═══════════════════════════════════════════
    #[error("[KILN-001] Invalid workflow definition: {reason}")]
    Definition { reason: String },

    // ═══════════════════════════════════════════
    // ARGUMENT ERRORS (010-019)
    // ═══════════════════════════════════════════
    #[error("[KILN-010] Workflow '{workflow}': argument '{arg}' expected {expected}: {reason}")]
    ArgValidation {
        workflow: String,
        arg: String,
        expected: String,
        reason: String,
    },

    // ═══════════════════════════════════════════
    // HANDLER ERRORS (020-029)
    // ═══════════════════════════════════════════
    /// The handler's own error, kept untouched as the source.
    #[error("[KILN-020] Workflow '{workflow}' failed: {source}")]
    Handler {
        workflow: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("[KILN-021] Step {index} of '{workflow}' failed: {reason}")]
    Step {
        workflow: String,
        index: usize,
        reason: String,
    },

    #[error("[KILN-022] Workflow '{workflow}' nested {depth} levels deep (limit {limit})")]
    NestingTooDeep {
        workflow: String,
        depth: usize,
        limit: usize,
    },

    // ═══════════════════════════════════════════
    // LOADING ERRORS (030-039)
    // ═══════════════════════════════════════════
    #[error("[KILN-030] Failed to load '{path}': {reason}")]
    Load { path: String, reason: String },

    #[error("[KILN-031] Subflow '{name}' of '{parent}' failed to load: {reason}")]
    SubflowLoad {
        parent: String,
        name: String,
        reason: String,
    },

    #[error("[KILN-032] Workflow '{name}' not found")]
    WorkflowNotFound { name: String },

    #[error("[KILN-033] Workflow '{name}' is disabled")]
    WorkflowDisabled { name: String },

    #[error("[KILN-034] Workflow '{name}' failed to load: {reason}")]
    WorkflowLoad { name: String, reason: String },

    // ═══════════════════════════════════════════
    // PREFERENCES ERRORS (040-049)
    // ═══════════════════════════════════════════
    #[error("[KILN-040] Configuration error: {reason}")]
    Config { reason: String },

    // ═══════════════════════════════════════════
    // SESSION ERRORS (050-059)
    // ═══════════════════════════════════════════
    #[error("[KILN-050] Session file '{path}': {reason}")]
    Session { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl KilnError {
    /// Error code like `KILN-020`, if the variant carries one
    pub fn code(&self) -> Option<&'static str> {
        match self {
            KilnError::Definition { .. } => Some("KILN-001"),
            KilnError::ArgValidation { .. } => Some("KILN-010"),
            KilnError::Handler { .. } => Some("KILN-020"),
            KilnError::Step { .. } => Some("KILN-021"),
            KilnError::NestingTooDeep { .. } => Some("KILN-022"),
            KilnError::Load { .. } => Some("KILN-030"),
            KilnError::SubflowLoad { .. } => Some("KILN-031"),
            KilnError::WorkflowNotFound { .. } => Some("KILN-032"),
            KilnError::WorkflowDisabled { .. } => Some("KILN-033"),
            KilnError::WorkflowLoad { .. } => Some("KILN-034"),
            KilnError::Config { .. } => Some("KILN-040"),
            KilnError::Session { .. } => Some("KILN-050"),
            KilnError::Io(_) | KilnError::YamlParse(_) | KilnError::Json(_) => None,
        }
    }

    /// The handler's original error, when this is a handler failure
    pub fn handler_source(&self) -> Option<&anyhow::Error> {
        match self {
            KilnError::Handler { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl FixSuggestion for KilnError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            KilnError::Definition { .. } => {
                Some("Give the workflow a non-empty name and a handler")
            }
            KilnError::ArgValidation { .. } => {
                Some("Pass a value matching the declared type (string, number or boolean)")
            }
            KilnError::Handler { .. } => None,
            KilnError::Step { .. } => Some("Check the step's command and its exit status"),
            KilnError::NestingTooDeep { .. } => {
                Some("Check for a workflow that runs itself through its subflows")
            }
            KilnError::Load { .. } => Some("Check YAML syntax and that 'name' is set"),
            KilnError::SubflowLoad { .. } => {
                Some("Make sure the subflow is installed and not archived")
            }
            KilnError::WorkflowNotFound { .. } => Some("Run 'kiln list' to see active workflows"),
            KilnError::WorkflowDisabled { .. } => {
                Some("Remove it from disabled_workflows in config.toml")
            }
            KilnError::WorkflowLoad { .. } => {
                Some("Check the factory registered for this workflow")
            }
            KilnError::Config { .. } => Some("Check config.toml syntax"),
            KilnError::Session { .. } => Some("Delete or repair the session file"),
            KilnError::Io(_) => Some("Check file path and permissions"),
            KilnError::YamlParse(_) => Some("Check YAML syntax: indentation and quoting"),
            KilnError::Json(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_error_keeps_source() {
        #[derive(Debug, thiserror::Error)]
        #[error("agent crashed")]
        struct AgentCrash;

        let err = KilnError::Handler {
            workflow: "coder".to_string(),
            source: anyhow::Error::new(AgentCrash),
        };

        assert_eq!(err.code(), Some("KILN-020"));
        assert!(err.to_string().contains("agent crashed"));
        let source = err.handler_source().unwrap();
        assert!(source.downcast_ref::<AgentCrash>().is_some());
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn suggestions() {
        let err = KilnError::WorkflowNotFound {
            name: "ghost".to_string(),
        };
        assert!(err.to_string().contains("KILN-032"));
        assert!(err.fix_suggestion().unwrap().contains("kiln list"));
    }
}
