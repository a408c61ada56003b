//! Workflow and tool-server manifests
//!
//! File-based workflows are YAML manifests. A manifest declares the same
//! things as [`WorkflowSpec`] plus a list of steps that becomes the handler.
//!
//! ```yaml
//! name: coder
//! description: Implement a change
//! args:
//!   task: { type: string, alias: t }
//! subflows: [reviewer]
//! steps:
//!   - log: "starting {{args.task}}"
//!   - exec: "{{agent}} -p {{args.task}}"
//!   - exec: "echo \"Task: $KILN_ARG_TASK\""
//!   - subflow: reviewer
//!     args: { strict: true }
//! ```
//!
//! Placeholders: `{{args.NAME}}` (absent args render empty) and `{{agent}}`
//! (the ambient preferred agent). In `exec` steps each substituted value is
//! quoted as a single shell word, so placeholders must not sit inside quotes
//! of their own. Parsed args are also exported to the command as
//! `KILN_ARG_<NAME>` for use inside larger quoted strings.
//!
//! A `subflow` step naming a workflow that is already running further up the
//! chain fails instead of recursing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context;
use crate::error::{KilnError, Result};
use crate::inventory::{build_inventory, InventoryRoots};
use crate::workflow::{
    ArgSpec, ExecutionHandle, ParsedArgs, SubflowRef, WorkflowDefinition, WorkflowSpec,
};

/// Pattern for {{agent}} and {{args.name}} placeholders
static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*(agent|args\.([A-Za-z0-9_-]+))\s*\}\}").expect("placeholder regex")
});

/// Workflow manifest (`*.workflow.yaml`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowManifest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub args: BTreeMap<String, ArgSpec>,
    #[serde(default)]
    pub subflows: Vec<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// One step - serde picks the variant from the key present
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Step {
    /// Shell command; a non-zero exit fails the workflow
    Exec { exec: String },
    /// Declared subflow, executed in its own scope
    Subflow {
        subflow: String,
        #[serde(default)]
        args: serde_json::Map<String, Value>,
    },
    /// Message logged at info level
    Log { log: String },
}

impl WorkflowManifest {
    pub fn from_yaml(yaml: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Structural checks beyond what serde enforces
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("'name' is missing or empty".to_string());
        }
        if self.subflows.iter().any(|s| s.trim() == self.name.trim()) {
            return Err(format!("'{}' lists itself in 'subflows'", self.name.trim()));
        }
        for (index, step) in self.steps.iter().enumerate() {
            if let Step::Subflow { subflow, .. } = step {
                if !self.subflows.contains(subflow) {
                    return Err(format!(
                        "step {} uses subflow '{}' which is not listed in 'subflows'",
                        index, subflow
                    ));
                }
            }
        }
        Ok(())
    }

    /// Build an executable definition; subflows resolve through `catalog`
    pub fn into_definition(self, catalog: &ManifestCatalog) -> Result<Arc<WorkflowDefinition>> {
        let steps: Arc<[Step]> = self.steps.into();
        let name = self.name.trim().to_string();
        let workflow = name.clone();

        WorkflowSpec::new(name)
            .description(self.description)
            .auto_start(self.auto_start)
            .args(self.args)
            .subflows(self.subflows.iter().map(|s| catalog.subflow_ref(s)))
            .handler(move |args, handle| {
                let steps = steps.clone();
                let workflow = workflow.clone();
                async move { run_steps(&workflow, &steps, &args, &handle).await }
            })
            .define()
    }
}

/// Tool-server manifest (`*.mcp.yaml`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpManifest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn load_error(path: &Path, reason: impl ToString) -> KilnError {
    KilnError::Load {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

pub fn load_workflow_manifest(path: &Path) -> Result<WorkflowManifest> {
    let yaml = std::fs::read_to_string(path).map_err(|e| load_error(path, e))?;
    let manifest = WorkflowManifest::from_yaml(&yaml).map_err(|e| load_error(path, e))?;
    manifest.validate().map_err(|e| load_error(path, e))?;
    Ok(manifest)
}

pub fn load_mcp_manifest(path: &Path) -> Result<McpManifest> {
    let yaml = std::fs::read_to_string(path).map_err(|e| load_error(path, e))?;
    let manifest: McpManifest = serde_yaml::from_str(&yaml).map_err(|e| load_error(path, e))?;
    if manifest.name.trim().is_empty() {
        return Err(load_error(path, "'name' is missing or empty"));
    }
    if manifest.command.trim().is_empty() {
        return Err(load_error(path, "'command' is missing or empty"));
    }
    Ok(manifest)
}

/// Resolves workflow names to manifests through the active inventory view.
///
/// Every load rescans the roots, so it always reflects the filesystem.
#[derive(Debug, Clone)]
pub struct ManifestCatalog {
    roots: Arc<InventoryRoots>,
}

impl ManifestCatalog {
    pub fn new(roots: InventoryRoots) -> Self {
        Self {
            roots: Arc::new(roots),
        }
    }

    pub fn roots(&self) -> &InventoryRoots {
        &self.roots
    }

    /// Manifest path of the active workflow called `name`
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        build_inventory(&self.roots)
            .find_active_workflow(name)
            .map(|entry| entry.path)
    }

    /// Load the active workflow called `name`
    pub async fn load(&self, name: &str) -> Result<Arc<WorkflowDefinition>> {
        let path = self
            .resolve(name)
            .ok_or_else(|| KilnError::WorkflowNotFound {
                name: name.to_string(),
            })?;
        self.load_path(&path).await
    }

    /// Load a manifest directly by path, archived or not
    pub async fn load_path(&self, path: &Path) -> Result<Arc<WorkflowDefinition>> {
        let yaml = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| load_error(path, e))?;
        let manifest = WorkflowManifest::from_yaml(&yaml).map_err(|e| load_error(path, e))?;
        manifest.validate().map_err(|e| load_error(path, e))?;
        tracing::debug!(workflow = %manifest.name, path = %path.display(), "Loaded manifest");
        manifest.into_definition(self)
    }

    /// Deferred reference resolved at first use
    pub fn subflow_ref(&self, name: &str) -> SubflowRef {
        let catalog = self.clone();
        let target = name.to_string();
        SubflowRef::new(name, move || {
            let catalog = catalog.clone();
            let target = target.clone();
            async move { Ok(catalog.load(&target).await?) }
        })
    }
}

fn resolve(caps: &Captures, args: &ParsedArgs) -> String {
    match caps.get(2) {
        Some(arg) => args.display(arg.as_str()).unwrap_or_default(),
        None => context::preferred_agent(),
    }
}

/// Substitute placeholders in `template`
pub fn render(template: &str, args: &ParsedArgs) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| resolve(caps, args))
        .into_owned()
}

/// Like [`render`], but every substituted value becomes one quoted shell word.
///
/// Fails only for values `sh` cannot carry (a NUL byte).
pub fn render_shell(template: &str, args: &ParsedArgs) -> std::result::Result<String, String> {
    let mut failure = None;
    let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures| {
        match shlex::try_quote(&resolve(caps, args)) {
            Ok(quoted) => quoted.into_owned(),
            Err(e) => {
                failure.get_or_insert_with(|| format!("cannot quote {}: {}", &caps[0], e));
                String::new()
            }
        }
    });
    match failure {
        Some(reason) => Err(reason),
        None => Ok(rendered.into_owned()),
    }
}

/// `KILN_ARG_<NAME>` variables for every parsed arg
fn arg_env(args: &ParsedArgs) -> Vec<(String, String)> {
    args.iter()
        .filter_map(|(name, _)| {
            let key = format!("KILN_ARG_{}", name.to_ascii_uppercase().replace('-', "_"));
            args.display(name).map(|value| (key, value))
        })
        .collect()
}

fn render_value(value: &Value, args: &ParsedArgs) -> Value {
    match value {
        Value::String(s) => Value::String(render(s, args)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, args)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, args)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn step_error(workflow: &str, index: usize, reason: impl Into<String>) -> KilnError {
    KilnError::Step {
        workflow: workflow.to_string(),
        index,
        reason: reason.into(),
    }
}

async fn run_steps(
    workflow: &str,
    steps: &[Step],
    args: &ParsedArgs,
    handle: &ExecutionHandle,
) -> anyhow::Result<()> {
    for (index, step) in steps.iter().enumerate() {
        match step {
            Step::Log { log } => {
                tracing::info!(workflow, step = index, "{}", render(log, args));
            }
            Step::Exec { exec } => {
                let command = render_shell(exec, args).map_err(|e| step_error(workflow, index, e))?;
                run_command(workflow, index, &command, args).await?;
            }
            Step::Subflow {
                subflow,
                args: sub_args,
            } => {
                if context::is_workflow_disabled(subflow) {
                    tracing::info!(workflow, subflow = %subflow, "Skipping disabled subflow");
                    continue;
                }
                if context::is_running(subflow) {
                    let chain = context::current()
                        .map(|scope| scope.lineage().join(" -> "))
                        .unwrap_or_default();
                    return Err(step_error(
                        workflow,
                        index,
                        format!(
                            "subflow '{}' is already running ({} -> {})",
                            subflow, chain, subflow
                        ),
                    )
                    .into());
                }
                let Some(definition) = handle.get_subflow(subflow).await? else {
                    return Err(step_error(
                        workflow,
                        index,
                        format!("subflow '{}' not found", subflow),
                    )
                    .into());
                };
                let sub_args = render_value(&Value::Object(sub_args.clone()), args);
                definition.execute(sub_args).await?;
            }
        }
    }
    Ok(())
}

async fn run_command(
    workflow: &str,
    index: usize,
    command: &str,
    args: &ParsedArgs,
) -> anyhow::Result<()> {
    tracing::debug!(workflow, step = index, command, "Running command");

    let mut cmd = if cfg!(windows) {
        let mut cmd = tokio::process::Command::new("cmd");
        cmd.arg("/C");
        cmd
    } else {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c");
        cmd
    };

    let status = cmd
        .arg(command)
        .env("KILN_AGENT", context::preferred_agent())
        .env("KILN_WORKFLOW", workflow)
        .envs(arg_env(args))
        .status()
        .await
        .map_err(|e| step_error(workflow, index, format!("failed to spawn: {}", e)))?;

    if !status.success() {
        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        return Err(step_error(
            workflow,
            index,
            format!("command exited with {}: {}", code, command),
        )
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::args::parse_args;
    use serde_json::json;

    const CODER: &str = r#"
name: coder
description: Implement a change
args:
  task: { type: string, alias: t }
  retries: { type: number, default: 2 }
subflows: [reviewer]
steps:
  - log: "starting {{args.task}}"
  - exec: "true"
  - subflow: reviewer
    args: { focus: "{{args.task}}" }
"#;

    #[test]
    fn parses_steps() {
        let manifest = WorkflowManifest::from_yaml(CODER).unwrap();
        assert_eq!(manifest.name, "coder");
        assert_eq!(manifest.args.len(), 2);
        assert_eq!(manifest.steps.len(), 3);
        assert!(matches!(manifest.steps[0], Step::Log { .. }));
        assert_eq!(manifest.steps[1], Step::Exec { exec: "true".to_string() });
        match &manifest.steps[2] {
            Step::Subflow { subflow, args } => {
                assert_eq!(subflow, "reviewer");
                assert_eq!(args.get("focus"), Some(&json!("{{args.task}}")));
            }
            other => panic!("unexpected step: {other:?}"),
        }
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn undeclared_subflow_step_is_invalid() {
        let manifest = WorkflowManifest::from_yaml(
            r#"
name: lonely
steps:
  - subflow: ghost
"#,
        )
        .unwrap();
        assert!(manifest.validate().unwrap_err().contains("ghost"));
    }

    #[test]
    fn render_placeholders() {
        let mut schema = BTreeMap::new();
        schema.insert("task".to_string(), ArgSpec::string());
        schema.insert("n".to_string(), ArgSpec::number());
        let args = parse_args("w", &schema, &json!({"task": "fix bug", "n": 3})).unwrap();

        assert_eq!(render("do {{args.task}} x{{ args.n }}", &args), "do fix bug x3");
        assert_eq!(render("missing: [{{args.other}}]", &args), "missing: []");
        assert_eq!(render("{{agent}} run", &args), "claude run");
        assert_eq!(render("{{unknown}}", &args), "{{unknown}}");
    }

    #[test]
    fn render_shell_keeps_each_value_one_word() {
        let mut schema = BTreeMap::new();
        schema.insert("text".to_string(), ArgSpec::string());

        for text in ["it's fine", "x'; touch pwned; echo '", "$(id) `id` \"q\" a\\b"] {
            let args = parse_args("w", &schema, &json!({ "text": text })).unwrap();
            let command = render_shell("printf %s {{args.text}}", &args).unwrap();
            assert_eq!(shlex::split(&command).unwrap(), vec!["printf", "%s", text]);
        }

        // Log text stays verbatim
        let args = parse_args("w", &schema, &json!({ "text": "it's fine" })).unwrap();
        assert_eq!(render("{{args.text}}", &args), "it's fine");
    }

    #[test]
    fn render_shell_rejects_nul() {
        let mut schema = BTreeMap::new();
        schema.insert("text".to_string(), ArgSpec::string());
        let args = parse_args("w", &schema, &json!({ "text": "a\u{0}b" })).unwrap();

        let reason = render_shell("echo {{args.text}}", &args).unwrap_err();
        assert!(reason.contains("args.text"), "{reason}");
    }

    #[test]
    fn arg_env_names() {
        let mut schema = BTreeMap::new();
        schema.insert("dry-run".to_string(), ArgSpec::boolean());
        schema.insert("task".to_string(), ArgSpec::string());
        let args = parse_args("w", &schema, &json!({ "dry-run": true, "task": "x" })).unwrap();

        assert_eq!(
            arg_env(&args),
            vec![
                ("KILN_ARG_DRY_RUN".to_string(), "true".to_string()),
                ("KILN_ARG_TASK".to_string(), "x".to_string()),
            ]
        );
    }

    #[test]
    fn self_referencing_manifest_is_invalid() {
        let manifest = WorkflowManifest::from_yaml(
            r#"
name: loop
subflows: [loop]
steps:
  - subflow: loop
"#,
        )
        .unwrap();
        assert!(manifest.validate().unwrap_err().contains("itself"));
    }

    #[test]
    fn mcp_manifest_requires_command() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("memory.mcp.yaml");
        std::fs::write(&path, "name: memory\ndescription: Memory\ncommand: ''\n").unwrap();
        assert!(matches!(
            load_mcp_manifest(&path).unwrap_err(),
            KilnError::Load { .. }
        ));

        std::fs::write(&path, "name: memory\ncommand: kiln-memory\nargs: [--stdio]\n").unwrap();
        let manifest = load_mcp_manifest(&path).unwrap();
        assert_eq!(manifest.args, vec!["--stdio".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exec_failure_is_step_error() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("fail.workflow.yaml");
        std::fs::write(&path, "name: fail\nsteps:\n  - exec: \"exit 3\"\n").unwrap();

        let catalog = ManifestCatalog::new(InventoryRoots::new(
            temp.path().join("b"),
            temp.path().join("u"),
            temp.path().join("a"),
        ));
        let definition = catalog.load_path(&path).await.unwrap();
        let err = definition.execute(json!({})).await.unwrap_err();

        let source = err.handler_source().unwrap();
        let step = source.downcast_ref::<KilnError>().unwrap();
        assert!(matches!(step, KilnError::Step { index: 0, .. }));
        assert!(step.to_string().contains("exited with 3"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exec_args_reach_command_verbatim() {
        let temp = tempfile::tempdir().unwrap();
        let out = temp.path().join("out");
        let pwned = temp.path().join("pwned");
        let yaml = r#"
name: note
args:
  text: { type: string }
steps:
  - exec: "printf '%s' {{args.text}} > OUT.txt"
  - exec: "printf '%s' \"$KILN_ARG_TEXT\" > OUT.env"
"#
        .replace("OUT", &out.display().to_string());
        let path = temp.path().join("note.workflow.yaml");
        std::fs::write(&path, yaml).unwrap();

        let catalog = ManifestCatalog::new(InventoryRoots::new(
            temp.path().join("b"),
            temp.path().join("u"),
            temp.path().join("a"),
        ));
        let definition = catalog.load_path(&path).await.unwrap();

        let injected = format!("x'; touch '{}'; echo '", pwned.display());
        for text in ["it's fine", injected.as_str()] {
            definition.execute(json!({ "text": text })).await.unwrap();
            let printed = std::fs::read_to_string(out.with_extension("txt")).unwrap();
            assert_eq!(printed, text);
            let exported = std::fs::read_to_string(out.with_extension("env")).unwrap();
            assert_eq!(exported, text);
        }
        assert!(!pwned.exists());
    }
}
