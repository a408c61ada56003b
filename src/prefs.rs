//! Preferences Store
//!
//! Process-wide, read-mostly configuration: preferred agent, retry policy and
//! per-workflow enablement.
//!
//! ## Priority Order (highest to lowest)
//!
//! 1. Environment variables (`KILN_AGENT`, `KILN_MAX_ATTEMPTS`, `KILN_DISABLED_WORKFLOWS`)
//! 2. Project file (`./.kiln/config.toml`)
//! 3. Global file (`~/.config/kiln/config.toml`)
//! 4. Defaults
//!
//! Executions never read this module directly. They take a [`ContextSnapshot`]
//! from a [`PreferencesSource`] when their scope opens.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::context::ContextSnapshot;
use crate::error::{KilnError, Result};
use crate::retry::RetryConfig;

/// Agent used when nothing is configured
pub const DEFAULT_AGENT: &str = "claude";

/// Anything that can hand out a fresh snapshot when a scope opens
pub trait PreferencesSource: Send + Sync + std::fmt::Debug {
    fn snapshot(&self) -> ContextSnapshot;
}

/// Preferences as stored on disk (every field optional so layers can merge)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Preferences {
    /// Agent CLI to drive (claude, codex, gemini, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_agent: Option<String>,

    #[serde(default)]
    pub retry: RetryPreferences,

    /// Workflows switched off by name
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub disabled_workflows: BTreeSet<String>,

    /// Per-workflow overrides; `enabled` here wins over `disabled_workflows`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub workflows: BTreeMap<String, WorkflowPreference>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RetryPreferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkflowPreference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

impl Preferences {
    /// Get the config directory path
    ///
    /// Returns `~/.config/kiln/` on Unix, `%APPDATA%/kiln/` on Windows
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kiln")
    }

    /// Get the global config file path
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Project-local config file under `dir`
    pub fn project_config_path(dir: &Path) -> PathBuf {
        dir.join(".kiln").join("config.toml")
    }

    /// Read one config file. A missing file is `Ok(None)`.
    pub fn load_file(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path).map_err(|e| KilnError::Config {
            reason: format!("Failed to read {}: {}", path.display(), e),
        })?;

        toml::from_str(&content)
            .map(Some)
            .map_err(|e| KilnError::Config {
                reason: format!("Failed to parse {}: {}", path.display(), e),
            })
    }

    /// Load every layer: global file, project file in the current directory, env
    pub fn load_layered() -> Result<Self> {
        let cwd = std::env::current_dir()?;
        let project = Self::project_config_path(&cwd);
        Ok(Self::load_from(&[Self::config_path(), project])?.with_env())
    }

    /// Merge the given files in order, later files winning
    pub fn load_from(paths: &[PathBuf]) -> Result<Self> {
        let mut prefs = Self::default();
        for path in paths {
            if let Some(layer) = Self::load_file(path)? {
                tracing::debug!(path = %path.display(), "Loaded preferences layer");
                prefs = prefs.merge(layer);
            }
        }
        Ok(prefs)
    }

    /// Overlay `other` on top of `self`
    pub fn merge(mut self, other: Preferences) -> Self {
        if other.preferred_agent.is_some() {
            self.preferred_agent = other.preferred_agent;
        }
        if other.retry.max_attempts.is_some() {
            self.retry.max_attempts = other.retry.max_attempts;
        }
        if other.retry.initial_delay_ms.is_some() {
            self.retry.initial_delay_ms = other.retry.initial_delay_ms;
        }
        if other.retry.backoff_multiplier.is_some() {
            self.retry.backoff_multiplier = other.retry.backoff_multiplier;
        }
        self.disabled_workflows.extend(other.disabled_workflows);
        for (name, pref) in other.workflows {
            let entry = self.workflows.entry(name).or_default();
            if pref.enabled.is_some() {
                entry.enabled = pref.enabled;
            }
        }
        self
    }

    /// Merge with environment variables
    ///
    /// Unparsable values are logged and ignored.
    pub fn with_env(mut self) -> Self {
        if let Ok(agent) = std::env::var("KILN_AGENT") {
            if !agent.trim().is_empty() {
                self.preferred_agent = Some(agent.trim().to_string());
            }
        }

        if let Ok(raw) = std::env::var("KILN_MAX_ATTEMPTS") {
            match raw.trim().parse::<u32>() {
                Ok(n) => self.retry.max_attempts = Some(n),
                Err(e) => tracing::warn!(value = %raw, "Ignoring KILN_MAX_ATTEMPTS: {}", e),
            }
        }

        if let Ok(raw) = std::env::var("KILN_DISABLED_WORKFLOWS") {
            self.disabled_workflows.extend(
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from),
            );
        }

        self
    }

    /// Save to `path`, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| KilnError::Config {
                reason: format!("Failed to create config directory: {}", e),
            })?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| KilnError::Config {
            reason: format!("Failed to serialize config: {}", e),
        })?;

        fs::write(path, content).map_err(|e| KilnError::Config {
            reason: format!("Failed to write config file: {}", e),
        })
    }

    pub fn preferred_agent(&self) -> &str {
        self.preferred_agent
            .as_deref()
            .filter(|a| !a.is_empty())
            .unwrap_or(DEFAULT_AGENT)
    }

    /// Effective retry policy, defaults filled in and `max_attempts >= 1`
    pub fn retry_config(&self) -> RetryConfig {
        let mut config = RetryConfig::default();
        if let Some(n) = self.retry.max_attempts {
            config = config.with_max_attempts(n);
        }
        if let Some(ms) = self.retry.initial_delay_ms {
            config.initial_delay_ms = ms;
        }
        if let Some(m) = self.retry.backoff_multiplier {
            config = config.with_backoff_multiplier(m);
        }
        config
    }

    pub fn is_workflow_disabled(&self, name: &str) -> bool {
        match self.workflows.get(name).and_then(|w| w.enabled) {
            Some(enabled) => !enabled,
            None => self.disabled_workflows.contains(name),
        }
    }

    /// Names disabled after applying per-workflow overrides
    pub fn effective_disabled(&self) -> BTreeSet<String> {
        self.disabled_workflows
            .iter()
            .chain(self.workflows.keys())
            .filter(|name| self.is_workflow_disabled(name))
            .cloned()
            .collect()
    }
}

impl PreferencesSource for Preferences {
    fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot::new(
            self.preferred_agent(),
            self.retry_config(),
            self.effective_disabled(),
        )
    }
}

/// Mutable, shareable store. Mutate before opening scopes against it.
#[derive(Debug, Default)]
pub struct PreferencesStore {
    prefs: RwLock<Preferences>,
}

impl PreferencesStore {
    pub fn new(prefs: Preferences) -> Self {
        Self {
            prefs: RwLock::new(prefs),
        }
    }

    /// Store seeded from every configuration layer
    pub fn load() -> Result<Self> {
        Ok(Self::new(Preferences::load_layered()?))
    }

    /// Copy of the current preferences
    pub fn get(&self) -> Preferences {
        self.prefs.read().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut Preferences)) {
        f(&mut self.prefs.write());
    }

    pub fn replace(&self, prefs: Preferences) {
        *self.prefs.write() = prefs;
    }

    /// Re-read every configuration layer. On error the current values stay.
    pub fn reload(&self) -> Result<()> {
        let fresh = Preferences::load_layered()?;
        self.replace(fresh);
        tracing::debug!("Reloaded preferences");
        Ok(())
    }
}

impl PreferencesSource for PreferencesStore {
    fn snapshot(&self) -> ContextSnapshot {
        self.prefs.read().snapshot()
    }
}

/// Process-wide source. Defaults only until [`init_global`] or [`set_global`] runs.
static GLOBAL: Lazy<RwLock<Arc<dyn PreferencesSource>>> = Lazy::new(|| {
    let store: Arc<dyn PreferencesSource> = Arc::new(PreferencesStore::default());
    RwLock::new(store)
});

pub fn global() -> Arc<dyn PreferencesSource> {
    GLOBAL.read().clone()
}

pub fn set_global(source: Arc<dyn PreferencesSource>) {
    *GLOBAL.write() = source;
}

/// Load the layered configuration and install it as the process-wide source
pub fn init_global() -> Result<Arc<PreferencesStore>> {
    let store = Arc::new(PreferencesStore::load()?);
    set_global(store.clone());
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn defaults() {
        let prefs = Preferences::default();
        assert_eq!(prefs.preferred_agent(), DEFAULT_AGENT);
        assert!(prefs.retry_config().max_attempts >= 1);
        assert!(!prefs.is_workflow_disabled("nonexistent-workflow"));
    }

    #[test]
    fn zero_attempts_clamped() {
        let prefs = Preferences {
            retry: RetryPreferences {
                max_attempts: Some(0),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(prefs.retry_config().max_attempts, 1);
    }

    #[test]
    fn workflow_override_beats_disabled_list() {
        let mut prefs = Preferences::default();
        prefs.disabled_workflows.insert("reviewer".to_string());
        prefs.workflows.insert(
            "reviewer".to_string(),
            WorkflowPreference {
                enabled: Some(true),
            },
        );
        prefs.workflows.insert(
            "legacy".to_string(),
            WorkflowPreference {
                enabled: Some(false),
            },
        );

        assert!(!prefs.is_workflow_disabled("reviewer"));
        assert!(prefs.is_workflow_disabled("legacy"));

        let snapshot = prefs.snapshot();
        assert!(snapshot.is_workflow_disabled("legacy"));
        assert!(!snapshot.is_workflow_disabled("reviewer"));
    }

    #[test]
    fn layers_merge_in_order() {
        let temp = TempDir::new().unwrap();
        let global = temp.path().join("global.toml");
        let project = temp.path().join("project.toml");

        fs::write(
            &global,
            r#"
preferred_agent = "codex"
disabled_workflows = ["legacy"]

[retry]
max_attempts = 5
initial_delay_ms = 50
"#,
        )
        .unwrap();
        fs::write(
            &project,
            r#"
preferred_agent = "gemini"
disabled_workflows = ["draft"]

[retry]
max_attempts = 2
"#,
        )
        .unwrap();

        let prefs = Preferences::load_from(&[global, project, temp.path().join("missing.toml")])
            .unwrap();

        assert_eq!(prefs.preferred_agent(), "gemini");
        assert_eq!(prefs.retry_config().max_attempts, 2);
        assert_eq!(prefs.retry_config().initial_delay_ms, 50);
        assert!(prefs.is_workflow_disabled("legacy"));
        assert!(prefs.is_workflow_disabled("draft"));
    }

    #[test]
    fn malformed_file_is_config_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(&path, "preferred_agent = [").unwrap();

        let err = Preferences::load_file(&path).unwrap_err();
        assert!(matches!(err, KilnError::Config { .. }));
    }

    #[test]
    fn save_and_reload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.toml");

        let mut prefs = Preferences {
            preferred_agent: Some("codex".to_string()),
            ..Default::default()
        };
        prefs.disabled_workflows.insert("legacy".to_string());
        prefs.save(&path).unwrap();

        let loaded = Preferences::load_file(&path).unwrap().unwrap();
        assert_eq!(loaded, prefs);
    }

    #[test]
    #[serial]
    fn env_overrides() {
        std::env::set_var("KILN_AGENT", "gemini");
        std::env::set_var("KILN_MAX_ATTEMPTS", "not-a-number");
        std::env::set_var("KILN_DISABLED_WORKFLOWS", "a, b,,");

        let prefs = Preferences {
            retry: RetryPreferences {
                max_attempts: Some(4),
                ..Default::default()
            },
            ..Default::default()
        }
        .with_env();

        std::env::remove_var("KILN_AGENT");
        std::env::remove_var("KILN_MAX_ATTEMPTS");
        std::env::remove_var("KILN_DISABLED_WORKFLOWS");

        assert_eq!(prefs.preferred_agent(), "gemini");
        assert_eq!(prefs.retry_config().max_attempts, 4);
        assert!(prefs.is_workflow_disabled("a"));
        assert!(prefs.is_workflow_disabled("b"));
        assert_eq!(prefs.disabled_workflows.len(), 2);
    }

    #[test]
    fn store_update_changes_next_snapshot() {
        let store = PreferencesStore::default();
        let before = store.snapshot();

        store.update(|p| p.preferred_agent = Some("codex".to_string()));
        let after = store.snapshot();

        assert_eq!(before.preferred_agent(), DEFAULT_AGENT);
        assert_eq!(after.preferred_agent(), "codex");
    }

    #[test]
    #[serial]
    fn store_reload_picks_up_env() {
        let store = PreferencesStore::default();
        std::env::set_var("KILN_AGENT", "opencode");
        let reloaded = store.reload();
        std::env::remove_var("KILN_AGENT");

        reloaded.unwrap();
        assert_eq!(store.snapshot().preferred_agent(), "opencode");
    }
}
