//! Inventory Resolver
//!
//! Discovers workflow and tool-server manifests across three tiers:
//!
//! ```text
//! builtin/   workflows/*.workflow.yaml   mcp/*.mcp.yaml
//! user/      workflows/*.workflow.yaml   mcp/*.mcp.yaml
//! archived/  workflows/*.workflow.yaml   mcp/*.mcp.yaml
//! ```
//!
//! [`build_inventory`] returns every candidate (the raw view). [`active_workflows`]
//! and [`active_mcps`] reconcile by name: user beats builtin, archived never
//! wins. Nothing is cached; each call reads the filesystem again.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::KilnError;
use crate::manifest::{load_mcp_manifest, load_workflow_manifest};
use crate::prefs::Preferences;

pub const WORKFLOWS_DIR: &str = "workflows";
pub const MCP_DIR: &str = "mcp";
pub const WORKFLOW_SUFFIX: &str = ".workflow.yaml";
pub const MCP_SUFFIX: &str = ".mcp.yaml";

/// Tier an entry was found in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Builtin,
    User,
    Archived,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Builtin => "builtin",
            Source::User => "user",
            Source::Archived => "archived",
        }
    }

    /// Override rank among active tiers; archived has none
    fn precedence(&self) -> Option<u8> {
        match self {
            Source::Builtin => Some(0),
            Source::User => Some(1),
            Source::Archived => None,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub name: String,
    pub description: String,
    pub source: Source,
    pub archived: bool,
    pub path: PathBuf,
}

/// A candidate file that could not be loaded
#[derive(Debug, Clone, Serialize)]
pub struct LoadDiagnostic {
    pub path: PathBuf,
    pub source: Source,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Inventory {
    pub workflows: Vec<InventoryEntry>,
    pub mcp_scripts: Vec<InventoryEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<LoadDiagnostic>,
}

impl Inventory {
    pub fn active_workflows(&self) -> Vec<InventoryEntry> {
        active_workflows(self)
    }

    pub fn active_mcps(&self) -> Vec<InventoryEntry> {
        active_mcps(self)
    }

    pub fn find_active_workflow(&self, name: &str) -> Option<InventoryEntry> {
        reconcile(&self.workflows).remove(name)
    }
}

/// Fixed, ordered tier roots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryRoots {
    pub builtin: PathBuf,
    pub user: PathBuf,
    pub archived: PathBuf,
}

impl InventoryRoots {
    pub fn new(
        builtin: impl Into<PathBuf>,
        user: impl Into<PathBuf>,
        archived: impl Into<PathBuf>,
    ) -> Self {
        Self {
            builtin: builtin.into(),
            user: user.into(),
            archived: archived.into(),
        }
    }

    /// Builtin manifests shipped with the crate
    pub fn shipped_builtin_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("builtin")
    }

    /// Roots of a default installation.
    ///
    /// `KILN_BUILTIN_DIR`, `KILN_USER_DIR` and `KILN_ARCHIVED_DIR` override
    /// the shipped builtin directory, `~/.config/kiln` and `<user>/archived`.
    pub fn default_install() -> Self {
        let from_env = |var: &str| std::env::var_os(var).map(PathBuf::from);

        let builtin = from_env("KILN_BUILTIN_DIR").unwrap_or_else(Self::shipped_builtin_dir);
        let user = from_env("KILN_USER_DIR").unwrap_or_else(Preferences::config_dir);
        let archived = from_env("KILN_ARCHIVED_DIR").unwrap_or_else(|| user.join("archived"));

        Self::new(builtin, user, archived)
    }

    /// Tiers in scan order
    pub fn tiers(&self) -> [(Source, &Path); 3] {
        [
            (Source::Builtin, self.builtin.as_path()),
            (Source::User, self.user.as_path()),
            (Source::Archived, self.archived.as_path()),
        ]
    }
}

/// Scan every tier. Unloadable files become diagnostics; missing roots are empty.
pub fn build_inventory(roots: &InventoryRoots) -> Inventory {
    let mut inventory = Inventory::default();

    for (source, root) in roots.tiers() {
        scan(
            &root.join(WORKFLOWS_DIR),
            WORKFLOW_SUFFIX,
            source,
            |path| load_workflow_manifest(path).map(|m| (m.name, m.description)),
            &mut inventory.workflows,
            &mut inventory.diagnostics,
        );
        scan(
            &root.join(MCP_DIR),
            MCP_SUFFIX,
            source,
            |path| load_mcp_manifest(path).map(|m| (m.name, m.description)),
            &mut inventory.mcp_scripts,
            &mut inventory.diagnostics,
        );
    }

    tracing::debug!(
        workflows = inventory.workflows.len(),
        mcp_scripts = inventory.mcp_scripts.len(),
        diagnostics = inventory.diagnostics.len(),
        "Built inventory"
    );
    inventory
}

fn scan(
    dir: &Path,
    suffix: &str,
    source: Source,
    load: impl Fn(&Path) -> Result<(String, String), KilnError>,
    entries: &mut Vec<InventoryEntry>,
    diagnostics: &mut Vec<LoadDiagnostic>,
) {
    if !dir.is_dir() {
        return;
    }

    let walker = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name();

    for item in walker {
        let path = match item {
            Ok(item) if item.file_type().is_file() => item.into_path(),
            Ok(_) => continue,
            Err(e) => {
                let path = e
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| dir.to_path_buf());
                record(diagnostics, path, source, e.to_string());
                continue;
            }
        };

        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(suffix));
        if !matches {
            continue;
        }

        match load(&path) {
            Ok((name, description)) => entries.push(InventoryEntry {
                name: name.trim().to_string(),
                description,
                source,
                archived: source == Source::Archived,
                path,
            }),
            Err(e) => record(diagnostics, path, source, e.to_string()),
        }
    }
}

fn record(diagnostics: &mut Vec<LoadDiagnostic>, path: PathBuf, source: Source, reason: String) {
    tracing::warn!(path = %path.display(), tier = %source, "Skipping unloadable file: {}", reason);
    diagnostics.push(LoadDiagnostic {
        path,
        source,
        reason,
    });
}

/// One entry per name: highest precedence, never archived
fn reconcile(entries: &[InventoryEntry]) -> BTreeMap<String, InventoryEntry> {
    let mut active: BTreeMap<String, InventoryEntry> = BTreeMap::new();

    for entry in entries {
        let Some(rank) = entry.source.precedence() else {
            continue;
        };
        match active.get(&entry.name) {
            Some(current) if current.source.precedence() >= Some(rank) => {}
            _ => {
                active.insert(entry.name.clone(), entry.clone());
            }
        }
    }

    active
}

/// Active workflows sorted by name
pub fn active_workflows(inventory: &Inventory) -> Vec<InventoryEntry> {
    reconcile(&inventory.workflows).into_values().collect()
}

/// Active tool-servers sorted by name
pub fn active_mcps(inventory: &Inventory) -> Vec<InventoryEntry> {
    reconcile(&inventory.mcp_scripts).into_values().collect()
}
