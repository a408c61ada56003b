//! Session persistence
//!
//! A session is the record of one agent conversation: metadata plus an ordered
//! turn history. Stored as camelCase JSON, written atomically.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{KilnError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    Completed,
    Failed,
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub session_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub working_directory: PathBuf,
    pub turn_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_prompt: Option<String>,
    #[serde(default)]
    pub status: SessionStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub prompt: String,
    pub response: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub metadata: SessionMetadata,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl Session {
    pub fn new(title: impl Into<String>, working_directory: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            metadata: SessionMetadata {
                session_id: Uuid::new_v4().to_string(),
                title: title.into(),
                created_at: now,
                updated_at: now,
                working_directory: working_directory.into(),
                turn_count: 0,
                last_prompt: None,
                status: SessionStatus::Active,
            },
            history: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.metadata.session_id
    }

    /// Append a prompt/response pair and bump the counters
    pub fn record_turn(&mut self, prompt: impl Into<String>, response: impl Into<String>) {
        let prompt = prompt.into();
        let now = Utc::now();
        self.metadata.turn_count += 1;
        self.metadata.last_prompt = Some(prompt.clone());
        self.metadata.updated_at = now;
        self.history.push(HistoryEntry {
            timestamp: now,
            prompt,
            response: response.into(),
        });
    }

    pub fn set_status(&mut self, status: SessionStatus) {
        self.metadata.status = status;
        self.metadata.updated_at = Utc::now();
    }
}

fn session_error(path: &Path, reason: impl ToString) -> KilnError {
    KilnError::Session {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

/// Write `session` to `path`, creating parent directories
pub fn save_session(path: &Path, session: &Session) -> Result<()> {
    let json = serde_json::to_vec_pretty(session)?;
    atomic_write(path, &json).map_err(|e| session_error(path, e))?;
    tracing::debug!(session = %session.id(), path = %path.display(), "Saved session");
    Ok(())
}

/// Read a session. A missing file is `Ok(None)`; an unreadable one is an error.
pub fn load_session(path: &Path) -> Result<Option<Session>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(session_error(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| session_error(path, e))
}

/// Remove a session file; absent files are fine
pub fn delete_session(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(session_error(path, e)),
    }
}

fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let tmp_path = parent.join(format!(
        ".{}.tmp-{}-{}",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("session"),
        std::process::id(),
        Uuid::new_v4().simple(),
    ));

    {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }
    sync_parent_dir(parent)
}

#[cfg(unix)]
fn sync_parent_dir(parent: &Path) -> std::io::Result<()> {
    fs::File::open(parent)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent_dir(_parent: &Path) -> std::io::Result<()> {
    Ok(())
}
