//! JSON history of finished research runs

use crate::session::ResearchRun;
use chrono::{DateTime, Utc};
use delve_core::{config_error, validation_error, DelveResult, OutputMode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

/// One finished run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: Uuid,
    /// What the user asked
    pub query: String,
    /// What was actually researched, including clarifications
    pub prompt: String,
    pub learnings: Vec<String>,
    pub mode: OutputMode,
    pub content: String,
    #[serde(default)]
    pub citations: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn from_run(query: &str, prompt: &str, run: &ResearchRun) -> Self {
        Self {
            id: run.outcome.session_id,
            query: query.to_string(),
            prompt: prompt.to_string(),
            learnings: run.outcome.snapshot.learnings(),
            mode: run.artifact.mode,
            content: run.artifact.content.clone(),
            citations: run.artifact.citations.clone(),
            created_at: run.artifact.generated_at,
        }
    }
}

/// History file with its loaded entries, oldest first
#[derive(Debug, Clone)]
pub struct ResearchHistory {
    path: PathBuf,
    entries: Vec<HistoryEntry>,
}

impl ResearchHistory {
    /// `$DATA_DIR/delve/history.json`
    pub fn default_path() -> DelveResult<PathBuf> {
        dirs::data_dir()
            .map(|dir| dir.join("delve").join("history.json"))
            .ok_or_else(|| config_error!("Could not determine the data directory", "history"))
    }

    /// Load the history; a missing or empty file is an empty history
    pub async fn load(path: impl Into<PathBuf>) -> DelveResult<Self> {
        let path = path.into();
        let entries = if fs::try_exists(&path).await? {
            let raw = fs::read_to_string(&path).await?;
            if raw.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            Vec::new()
        };

        debug!(path = %path.display(), entries = entries.len(), "Loaded history");
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find an entry by id or unambiguous id prefix
    pub fn get(&self, id: &str) -> Option<&HistoryEntry> {
        let id = id.trim().to_lowercase();
        if id.is_empty() {
            return None;
        }
        let mut matches = self
            .entries
            .iter()
            .filter(|e| e.id.to_string().starts_with(&id));
        match (matches.next(), matches.next()) {
            (Some(entry), None) => Some(entry),
            _ => None,
        }
    }

    pub async fn save(&self) -> DelveResult<()> {
        write_entries(&self.path, &self.entries).await
    }

    pub async fn append(&mut self, entry: HistoryEntry) -> DelveResult<()> {
        self.entries.push(entry);
        self.save().await
    }

    pub async fn clear(&mut self) -> DelveResult<()> {
        self.entries.clear();
        self.save().await?;
        info!(path = %self.path.display(), "History cleared");
        Ok(())
    }

    /// Write every entry to `path` as a JSON list
    pub async fn export(&self, path: impl AsRef<Path>) -> DelveResult<()> {
        write_entries(path.as_ref(), &self.entries).await
    }

    /// Merge entries from a JSON list file; returns how many were added.
    ///
    /// Entries equal to one already present, or sharing its id, are skipped.
    pub async fn import(&mut self, path: impl AsRef<Path>) -> DelveResult<usize> {
        let raw = fs::read_to_string(path.as_ref()).await?;
        let value: serde_json::Value = serde_json::from_str(&raw)?;
        if !value.is_array() {
            return Err(validation_error!(
                "History import must be a JSON list",
                "history",
                "history"
            ));
        }

        let incoming: Vec<HistoryEntry> = serde_json::from_value(value)?;
        let mut added = 0;
        for entry in incoming {
            let known = self
                .entries
                .iter()
                .any(|e| e.id == entry.id || *e == entry);
            if !known {
                self.entries.push(entry);
                added += 1;
            }
        }

        if added > 0 {
            self.save().await?;
        }
        info!(added = added, total = self.entries.len(), "History imported");
        Ok(added)
    }
}

async fn write_entries(path: &Path, entries: &[HistoryEntry]) -> DelveResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let json = serde_json::to_string_pretty(entries)?;
    fs::write(path, json).await?;
    Ok(())
}
