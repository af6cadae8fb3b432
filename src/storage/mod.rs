//! Durable snapshot of human-visible state
//!
//! One JSON document holds every tab's conversation, its display name and its
//! cumulative counters. Writes go to a sibling temp file and are renamed into
//! place, so readers see either the old blob or the new one. A missing blob
//! means "no saved state".

use crate::core::{TabId, Turn};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Per-tab counters carried across restarts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CumulativeStats {
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub total_tokens: u64,
    /// Seconds
    #[serde(default)]
    pub total_duration: f64,
}

/// Everything `/save_sessions` persists
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub conversations: BTreeMap<TabId, Vec<Turn>>,
    #[serde(default, alias = "tabNames")]
    pub tab_names: BTreeMap<TabId, String>,
    #[serde(default, alias = "sessionStats")]
    pub cumulative: BTreeMap<TabId, CumulativeStats>,
    /// UI fields this server does not interpret, kept verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty() && self.tab_names.is_empty() && self.cumulative.is_empty()
    }

    /// Fold the server's live sessions into a stored snapshot
    ///
    /// Live tabs take the server's conversation and counters; a stored tab
    /// name outranks the server-side project name. Tabs that are not live and
    /// UI extras are left untouched.
    pub fn merge_live(&mut self, live: Snapshot) {
        self.conversations.extend(live.conversations);
        self.cumulative.extend(live.cumulative);
        for (tab, name) in live.tab_names {
            self.tab_names.entry(tab).or_insert(name);
        }
    }

    /// Every tab mentioned anywhere in the snapshot
    pub fn tabs(&self) -> Vec<TabId> {
        let mut tabs: Vec<TabId> = self
            .conversations
            .keys()
            .chain(self.tab_names.keys())
            .chain(self.cumulative.keys())
            .cloned()
            .collect();
        tabs.sort();
        tabs.dedup();
        tabs
    }
}

/// File-backed snapshot storage
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "sessions.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Overwrite the blob with `snapshot`
    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(snapshot)?;
        let tmp = self.temp_path();
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        tracing::debug!(
            path = %self.path.display(),
            tabs = snapshot.tab_names.len(),
            "Snapshot saved"
        );
        Ok(())
    }

    /// Read the blob; `None` when nothing has been saved
    pub fn load(&self) -> Result<Option<Snapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        let snapshot = serde_json::from_str(&content).context("Failed to parse snapshot")?;
        Ok(Some(snapshot))
    }

    /// Remove the blob; clearing an absent blob is not an error
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", self.path.display())),
        }
    }
}
