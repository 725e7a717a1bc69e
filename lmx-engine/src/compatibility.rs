//! Durable pass/fail ledger per (model, backend, backend version).
//!
//! The file holds a flat JSON array, newest last, capped at
//! [`MAX_ENTRIES`]. Every update is a locked read-modify-write followed by an
//! atomic rename.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::loader::Metadata;
use lmx_core::persistence::{atomic_write_json, load_json_or_default};

/// Most recent entries kept on disk.
pub const MAX_ENTRIES: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompatOutcome {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityEntry {
    pub ts: DateTime<Utc>,
    pub model_id: String,
    pub backend: String,
    pub backend_version: String,
    pub outcome: CompatOutcome,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl CompatibilityEntry {
    pub fn new(
        model_id: impl Into<String>,
        backend: impl Into<String>,
        backend_version: impl Into<String>,
        outcome: CompatOutcome,
    ) -> Self {
        Self {
            ts: Utc::now(),
            model_id: model_id.into(),
            backend: backend.into(),
            backend_version: backend_version.into(),
            outcome,
            reason: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

pub struct CompatibilityRegistry {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CompatibilityRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry, trimming the ledger to the newest [`MAX_ENTRIES`].
    pub fn record(&self, entry: CompatibilityEntry) -> std::io::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<CompatibilityEntry> = load_json_or_default(&self.path);
        rows.push(entry);
        if rows.len() > MAX_ENTRIES {
            let excess = rows.len() - MAX_ENTRIES;
            rows.drain(..excess);
        }
        atomic_write_json(&self.path, &rows)
    }

    pub fn entries(&self) -> Vec<CompatibilityEntry> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        load_json_or_default(&self.path)
    }

    pub fn entries_for(&self, model_id: &str) -> Vec<CompatibilityEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.model_id == model_id)
            .collect()
    }

    /// Newest entry for `model_id`, optionally restricted to one backend.
    pub fn latest_record(&self, model_id: &str, backend: Option<&str>) -> Option<CompatibilityEntry> {
        self.entries()
            .into_iter()
            .rev()
            .find(|e| e.model_id == model_id && backend.is_none_or(|b| e.backend == b))
    }
}
