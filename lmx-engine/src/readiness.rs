//! Per-model readiness state machine with crash-loop quarantine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Readiness of one model id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessState {
    Unknown,
    Admitted,
    Loading,
    CanaryPending,
    Routable,
    Quarantined,
    Unloaded,
}

impl ReadinessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadinessState::Unknown => "unknown",
            ReadinessState::Admitted => "admitted",
            ReadinessState::Loading => "loading",
            ReadinessState::CanaryPending => "canary_pending",
            ReadinessState::Routable => "routable",
            ReadinessState::Quarantined => "quarantined",
            ReadinessState::Unloaded => "unloaded",
        }
    }
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessRecord {
    pub state: ReadinessState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub crash_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ReadinessRecord {
    fn unknown() -> Self {
        Self {
            state: ReadinessState::Unknown,
            reason: None,
            crash_count: 0,
            last_failure_reason: None,
            updated_at: Utc::now(),
        }
    }
}

/// Readiness records keyed by model id. Owned by the engine.
#[derive(Debug, Default)]
pub struct ReadinessTracker {
    records: HashMap<String, ReadinessRecord>,
}

impl ReadinessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct transition. `crash_count` is carried over untouched.
    pub fn set_state(&mut self, model_id: &str, state: ReadinessState, reason: Option<String>) {
        let record = self
            .records
            .entry(model_id.to_string())
            .or_insert_with(ReadinessRecord::unknown);
        record.state = state;
        record.reason = reason;
        record.updated_at = Utc::now();
    }

    /// Count one load failure; quarantine once the count reaches `threshold`.
    ///
    /// Returns `true` if this call moved the model into quarantine.
    pub fn mark_failure(&mut self, model_id: &str, reason: &str, threshold: u32) -> bool {
        let record = self
            .records
            .entry(model_id.to_string())
            .or_insert_with(|| ReadinessRecord {
                state: ReadinessState::Loading,
                ..ReadinessRecord::unknown()
            });
        record.crash_count = record.crash_count.saturating_add(1);
        record.last_failure_reason = Some(reason.to_string());
        record.updated_at = Utc::now();

        if record.crash_count >= threshold {
            let newly = record.state != ReadinessState::Quarantined;
            record.state = ReadinessState::Quarantined;
            record.reason = Some(format!("crash_loop:{}", record.crash_count));
            return newly;
        }
        false
    }

    /// Snapshot; unseen ids report `unknown`.
    pub fn get(&self, model_id: &str) -> ReadinessRecord {
        self.records
            .get(model_id)
            .cloned()
            .unwrap_or_else(ReadinessRecord::unknown)
    }

    pub fn state(&self, model_id: &str) -> ReadinessState {
        self.records
            .get(model_id)
            .map_or(ReadinessState::Unknown, |r| r.state)
    }

    pub fn is_routable(&self, model_id: &str) -> bool {
        self.state(model_id) == ReadinessState::Routable
    }

    pub fn is_quarantined(&self, model_id: &str) -> bool {
        self.state(model_id) == ReadinessState::Quarantined
    }

    /// Operator reset: forget everything, including the crash count.
    pub fn clear(&mut self, model_id: &str) -> bool {
        self.records.remove(model_id).is_some()
    }

    pub fn snapshot(&self) -> HashMap<String, ReadinessRecord> {
        self.records.clone()
    }
}
