//! Best-known performance profile per (model, backend, backend version).
//!
//! Profiles are ranked by [`score_profile`]; a stored profile is only
//! replaced by one with a strictly lower sort key, so a single noisy run can
//! never evict a proven configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::loader::Metadata;
use lmx_core::persistence::{atomic_write_json, load_json_or_default};

const TTFT_WEIGHT: f64 = 0.015;
const ERROR_RATE_WEIGHT: f64 = 50.0;
const GATE_EPSILON: f64 = 1e-9;

/// Aggregated measurements for one profile run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutotuneMetrics {
    #[serde(default)]
    pub avg_tokens_per_second: f64,
    #[serde(default)]
    pub avg_ttft_ms: f64,
    #[serde(default)]
    pub error_rate: f64,
    #[serde(default)]
    pub avg_total_ms: f64,
    #[serde(default, alias = "avg_queue_wait_ms")]
    pub queue_wait_ms: f64,
    #[serde(default)]
    pub requests: u64,
}

/// Ascending ranking: lower is better. Compared lexicographically.
#[derive(Debug, Clone, Copy)]
pub struct SortKey(pub [f64; 3]);

impl PartialEq for SortKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortKey {}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| a.total_cmp(b))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreResult {
    pub score: f64,
    pub sort_key: SortKey,
}

/// v1: `score = tok/s - 0.015 * ttft_ms - 50 * error_rate`.
///
/// Ties on score break on total latency, then queue wait.
pub fn score_profile(metrics: &AutotuneMetrics) -> ScoreResult {
    let score = metrics.avg_tokens_per_second
        - TTFT_WEIGHT * metrics.avg_ttft_ms
        - ERROR_RATE_WEIGHT * metrics.error_rate;
    ScoreResult {
        score,
        sort_key: sort_key(score, metrics),
    }
}

fn sort_key(score: f64, metrics: &AutotuneMetrics) -> SortKey {
    SortKey([-score, metrics.avg_total_ms, metrics.queue_wait_ms])
}

/// Outcome of a throughput regression check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub passed: bool,
    pub drop_fraction: f64,
}

/// Pass iff throughput dropped by at most `max_drop_fraction` of the baseline.
pub fn regression_gate(baseline_tps: f64, candidate_tps: f64, max_drop_fraction: f64) -> GateResult {
    if baseline_tps <= 0.0 {
        return GateResult {
            passed: true,
            drop_fraction: 0.0,
        };
    }
    let drop_fraction = (baseline_tps - candidate_tps) / baseline_tps;
    GateResult {
        passed: drop_fraction <= max_drop_fraction + GATE_EPSILON,
        drop_fraction,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutotuneRecord {
    pub ts: DateTime<Utc>,
    pub model_id: String,
    pub backend: String,
    pub backend_version: String,
    #[serde(default)]
    pub profile: Metadata,
    #[serde(default)]
    pub metrics: AutotuneMetrics,
    pub score: f64,
}

impl AutotuneRecord {
    pub fn sort_key(&self) -> SortKey {
        sort_key(self.score, &self.metrics)
    }
}

pub fn record_key(model_id: &str, backend: &str, backend_version: &str) -> String {
    format!("{model_id}::{backend}::{backend_version}")
}

pub struct AutotuneRegistry {
    path: PathBuf,
    lock: Mutex<()>,
}

impl AutotuneRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Store the profile if it beats the current one. Returns whether it was written.
    pub fn save_best(
        &self,
        model_id: &str,
        backend: &str,
        backend_version: &str,
        profile: Metadata,
        metrics: AutotuneMetrics,
        score: f64,
    ) -> std::io::Result<bool> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut data: BTreeMap<String, AutotuneRecord> = load_json_or_default(&self.path);
        let key = record_key(model_id, backend, backend_version);

        if let Some(existing) = data.get(&key)
            && sort_key(score, &metrics) >= existing.sort_key()
        {
            return Ok(false);
        }

        data.insert(
            key,
            AutotuneRecord {
                ts: Utc::now(),
                model_id: model_id.to_string(),
                backend: backend.to_string(),
                backend_version: backend_version.to_string(),
                profile,
                metrics,
                score,
            },
        );
        atomic_write_json(&self.path, &data)?;
        Ok(true)
    }

    pub fn get_best(
        &self,
        model_id: &str,
        backend: &str,
        backend_version: &str,
    ) -> Option<AutotuneRecord> {
        self.records()
            .remove(&record_key(model_id, backend, backend_version))
    }

    /// Best record for a model across every backend/version, by sort key.
    pub fn best_for_model(&self, model_id: &str, backend: Option<&str>) -> Option<AutotuneRecord> {
        self.records()
            .into_values()
            .filter(|r| r.model_id == model_id && backend.is_none_or(|b| r.backend == b))
            .min_by_key(AutotuneRecord::sort_key)
    }

    pub fn records(&self) -> BTreeMap<String, AutotuneRecord> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        load_json_or_default(&self.path)
    }

    /// Score `metrics`, persist if it wins, and return the score.
    pub fn save_scored_profile(
        &self,
        model_id: &str,
        backend: &str,
        backend_version: &str,
        profile: Metadata,
        metrics: AutotuneMetrics,
    ) -> std::io::Result<f64> {
        let scored = score_profile(&metrics);
        self.save_best(model_id, backend, backend_version, profile, metrics, scored.score)?;
        Ok(scored.score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn metrics(tps: f64, ttft: f64, total: f64) -> AutotuneMetrics {
        AutotuneMetrics {
            avg_tokens_per_second: tps,
            avg_ttft_ms: ttft,
            avg_total_ms: total,
            ..Default::default()
        }
    }

    fn profile(batch: u32) -> Metadata {
        let mut p = Metadata::new();
        p.insert("max_batch".into(), json!(batch));
        p
    }

    #[test]
    fn test_score_formula() {
        let m = AutotuneMetrics {
            avg_tokens_per_second: 100.0,
            avg_ttft_ms: 200.0,
            error_rate: 0.1,
            ..Default::default()
        };
        let scored = score_profile(&m);
        assert!((scored.score - (100.0 - 3.0 - 5.0)).abs() < 1e-9);
    }

    #[test]
    fn test_higher_score_means_lower_sort_key() {
        let fast = score_profile(&metrics(120.0, 100.0, 900.0));
        let slow = score_profile(&metrics(80.0, 100.0, 900.0));
        assert!(fast.score > slow.score);
        assert!(fast.sort_key < slow.sort_key);
    }

    #[test]
    fn test_ties_break_on_total_then_queue() {
        let a = score_profile(&metrics(50.0, 0.0, 800.0));
        let b = score_profile(&metrics(50.0, 0.0, 900.0));
        assert!(a.sort_key < b.sort_key);

        let mut q1 = metrics(50.0, 0.0, 800.0);
        q1.queue_wait_ms = 5.0;
        let mut q2 = q1.clone();
        q2.queue_wait_ms = 10.0;
        assert!(score_profile(&q1).sort_key < score_profile(&q2).sort_key);
    }

    #[test]
    fn test_save_best_only_overwrites_when_strictly_better() {
        let dir = TempDir::new().unwrap();
        let reg = AutotuneRegistry::new(dir.path().join("autotune-registry.json"));

        assert!(reg
            .save_best("m", "mlx-lm", "0.2", profile(1), metrics(100.0, 0.0, 500.0), 100.0)
            .unwrap());

        // Equal: keep the first-seen record.
        assert!(!reg
            .save_best("m", "mlx-lm", "0.2", profile(2), metrics(100.0, 0.0, 500.0), 100.0)
            .unwrap());
        // Worse.
        assert!(!reg
            .save_best("m", "mlx-lm", "0.2", profile(3), metrics(90.0, 0.0, 500.0), 90.0)
            .unwrap());
        assert_eq!(
            reg.get_best("m", "mlx-lm", "0.2").unwrap().profile,
            profile(1)
        );

        // Better.
        assert!(reg
            .save_best("m", "mlx-lm", "0.2", profile(4), metrics(110.0, 0.0, 500.0), 110.0)
            .unwrap());
        assert_eq!(
            reg.get_best("m", "mlx-lm", "0.2").unwrap().profile,
            profile(4)
        );
    }

    #[test]
    fn test_keys_are_independent() {
        let dir = TempDir::new().unwrap();
        let reg = AutotuneRegistry::new(dir.path().join("a.json"));
        reg.save_scored_profile("m", "mlx-lm", "1", profile(1), metrics(10.0, 0.0, 0.0))
            .unwrap();
        reg.save_scored_profile("m", "vllm-mlx", "1", profile(2), metrics(30.0, 0.0, 0.0))
            .unwrap();

        let records = reg.records();
        assert!(records.contains_key("m::mlx-lm::1"));
        assert!(records.contains_key("m::vllm-mlx::1"));

        let best = reg.best_for_model("m", None).unwrap();
        assert_eq!(best.backend, "vllm-mlx");
        let best_mlx = reg.best_for_model("m", Some("mlx-lm")).unwrap();
        assert_eq!(best_mlx.score, 10.0);
    }

    #[test]
    fn test_save_scored_profile_returns_score() {
        let dir = TempDir::new().unwrap();
        let reg = AutotuneRegistry::new(dir.path().join("a.json"));
        let score = reg
            .save_scored_profile("m", "gguf", "1", profile(1), metrics(40.0, 400.0, 0.0))
            .unwrap();
        assert!((score - 34.0).abs() < 1e-9);
    }

    #[test]
    fn test_regression_gate_boundaries() {
        assert!(!regression_gate(100.0, 84.0, 0.15).passed);
        assert!(regression_gate(100.0, 85.0, 0.15).passed);
        assert!(regression_gate(100.0, 120.0, 0.0).passed);
        assert!(regression_gate(0.0, 1.0, 0.15).passed);
    }
}
