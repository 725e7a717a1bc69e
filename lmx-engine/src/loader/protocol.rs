//! Messages exchanged across the parent/child loader boundary.
//!
//! Each message travels as a single JSON line: the spec on the child's stdin,
//! a `LoadResult` on stdout, or a `LoaderFailure` on stderr.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ErrorCode;

pub type Metadata = BTreeMap<String, Value>;

/// One load attempt, immutable once sent to the child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadSpec {
    pub model_id: String,
    /// Wire name of the backend (`vllm-mlx`, `mlx-lm`, `gguf`).
    pub backend: String,
    #[serde(default)]
    pub use_batching: bool,
    #[serde(default)]
    pub performance_overrides: Metadata,
    /// Probe the backend without keeping anything loaded.
    #[serde(default)]
    pub probe_only: bool,
}

impl LoadSpec {
    pub fn new(model_id: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            backend: backend.into(),
            use_batching: false,
            performance_overrides: Metadata::new(),
            probe_only: false,
        }
    }

    pub fn probe_only(mut self) -> Self {
        self.probe_only = true;
        self
    }

    /// `performance_overrides.memory_estimate_gb`, when present and numeric.
    pub fn memory_estimate_gb(&self) -> Option<f64> {
        self.performance_overrides
            .get("memory_estimate_gb")
            .and_then(Value::as_f64)
            .filter(|gb| *gb > 0.0)
    }
}

/// Success payload from the child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadResult {
    pub ok: bool,
    pub backend: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub telemetry: Metadata,
}

impl LoadResult {
    pub fn success(backend: impl Into<String>, telemetry: Metadata) -> Self {
        Self {
            ok: true,
            backend: backend.into(),
            reason: None,
            telemetry,
        }
    }
}

/// Structured failure from the child or synthesized by the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderFailure {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl LoaderFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            exit_code: None,
            signal: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

impl fmt::Display for LoaderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Four-way classification of one supervised child run.
#[derive(Debug, Clone, PartialEq)]
pub enum LoaderOutcome {
    Success(LoadResult),
    /// The child missed its deadline and was terminated.
    Timeout(LoaderFailure),
    /// The child died from a signal; no output was parsed.
    Crashed(LoaderFailure),
    /// The child exited non-zero (or emitted an unusable success payload).
    Failed(LoaderFailure),
}

impl LoaderOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, LoaderOutcome::Success(_))
    }

    pub fn failure(&self) -> Option<&LoaderFailure> {
        match self {
            LoaderOutcome::Success(_) => None,
            LoaderOutcome::Timeout(f) | LoaderOutcome::Crashed(f) | LoaderOutcome::Failed(f) => {
                Some(f)
            }
        }
    }

    pub fn into_result(self) -> Result<LoadResult, LoaderFailure> {
        match self {
            LoaderOutcome::Success(r) => Ok(r),
            LoaderOutcome::Timeout(f) | LoaderOutcome::Crashed(f) | LoaderOutcome::Failed(f) => {
                Err(f)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_spec_defaults_when_fields_missing() {
        let spec: LoadSpec =
            serde_json::from_str(r#"{"model_id":"mlx-community/Qwen","backend":"mlx-lm"}"#)
                .unwrap();
        assert_eq!(spec, LoadSpec::new("mlx-community/Qwen", "mlx-lm"));
    }

    #[test]
    fn test_memory_estimate_from_overrides() {
        let mut spec = LoadSpec::new("m", "gguf");
        assert_eq!(spec.memory_estimate_gb(), None);
        spec.performance_overrides
            .insert("memory_estimate_gb".into(), serde_json::json!(12.5));
        assert_eq!(spec.memory_estimate_gb(), Some(12.5));
        spec.performance_overrides
            .insert("memory_estimate_gb".into(), serde_json::json!("lots"));
        assert_eq!(spec.memory_estimate_gb(), None);
    }

    #[test]
    fn test_failure_wire_shape() {
        let failure = LoaderFailure::new(ErrorCode::ModelLoadTimeout, "Loader timed out after 2s")
            .with_metadata("timeout_sec", 2)
            .with_metadata("model_id", "m");
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "code": "model_load_timeout",
                "message": "Loader timed out after 2s",
                "metadata": {"model_id": "m", "timeout_sec": 2}
            })
        );
    }

    #[test]
    fn test_failure_accepts_unknown_code() {
        let failure: LoaderFailure =
            serde_json::from_str(r#"{"code":"metal_oom","message":"boom","exit_code":1}"#).unwrap();
        assert_eq!(failure.code, ErrorCode::ModelProbeFailed);
        assert_eq!(failure.exit_code, Some(1));
    }

    #[test]
    fn test_outcome_accessors() {
        let ok = LoaderOutcome::Success(LoadResult::success("gguf", Metadata::new()));
        assert!(ok.is_ok());
        assert!(ok.failure().is_none());

        let crashed = LoaderOutcome::Crashed(LoaderFailure::new(
            ErrorCode::ModelLoaderCrashed,
            "signal 6",
        ));
        assert_eq!(
            crashed.failure().map(|f| f.code),
            Some(ErrorCode::ModelLoaderCrashed)
        );
        assert!(crashed.into_result().is_err());
    }
}
