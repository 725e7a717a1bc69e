//! Error types for the lmx-engine crate.
//!
//! `ErrorCode` is the closed loader/admission taxonomy shared with the child
//! loader process; `EngineError` is what callers of the engine see.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

use crate::loader::LoaderFailure;

/// Closed taxonomy of loader and admission failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ModelIncomplete,
    ModelUnsupportedBackend,
    ModelUnsupportedArch,
    ModelNotReady,
    ModelUnstable,
    ModelCanaryFailed,
    ModelLoadTimeout,
    ModelLoaderCrashed,
    ModelProbeFailed,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 9] = [
        ErrorCode::ModelIncomplete,
        ErrorCode::ModelUnsupportedBackend,
        ErrorCode::ModelUnsupportedArch,
        ErrorCode::ModelNotReady,
        ErrorCode::ModelUnstable,
        ErrorCode::ModelCanaryFailed,
        ErrorCode::ModelLoadTimeout,
        ErrorCode::ModelLoaderCrashed,
        ErrorCode::ModelProbeFailed,
    ];

    /// Stable wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ModelIncomplete => "model_incomplete",
            ErrorCode::ModelUnsupportedBackend => "model_unsupported_backend",
            ErrorCode::ModelUnsupportedArch => "model_unsupported_arch",
            ErrorCode::ModelNotReady => "model_not_ready",
            ErrorCode::ModelUnstable => "model_unstable",
            ErrorCode::ModelCanaryFailed => "model_canary_failed",
            ErrorCode::ModelLoadTimeout => "model_load_timeout",
            ErrorCode::ModelLoaderCrashed => "model_loader_crashed",
            ErrorCode::ModelProbeFailed => "model_probe_failed",
        }
    }

    /// Parse a wire string. Unknown codes fold into `ModelProbeFailed`.
    pub fn parse_lossy(raw: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(raw.trim()))
            .unwrap_or(ErrorCode::ModelProbeFailed)
    }

    /// HTTP-equivalent status the protocol layer should render.
    pub fn status(&self) -> u16 {
        match self {
            ErrorCode::ModelUnsupportedArch | ErrorCode::ModelUnsupportedBackend => 422,
            ErrorCode::ModelUnstable => 409,
            ErrorCode::ModelNotReady => 503,
            ErrorCode::ModelLoadTimeout => 504,
            ErrorCode::ModelIncomplete => 404,
            ErrorCode::ModelCanaryFailed
            | ErrorCode::ModelLoaderCrashed
            | ErrorCode::ModelProbeFailed => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(ErrorCode::parse_lossy(&raw))
    }
}

/// Top-level error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Rejected before any process was spawned (validation, architecture).
    #[error("{message}")]
    Admission { code: ErrorCode, message: String },

    #[error("Failed to load model '{model_id}' [{}]: {}", failure.code, failure.message)]
    LoadFailed {
        model_id: String,
        failure: LoaderFailure,
    },

    #[error("Model '{model_id}' is quarantined ({reason}); reset readiness to retry")]
    Quarantined { model_id: String, reason: String },

    #[error("Model '{model_id}' is not loaded")]
    NotLoaded { model_id: String },

    #[error("Model '{model_id}' is loaded but not routable (state: {state})")]
    NotReady { model_id: String, state: String },

    #[error("Insufficient memory to load '{model_id}': {message}")]
    InsufficientMemory { model_id: String, message: String },

    #[error("Server is busy: {message}")]
    Busy { message: String },

    #[error("Inference timed out after {seconds}s")]
    InferenceTimeout { seconds: u64 },

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Invalid model id: {0}")]
    InvalidModelId(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Core error: {0}")]
    Core(#[from] lmx_core::LmxError),
}

impl EngineError {
    pub fn inference(msg: impl Into<String>) -> Self {
        Self::Inference(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn busy(msg: impl Into<String>) -> Self {
        Self::Busy {
            message: msg.into(),
        }
    }

    /// Taxonomy code, when the failure belongs to the loader/admission taxonomy.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            EngineError::Admission { code, .. } => Some(*code),
            EngineError::LoadFailed { failure, .. } => Some(failure.code),
            EngineError::Quarantined { .. } => Some(ErrorCode::ModelUnstable),
            EngineError::NotReady { .. } => Some(ErrorCode::ModelNotReady),
            _ => None,
        }
    }

    /// HTTP-equivalent status for the protocol layer.
    pub fn status(&self) -> u16 {
        if let Some(code) = self.code() {
            return code.status();
        }
        match self {
            EngineError::NotLoaded { .. } => 404,
            EngineError::InvalidModelId(_) => 400,
            EngineError::InsufficientMemory { .. } | EngineError::Busy { .. } => 503,
            EngineError::InferenceTimeout { .. } => 504,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_strings() {
        assert_eq!(ErrorCode::ModelProbeFailed.as_str(), "model_probe_failed");
        assert_eq!(
            serde_json::to_string(&ErrorCode::ModelLoaderCrashed).unwrap(),
            "\"model_loader_crashed\""
        );
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::parse_lossy(code.as_str()), code);
        }
    }

    #[test]
    fn test_unknown_code_normalizes_to_probe_failed() {
        let code: ErrorCode = serde_json::from_str("\"model_exploded\"").unwrap();
        assert_eq!(code, ErrorCode::ModelProbeFailed);
    }

    #[test]
    fn test_quarantined_maps_to_unstable_409() {
        let err = EngineError::Quarantined {
            model_id: "m".into(),
            reason: "crash_loop:3".into(),
        };
        assert_eq!(err.code(), Some(ErrorCode::ModelUnstable));
        assert_eq!(err.status(), 409);
    }

    #[test]
    fn test_arch_admission_is_422() {
        let err = EngineError::Admission {
            code: ErrorCode::ModelUnsupportedArch,
            message: "MLX requires Apple Silicon".into(),
        };
        assert_eq!(err.status(), 422);
    }

    #[test]
    fn test_busy_message() {
        let err = EngineError::busy("timed out waiting for global slot");
        assert!(err.to_string().starts_with("Server is busy"));
        assert_eq!(err.code(), None);
        assert_eq!(err.status(), 503);
    }
}
