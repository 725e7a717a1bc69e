//! In-process backend handles.
//!
//! Backends are a closed set ([`BackendKind`]) selected by a detection
//! heuristic on the model id and dispatched through the [`Backend`] trait.
//! Handles are built by a [`BackendFactory`] so the engine never knows which
//! runtime sits behind them.

pub mod mock;
pub mod policy;
pub mod runtime_client;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{EngineError, ErrorCode, Result};
use crate::loader::LoadSpec;

pub use mock::{MockBackend, MockBackendFactory};
pub use policy::backend_candidates;
pub use runtime_client::{RuntimeClientBackend, RuntimeClientFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    #[serde(rename = "vllm-mlx")]
    VllmMlx,
    #[serde(rename = "mlx-lm")]
    MlxLm,
    #[serde(rename = "gguf")]
    Gguf,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [BackendKind::VllmMlx, BackendKind::MlxLm, BackendKind::Gguf];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::VllmMlx => "vllm-mlx",
            BackendKind::MlxLm => "mlx-lm",
            BackendKind::Gguf => "gguf",
        }
    }

    pub fn is_mlx(&self) -> bool {
        matches!(self, BackendKind::VllmMlx | BackendKind::MlxLm)
    }

    /// GGUF if the id ends with `.gguf` or mentions `gguf`; MLX-LM otherwise.
    pub fn detect(model_id: &str) -> Self {
        if is_gguf_id(model_id) {
            BackendKind::Gguf
        } else {
            BackendKind::MlxLm
        }
    }
}

pub(crate) fn is_gguf_id(model_id: &str) -> bool {
    let lowered = model_id.to_lowercase();
    lowered.ends_with(".gguf") || lowered.contains("gguf")
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        BackendKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s.trim())
            .ok_or_else(|| EngineError::Admission {
                code: ErrorCode::ModelUnsupportedBackend,
                message: format!(
                    "Unsupported backend '{s}'. Expected one of vllm-mlx, mlx-lm, gguf."
                ),
            })
    }
}

/// MLX runtimes only exist on Apple Silicon.
pub fn validate_architecture(kind: BackendKind) -> Result<()> {
    validate_architecture_for(kind, std::env::consts::ARCH)
}

pub(crate) fn validate_architecture_for(kind: BackendKind, arch: &str) -> Result<()> {
    if kind.is_mlx() && !matches!(arch, "aarch64" | "arm64") {
        return Err(EngineError::Admission {
            code: ErrorCode::ModelUnsupportedArch,
            message: format!("{kind} requires Apple Silicon (arm64); host is {arch}"),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// A loaded model runtime.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<GenerationOutput>;

    /// Token stream. Dropping the stream must cancel the underlying call.
    async fn stream(&self, messages: &[ChatMessage], params: &GenerationParams)
    -> Result<TokenStream>;

    /// Release runtime resources. Called once on unload.
    async fn close(&self) {}
}

/// Builds backend handles after a successful probe.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn create(&self, kind: BackendKind, spec: &LoadSpec) -> Result<Arc<dyn Backend>>;

    /// Version string recorded in the compatibility and autotune registries.
    fn backend_version(&self, kind: BackendKind) -> String;
}
