//! Child-side loader: one spec in, one JSON line out.
//!
//! This runs inside the disposable `lmx loader-worker` process. Native
//! backend initialization is the only step allowed to take a process down,
//! so it happens here and never in the parent.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::protocol::{LoadResult, LoadSpec, LoaderFailure, LoaderOutcome, Metadata};
use super::supervisor::ModelLoader;
use crate::backend::BackendKind;
use crate::error::ErrorCode;

/// Exit code for a missing or unreadable spec.
pub const EXIT_BAD_INPUT: i32 = 2;
/// Exit code for a structured failure written to stderr.
pub const EXIT_FAILURE: i32 = 1;

const GGUF_MAGIC: &[u8; 4] = b"GGUF";

/// Probe errors. Structured failures pass through untouched; anything else
/// is wrapped as `model_probe_failed`.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("{0}")]
    Structured(LoaderFailure),
    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for ProbeError {
    fn from(err: std::io::Error) -> Self {
        ProbeError::Other(err.to_string())
    }
}

/// One backend-specific initialization attempt.
#[async_trait]
pub trait BackendProbe: Send + Sync {
    async fn probe(&self, spec: &LoadSpec) -> Result<Metadata, ProbeError>;
}

pub type ProbeRegistry = HashMap<String, Arc<dyn BackendProbe>>;

fn require_model_id(spec: &LoadSpec) -> Result<(), ProbeError> {
    if spec.model_id.trim().is_empty() {
        return Err(ProbeError::Other("model_id is required".into()));
    }
    Ok(())
}

fn ok_telemetry(backend: &str) -> Metadata {
    let mut telemetry = Metadata::new();
    telemetry.insert("probe".into(), json!("ok"));
    telemetry.insert("backend".into(), json!(backend));
    telemetry.insert("canary".into(), json!("ok"));
    telemetry
}

/// MLX-family probe (vllm-mlx, mlx-lm).
pub struct MlxProbe {
    kind: BackendKind,
}

impl MlxProbe {
    pub fn new(kind: BackendKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl BackendProbe for MlxProbe {
    async fn probe(&self, spec: &LoadSpec) -> Result<Metadata, ProbeError> {
        require_model_id(spec)?;
        Ok(ok_telemetry(self.kind.as_str()))
    }
}

/// GGUF probe. Local `.gguf` paths must exist and carry the GGUF magic.
pub struct GgufProbe;

#[async_trait]
impl BackendProbe for GgufProbe {
    async fn probe(&self, spec: &LoadSpec) -> Result<Metadata, ProbeError> {
        require_model_id(spec)?;
        let mut telemetry = ok_telemetry(BackendKind::Gguf.as_str());

        if !spec.model_id.to_lowercase().ends_with(".gguf") {
            return Ok(telemetry);
        }

        let path = Path::new(&spec.model_id);
        let metadata = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProbeError::Structured(
                    LoaderFailure::new(
                        ErrorCode::ModelIncomplete,
                        format!("GGUF file not found: {}", path.display()),
                    )
                    .with_metadata("model_id", spec.model_id.as_str())
                    .with_metadata("backend", "gguf"),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        let mut file = tokio::fs::File::open(path).await?;
        let mut magic = [0u8; 4];
        if file.read_exact(&mut magic).await.is_err() || &magic != GGUF_MAGIC {
            return Err(ProbeError::Other(format!(
                "{} is not a GGUF file",
                path.display()
            )));
        }

        telemetry.insert("file_size_bytes".into(), json!(metadata.len()));
        Ok(telemetry)
    }
}

/// Probes for every supported backend, keyed by wire name.
pub fn default_probes() -> ProbeRegistry {
    let mut probes: ProbeRegistry = HashMap::new();
    probes.insert(
        BackendKind::VllmMlx.as_str().into(),
        Arc::new(MlxProbe::new(BackendKind::VllmMlx)),
    );
    probes.insert(
        BackendKind::MlxLm.as_str().into(),
        Arc::new(MlxProbe::new(BackendKind::MlxLm)),
    );
    probes.insert(BackendKind::Gguf.as_str().into(), Arc::new(GgufProbe));
    probes
}

/// Run the probe selected by `spec.backend`.
pub async fn execute_load_spec(
    spec: &LoadSpec,
    probes: &ProbeRegistry,
) -> Result<LoadResult, LoaderFailure> {
    let Some(probe) = probes.get(&spec.backend) else {
        return Err(LoaderFailure::new(
            ErrorCode::ModelProbeFailed,
            format!("Unsupported backend '{}'", spec.backend),
        )
        .with_metadata("backend", spec.backend.as_str())
        .with_metadata("model_id", spec.model_id.as_str()));
    };

    match probe.probe(spec).await {
        Ok(telemetry) => Ok(LoadResult::success(spec.backend.as_str(), telemetry)),
        Err(ProbeError::Structured(failure)) => Err(failure),
        Err(ProbeError::Other(message)) => Err(LoaderFailure::new(
            ErrorCode::ModelProbeFailed,
            format!("Probe failed for backend '{}': {message}", spec.backend),
        )
        .with_metadata("backend", spec.backend.as_str())
        .with_metadata("model_id", spec.model_id.as_str())),
    }
}

/// Runs probes inside the current process. Used when isolation is disabled;
/// a native crash here takes the server down with it.
pub struct InProcessLoader {
    probes: ProbeRegistry,
}

impl InProcessLoader {
    pub fn new(probes: ProbeRegistry) -> Self {
        Self { probes }
    }
}

impl Default for InProcessLoader {
    fn default() -> Self {
        Self::new(default_probes())
    }
}

#[async_trait]
impl ModelLoader for InProcessLoader {
    async fn run(&self, spec: &LoadSpec, timeout: Duration) -> LoaderOutcome {
        match tokio::time::timeout(timeout, execute_load_spec(spec, &self.probes)).await {
            Ok(Ok(result)) => LoaderOutcome::Success(result),
            Ok(Err(failure)) => LoaderOutcome::Failed(failure),
            Err(_) => LoaderOutcome::Timeout(
                LoaderFailure::new(
                    ErrorCode::ModelLoadTimeout,
                    format!("Loader timed out after {}s", timeout.as_secs_f64()),
                )
                .with_metadata("timeout_sec", timeout.as_secs_f64())
                .with_metadata("model_id", spec.model_id.as_str()),
            ),
        }
    }
}

async fn write_line<W, T>(out: &mut W, payload: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let mut line = serde_json::to_vec(payload).map_err(std::io::Error::other)?;
    line.push(b'\n');
    out.write_all(&line).await?;
    out.flush().await
}

/// Worker entry point. Returns the process exit code.
///
/// Reads the whole input, writes exactly one line to `stdout` (success) or
/// `stderr` (failure).
pub async fn run_worker<R, O, E>(
    mut input: R,
    mut stdout: O,
    mut stderr: E,
    probes: &ProbeRegistry,
) -> i32
where
    R: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let mut raw = String::new();
    if let Err(e) = input.read_to_string(&mut raw).await {
        let failure =
            LoaderFailure::new(ErrorCode::ModelProbeFailed, format!("unreadable_load_spec: {e}"));
        let _ = write_line(&mut stderr, &failure).await;
        return EXIT_BAD_INPUT;
    }

    if raw.trim().is_empty() {
        let failure = LoaderFailure::new(ErrorCode::ModelProbeFailed, "missing_load_spec");
        let _ = write_line(&mut stderr, &failure).await;
        return EXIT_BAD_INPUT;
    }

    let spec: LoadSpec = match serde_json::from_str(raw.trim()) {
        Ok(spec) => spec,
        Err(e) => {
            let failure =
                LoaderFailure::new(ErrorCode::ModelProbeFailed, format!("invalid_load_spec: {e}"));
            let _ = write_line(&mut stderr, &failure).await;
            return EXIT_BAD_INPUT;
        }
    };

    match execute_load_spec(&spec, probes).await {
        Ok(result) => match write_line(&mut stdout, &result).await {
            Ok(()) => 0,
            Err(_) => EXIT_FAILURE,
        },
        Err(failure) => {
            let _ = write_line(&mut stderr, &failure).await;
            EXIT_FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    async fn run(input: &str) -> (i32, String, String) {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let code = run_worker(input.as_bytes(), &mut out, &mut err, &default_probes()).await;
        (
            code,
            String::from_utf8(out).unwrap(),
            String::from_utf8(err).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_success_writes_one_stdout_line() {
        let (code, out, err) = run(r#"{"model_id":"mlx-community/Qwen","backend":"mlx-lm"}"#).await;
        assert_eq!(code, 0);
        assert!(err.is_empty());
        assert_eq!(out.lines().count(), 1);
        let result: LoadResult = serde_json::from_str(out.trim()).unwrap();
        assert!(result.ok);
        assert_eq!(result.backend, "mlx-lm");
        assert_eq!(result.telemetry["canary"], "ok");
    }

    #[tokio::test]
    async fn test_unknown_backend_fails_with_probe_failed() {
        let (code, out, err) = run(r#"{"model_id":"m","backend":"onnx"}"#).await;
        assert_eq!(code, EXIT_FAILURE);
        assert!(out.is_empty());
        let failure: LoaderFailure = serde_json::from_str(err.trim()).unwrap();
        assert_eq!(failure.code, ErrorCode::ModelProbeFailed);
        assert_eq!(failure.message, "Unsupported backend 'onnx'");
    }

    #[tokio::test]
    async fn test_empty_input_exits_2() {
        let (code, _, err) = run("   \n").await;
        assert_eq!(code, EXIT_BAD_INPUT);
        assert!(err.contains("missing_load_spec"));
    }

    #[tokio::test]
    async fn test_garbage_input_exits_2() {
        let (code, _, err) = run("not json").await;
        assert_eq!(code, EXIT_BAD_INPUT);
        assert!(err.contains("invalid_load_spec"));
    }

    #[tokio::test]
    async fn test_probe_error_is_wrapped() {
        let (code, _, err) = run(r#"{"model_id":"  ","backend":"vllm-mlx"}"#).await;
        assert_eq!(code, EXIT_FAILURE);
        let failure: LoaderFailure = serde_json::from_str(err.trim()).unwrap();
        assert_eq!(failure.code, ErrorCode::ModelProbeFailed);
        assert!(failure.message.contains("model_id is required"));
    }

    #[tokio::test]
    async fn test_missing_gguf_file_is_incomplete() {
        let spec = LoadSpec::new("/nonexistent/dir/model-q4.gguf", "gguf");
        let failure = execute_load_spec(&spec, &default_probes())
            .await
            .unwrap_err();
        assert_eq!(failure.code, ErrorCode::ModelIncomplete);
    }

    #[tokio::test]
    async fn test_gguf_magic_checked() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.gguf");
        let mut f = std::fs::File::create(&good).unwrap();
        f.write_all(b"GGUF\x03\x00\x00\x00rest").unwrap();
        let bad = dir.path().join("bad.gguf");
        std::fs::write(&bad, b"PK\x03\x04").unwrap();

        let probes = default_probes();
        let ok = execute_load_spec(&LoadSpec::new(good.to_string_lossy(), "gguf"), &probes)
            .await
            .unwrap();
        assert_eq!(ok.telemetry["file_size_bytes"], 12);

        let failure = execute_load_spec(&LoadSpec::new(bad.to_string_lossy(), "gguf"), &probes)
            .await
            .unwrap_err();
        assert_eq!(failure.code, ErrorCode::ModelProbeFailed);
        assert!(failure.message.contains("not a GGUF file"));
    }

    #[tokio::test]
    async fn test_structured_probe_failure_propagates_verbatim() {
        struct Arch;
        #[async_trait]
        impl BackendProbe for Arch {
            async fn probe(&self, _spec: &LoadSpec) -> Result<Metadata, ProbeError> {
                Err(ProbeError::Structured(LoaderFailure::new(
                    ErrorCode::ModelUnsupportedArch,
                    "needs arm64",
                )))
            }
        }
        let mut probes = ProbeRegistry::new();
        probes.insert("mlx-lm".into(), Arc::new(Arch));
        let failure = execute_load_spec(&LoadSpec::new("m", "mlx-lm"), &probes)
            .await
            .unwrap_err();
        assert_eq!(failure.code, ErrorCode::ModelUnsupportedArch);
        assert_eq!(failure.message, "needs arm64");
    }

    #[tokio::test]
    async fn test_in_process_loader_outcomes() {
        let loader = InProcessLoader::default();
        let ok = loader
            .run(&LoadSpec::new("m", "mlx-lm"), Duration::from_secs(5))
            .await;
        assert!(ok.is_ok());

        let failed = loader
            .run(&LoadSpec::new("m", "onnx"), Duration::from_secs(5))
            .await;
        assert!(matches!(failed, LoaderOutcome::Failed(_)));
    }
}
