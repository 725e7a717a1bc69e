//! Candidate backend order for a load attempt.

use super::{BackendKind, is_gguf_id};
use crate::compatibility::{CompatOutcome, CompatibilityRegistry};
use crate::error::{EngineError, ErrorCode, Result};

const DEFAULT_ORDER: [BackendKind; 2] = [BackendKind::VllmMlx, BackendKind::MlxLm];
/// Model families whose runtime signatures only work on mlx-lm.
const MLX_LM_FIRST_HINTS: [&str; 2] = ["glm-5", "glm5"];

/// Ordered backends to try for `model_id`.
///
/// GGUF ids resolve to GGUF alone. Other ids follow `preference_order`
/// (MLX backends only), an explicit `preferred` backend goes first, and a
/// backend whose latest ledger entry for this model failed is skipped unless
/// `allow_failed` is set. If every candidate would be skipped, the unfiltered
/// order is returned.
pub fn backend_candidates(
    model_id: &str,
    preference_order: &[String],
    registry: &CompatibilityRegistry,
    allow_failed: bool,
    preferred: Option<BackendKind>,
) -> Result<Vec<BackendKind>> {
    if is_gguf_id(model_id) {
        if let Some(p) = preferred
            && p != BackendKind::Gguf
        {
            return Err(EngineError::Admission {
                code: ErrorCode::ModelUnsupportedBackend,
                message: "GGUF model ids can only be loaded with backend 'gguf'".into(),
            });
        }
        return Ok(vec![BackendKind::Gguf]);
    }

    let mut ordered: Vec<BackendKind> = Vec::new();
    for name in preference_order {
        if let Ok(kind) = name.parse::<BackendKind>()
            && kind.is_mlx()
            && !ordered.contains(&kind)
        {
            ordered.push(kind);
        }
    }
    if ordered.is_empty() {
        ordered = DEFAULT_ORDER.to_vec();
    }

    let lowered = model_id.to_lowercase();
    let mlx_lm_first = MLX_LM_FIRST_HINTS.iter().any(|h| lowered.contains(h));
    if mlx_lm_first {
        prioritize(&mut ordered, BackendKind::MlxLm);
    }
    if let Some(p) = preferred {
        prioritize(&mut ordered, p);
    }

    if allow_failed {
        return Ok(ordered);
    }

    let filtered: Vec<BackendKind> = ordered
        .iter()
        .copied()
        .filter(|kind| {
            if Some(*kind) == preferred || (mlx_lm_first && *kind == BackendKind::MlxLm) {
                return true;
            }
            registry
                .latest_record(model_id, Some(kind.as_str()))
                .is_none_or(|entry| entry.outcome != CompatOutcome::Fail)
        })
        .collect();

    Ok(if filtered.is_empty() { ordered } else { filtered })
}

fn prioritize(order: &mut Vec<BackendKind>, first: BackendKind) {
    order.retain(|k| *k != first);
    order.insert(0, first);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compatibility::CompatibilityEntry;
    use tempfile::TempDir;

    fn prefs() -> Vec<String> {
        vec!["vllm-mlx".into(), "mlx-lm".into()]
    }

    #[test]
    fn test_gguf_only_for_gguf_ids() {
        let dir = TempDir::new().unwrap();
        let reg = CompatibilityRegistry::new(dir.path().join("c.json"));
        let c = backend_candidates("TheBloke/Llama-GGUF", &prefs(), &reg, false, None).unwrap();
        assert_eq!(c, vec![BackendKind::Gguf]);

        let err = backend_candidates("x.gguf", &prefs(), &reg, false, Some(BackendKind::MlxLm))
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ModelUnsupportedBackend));
    }

    #[test]
    fn test_failed_backend_skipped() {
        let dir = TempDir::new().unwrap();
        let reg = CompatibilityRegistry::new(dir.path().join("c.json"));
        reg.record(CompatibilityEntry::new("m", "vllm-mlx", "1", CompatOutcome::Fail))
            .unwrap();

        let c = backend_candidates("m", &prefs(), &reg, false, None).unwrap();
        assert_eq!(c, vec![BackendKind::MlxLm]);

        let all = backend_candidates("m", &prefs(), &reg, true, None).unwrap();
        assert_eq!(all, vec![BackendKind::VllmMlx, BackendKind::MlxLm]);
    }

    #[test]
    fn test_all_failed_falls_back_to_full_order() {
        let dir = TempDir::new().unwrap();
        let reg = CompatibilityRegistry::new(dir.path().join("c.json"));
        for b in ["vllm-mlx", "mlx-lm"] {
            reg.record(CompatibilityEntry::new("m", b, "1", CompatOutcome::Fail))
                .unwrap();
        }
        let c = backend_candidates("m", &prefs(), &reg, false, None).unwrap();
        assert_eq!(c, vec![BackendKind::VllmMlx, BackendKind::MlxLm]);
    }

    #[test]
    fn test_pass_after_fail_restores_backend() {
        let dir = TempDir::new().unwrap();
        let reg = CompatibilityRegistry::new(dir.path().join("c.json"));
        reg.record(CompatibilityEntry::new("m", "vllm-mlx", "1", CompatOutcome::Fail))
            .unwrap();
        reg.record(CompatibilityEntry::new("m", "vllm-mlx", "1", CompatOutcome::Pass))
            .unwrap();
        let c = backend_candidates("m", &prefs(), &reg, false, None).unwrap();
        assert_eq!(c[0], BackendKind::VllmMlx);
    }

    #[test]
    fn test_preferred_and_hints_reorder() {
        let dir = TempDir::new().unwrap();
        let reg = CompatibilityRegistry::new(dir.path().join("c.json"));
        let c = backend_candidates("m", &prefs(), &reg, false, Some(BackendKind::MlxLm)).unwrap();
        assert_eq!(c, vec![BackendKind::MlxLm, BackendKind::VllmMlx]);

        let glm = backend_candidates("mlx-community/GLM-5-4bit", &prefs(), &reg, false, None)
            .unwrap();
        assert_eq!(glm[0], BackendKind::MlxLm);

        let junk = backend_candidates("m", &["onnx".into()], &reg, false, None).unwrap();
        assert_eq!(junk, vec![BackendKind::VllmMlx, BackendKind::MlxLm]);
    }
}
