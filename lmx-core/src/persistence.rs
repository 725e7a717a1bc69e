//! Shared persistence utilities: atomic file writes and JSON load/save.
//!
//! Both on-disk registries (compatibility ledger, autotune profiles) are
//! rewritten wholesale on every update, so every write goes through a
//! `.tmp` sibling followed by a rename.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Atomically write JSON data to a file.
///
/// Serializes `data` to pretty-printed JSON, writes to a `.tmp` sibling file,
/// then renames over the target path. Creates parent directories if needed.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Atomically write raw bytes to a file.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load and deserialize JSON from a file.
///
/// Returns `Ok(None)` if the file doesn't exist.
/// Returns `Err` on I/O errors or deserialization failures.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

/// Load JSON, treating a missing or unreadable file as `T::default()`.
///
/// Registries are diagnostic state: a corrupt file must not take the runtime
/// down, so the caller starts from empty. An undecodable file is renamed to a
/// `.corrupt-<unix secs>` sibling first so the next write cannot clobber it.
pub fn load_json_or_default<T>(path: &Path) -> T
where
    T: serde::de::DeserializeOwned + Default,
{
    match load_json(path) {
        Ok(Some(value)) => value,
        Ok(None) => T::default(),
        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
            match set_aside(path) {
                Ok(moved) => tracing::warn!(
                    path = %path.display(),
                    moved_to = %moved.display(),
                    error = %e,
                    "registry_corrupt_moved_aside"
                ),
                Err(rename_err) => tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    rename_error = %rename_err,
                    "registry_corrupt"
                ),
            }
            T::default()
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "registry_load_failed");
            T::default()
        }
    }
}

fn set_aside(path: &Path) -> io::Result<PathBuf> {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "registry".to_string());
    let target = path.with_file_name(format!("{name}.corrupt-{secs}"));
    std::fs::rename(path, &target)?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Row {
        model_id: String,
        outcome: String,
    }

    #[test]
    fn test_atomic_write_json_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.json");

        let rows = vec![Row {
            model_id: "mlx-community/Qwen".into(),
            outcome: "pass".into(),
        }];

        atomic_write_json(&path, &rows).unwrap();
        let loaded: Option<Vec<Row>> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(rows));
    }

    #[test]
    fn test_atomic_write_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("lmx").join("registry.json");

        atomic_write_json(&path, &BTreeMap::<String, u32>::new()).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_load_json_nonexistent() {
        let result: io::Result<Option<Vec<Row>>> = load_json(Path::new("/nonexistent/file.json"));
        assert!(result.unwrap().is_none());
    }

    #[test]
    fn test_atomic_write_no_tmp_leftover() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clean.json");

        atomic_write_json(&path, &"test").unwrap();
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_load_json_or_default_on_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("corrupt.json");
        std::fs::write(&path, "{not json").unwrap();

        let rows: Vec<Row> = load_json_or_default(&path);
        assert!(rows.is_empty());
    }

    #[test]
    fn test_corrupt_file_is_kept_before_rewrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("compatibility.json");
        std::fs::write(&path, "[{\"model_id\": truncated").unwrap();

        let mut rows: Vec<Row> = load_json_or_default(&path);
        assert!(rows.is_empty());
        assert!(!path.exists());

        rows.push(Row {
            model_id: "org/m".into(),
            outcome: "pass".into(),
        });
        atomic_write_json(&path, &rows).unwrap();

        let kept: Vec<PathBuf> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| {
                p.file_name()
                    .unwrap()
                    .to_string_lossy()
                    .starts_with("compatibility.json.corrupt-")
            })
            .collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(
            std::fs::read_to_string(&kept[0]).unwrap(),
            "[{\"model_id\": truncated"
        );
        let reloaded: Option<Vec<Row>> = load_json(&path).unwrap();
        assert_eq!(reloaded, Some(rows));
    }
}
