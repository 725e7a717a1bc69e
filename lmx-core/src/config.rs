//! Configuration system for LMX.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from `~/.config/lmx/config.toml` and/or `.lmx/config.toml`
//! in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// File name of the compatibility ledger inside the data directory.
pub const COMPATIBILITY_FILE: &str = "compatibility-registry.json";
/// File name of the autotune registry inside the data directory.
pub const AUTOTUNE_FILE: &str = "autotune-registry.json";

/// Top-level configuration for the LMX runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LmxConfig {
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub eviction: EvictionConfig,
    #[serde(default)]
    pub backends: BackendsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Host memory admission settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Usage percentage (0-100) that a load may never push the host past.
    #[serde(default = "default_max_percent")]
    pub max_percent: f64,
    /// How long a memory sample is reused before the OS is queried again.
    #[serde(default = "default_memory_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_percent: default_max_percent(),
            cache_ttl_ms: default_memory_cache_ttl_ms(),
        }
    }
}

fn default_max_percent() -> f64 {
    90.0
}

fn default_memory_cache_ttl_ms() -> u64 {
    1000
}

/// Isolated child-loader settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Run the backend probe in a disposable child process before loading.
    #[serde(default = "default_true")]
    pub isolation_enabled: bool,
    /// Hard deadline for one child loader round-trip (seconds).
    #[serde(default = "default_loader_timeout")]
    pub timeout_secs: u64,
    /// Consecutive load failures before a model is quarantined.
    #[serde(default = "default_quarantine_threshold")]
    pub quarantine_threshold: u32,
    /// Program spawned as the loader worker (defaults to the current executable).
    #[serde(default)]
    pub worker_program: Option<PathBuf>,
    /// Arguments passed to the worker program.
    #[serde(default = "default_worker_args")]
    pub worker_args: Vec<String>,
    /// Reject MLX models on non-arm64 hosts before spawning anything.
    #[serde(default = "default_true")]
    pub enforce_architecture: bool,
    /// Require a canary generation before a model becomes routable.
    #[serde(default = "default_true")]
    pub canary_enabled: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            isolation_enabled: true,
            timeout_secs: default_loader_timeout(),
            quarantine_threshold: default_quarantine_threshold(),
            worker_program: None,
            worker_args: default_worker_args(),
            enforce_architecture: true,
            canary_enabled: true,
        }
    }
}

fn default_loader_timeout() -> u64 {
    120
}

fn default_quarantine_threshold() -> u32 {
    3
}

fn default_worker_args() -> Vec<String> {
    vec!["loader-worker".to_string()]
}

/// Request admission settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Global cap on concurrent generation requests across all models.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
    /// Bounded wait for each semaphore acquisition (seconds).
    #[serde(default = "default_semaphore_timeout")]
    pub semaphore_timeout_secs: f64,
    /// Deadline for a single backend generation call (seconds).
    #[serde(default = "default_inference_timeout")]
    pub inference_timeout_secs: u64,
    /// Optional per-model caps, keyed by model id.
    #[serde(default)]
    pub per_model_concurrency_limits: HashMap<String, usize>,
    /// Default per-client cap; `None` disables client fairness.
    #[serde(default)]
    pub per_client_default_concurrency: Option<usize>,
    /// Per-client cap overrides, keyed by client id.
    #[serde(default)]
    pub per_client_concurrency_overrides: HashMap<String, usize>,
    #[serde(default = "default_true")]
    pub adaptive_concurrency_enabled: bool,
    #[serde(default = "default_latency_target_ms")]
    pub adaptive_latency_target_ms: f64,
    #[serde(default = "default_latency_window")]
    pub adaptive_latency_window: usize,
    #[serde(default = "default_min_concurrent")]
    pub adaptive_min_concurrent_requests: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: default_max_concurrent(),
            semaphore_timeout_secs: default_semaphore_timeout(),
            inference_timeout_secs: default_inference_timeout(),
            per_model_concurrency_limits: HashMap::new(),
            per_client_default_concurrency: None,
            per_client_concurrency_overrides: HashMap::new(),
            adaptive_concurrency_enabled: true,
            adaptive_latency_target_ms: default_latency_target_ms(),
            adaptive_latency_window: default_latency_window(),
            adaptive_min_concurrent_requests: default_min_concurrent(),
        }
    }
}

fn default_max_concurrent() -> usize {
    4
}

fn default_semaphore_timeout() -> f64 {
    30.0
}

fn default_inference_timeout() -> u64 {
    300
}

fn default_latency_target_ms() -> f64 {
    2500.0
}

fn default_latency_window() -> usize {
    128
}

fn default_min_concurrent() -> usize {
    1
}

/// Idle-model eviction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionConfig {
    /// Idle time after which a model is unloaded; `None` disables the sweep.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    /// How often the background sweep runs (seconds).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Evict the least-recently-used model when a load does not fit.
    #[serde(default = "default_true")]
    pub auto_evict_lru: bool,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: None,
            sweep_interval_secs: default_sweep_interval(),
            auto_evict_lru: true,
        }
    }
}

fn default_sweep_interval() -> u64 {
    60
}

/// Backend selection and runtime endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendsConfig {
    /// Preferred order for non-GGUF models.
    #[serde(default = "default_preference_order")]
    pub preference_order: Vec<String>,
    /// OpenAI-compatible endpoint serving MLX models.
    #[serde(default = "default_mlx_endpoint")]
    pub mlx_endpoint: String,
    /// OpenAI-compatible endpoint serving GGUF models.
    #[serde(default = "default_gguf_endpoint")]
    pub gguf_endpoint: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            preference_order: default_preference_order(),
            mlx_endpoint: default_mlx_endpoint(),
            gguf_endpoint: default_gguf_endpoint(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_preference_order() -> Vec<String> {
    vec!["vllm-mlx".to_string(), "mlx-lm".to_string()]
}

fn default_mlx_endpoint() -> String {
    "http://127.0.0.1:8081".to_string()
}

fn default_gguf_endpoint() -> String {
    "http://127.0.0.1:8082".to_string()
}

fn default_request_timeout() -> u64 {
    600
}

/// Location of durable runtime state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the registries (defaults to the platform data dir).
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolve the data directory, falling back to `~/.lmx` when the platform
    /// has no conventional data location.
    pub fn resolved_data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        directories::ProjectDirs::from("dev", "opta", "lmx")
            .map(|d| d.data_dir().to_path_buf())
            .or_else(|| directories::BaseDirs::new().map(|b| b.home_dir().join(".lmx")))
            .unwrap_or_else(|| PathBuf::from(".lmx"))
    }

    pub fn compatibility_path(&self) -> PathBuf {
        self.resolved_data_dir().join(COMPATIBILITY_FILE)
    }

    pub fn autotune_path(&self) -> PathBuf {
        self.resolved_data_dir().join(AUTOTUNE_FILE)
    }
}

fn default_true() -> bool {
    true
}

impl LmxConfig {
    /// Reject combinations the runtime cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency.max_concurrent_requests == 0 {
            return Err(ConfigError::Invalid {
                message: "concurrency.max_concurrent_requests must be >= 1".into(),
            });
        }
        if !(0.0..=100.0).contains(&self.memory.max_percent) || self.memory.max_percent == 0.0 {
            return Err(ConfigError::Invalid {
                message: format!(
                    "memory.max_percent must be in (0, 100], got {}",
                    self.memory.max_percent
                ),
            });
        }
        if self.loader.quarantine_threshold == 0 {
            return Err(ConfigError::Invalid {
                message: "loader.quarantine_threshold must be >= 1".into(),
            });
        }
        if self.concurrency.semaphore_timeout_secs <= 0.0 {
            return Err(ConfigError::Invalid {
                message: "concurrency.semaphore_timeout_secs must be > 0".into(),
            });
        }
        if let Some((model, _)) = self
            .concurrency
            .per_model_concurrency_limits
            .iter()
            .find(|(_, limit)| **limit == 0)
        {
            return Err(ConfigError::Invalid {
                message: format!("per-model concurrency limit for '{model}' must be >= 1"),
            });
        }
        Ok(())
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `LMX_`)
/// 3. Workspace-local config (`.lmx/config.toml`)
/// 4. User config (`~/.config/lmx/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&LmxConfig>,
) -> Result<LmxConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(LmxConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "opta", "lmx") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".lmx").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // LMX_LOADER__TIMEOUT_SECS, LMX_CONCURRENCY__MAX_CONCURRENT_REQUESTS, etc.
    figment = figment.merge(Env::prefixed("LMX_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: LmxConfig = figment.extract()?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from one explicit file plus environment, skipping the
/// user/workspace discovery.
pub fn load_config_file(path: &Path) -> Result<LmxConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let config: LmxConfig = Figment::from(Serialized::defaults(LmxConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("LMX_").split("__"))
        .extract()?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LmxConfig::default();
        assert_eq!(config.memory.max_percent, 90.0);
        assert_eq!(config.loader.timeout_secs, 120);
        assert_eq!(config.loader.quarantine_threshold, 3);
        assert_eq!(config.loader.worker_args, vec!["loader-worker".to_string()]);
        assert_eq!(config.concurrency.max_concurrent_requests, 4);
        assert!(config.concurrency.per_client_default_concurrency.is_none());
        assert!(config.eviction.ttl_secs.is_none());
        assert_eq!(config.backends.preference_order, vec!["vllm-mlx", "mlx-lm"]);
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let mut config = LmxConfig::default();
        config
            .concurrency
            .per_model_concurrency_limits
            .insert("m".into(), 2);
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: LmxConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(
            parsed.concurrency.per_model_concurrency_limits.get("m"),
            Some(&2)
        );
        assert_eq!(parsed.loader.timeout_secs, config.loader.timeout_secs);
    }

    #[test]
    fn test_load_config_with_overrides() {
        let mut overrides = LmxConfig::default();
        overrides.concurrency.max_concurrent_requests = 8;
        overrides.loader.timeout_secs = 30;

        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.concurrency.max_concurrent_requests, 8);
        assert_eq!(config.loader.timeout_secs, 30);
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let lmx_dir = dir.path().join(".lmx");
        std::fs::create_dir_all(&lmx_dir).unwrap();
        std::fs::write(
            lmx_dir.join("config.toml"),
            r#"
[memory]
max_percent = 80.0

[concurrency]
max_concurrent_requests = 6
per_client_default_concurrency = 1

[concurrency.per_model_concurrency_limits]
"mlx-community/Qwen2.5-7B-4bit" = 2

[eviction]
ttl_secs = 900
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.memory.max_percent, 80.0);
        assert_eq!(config.concurrency.max_concurrent_requests, 6);
        assert_eq!(config.concurrency.per_client_default_concurrency, Some(1));
        assert_eq!(
            config
                .concurrency
                .per_model_concurrency_limits
                .get("mlx-community/Qwen2.5-7B-4bit"),
            Some(&2)
        );
        assert_eq!(config.eviction.ttl_secs, Some(900));
        // Untouched sections keep their defaults.
        assert_eq!(config.loader.quarantine_threshold, 3);
    }

    #[test]
    fn test_load_config_file_missing() {
        let err = load_config_file(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = LmxConfig::default();
        config.concurrency.max_concurrent_requests = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_model_limit() {
        let mut config = LmxConfig::default();
        config
            .concurrency
            .per_model_concurrency_limits
            .insert("m".into(), 0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("'m'"));
    }

    #[test]
    fn test_storage_paths_use_data_dir() {
        let storage = StorageConfig {
            data_dir: Some(PathBuf::from("/var/lib/lmx")),
        };
        assert_eq!(
            storage.compatibility_path(),
            PathBuf::from("/var/lib/lmx/compatibility-registry.json")
        );
        assert_eq!(
            storage.autotune_path(),
            PathBuf::from("/var/lib/lmx/autotune-registry.json")
        );
    }
}
