//! The model lifecycle orchestrator.
//!
//! [`InferenceEngine`] owns the loaded-model set and the readiness records.
//! Both live behind one std mutex that is never held across an await point;
//! per-model operations (load, unload, eviction) are serialized by a per-id
//! async mutex. Every generation call passes through [`AdmissionController`]
//! before it reaches a backend handle.

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use pin_project_lite::pin_project;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lmx_core::LmxConfig;

use crate::admission::{AdmissionConfig, AdmissionController, ConcurrencyPolicy, RequestPermit};
use crate::autotune::{AutotuneMetrics, AutotuneRecord, AutotuneRegistry};
use crate::backend::policy::backend_candidates;
use crate::backend::runtime_client::RuntimeClientFactory;
use crate::backend::{
    Backend, BackendFactory, BackendKind, ChatMessage, GenerationOutput, GenerationParams,
    TokenStream, validate_architecture,
};
use crate::compatibility::{CompatOutcome, CompatibilityEntry, CompatibilityRegistry};
use crate::error::{EngineError, ErrorCode, Result};
use crate::loader::{
    InProcessLoader, LoadSpec, LoaderFailure, LoaderOutcome, LoaderSupervisor, Metadata,
    ModelLoader, WorkerCommand,
};
use crate::memory::{MEMORY_SAFETY_MARGIN, MemoryMonitor, MemoryStatus};
use crate::perf::{PerfRegistry, PerfSample};
use crate::readiness::{ReadinessRecord, ReadinessState, ReadinessTracker};

pub const CANARY_PROMPT: &str = "Reply with exactly: OK";
pub const CANARY_MAX_TOKENS: u32 = 8;

/// Engine knobs derived from [`LmxConfig`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub loader_timeout: Duration,
    pub quarantine_threshold: u32,
    pub enforce_architecture: bool,
    pub canary_enabled: bool,
    pub inference_timeout: Duration,
    pub auto_evict_lru: bool,
    pub preference_order: Vec<String>,
}

impl EngineOptions {
    pub fn from_config(config: &LmxConfig) -> Self {
        Self {
            loader_timeout: Duration::from_secs(config.loader.timeout_secs.max(1)),
            quarantine_threshold: config.loader.quarantine_threshold.max(1),
            enforce_architecture: config.loader.enforce_architecture,
            canary_enabled: config.loader.canary_enabled,
            inference_timeout: Duration::from_secs(config.concurrency.inference_timeout_secs.max(1)),
            auto_evict_lru: config.eviction.auto_evict_lru,
            preference_order: config.backends.preference_order.clone(),
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_config(&LmxConfig::default())
    }
}

/// Per-call load options.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Try this backend first.
    pub backend: Option<BackendKind>,
    /// Include backends whose last ledger entry for this model failed.
    pub allow_failed: bool,
    pub use_batching: bool,
    pub memory_estimate_gb: Option<f64>,
    /// Overrides the sweep TTL for this model. `Some(0)` pins it.
    pub keep_alive_sec: Option<u64>,
    pub performance_overrides: Metadata,
}

/// Operator view of a loaded model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_id: String,
    pub backend: BackendKind,
    pub backend_version: String,
    pub loaded_at: DateTime<Utc>,
    pub request_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_memory_gb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_alive_sec: Option<u64>,
    pub idle_secs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeOutcome {
    Pass,
    Fail,
    /// The probe could not finish (timeout); nothing is known.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendProbeResult {
    pub backend: BackendKind,
    pub outcome: ProbeOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub model_id: String,
    pub candidates: Vec<BackendProbeResult>,
    pub recommended_backend: Option<BackendKind>,
}

/// Counts generation calls currently using one model.
struct ActiveRequest(Arc<AtomicUsize>);

impl ActiveRequest {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct LoadedModel {
    backend: Arc<dyn Backend>,
    kind: BackendKind,
    backend_version: String,
    loaded_at: DateTime<Utc>,
    last_used: Instant,
    request_count: u64,
    estimated_memory_gb: Option<f64>,
    keep_alive_sec: Option<u64>,
    active: Arc<AtomicUsize>,
}

impl LoadedModel {
    fn info(&self, model_id: &str, now: Instant) -> ModelInfo {
        ModelInfo {
            model_id: model_id.to_string(),
            backend: self.kind,
            backend_version: self.backend_version.clone(),
            loaded_at: self.loaded_at,
            request_count: self.request_count,
            estimated_memory_gb: self.estimated_memory_gb,
            keep_alive_sec: self.keep_alive_sec,
            idle_secs: now.saturating_duration_since(self.last_used).as_secs_f64(),
        }
    }

    fn is_busy(&self) -> bool {
        self.active.load(Ordering::SeqCst) > 0
    }

    /// Strictly idle longer than its TTL. A zero keep-alive never expires.
    fn is_expired(&self, now: Instant, default_ttl: Duration) -> bool {
        let ttl = match self.keep_alive_sec {
            Some(0) => return false,
            Some(secs) => Duration::from_secs(secs),
            None => default_ttl,
        };
        now.saturating_duration_since(self.last_used) > ttl
    }
}

#[derive(Default)]
struct EngineState {
    models: HashMap<String, LoadedModel>,
    readiness: ReadinessTracker,
    /// Buffered size (GB) held by loads that are still in progress.
    reservations: HashMap<String, f64>,
}

/// Releases a cold-load memory reservation however the load ends.
struct Reservation<'a> {
    state: &'a Mutex<EngineState>,
    model_id: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reservations
            .remove(&self.model_id);
    }
}

/// Why one backend candidate did not produce a routable model.
enum AttemptError {
    /// Counts toward quarantine; the next candidate is tried.
    Loader(LoaderFailure),
    /// Ends the load without counting as a loader failure.
    Abort(EngineError),
}

pub struct EngineBuilder {
    config: LmxConfig,
    options: Option<EngineOptions>,
    memory: Option<Arc<MemoryMonitor>>,
    loader: Option<Arc<dyn ModelLoader>>,
    factory: Option<Arc<dyn BackendFactory>>,
    policy: Option<Box<dyn ConcurrencyPolicy>>,
}

impl EngineBuilder {
    pub fn new(config: LmxConfig) -> Self {
        Self {
            config,
            options: None,
            memory: None,
            loader: None,
            factory: None,
            policy: None,
        }
    }

    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn memory(mut self, memory: Arc<MemoryMonitor>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn loader(mut self, loader: Arc<dyn ModelLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn factory(mut self, factory: Arc<dyn BackendFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn policy(mut self, policy: Box<dyn ConcurrencyPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Fill anything not supplied from the config: system memory, an isolated
    /// loader (or in-process when isolation is off), the HTTP runtime client.
    pub fn build(self) -> Result<InferenceEngine> {
        let options = self
            .options
            .unwrap_or_else(|| EngineOptions::from_config(&self.config));
        let memory = match self.memory {
            Some(memory) => memory,
            None => Arc::new(MemoryMonitor::from_config(&self.config.memory)),
        };
        let loader: Arc<dyn ModelLoader> = match self.loader {
            Some(loader) => loader,
            None if self.config.loader.isolation_enabled => Arc::new(LoaderSupervisor::new(
                WorkerCommand::from_config(&self.config.loader)?,
            )),
            None => Arc::new(InProcessLoader::default()),
        };
        let factory: Arc<dyn BackendFactory> = match self.factory {
            Some(factory) => factory,
            None => Arc::new(RuntimeClientFactory::new(&self.config.backends)?),
        };
        let admission_config = AdmissionConfig::from_config(&self.config.concurrency);
        let admission = match self.policy {
            Some(policy) => AdmissionController::with_policy(admission_config, policy),
            None => AdmissionController::new(admission_config),
        };

        Ok(InferenceEngine {
            options,
            memory,
            loader,
            factory,
            compatibility: Arc::new(CompatibilityRegistry::new(
                self.config.storage.compatibility_path(),
            )),
            autotune: Arc::new(AutotuneRegistry::new(self.config.storage.autotune_path())),
            admission,
            perf: Arc::new(PerfRegistry::new()),
            state: Mutex::new(EngineState::default()),
            model_locks: Mutex::new(HashMap::new()),
        })
    }
}

pub struct InferenceEngine {
    options: EngineOptions,
    memory: Arc<MemoryMonitor>,
    loader: Arc<dyn ModelLoader>,
    factory: Arc<dyn BackendFactory>,
    compatibility: Arc<CompatibilityRegistry>,
    autotune: Arc<AutotuneRegistry>,
    admission: AdmissionController,
    perf: Arc<PerfRegistry>,
    state: Mutex<EngineState>,
    model_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl InferenceEngine {
    pub fn builder(config: LmxConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn from_config(config: &LmxConfig) -> Result<Self> {
        EngineBuilder::new(config.clone()).build()
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn compatibility(&self) -> &CompatibilityRegistry {
        &self.compatibility
    }

    pub fn autotune(&self) -> &AutotuneRegistry {
        &self.autotune
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn model_lock(&self, model_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.model_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(model_id.to_string())
            .or_default()
            .clone()
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Admit, probe in isolation, build the backend handle, run the canary,
    /// then register the model as routable.
    ///
    /// Candidates are tried in policy order. When all of them fail the model
    /// records one failure toward quarantine and the last [`LoaderFailure`]
    /// is returned.
    pub async fn load_model(&self, model_id: &str, options: LoadOptions) -> Result<ModelInfo> {
        validate_model_id(model_id)?;
        let lock = self.model_lock(model_id);
        let _serial = lock.lock().await;

        {
            let mut st = self.state();
            let record = st.readiness.get(model_id);
            if record.state == ReadinessState::Quarantined {
                return Err(EngineError::Quarantined {
                    model_id: model_id.to_string(),
                    reason: record.reason.unwrap_or_else(|| "quarantined".into()),
                });
            }
            if let Some(model) = st.models.get_mut(model_id) {
                let now = Instant::now();
                model.last_used = now;
                return Ok(model.info(model_id, now));
            }
        }

        let candidates = self
            .candidates(model_id, options.allow_failed, options.backend)
            .await?;
        // Must run before `admit_memory`, which can evict.
        let candidates = match self.supported_candidates(model_id, candidates) {
            Ok(candidates) => candidates,
            Err(err) => {
                self.state().readiness.set_state(
                    model_id,
                    ReadinessState::Unloaded,
                    err.code().map(|c| c.as_str().to_string()),
                );
                return Err(err);
            }
        };
        let estimate = options.memory_estimate_gb.filter(|gb| *gb > 0.0).or_else(|| {
            options
                .performance_overrides
                .get("memory_estimate_gb")
                .and_then(serde_json::Value::as_f64)
                .filter(|gb| *gb > 0.0)
        });
        let _reservation = self.admit_memory(model_id, estimate).await?;
        self.state()
            .readiness
            .set_state(model_id, ReadinessState::Admitted, None);

        let mut overrides = options.performance_overrides.clone();
        if let Some(gb) = estimate {
            overrides.insert("memory_estimate_gb".into(), json!(gb));
        }

        let mut last_failure: Option<LoaderFailure> = None;

        for kind in candidates {
            let spec = LoadSpec {
                model_id: model_id.to_string(),
                backend: kind.as_str().to_string(),
                use_batching: options.use_batching,
                performance_overrides: overrides.clone(),
                probe_only: false,
            };
            let version = self.factory.backend_version(kind);
            self.state().readiness.set_state(
                model_id,
                ReadinessState::Loading,
                Some(kind.as_str().to_string()),
            );

            match self.attempt(kind, &spec).await {
                Ok((backend, telemetry)) => {
                    self.record_compat(
                        CompatibilityEntry::new(model_id, kind.as_str(), &version, CompatOutcome::Pass)
                            .with_metadata(telemetry),
                    )
                    .await;

                    let now = Instant::now();
                    let model = LoadedModel {
                        backend,
                        kind,
                        backend_version: version.clone(),
                        loaded_at: Utc::now(),
                        last_used: now,
                        request_count: 0,
                        estimated_memory_gb: estimate,
                        keep_alive_sec: options.keep_alive_sec,
                        active: Arc::new(AtomicUsize::new(0)),
                    };
                    let info = model.info(model_id, now);
                    {
                        let mut st = self.state();
                        st.models.insert(model_id.to_string(), model);
                        st.readiness
                            .set_state(model_id, ReadinessState::Routable, None);
                    }
                    self.perf.reset(model_id);
                    info!(model_id, backend = %kind, backend_version = %version, "model_loaded");
                    return Ok(info);
                }
                Err(AttemptError::Loader(failure)) => {
                    warn!(
                        model_id,
                        backend = %kind,
                        code = %failure.code,
                        exit_code = ?failure.exit_code,
                        signal = ?failure.signal,
                        message = %failure.message,
                        "loader_failed"
                    );
                    let mut metadata = failure.metadata.clone();
                    metadata.insert("message".into(), json!(failure.message));
                    self.record_compat(
                        CompatibilityEntry::new(model_id, kind.as_str(), &version, CompatOutcome::Fail)
                            .with_reason(failure.code.as_str())
                            .with_metadata(metadata),
                    )
                    .await;
                    last_failure = Some(failure);
                }
                Err(AttemptError::Abort(err)) => {
                    self.state().readiness.set_state(
                        model_id,
                        ReadinessState::Unloaded,
                        Some(err.to_string()),
                    );
                    return Err(err);
                }
            }
        }

        let Some(failure) = last_failure else {
            let err = EngineError::Admission {
                code: ErrorCode::ModelUnsupportedBackend,
                message: format!("No backend can serve '{model_id}'"),
            };
            self.state().readiness.set_state(
                model_id,
                ReadinessState::Unloaded,
                err.code().map(|c| c.as_str().to_string()),
            );
            return Err(err);
        };

        let (quarantined, crash_count) = {
            let mut st = self.state();
            st.readiness.set_state(
                model_id,
                ReadinessState::Unloaded,
                Some(failure.code.as_str().to_string()),
            );
            let quarantined = st.readiness.mark_failure(
                model_id,
                failure.code.as_str(),
                self.options.quarantine_threshold,
            );
            (quarantined, st.readiness.get(model_id).crash_count)
        };
        if quarantined {
            warn!(model_id, crash_count, code = %failure.code, "model_quarantined");
        }
        Err(EngineError::LoadFailed {
            model_id: model_id.to_string(),
            failure,
        })
    }

    /// One candidate: isolated probe, handle construction, memory re-check, canary.
    async fn attempt(
        &self,
        kind: BackendKind,
        spec: &LoadSpec,
    ) -> std::result::Result<(Arc<dyn Backend>, Metadata), AttemptError> {
        let result = self
            .loader
            .run(spec, self.options.loader_timeout)
            .await
            .into_result()
            .map_err(AttemptError::Loader)?;

        let backend = self.factory.create(kind, spec).await.map_err(|e| {
            AttemptError::Loader(
                LoaderFailure::new(
                    ErrorCode::ModelNotReady,
                    format!("Failed to start {kind} backend: {e}"),
                )
                .with_metadata("backend", kind.as_str())
                .with_metadata("model_id", spec.model_id.as_str()),
            )
        })?;

        self.memory.invalidate();
        if self.memory.threshold_exceeded() {
            backend.close().await;
            return Err(AttemptError::Abort(EngineError::InsufficientMemory {
                model_id: spec.model_id.clone(),
                message: format!(
                    "memory usage {:.1}% reached the {:.0}% threshold after loading",
                    self.memory.usage_percent(),
                    self.memory.threshold_percent()
                ),
            }));
        }

        if self.options.canary_enabled {
            self.state()
                .readiness
                .set_state(&spec.model_id, ReadinessState::CanaryPending, None);
            if let Err(reason) = self.run_canary(backend.as_ref()).await {
                backend.close().await;
                return Err(AttemptError::Loader(
                    LoaderFailure::new(ErrorCode::ModelCanaryFailed, reason)
                        .with_metadata("backend", kind.as_str())
                        .with_metadata("model_id", spec.model_id.as_str()),
                ));
            }
        }

        Ok((backend, result.telemetry))
    }

    async fn run_canary(&self, backend: &dyn Backend) -> std::result::Result<(), String> {
        let messages = [ChatMessage::user(CANARY_PROMPT)];
        let params = GenerationParams {
            max_tokens: Some(CANARY_MAX_TOKENS),
            temperature: Some(0.0),
            ..Default::default()
        };
        match tokio::time::timeout(
            self.options.inference_timeout,
            backend.generate(&messages, &params),
        )
        .await
        {
            Ok(Ok(output)) if !output.text.trim().is_empty() => Ok(()),
            Ok(Ok(_)) => Err("Canary returned empty output".into()),
            Ok(Err(e)) => Err(format!("Canary generation failed: {e}")),
            Err(_) => Err(format!(
                "Canary timed out after {}s",
                self.options.inference_timeout.as_secs()
            )),
        }
    }

    /// Reserve memory for a cold load, evicting LRU models while allowed.
    async fn admit_memory(
        &self,
        model_id: &str,
        estimate_gb: Option<f64>,
    ) -> Result<Reservation<'_>> {
        loop {
            {
                let mut st = self.state();
                let reserved: f64 = st.reservations.values().sum();
                if self.memory.can_load_with_reserved(estimate_gb, reserved) {
                    st.reservations.insert(
                        model_id.to_string(),
                        estimate_gb.map_or(0.0, |gb| gb * MEMORY_SAFETY_MARGIN),
                    );
                    return Ok(Reservation {
                        state: &self.state,
                        model_id: model_id.to_string(),
                    });
                }
            }

            if !self.options.auto_evict_lru {
                break;
            }
            let Some(victim) = self.lru_candidate(model_id) else {
                break;
            };
            match self.evict_if(&victim, "lru", |_| true).await {
                Some(info) => {
                    info!(model_id = %victim, for_model = model_id, idle_secs = info.idle_secs, "lru_eviction");
                    self.memory.invalidate();
                }
                None => break,
            }
        }

        Err(EngineError::InsufficientMemory {
            model_id: model_id.to_string(),
            message: format!(
                "loading would exceed the {:.0}% memory threshold ({:.1}% in use)",
                self.memory.threshold_percent(),
                self.memory.usage_percent()
            ),
        })
    }

    fn lru_candidate(&self, exclude: &str) -> Option<String> {
        self.state()
            .models
            .iter()
            .filter(|(id, m)| id.as_str() != exclude && !m.is_busy())
            .min_by_key(|(_, m)| m.last_used)
            .map(|(id, _)| id.clone())
    }

    /// Remove a model if its lock is free, it has no active requests and
    /// `evictable` still holds.
    async fn evict_if(
        &self,
        model_id: &str,
        reason: &str,
        evictable: impl Fn(&LoadedModel) -> bool,
    ) -> Option<ModelInfo> {
        let lock = self.model_lock(model_id);
        let Ok(_serial) = lock.try_lock() else {
            debug!(model_id, reason, "eviction_skipped_busy");
            return None;
        };
        let model = {
            let mut st = self.state();
            let ok = st
                .models
                .get(model_id)
                .is_some_and(|m| !m.is_busy() && evictable(m));
            if !ok {
                return None;
            }
            let model = st.models.remove(model_id)?;
            st.readiness.set_state(
                model_id,
                ReadinessState::Unloaded,
                Some(format!("evicted:{reason}")),
            );
            model
        };
        let info = model.info(model_id, Instant::now());
        self.perf.remove(model_id);
        model.backend.close().await;
        Some(info)
    }

    /// Release the backend and forget the model. `None` if it was not loaded.
    pub async fn unload_model(&self, model_id: &str) -> Option<ModelInfo> {
        let lock = self.model_lock(model_id);
        let _serial = lock.lock().await;
        let model = {
            let mut st = self.state();
            let model = st.models.remove(model_id)?;
            st.readiness
                .set_state(model_id, ReadinessState::Unloaded, Some("unloaded".into()));
            model
        };
        let info = model.info(model_id, Instant::now());
        self.perf.remove(model_id);
        model.backend.close().await;
        info!(model_id, backend = %model.kind, requests = info.request_count, "model_unloaded");
        Some(info)
    }

    /// Unload every model idle for strictly longer than its TTL.
    pub async fn evict_idle_models(&self, ttl: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut expired: Vec<String> = self
            .state()
            .models
            .iter()
            .filter(|(_, m)| m.is_expired(now, ttl))
            .map(|(id, _)| id.clone())
            .collect();
        expired.sort();

        let mut evicted = Vec::new();
        for model_id in expired {
            if let Some(info) = self
                .evict_if(&model_id, "ttl", |m| m.is_expired(Instant::now(), ttl))
                .await
            {
                info!(model_id = %model_id, idle_secs = info.idle_secs, ttl_secs = ttl.as_secs(), "ttl_eviction");
                evicted.push(model_id);
            }
        }
        evicted
    }

    /// Periodic TTL sweep until `cancel` fires.
    pub fn spawn_ttl_sweep(
        self: &Arc<Self>,
        ttl: Duration,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = engine.evict_idle_models(ttl).await;
                        debug!(evicted = evicted.len(), "ttl_sweep");
                    }
                }
            }
        })
    }

    // ── Generation ───────────────────────────────────────────────────

    fn adapt_concurrency(&self) {
        self.admission
            .adapt(self.memory.usage_percent(), self.memory.threshold_percent());
    }

    fn routable_backend(&self, model_id: &str) -> Result<(Arc<dyn Backend>, ActiveRequest)> {
        let mut st = self.state();
        let state = st.readiness.state(model_id);
        let Some(model) = st.models.get_mut(model_id) else {
            return Err(EngineError::NotLoaded {
                model_id: model_id.to_string(),
            });
        };
        if state != ReadinessState::Routable {
            return Err(EngineError::NotReady {
                model_id: model_id.to_string(),
                state: state.to_string(),
            });
        }
        model.last_used = Instant::now();
        model.request_count += 1;
        Ok((model.backend.clone(), ActiveRequest::enter(&model.active)))
    }

    /// Admission-gated completion. Errors here never touch readiness.
    pub async fn generate(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        params: &GenerationParams,
        client_id: Option<&str>,
    ) -> Result<GenerationOutput> {
        self.adapt_concurrency();
        let permit = self.admission.acquire(model_id, client_id).await?;
        let (backend, active) = self.routable_backend(model_id)?;

        let started = Instant::now();
        let result = match tokio::time::timeout(
            self.options.inference_timeout,
            backend.generate(messages, params),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(EngineError::InferenceTimeout {
                seconds: self.options.inference_timeout.as_secs(),
            }),
        };

        self.perf.record(
            model_id,
            PerfSample {
                ok: result.is_ok(),
                completion_tokens: result
                    .as_ref()
                    .map_or(0, |out| u64::from(out.completion_tokens)),
                latency: started.elapsed(),
                ttft: None,
                queue_wait: permit.queue_wait(),
            },
        );
        drop(active);
        drop(permit);

        if let Err(e) = &result {
            warn!(model_id, error = %e, "generation_failed");
        }
        result
    }

    /// Admission-gated token stream. The returned stream holds the request's
    /// permits until it ends; dropping it cancels the backend call.
    pub async fn stream_generate(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        params: &GenerationParams,
        client_id: Option<&str>,
    ) -> Result<GenerationStream> {
        self.adapt_concurrency();
        let permit = self.admission.acquire(model_id, client_id).await?;
        let (backend, active) = self.routable_backend(model_id)?;

        let started = Instant::now();
        let deadline = started + self.options.inference_timeout;
        let recorder = StreamRecorder {
            perf: self.perf.clone(),
            model_id: model_id.to_string(),
            started,
            queue_wait: permit.queue_wait(),
            first_token: None,
            tokens: 0,
            _active: active,
        };

        let inner = match tokio::time::timeout_at(deadline, backend.stream(messages, params)).await {
            Ok(Ok(inner)) => inner,
            Ok(Err(e)) => {
                warn!(model_id, error = %e, "generation_failed");
                recorder.finish(false);
                return Err(e);
            }
            Err(_) => {
                recorder.finish(false);
                return Err(EngineError::InferenceTimeout {
                    seconds: self.options.inference_timeout.as_secs(),
                });
            }
        };

        Ok(GenerationStream {
            inner,
            deadline: tokio::time::sleep_until(deadline),
            timeout: self.options.inference_timeout,
            recorder: Some(recorder),
            permit: Some(permit),
        })
    }

    // ── Introspection ────────────────────────────────────────────────

    pub fn is_model_loaded(&self, model_id: &str) -> bool {
        self.state().models.contains_key(model_id)
    }

    pub fn loaded_models(&self) -> Vec<ModelInfo> {
        let now = Instant::now();
        let mut models: Vec<ModelInfo> = self
            .state()
            .models
            .iter()
            .map(|(id, m)| m.info(id, now))
            .collect();
        models.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        models
    }

    pub fn model_readiness(&self, model_id: &str) -> ReadinessRecord {
        self.state().readiness.get(model_id)
    }

    pub fn readiness_snapshot(&self) -> HashMap<String, ReadinessRecord> {
        self.state().readiness.snapshot()
    }

    /// Operator reset. Lifts quarantine and zeroes the crash count.
    pub fn reset_readiness(&self, model_id: &str) -> bool {
        let cleared = self.state().readiness.clear(model_id);
        if cleared {
            info!(model_id, "readiness_reset");
        }
        cleared
    }

    pub fn in_flight_count(&self) -> usize {
        self.admission.in_flight()
    }

    pub fn waiting_count(&self) -> usize {
        self.admission.waiting()
    }

    pub fn current_concurrency_limit(&self) -> usize {
        self.admission.current_limit()
    }

    /// Wait for in-flight requests to finish. `false` on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.admission.wait_idle(timeout).await
    }

    /// Drain, then unload everything.
    pub async fn shutdown(&self, drain_timeout: Duration) -> bool {
        let drained = self.drain(drain_timeout).await;
        if !drained {
            warn!(in_flight = self.in_flight_count(), "drain_timeout");
        }
        let ids: Vec<String> = self.state().models.keys().cloned().collect();
        for model_id in ids {
            self.unload_model(&model_id).await;
        }
        drained
    }

    pub fn memory_status(&self) -> MemoryStatus {
        self.memory.get_status()
    }

    // ── Backend policy, probing, autotune ────────────────────────────

    async fn candidates(
        &self,
        model_id: &str,
        allow_failed: bool,
        preferred: Option<BackendKind>,
    ) -> Result<Vec<BackendKind>> {
        let registry = self.compatibility.clone();
        let model_id = model_id.to_string();
        let order = self.options.preference_order.clone();
        tokio::task::spawn_blocking(move || {
            backend_candidates(&model_id, &order, &registry, allow_failed, preferred)
        })
        .await
        .map_err(join_error)?
    }

    /// Drop candidates this host cannot run when architecture checks are on.
    ///
    /// Fails with the first rejection when nothing is left.
    fn supported_candidates(
        &self,
        model_id: &str,
        candidates: Vec<BackendKind>,
    ) -> Result<Vec<BackendKind>> {
        if !self.options.enforce_architecture {
            return Ok(candidates);
        }
        let mut rejected: Option<EngineError> = None;
        let mut supported = Vec::with_capacity(candidates.len());
        for kind in candidates {
            match validate_architecture(kind) {
                Ok(()) => supported.push(kind),
                Err(e) => {
                    warn!(model_id, backend = %kind, error = %e, "backend_rejected");
                    rejected.get_or_insert(e);
                }
            }
        }
        match rejected {
            Some(err) if supported.is_empty() => Err(err),
            _ => Ok(supported),
        }
    }

    async fn record_compat(&self, entry: CompatibilityEntry) {
        let registry = self.compatibility.clone();
        match tokio::task::spawn_blocking(move || registry.record(entry)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "compatibility_write_failed"),
            Err(e) => warn!(error = %e, "compatibility_write_failed"),
        }
    }

    /// Probe every candidate backend in probe-only mode. Nothing is loaded;
    /// conclusive outcomes are written to the compatibility ledger.
    pub async fn probe_model_backends(&self, model_id: &str) -> Result<ProbeReport> {
        validate_model_id(model_id)?;
        let candidates = self.candidates(model_id, true, None).await?;
        let mut results = Vec::with_capacity(candidates.len());

        for kind in candidates {
            if self.options.enforce_architecture
                && let Err(e) = validate_architecture(kind)
            {
                results.push(BackendProbeResult {
                    backend: kind,
                    outcome: ProbeOutcome::Fail,
                    reason: e.code().map(|c| c.as_str().to_string()),
                });
                continue;
            }

            let spec = LoadSpec::new(model_id, kind.as_str()).probe_only();
            let version = self.factory.backend_version(kind);
            let result = match self.loader.run(&spec, self.options.loader_timeout).await {
                LoaderOutcome::Success(_) => BackendProbeResult {
                    backend: kind,
                    outcome: ProbeOutcome::Pass,
                    reason: None,
                },
                LoaderOutcome::Timeout(f) => BackendProbeResult {
                    backend: kind,
                    outcome: ProbeOutcome::Unknown,
                    reason: Some(f.code.as_str().to_string()),
                },
                LoaderOutcome::Crashed(f) | LoaderOutcome::Failed(f) => BackendProbeResult {
                    backend: kind,
                    outcome: ProbeOutcome::Fail,
                    reason: Some(f.code.as_str().to_string()),
                },
            };

            let ledger_outcome = match result.outcome {
                ProbeOutcome::Pass => Some(CompatOutcome::Pass),
                ProbeOutcome::Fail => Some(CompatOutcome::Fail),
                ProbeOutcome::Unknown => None,
            };
            if let Some(outcome) = ledger_outcome {
                let mut metadata = Metadata::new();
                metadata.insert("probe_only".into(), json!(true));
                let mut entry = CompatibilityEntry::new(model_id, kind.as_str(), &version, outcome)
                    .with_metadata(metadata);
                if let Some(reason) = &result.reason {
                    entry = entry.with_reason(reason.as_str());
                }
                self.record_compat(entry).await;
            }
            results.push(result);
        }

        let recommended_backend = results
            .iter()
            .find(|r| r.outcome == ProbeOutcome::Pass)
            .map(|r| r.backend);
        info!(model_id, recommended = ?recommended_backend, "backend_probe_completed");
        Ok(ProbeReport {
            model_id: model_id.to_string(),
            candidates: results,
            recommended_backend,
        })
    }

    /// Running metrics since the model was last loaded.
    pub fn performance_metrics(&self, model_id: &str) -> Option<AutotuneMetrics> {
        self.perf.window(model_id).map(|w| w.to_metrics())
    }

    /// Score the current window for `profile` and keep it if it beats the
    /// stored best. Returns the score.
    pub async fn commit_tuned_profile(&self, model_id: &str, profile: Metadata) -> Result<f64> {
        let (kind, version) = self
            .state()
            .models
            .get(model_id)
            .map(|m| (m.kind, m.backend_version.clone()))
            .ok_or_else(|| EngineError::NotLoaded {
                model_id: model_id.to_string(),
            })?;
        let metrics = self.performance_metrics(model_id).unwrap_or_default();
        let registry = self.autotune.clone();
        let id = model_id.to_string();
        let score = tokio::task::spawn_blocking(move || {
            registry.save_scored_profile(&id, kind.as_str(), &version, profile, metrics)
        })
        .await
        .map_err(join_error)??;
        info!(model_id, backend = %kind, score, "autotune_profile_scored");
        Ok(score)
    }

    pub async fn get_tuned_profile(
        &self,
        model_id: &str,
        backend: Option<BackendKind>,
    ) -> Result<Option<AutotuneRecord>> {
        let registry = self.autotune.clone();
        let id = model_id.to_string();
        tokio::task::spawn_blocking(move || {
            registry.best_for_model(&id, backend.map(|b| b.as_str()))
        })
        .await
        .map_err(join_error)
    }
}

fn join_error(err: tokio::task::JoinError) -> EngineError {
    EngineError::backend(format!("background task failed: {err}"))
}

fn validate_model_id(model_id: &str) -> Result<()> {
    if model_id.trim().is_empty() {
        return Err(EngineError::InvalidModelId("model id must not be empty".into()));
    }
    if model_id.chars().any(char::is_control) {
        return Err(EngineError::InvalidModelId(format!(
            "model id contains control characters: {model_id:?}"
        )));
    }
    Ok(())
}

/// Per-stream accounting, written to the perf window once the stream settles.
struct StreamRecorder {
    perf: Arc<PerfRegistry>,
    model_id: String,
    started: Instant,
    queue_wait: Duration,
    first_token: Option<Duration>,
    tokens: u64,
    _active: ActiveRequest,
}

impl StreamRecorder {
    fn on_token(&mut self) {
        self.tokens += 1;
        if self.first_token.is_none() {
            self.first_token = Some(self.started.elapsed());
        }
    }

    fn finish(self, ok: bool) {
        self.perf.record(
            &self.model_id,
            PerfSample {
                ok,
                completion_tokens: self.tokens,
                latency: self.started.elapsed(),
                ttft: self.first_token,
                queue_wait: self.queue_wait,
            },
        );
    }
}

pin_project! {
    /// Tokens for one admitted request.
    ///
    /// Permits are released as soon as the stream ends, fails or passes the
    /// inference deadline, and on drop otherwise.
    pub struct GenerationStream {
        inner: TokenStream,
        #[pin]
        deadline: Sleep,
        timeout: Duration,
        recorder: Option<StreamRecorder>,
        permit: Option<RequestPermit>,
    }
}

impl GenerationStream {
    /// `false` once the stream has settled and released its permits.
    pub fn is_active(&self) -> bool {
        self.permit.is_some()
    }
}

impl Stream for GenerationStream {
    type Item = Result<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if this.permit.is_none() {
            return Poll::Ready(None);
        }

        let settle = |inner: &mut TokenStream,
                      recorder: &mut Option<StreamRecorder>,
                      permit: &mut Option<RequestPermit>,
                      ok: bool| {
            *inner = Box::pin(futures::stream::empty());
            if let Some(recorder) = recorder.take() {
                recorder.finish(ok);
            }
            permit.take();
        };

        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(token))) => {
                if let Some(recorder) = this.recorder.as_mut() {
                    recorder.on_token();
                }
                return Poll::Ready(Some(Ok(token)));
            }
            Poll::Ready(Some(Err(e))) => {
                settle(this.inner, this.recorder, this.permit, false);
                return Poll::Ready(Some(Err(e)));
            }
            Poll::Ready(None) => {
                settle(this.inner, this.recorder, this.permit, true);
                return Poll::Ready(None);
            }
            Poll::Pending => {}
        }

        if this.deadline.poll(cx).is_ready() {
            settle(this.inner, this.recorder, this.permit, false);
            return Poll::Ready(Some(Err(EngineError::InferenceTimeout {
                seconds: this.timeout.as_secs(),
            })));
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBackendFactory, MockBehavior};
    use crate::memory::StaticMemorySource;
    use tempfile::TempDir;

    fn engine(dir: &TempDir, factory: Arc<MockBackendFactory>) -> InferenceEngine {
        engine_with(dir, factory, |_| {})
    }

    fn engine_with(
        dir: &TempDir,
        factory: Arc<MockBackendFactory>,
        tweak: impl FnOnce(&mut EngineOptions),
    ) -> InferenceEngine {
        let mut config = LmxConfig::default();
        config.storage.data_dir = Some(dir.path().to_path_buf());
        config.concurrency.semaphore_timeout_secs = 0.2;
        config.concurrency.adaptive_concurrency_enabled = false;
        let mut options = EngineOptions {
            enforce_architecture: false,
            ..EngineOptions::from_config(&config)
        };
        tweak(&mut options);
        InferenceEngine::builder(config)
            .options(options)
            .memory(Arc::new(MemoryMonitor::with_source(
                Arc::new(StaticMemorySource::new(64.0, 8.0)),
                90.0,
                Duration::ZERO,
            )))
            .loader(Arc::new(InProcessLoader::default()))
            .factory(factory)
            .build()
            .unwrap()
    }

    #[test]
    fn test_validate_model_id() {
        assert!(validate_model_id("mlx-community/Qwen").is_ok());
        assert!(matches!(
            validate_model_id("  "),
            Err(EngineError::InvalidModelId(_))
        ));
        assert!(validate_model_id("a\nb").is_err());
    }

    #[tokio::test]
    async fn test_load_generate_unload() {
        let dir = TempDir::new().unwrap();
        let factory = Arc::new(MockBackendFactory::default());
        let engine = engine(&dir, factory.clone());

        let info = engine
            .load_model("mlx-community/Qwen", LoadOptions::default())
            .await
            .unwrap();
        assert_eq!(info.backend, BackendKind::VllmMlx);
        assert_eq!(info.backend_version, "mock-1");
        assert!(engine.model_readiness("mlx-community/Qwen").state == ReadinessState::Routable);

        let out = engine
            .generate(
                "mlx-community/Qwen",
                &[ChatMessage::user("hi")],
                &GenerationParams::default(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.text, "OK");
        assert_eq!(engine.loaded_models()[0].request_count, 1);
        assert_eq!(engine.in_flight_count(), 0);

        let unloaded = engine.unload_model("mlx-community/Qwen").await.unwrap();
        assert_eq!(unloaded.request_count, 1);
        assert!(!engine.is_model_loaded("mlx-community/Qwen"));
        assert_eq!(
            engine.model_readiness("mlx-community/Qwen").state,
            ReadinessState::Unloaded
        );
        assert!(engine.unload_model("mlx-community/Qwen").await.is_none());
    }

    #[tokio::test]
    async fn test_second_load_returns_existing() {
        let dir = TempDir::new().unwrap();
        let factory = Arc::new(MockBackendFactory::default());
        let engine = engine(&dir, factory.clone());
        engine.load_model("m", LoadOptions::default()).await.unwrap();
        engine.load_model("m", LoadOptions::default()).await.unwrap();
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn test_canary_failure_is_loader_failure() {
        let dir = TempDir::new().unwrap();
        let factory = Arc::new(MockBackendFactory::new(MockBehavior {
            empty_reply: true,
            ..Default::default()
        }));
        let engine = engine(&dir, factory.clone());

        let err = engine
            .load_model("m", LoadOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ModelCanaryFailed));
        assert!(!engine.is_model_loaded("m"));
        assert_eq!(engine.model_readiness("m").crash_count, 1);

        let ledger = engine.compatibility().entries_for("m");
        assert_eq!(ledger.len(), 2);
        assert!(ledger.iter().all(|e| e.outcome == CompatOutcome::Fail));
    }

    #[tokio::test]
    async fn test_factory_failure_is_not_ready() {
        let dir = TempDir::new().unwrap();
        let factory = Arc::new(MockBackendFactory::default());
        factory.set_fail_create(true);
        let engine = engine(&dir, factory);
        let err = engine
            .load_model("TheBloke/Llama-GGUF", LoadOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ModelNotReady));
    }

    #[tokio::test]
    async fn test_generate_errors_leave_readiness_alone() {
        let dir = TempDir::new().unwrap();
        let factory = Arc::new(MockBackendFactory::new(MockBehavior {
            fail_generate: true,
            ..Default::default()
        }));
        let engine = engine_with(&dir, factory, |o| o.canary_enabled = false);
        engine.load_model("m", LoadOptions::default()).await.unwrap();

        for _ in 0..3 {
            let err = engine
                .generate("m", &[], &GenerationParams::default(), None)
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::Inference(_)));
        }
        let record = engine.model_readiness("m");
        assert_eq!(record.state, ReadinessState::Routable);
        assert_eq!(record.crash_count, 0);
        assert_eq!(engine.in_flight_count(), 0);
        assert_eq!(engine.performance_metrics("m").unwrap().error_rate, 1.0);

        let err = engine
            .generate("other", &[], &GenerationParams::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotLoaded { .. }));
    }

    #[tokio::test]
    async fn test_quarantined_load_is_refused_until_reset() {
        let dir = TempDir::new().unwrap();
        let factory = Arc::new(MockBackendFactory::default());
        factory.set_fail_create(true);
        let engine = engine(&dir, factory.clone());

        for _ in 0..3 {
            assert!(engine.load_model("m", LoadOptions::default()).await.is_err());
        }
        assert_eq!(engine.model_readiness("m").state, ReadinessState::Quarantined);
        let err = engine
            .load_model("m", LoadOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ModelUnstable));
        assert_eq!(err.status(), 409);

        factory.set_fail_create(false);
        assert!(engine.reset_readiness("m"));
        engine
            .load_model("m", LoadOptions { allow_failed: true, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(engine.model_readiness("m").crash_count, 0);
    }

    #[tokio::test]
    async fn test_probe_reports_and_records() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, Arc::new(MockBackendFactory::default()));
        let report = engine.probe_model_backends("m").await.unwrap();
        assert_eq!(report.candidates.len(), 2);
        assert!(report.candidates.iter().all(|c| c.outcome == ProbeOutcome::Pass));
        assert_eq!(report.recommended_backend, Some(BackendKind::VllmMlx));
        assert!(!engine.is_model_loaded("m"));
        assert_eq!(engine.compatibility().entries_for("m").len(), 2);
    }

    #[tokio::test]
    async fn test_commit_tuned_profile() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, Arc::new(MockBackendFactory::default()));
        let mut profile = Metadata::new();
        profile.insert("max_batch".into(), json!(4));
        assert!(matches!(
            engine.commit_tuned_profile("m", profile.clone()).await,
            Err(EngineError::NotLoaded { .. })
        ));

        engine.load_model("m", LoadOptions::default()).await.unwrap();
        engine
            .generate("m", &[ChatMessage::user("hi")], &GenerationParams::default(), None)
            .await
            .unwrap();
        engine.commit_tuned_profile("m", profile).await.unwrap();

        let best = engine.get_tuned_profile("m", None).await.unwrap().unwrap();
        assert_eq!(best.backend, "vllm-mlx");
        assert_eq!(best.profile["max_batch"], 4);
        assert_eq!(best.metrics.requests, 1);
    }
}
