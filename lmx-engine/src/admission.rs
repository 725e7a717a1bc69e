//! Three-level request admission: global, per-model, per-client.
//!
//! Every slot is an owned semaphore permit held by a [`RequestPermit`]; the
//! in-flight counter lives in the same guard, so dropping the permit on any
//! exit path (return, error, cancellation) releases everything at once.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

use crate::error::{EngineError, Result};

/// Minimum latency samples before p95 influences the limit.
const MIN_LATENCY_SAMPLES: usize = 8;
const LATENCY_HIGH_WATERMARK: f64 = 1.25;
const LATENCY_LOW_WATERMARK: f64 = 0.70;

pub const ANONYMOUS_CLIENT: &str = "anonymous";

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub max_concurrent_requests: usize,
    pub semaphore_timeout: Duration,
    pub per_model_limits: HashMap<String, usize>,
    pub per_client_default: Option<usize>,
    pub per_client_overrides: HashMap<String, usize>,
    pub adaptive_enabled: bool,
    pub latency_target_ms: f64,
    pub latency_window: usize,
    pub min_concurrent_requests: usize,
}

impl AdmissionConfig {
    pub fn from_config(config: &lmx_core::ConcurrencyConfig) -> Self {
        Self {
            max_concurrent_requests: config.max_concurrent_requests.max(1),
            semaphore_timeout: Duration::from_secs_f64(config.semaphore_timeout_secs.max(0.001)),
            per_model_limits: config.per_model_concurrency_limits.clone(),
            per_client_default: config.per_client_default_concurrency,
            per_client_overrides: config.per_client_concurrency_overrides.clone(),
            adaptive_enabled: config.adaptive_concurrency_enabled,
            latency_target_ms: config.adaptive_latency_target_ms,
            latency_window: config.adaptive_latency_window.max(1),
            min_concurrent_requests: config.adaptive_min_concurrent_requests.max(1),
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self::from_config(&lmx_core::ConcurrencyConfig::default())
    }
}

/// Inputs to a concurrency decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConcurrencySignals {
    pub current_limit: usize,
    pub max_limit: usize,
    pub min_limit: usize,
    pub memory_usage_percent: f64,
    pub memory_threshold_percent: f64,
    pub p95_latency_ms: Option<f64>,
    pub latency_samples: usize,
    pub latency_target_ms: f64,
    pub waiting: usize,
}

/// Decides the effective global limit. The result is clamped by the caller.
pub trait ConcurrencyPolicy: Send + Sync {
    fn next_limit(&self, signals: &ConcurrencySignals) -> usize;
}

/// Memory pressure tiers, then one step up or down on p95 latency.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryLatencyPolicy;

impl ConcurrencyPolicy for MemoryLatencyPolicy {
    fn next_limit(&self, s: &ConcurrencySignals) -> usize {
        let ratio = if s.memory_threshold_percent > 0.0 {
            s.memory_usage_percent / s.memory_threshold_percent
        } else {
            1.0
        };
        let mut target = if ratio < 0.70 {
            s.max_limit
        } else if ratio < 0.85 {
            (s.max_limit * 3 / 4).max(1)
        } else if ratio < 0.95 {
            (s.max_limit / 2).max(1)
        } else {
            s.min_limit
        };

        // Latency steps move from the current limit, never above the memory tier.
        if let Some(p95) = s.p95_latency_ms
            && s.latency_samples >= MIN_LATENCY_SAMPLES
            && s.latency_target_ms > 0.0
        {
            let current = s.current_limit.min(target);
            target = if p95 > s.latency_target_ms * LATENCY_HIGH_WATERMARK {
                current.saturating_sub(1)
            } else if p95 < s.latency_target_ms * LATENCY_LOW_WATERMARK && s.waiting > 0 {
                (s.current_limit + 1).min(target)
            } else {
                current
            };
        }
        target
    }
}

#[derive(Debug)]
struct LimitState {
    limit: usize,
    /// Permits still owed to the semaphore after a shrink below current use.
    debt: usize,
}

struct Shared {
    global: Arc<Semaphore>,
    limit: Mutex<LimitState>,
    in_flight: AtomicUsize,
    waiting: AtomicUsize,
    idle: Notify,
    latencies: Mutex<VecDeque<f64>>,
    latency_window: usize,
}

impl Shared {
    /// Returns `true` if the caller should forget its global permit.
    fn take_debt(&self) -> bool {
        let mut st = self.limit.lock().unwrap_or_else(|e| e.into_inner());
        if st.debt > 0 {
            st.debt -= 1;
            true
        } else {
            false
        }
    }

    fn record_latency(&self, ms: f64) {
        let mut window = self.latencies.lock().unwrap_or_else(|e| e.into_inner());
        window.push_back(ms);
        while window.len() > self.latency_window {
            window.pop_front();
        }
    }
}

/// Decrements `waiting` when a pending acquisition ends, however it ends.
struct WaitGuard<'a>(&'a AtomicUsize);

impl<'a> WaitGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// All slots held by one admitted request.
pub struct RequestPermit {
    shared: Arc<Shared>,
    global: Option<OwnedSemaphorePermit>,
    _model: Option<OwnedSemaphorePermit>,
    _client: Option<OwnedSemaphorePermit>,
    admitted_at: Instant,
    queue_wait: Duration,
}

impl RequestPermit {
    /// Time spent waiting for slots before admission.
    pub fn queue_wait(&self) -> Duration {
        self.queue_wait
    }

    pub fn admitted_at(&self) -> Instant {
        self.admitted_at
    }
}

impl Drop for RequestPermit {
    fn drop(&mut self) {
        self.shared
            .record_latency(self.admitted_at.elapsed().as_secs_f64() * 1000.0);
        if let Some(permit) = self.global.take()
            && self.shared.take_debt()
        {
            permit.forget();
        }
        if self.shared.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shared.idle.notify_waiters();
        }
    }
}

pub struct AdmissionController {
    config: AdmissionConfig,
    shared: Arc<Shared>,
    model_slots: Mutex<HashMap<String, Arc<Semaphore>>>,
    client_slots: Mutex<HashMap<String, Arc<Semaphore>>>,
    policy: Box<dyn ConcurrencyPolicy>,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        Self::with_policy(config, Box::new(MemoryLatencyPolicy))
    }

    pub fn with_policy(config: AdmissionConfig, policy: Box<dyn ConcurrencyPolicy>) -> Self {
        let max = config.max_concurrent_requests.max(1);
        let shared = Arc::new(Shared {
            global: Arc::new(Semaphore::new(max)),
            limit: Mutex::new(LimitState {
                limit: max,
                debt: 0,
            }),
            in_flight: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            idle: Notify::new(),
            latencies: Mutex::new(VecDeque::new()),
            latency_window: config.latency_window.max(1),
        });
        Self {
            config,
            shared,
            model_slots: Mutex::new(HashMap::new()),
            client_slots: Mutex::new(HashMap::new()),
            policy,
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    pub fn waiting(&self) -> usize {
        self.shared.waiting.load(Ordering::SeqCst)
    }

    pub fn current_limit(&self) -> usize {
        self.shared
            .limit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .limit
    }

    /// Effective per-model cap, or `None` when only the global cap applies.
    pub fn model_limit(&self, model_id: &str) -> Option<usize> {
        let max = self.config.max_concurrent_requests;
        self.config
            .per_model_limits
            .get(model_id)
            .map(|l| (*l).clamp(1, max))
            .filter(|l| *l < max)
    }

    /// Effective per-client cap, or `None` when client fairness is off.
    pub fn client_limit(&self, client_key: &str) -> Option<usize> {
        self.config
            .per_client_overrides
            .get(client_key)
            .copied()
            .or(self.config.per_client_default)
            .map(|l| l.clamp(1, self.config.max_concurrent_requests))
    }

    /// Number of client buckets currently tracked.
    pub fn client_slot_count(&self) -> usize {
        self.client_slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Shared semaphore for `key`, created on first use.
    ///
    /// Inserting a new key first drops buckets nobody holds or waits on: a
    /// permit or a pending `acquire_owned` keeps its own `Arc`, so a strong
    /// count of one means the bucket is idle and at full capacity.
    fn slot(
        map: &Mutex<HashMap<String, Arc<Semaphore>>>,
        key: &str,
        limit: usize,
    ) -> Arc<Semaphore> {
        let mut slots = map.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sem) = slots.get(key) {
            return sem.clone();
        }
        slots.retain(|_, sem| Arc::strong_count(sem) > 1);
        slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(limit)))
            .clone()
    }

    async fn acquire_slot(&self, sem: Arc<Semaphore>, scope: &str) -> Result<OwnedSemaphorePermit> {
        let _waiting = WaitGuard::enter(&self.shared.waiting);
        match tokio::time::timeout(self.config.semaphore_timeout, sem.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(EngineError::busy(format!("{scope} slots are closed"))),
            Err(_) => {
                warn!(
                    scope,
                    timeout_sec = self.config.semaphore_timeout.as_secs_f64(),
                    in_flight = self.in_flight(),
                    "semaphore_timeout"
                );
                Err(EngineError::busy(format!(
                    "timed out waiting for a {scope} slot after {:.1}s",
                    self.config.semaphore_timeout.as_secs_f64()
                )))
            }
        }
    }

    /// Acquire global, then model, then client slots.
    ///
    /// Partially acquired permits are dropped on failure; `in_flight` only
    /// moves once every slot is held.
    pub async fn acquire(&self, model_id: &str, client_id: Option<&str>) -> Result<RequestPermit> {
        let started = Instant::now();

        let global = self
            .acquire_slot(self.shared.global.clone(), "global")
            .await?;

        let model = match self.model_limit(model_id) {
            Some(limit) => {
                let sem = Self::slot(&self.model_slots, model_id, limit);
                Some(self.acquire_slot(sem, "model").await?)
            }
            None => None,
        };

        let client_key = normalize_client_id(client_id);
        let client = match self.client_limit(&client_key) {
            Some(limit) => {
                let sem = Self::slot(&self.client_slots, &client_key, limit);
                Some(self.acquire_slot(sem, "client").await?)
            }
            None => None,
        };

        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(RequestPermit {
            shared: self.shared.clone(),
            global: Some(global),
            _model: model,
            _client: client,
            admitted_at: Instant::now(),
            queue_wait: started.elapsed(),
        })
    }

    /// Rolling p95 of request latency, if any samples exist.
    pub fn p95_latency_ms(&self) -> Option<(f64, usize)> {
        let window = self.shared.latencies.lock().unwrap_or_else(|e| e.into_inner());
        if window.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = window.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let idx = ((sorted.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        Some((sorted[idx.min(sorted.len() - 1)], sorted.len()))
    }

    /// Re-evaluate the global limit from memory pressure and latency.
    ///
    /// Returns the new limit. No-op when adaptive concurrency is disabled.
    pub fn adapt(&self, memory_usage_percent: f64, memory_threshold_percent: f64) -> usize {
        if !self.config.adaptive_enabled {
            return self.current_limit();
        }
        let p95 = self.p95_latency_ms();
        let signals = ConcurrencySignals {
            current_limit: self.current_limit(),
            max_limit: self.config.max_concurrent_requests,
            min_limit: self
                .config
                .min_concurrent_requests
                .min(self.config.max_concurrent_requests),
            memory_usage_percent,
            memory_threshold_percent,
            p95_latency_ms: p95.map(|(v, _)| v),
            latency_samples: p95.map_or(0, |(_, n)| n),
            latency_target_ms: self.config.latency_target_ms,
            waiting: self.waiting(),
        };
        let next = self.policy.next_limit(&signals);
        self.set_limit(next)
    }

    /// Move the global limit, clamped to `[min, max]`. Returns the applied limit.
    pub fn set_limit(&self, requested: usize) -> usize {
        let max = self.config.max_concurrent_requests;
        let min = self.config.min_concurrent_requests.clamp(1, max);
        let next = requested.clamp(min, max);

        let mut st = self.shared.limit.lock().unwrap_or_else(|e| e.into_inner());
        let previous = st.limit;
        if next < previous {
            let shrink = previous - next;
            let forgotten = self.shared.global.forget_permits(shrink);
            st.debt += shrink - forgotten;
        } else if next > previous {
            let mut grow = next - previous;
            let repaid = grow.min(st.debt);
            st.debt -= repaid;
            grow -= repaid;
            if grow > 0 {
                self.shared.global.add_permits(grow);
            }
        }
        st.limit = next;
        drop(st);

        if next != previous {
            info!(previous, next, "concurrency_adapted");
        }
        next
    }

    /// Wait until nothing is in flight. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.idle.notified();
            if self.in_flight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.in_flight() == 0;
            }
        }
    }
}

/// Blank or missing client ids share one bucket.
pub fn normalize_client_id(client_id: Option<&str>) -> String {
    match client_id.map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => ANONYMOUS_CLIENT.to_string(),
    }
}
