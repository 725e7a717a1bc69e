//! # lmx-engine: model lifecycle and admission control
//!
//! The control plane of the LMX local inference server: it decides whether a
//! model may be loaded, isolates the crash-prone native loading step in a
//! disposable child process, tracks readiness through a quarantine state
//! machine, gates generation behind global/per-model/per-client limits, evicts
//! idle models, and keeps the best known performance profile per model.
//!
//! ## Layout
//!
//! - [`memory`]: host memory sampling and load admission
//! - [`loader`]: child worker, parent supervisor and their wire protocol
//! - [`readiness`]: per-model readiness and quarantine
//! - [`compatibility`]: durable ledger of load outcomes
//! - [`autotune`]: profile scoring and the best-profile registry
//! - [`admission`]: request semaphores and adaptive concurrency
//! - [`backend`]: backend kinds, selection policy and runtime handles
//! - [`engine`]: the orchestrator tying it all together

pub mod admission;
pub mod autotune;
pub mod backend;
pub mod compatibility;
pub mod engine;
pub mod error;
pub mod loader;
pub mod memory;
pub mod perf;
pub mod readiness;

pub use admission::{AdmissionConfig, AdmissionController, ConcurrencyPolicy, MemoryLatencyPolicy};
pub use autotune::{AutotuneMetrics, AutotuneRecord, AutotuneRegistry, regression_gate, score_profile};
pub use backend::{Backend, BackendFactory, BackendKind, ChatMessage, GenerationOutput, GenerationParams};
pub use compatibility::{CompatOutcome, CompatibilityEntry, CompatibilityRegistry};
pub use engine::{
    EngineBuilder, EngineOptions, GenerationStream, InferenceEngine, LoadOptions, ModelInfo,
    ProbeOutcome, ProbeReport,
};
pub use error::{EngineError, ErrorCode, Result};
pub use memory::{MemoryMonitor, MemoryStatus};
pub use readiness::{ReadinessRecord, ReadinessState, ReadinessTracker};
