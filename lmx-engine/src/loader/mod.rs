//! Isolated model loading: wire protocol, child worker, parent supervisor.

pub mod protocol;
pub mod supervisor;
pub mod worker;

pub use protocol::{LoadResult, LoadSpec, LoaderFailure, LoaderOutcome, Metadata};
pub use supervisor::{LoaderSupervisor, ModelLoader, WorkerCommand, classify_exit};
pub use worker::{
    BackendProbe, InProcessLoader, ProbeError, ProbeRegistry, default_probes, execute_load_spec,
    run_worker,
};
