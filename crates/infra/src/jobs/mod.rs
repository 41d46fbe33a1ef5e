//! Jobs: records, storage, the lifecycle manager and the in-process executor.
//!
//! ## Flow
//!
//! 1. `JobLifecycleManager::create` reserves the estimate and persists a
//!    pending job
//! 2. the executor (or an external worker) calls `begin`, runs the work and
//!    reports `complete` / `fail`
//! 3. the owner may `cancel` a pending or processing job at any time; the
//!    cancellation token stops in-flight provider calls
//!
//! Each terminal transition settles the reservation exactly once: actual
//! usage is committed, or the hold is released.

pub mod executor;
pub mod manager;
pub mod postgres;
pub mod store;
pub mod types;

pub use executor::{
    ChatWorkHandler, ExecutorStats, JobExecutor, JobExecutorConfig, WorkFailure, WorkHandler,
    WorkOutput,
};
pub use manager::{JobLifecycleManager, NewJob};
pub use postgres::PostgresJobStore;
pub use store::{InMemoryJobStore, JobFilter, JobStore, JobStoreError};
pub use types::{
    ChatParams, Job, JobKind, JobOutput, JobStatus, JobUsage, MAX_ERROR_LEN, Transition,
    estimate_usage,
};
