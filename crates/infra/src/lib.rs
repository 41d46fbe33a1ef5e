//! Infrastructure layer: usage ledger, job lifecycle, status streams and their
//! Postgres adapters.
//!
//! Everything a request handler needs is reachable from three services:
//! [`UsageLedger`], [`JobLifecycleManager`] and [`StatusStreamer`]. Each is
//! backed by a store trait with an in-memory and a Postgres implementation.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod ledger;
pub mod streaming;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AppConfig, ConfigError, ProviderCredentials, ProviderSettings};
pub use error::{ServiceError, SubscriptionProblem};
pub use jobs::{
    ChatWorkHandler, JobExecutor, JobExecutorConfig, JobLifecycleManager, NewJob, WorkHandler,
};
pub use ledger::{RecordOutcome, UsageLedger};
pub use streaming::{EventStream, StatusStreamer, StreamEvent, StreamerConfig};
