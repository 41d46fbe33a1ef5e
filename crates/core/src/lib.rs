//! `pulse-core`: shared primitives for the orchestration layer.
//!
//! Pure types only: identifiers, the domain error model and optimistic
//! concurrency expectations. No IO lives here.

pub mod error;
pub mod id;
pub mod version;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, SubscriptionId, UsageEventId, UserId};
pub use version::{ExpectedVersion, Versioned};
