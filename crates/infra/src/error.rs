//! Service-level error taxonomy.
//!
//! Every component fails with [`ServiceError`]; the HTTP layer maps each variant
//! to one status code. Provider and storage details are kept for logs; callers
//! decide how much of the message to expose.

use thiserror::Error;

use pulse_ai::AiError;
use pulse_billing::{DenialReason, ResourceKind};
use pulse_core::{DomainError, JobId};

use crate::jobs::JobStoreError;
use crate::ledger::LedgerStoreError;

/// Why a subscription cannot admit work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionProblem {
    Missing,
    Inactive,
    PeriodExpired,
}

impl SubscriptionProblem {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionProblem::Missing => "no subscription",
            SubscriptionProblem::Inactive => "subscription is not active",
            SubscriptionProblem::PeriodExpired => "subscription period has ended",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("{resource} quota exceeded ({used}/{limit})")]
    QuotaExceeded {
        resource: ResourceKind,
        limit: u64,
        used: u64,
    },

    #[error("{}", .0.as_str())]
    SubscriptionInvalid(SubscriptionProblem),

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("provider error: {0}")]
    ProviderError(String),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// Actual usage was already recorded for the job with another amount.
    #[error("usage for job {job_id} ({resource}) already recorded as {recorded}, got {attempted}")]
    ConflictingUsage {
        job_id: JobId,
        resource: ResourceKind,
        recorded: u64,
        attempted: u64,
    },

    #[error("job {0} was cancelled")]
    Cancelled(JobId),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl ServiceError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

impl From<DenialReason> for ServiceError {
    fn from(reason: DenialReason) -> Self {
        match reason {
            DenialReason::QuotaExceeded {
                resource,
                limit,
                used,
            } => ServiceError::QuotaExceeded {
                resource,
                limit,
                used,
            },
            DenialReason::NoSubscription => {
                ServiceError::SubscriptionInvalid(SubscriptionProblem::Missing)
            }
            DenialReason::SubscriptionInactive => {
                ServiceError::SubscriptionInvalid(SubscriptionProblem::Inactive)
            }
            DenialReason::PeriodExpired => {
                ServiceError::SubscriptionInvalid(SubscriptionProblem::PeriodExpired)
            }
        }
    }
}

impl From<AiError> for ServiceError {
    fn from(err: AiError) -> Self {
        match err {
            AiError::UnknownProvider(name) => {
                ServiceError::Validation(format!("unknown provider: {name}"))
            }
            AiError::ProviderUnavailable(name) => ServiceError::ProviderUnavailable(name),
            AiError::InvalidInput(msg) => ServiceError::Validation(msg),
            other => ServiceError::ProviderError(other.to_string()),
        }
    }
}

impl From<DomainError> for ServiceError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                ServiceError::Validation(msg)
            }
            DomainError::InvalidTransition { from, to } => {
                ServiceError::InvalidTransition(format!("{from} -> {to}"))
            }
            DomainError::Conflict(msg) => ServiceError::Conflict(msg),
            DomainError::InvariantViolation(msg) => ServiceError::Storage(msg),
        }
    }
}

impl From<JobStoreError> for ServiceError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => ServiceError::JobNotFound(id),
            JobStoreError::Concurrency(msg) => ServiceError::Conflict(msg),
            other => ServiceError::Storage(other.to_string()),
        }
    }
}

impl From<LedgerStoreError> for ServiceError {
    fn from(err: LedgerStoreError) -> Self {
        match err {
            LedgerStoreError::NoSubscription(_) => {
                ServiceError::SubscriptionInvalid(SubscriptionProblem::Missing)
            }
            LedgerStoreError::ConflictingUsage {
                job_id,
                resource,
                recorded,
                attempted,
            } => ServiceError::ConflictingUsage {
                job_id,
                resource,
                recorded,
                attempted,
            },
            LedgerStoreError::Concurrency(msg) | LedgerStoreError::AlreadyExists(msg) => {
                ServiceError::Conflict(msg)
            }
            LedgerStoreError::Domain(err) => err.into(),
            LedgerStoreError::Storage(msg) => ServiceError::Storage(msg),
        }
    }
}
