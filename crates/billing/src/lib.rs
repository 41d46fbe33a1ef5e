//! Billing module (plans, subscriptions, usage accounting).
//!
//! Pure domain logic only: no IO, no HTTP, no persistence concerns. Stores in
//! `pulse-infra` load a [`Subscription`], call one of its methods while holding
//! the subscription's lock (or row lock), and write it back.

pub mod plan;
pub mod subscription;
pub mod usage;

pub use plan::{PlanTier, ResourceAmounts, ResourceKind};
pub use subscription::{
    Decision, DenialReason, Reservation, Subscription, SubscriptionStatus, billing_period,
};
pub use usage::{
    ResourceUsage, UsageBreakdown, UsageEvent, UsageMetadata, UsageSummary, reconciles,
    usage_percentage,
};
