use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pulse_core::{JobId, SubscriptionId, UsageEventId, UserId};

use crate::plan::{PlanTier, ResourceKind};
use crate::subscription::{Subscription, SubscriptionStatus};

/// Where a usage amount came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Token counts were estimated (chars / 4), not reported by the backend.
    #[serde(default)]
    pub approximate: bool,
}

/// Append-only ledger entry. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: UsageEventId,
    pub subscription_id: SubscriptionId,
    pub user_id: UserId,
    pub job_id: JobId,
    pub resource: ResourceKind,
    pub amount: u64,
    /// Start of the period the amount was charged to.
    pub period_start: DateTime<Utc>,
    pub metadata: UsageMetadata,
    pub recorded_at: DateTime<Utc>,
}

impl UsageEvent {
    /// Build the event for a commit just applied to `subscription`.
    pub fn for_commit(
        subscription: &Subscription,
        job_id: JobId,
        resource: ResourceKind,
        amount: u64,
        metadata: UsageMetadata,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: UsageEventId::new(),
            subscription_id: subscription.id,
            user_id: subscription.user_id,
            job_id,
            resource,
            amount,
            period_start: subscription.period_start,
            metadata,
            recorded_at: now,
        }
    }
}

/// Percentage of `limit` consumed, clamped to `[0, 100]`; `0` for a zero limit.
pub fn usage_percentage(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    let pct = used as f64 / limit as f64 * 100.0;
    pct.clamp(0.0, 100.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub used: u64,
    pub limit: u64,
    pub percentage: f64,
    /// Held by in-flight jobs, not yet committed.
    pub reserved: u64,
}

/// Per-resource usage view of a subscription's current period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub plan: PlanTier,
    pub status: SubscriptionStatus,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub usage: UsageBreakdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageBreakdown {
    pub chat_tokens: ResourceUsage,
    pub images: ResourceUsage,
    pub video_seconds: ResourceUsage,
    pub cv_exports: ResourceUsage,
    pub slide_exports: ResourceUsage,
}

impl UsageBreakdown {
    pub fn get(&self, kind: ResourceKind) -> &ResourceUsage {
        match kind {
            ResourceKind::ChatTokens => &self.chat_tokens,
            ResourceKind::Images => &self.images,
            ResourceKind::VideoSeconds => &self.video_seconds,
            ResourceKind::CvExports => &self.cv_exports,
            ResourceKind::SlideExports => &self.slide_exports,
        }
    }
}

impl UsageSummary {
    pub fn of(subscription: &Subscription) -> Self {
        let entry = |kind: ResourceKind| {
            let used = subscription.used(kind);
            let limit = subscription.limit(kind);
            ResourceUsage {
                used,
                limit,
                percentage: usage_percentage(used, limit),
                reserved: subscription.reserved(kind),
            }
        };

        Self {
            plan: subscription.plan,
            status: subscription.status,
            period_start: subscription.period_start,
            period_end: subscription.period_end,
            usage: UsageBreakdown {
                chat_tokens: entry(ResourceKind::ChatTokens),
                images: entry(ResourceKind::Images),
                video_seconds: entry(ResourceKind::VideoSeconds),
                cv_exports: entry(ResourceKind::CvExports),
                slide_exports: entry(ResourceKind::SlideExports),
            },
        }
    }
}

/// Check the reconciliation invariant: per resource kind, the events charged to
/// the subscription's current period sum to its live counter.
pub fn reconciles(subscription: &Subscription, events: &[UsageEvent]) -> bool {
    ResourceKind::ALL.into_iter().all(|kind| {
        let total: u64 = events
            .iter()
            .filter(|e| {
                e.subscription_id == subscription.id
                    && e.resource == kind
                    && e.period_start == subscription.period_start
            })
            .map(|e| e.amount)
            .sum();
        total == subscription.used(kind)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn zero_limit_reads_as_zero_percent() {
        assert_eq!(usage_percentage(0, 0), 0.0);
        assert_eq!(usage_percentage(10, 0), 0.0);
    }

    #[test]
    fn summary_reports_committed_and_reserved_separately() {
        let now = Utc::now();
        let mut sub = Subscription::open(UserId::new(), PlanTier::Starter, now);
        let job = JobId::new();
        sub.check_and_reserve(job, ResourceKind::Images, 3, now);
        sub.commit(JobId::new(), ResourceKind::Images, 5, now).unwrap();

        let summary = UsageSummary::of(&sub);
        let images = summary.usage.get(ResourceKind::Images);
        assert_eq!(images.used, 5);
        assert_eq!(images.reserved, 3);
        assert_eq!(images.limit, 50);
        assert_eq!(images.percentage, 10.0);
    }

    #[test]
    fn events_from_a_previous_period_do_not_reconcile_against_the_new_one() {
        let now = Utc::now();
        let mut sub = Subscription::open(UserId::new(), PlanTier::Plus, now);
        let job = JobId::new();
        sub.commit(job, ResourceKind::Images, 2, now).unwrap();
        let old = UsageEvent::for_commit(
            &sub,
            job,
            ResourceKind::Images,
            2,
            UsageMetadata::default(),
            now,
        );
        assert!(reconciles(&sub, std::slice::from_ref(&old)));

        sub.roll_over(sub.period_end).unwrap();
        assert!(reconciles(&sub, &[]));
        assert!(reconciles(&sub, &[old]));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        #[test]
        fn percentage_is_always_clamped(used in any::<u64>(), limit in any::<u64>()) {
            let pct = usage_percentage(used, limit);
            prop_assert!((0.0..=100.0).contains(&pct));
        }
    }
}
