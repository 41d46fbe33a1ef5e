use core::str::FromStr;

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

use pulse_core::{DomainError, DomainResult, JobId, SubscriptionId, UserId, Versioned};

use crate::plan::{PlanTier, ResourceAmounts, ResourceKind};

/// Lifecycle status of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Cancelled,
}

impl SubscriptionStatus {
    /// Whether new work may be admitted against this subscription.
    pub fn admits(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Trialing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            other => Err(DomainError::validation(format!(
                "unknown subscription status: {other}"
            ))),
        }
    }
}

/// Why an admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenialReason {
    QuotaExceeded {
        resource: ResourceKind,
        limit: u64,
        used: u64,
    },
    NoSubscription,
    SubscriptionInactive,
    PeriodExpired,
}

/// Outcome of [`Subscription::check_and_reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied(DenialReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Quota held for an admitted job until its actual usage is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub job_id: JobId,
    pub resource: ResourceKind,
    pub amount: u64,
    pub reserved_at: DateTime<Utc>,
}

/// The monthly billing period anchored at `anchor` that contains `at`.
///
/// Every boundary is `anchor + n months`, so a period anchored on the 31st
/// returns to the 31st after a short month. `at` before the anchor yields the
/// first period.
pub fn billing_period(anchor: DateTime<Utc>, at: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let mut months = 0;
    loop {
        let end = period_boundary(anchor, months + 1);
        if end > at {
            return (period_boundary(anchor, months), end);
        }
        months += 1;
    }
}

fn period_boundary(anchor: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    anchor
        .checked_add_months(Months::new(months))
        .unwrap_or(anchor + Duration::days(30 * i64::from(months)))
}

/// One user's subscription: plan limits, the current period and its counters.
///
/// `counters` hold committed usage for the current period only. Admission looks
/// at `counters + reservations` so that concurrent in-flight jobs cannot jointly
/// overshoot a limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub user_id: UserId,
    pub plan: PlanTier,
    pub limits: ResourceAmounts,
    pub status: SubscriptionStatus,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub counters: ResourceAmounts,
    pub reservations: Vec<Reservation>,
    pub cancel_at_period_end: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl Versioned for Subscription {
    fn version(&self) -> u64 {
        self.version
    }
}

impl Subscription {
    /// Fresh subscription starting a new period at `now`.
    pub fn open(user_id: UserId, plan: PlanTier, now: DateTime<Utc>) -> Self {
        Self {
            id: SubscriptionId::new(),
            user_id,
            plan,
            limits: plan.limits(),
            status: SubscriptionStatus::Active,
            period_start: now,
            period_end: period_boundary(now, 1),
            counters: ResourceAmounts::default(),
            reservations: Vec::new(),
            cancel_at_period_end: false,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Override the limit snapshot (custom contracts, tests).
    pub fn with_limits(mut self, limits: ResourceAmounts) -> Self {
        self.limits = limits;
        self
    }

    pub fn limit(&self, kind: ResourceKind) -> u64 {
        self.limits.get(kind)
    }

    /// Committed usage in the current period.
    pub fn used(&self, kind: ResourceKind) -> u64 {
        self.counters.get(kind)
    }

    /// Outstanding holds for in-flight jobs.
    pub fn reserved(&self, kind: ResourceKind) -> u64 {
        self.reservations
            .iter()
            .filter(|r| r.resource == kind)
            .map(|r| r.amount)
            .sum()
    }

    pub fn reservation(&self, job_id: JobId, kind: ResourceKind) -> Option<&Reservation> {
        self.reservations
            .iter()
            .find(|r| r.job_id == job_id && r.resource == kind)
    }

    /// Advance the period if `now` has reached its end.
    ///
    /// Returns `Ok(true)` when a rollover happened. A subscription scheduled to
    /// end at the period boundary refuses to roll over.
    pub fn roll_over(&mut self, now: DateTime<Utc>) -> Result<bool, DenialReason> {
        if now < self.period_end {
            return Ok(false);
        }
        if self.cancel_at_period_end {
            return Err(DenialReason::PeriodExpired);
        }

        (self.period_start, self.period_end) = billing_period(self.created_at, now);
        self.counters = ResourceAmounts::default();
        self.updated_at = now;
        Ok(true)
    }

    /// Atomic admission step: callers must hold the subscription exclusively.
    ///
    /// On `Allowed` a reservation keyed by `(job_id, kind)` has been added. A
    /// second call for a job that already holds a reservation is admitted without
    /// adding another hold.
    pub fn check_and_reserve(
        &mut self,
        job_id: JobId,
        kind: ResourceKind,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Decision {
        if !self.status.admits() {
            return Decision::Denied(DenialReason::SubscriptionInactive);
        }
        if let Err(reason) = self.roll_over(now) {
            return Decision::Denied(reason);
        }
        if self.reservation(job_id, kind).is_some() {
            return Decision::Allowed;
        }

        let limit = self.limit(kind);
        let in_use = self.used(kind).saturating_add(self.reserved(kind));
        if in_use.saturating_add(amount) > limit {
            return Decision::Denied(DenialReason::QuotaExceeded {
                resource: kind,
                limit,
                used: in_use,
            });
        }

        self.reservations.push(Reservation {
            job_id,
            resource: kind,
            amount,
            reserved_at: now,
        });
        self.updated_at = now;
        Decision::Allowed
    }

    /// Drop the hold for `(job_id, kind)`; returns whether one existed.
    pub fn release(&mut self, job_id: JobId, kind: ResourceKind, now: DateTime<Utc>) -> bool {
        let before = self.reservations.len();
        self.reservations
            .retain(|r| !(r.job_id == job_id && r.resource == kind));
        let released = self.reservations.len() != before;
        if released {
            self.updated_at = now;
        }
        released
    }

    /// Commit actual consumption: release the job's hold and increment the
    /// live counter.
    ///
    /// Idempotency is the store's concern (it owns the event log); this method
    /// always applies. Usage arriving after an unrenewable period has lapsed is
    /// still charged to that last period.
    pub fn commit(
        &mut self,
        job_id: JobId,
        kind: ResourceKind,
        amount: u64,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        let _ = self.roll_over(now);
        self.release(job_id, kind, now);

        let counter = self.counters.get_mut(kind);
        *counter = counter
            .checked_add(amount)
            .ok_or_else(|| DomainError::invariant(format!("{kind} counter overflow")))?;
        self.updated_at = now;
        Ok(())
    }

    /// Switch plan; counters and the current period are kept.
    pub fn change_plan(&mut self, plan: PlanTier, now: DateTime<Utc>) {
        self.plan = plan;
        self.limits = plan.limits();
        self.updated_at = now;
    }

    /// Archive the subscription. Outstanding reservations stay so that in-flight
    /// jobs can still settle their usage.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status == SubscriptionStatus::Cancelled {
            return Err(DomainError::invalid_transition("cancelled", "cancelled"));
        }
        self.status = SubscriptionStatus::Cancelled;
        self.cancel_at_period_end = true;
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap()
    }

    fn test_subscription() -> Subscription {
        Subscription::open(UserId::new(), PlanTier::Starter, test_time())
    }

    #[test]
    fn open_starts_a_one_month_period() {
        let sub = test_subscription();
        assert_eq!(sub.period_start, test_time());
        assert_eq!(
            sub.period_end,
            Utc.with_ymd_and_hms(2026, 2, 15, 12, 0, 0).unwrap()
        );
        assert_eq!(sub.counters, ResourceAmounts::default());
    }

    #[test]
    fn third_image_is_denied_with_limit_and_used() {
        let mut sub = test_subscription()
            .with_limits(PlanTier::Starter.limits().with(ResourceKind::Images, 2));
        let now = test_time();

        for _ in 0..2 {
            let decision = sub.check_and_reserve(JobId::new(), ResourceKind::Images, 1, now);
            assert_eq!(decision, Decision::Allowed);
        }

        let denied = sub.check_and_reserve(JobId::new(), ResourceKind::Images, 1, now);
        assert_eq!(
            denied,
            Decision::Denied(DenialReason::QuotaExceeded {
                resource: ResourceKind::Images,
                limit: 2,
                used: 2,
            })
        );
    }

    #[test]
    fn inactive_subscription_is_denied() {
        let mut sub = test_subscription();
        sub.status = SubscriptionStatus::PastDue;
        let decision = sub.check_and_reserve(JobId::new(), ResourceKind::Images, 1, test_time());
        assert_eq!(decision, Decision::Denied(DenialReason::SubscriptionInactive));
    }

    #[test]
    fn reserving_twice_for_the_same_job_holds_once() {
        let mut sub = test_subscription();
        let job = JobId::new();
        sub.check_and_reserve(job, ResourceKind::CvExports, 1, test_time());
        sub.check_and_reserve(job, ResourceKind::CvExports, 1, test_time());
        assert_eq!(sub.reserved(ResourceKind::CvExports), 1);
    }

    #[test]
    fn commit_moves_hold_into_counter() {
        let mut sub = test_subscription();
        let job = JobId::new();
        let now = test_time();
        sub.check_and_reserve(job, ResourceKind::ChatTokens, 2_500, now);

        sub.commit(job, ResourceKind::ChatTokens, 1_234, now).unwrap();

        assert_eq!(sub.used(ResourceKind::ChatTokens), 1_234);
        assert_eq!(sub.reserved(ResourceKind::ChatTokens), 0);
    }

    #[test]
    fn rollover_zeroes_counters_and_advances_one_period() {
        let mut sub = test_subscription();
        sub.counters = sub.counters.with(ResourceKind::Images, 7);
        let old_end = sub.period_end;
        let now = old_end + Duration::minutes(1);

        let decision = sub.check_and_reserve(JobId::new(), ResourceKind::Images, 1, now);

        assert!(decision.is_allowed());
        assert_eq!(sub.used(ResourceKind::Images), 0);
        assert_eq!(sub.period_start, old_end);
        assert_eq!(
            sub.period_end,
            Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn month_end_anchor_does_not_drift() {
        let anchor = Utc.with_ymd_and_hms(2027, 1, 31, 9, 0, 0).unwrap();
        let mut sub = Subscription::open(UserId::new(), PlanTier::Starter, anchor);
        assert_eq!(sub.period_end, Utc.with_ymd_and_hms(2027, 2, 28, 9, 0, 0).unwrap());

        sub.roll_over(sub.period_end).unwrap();
        assert_eq!(sub.period_start, Utc.with_ymd_and_hms(2027, 2, 28, 9, 0, 0).unwrap());
        assert_eq!(sub.period_end, Utc.with_ymd_and_hms(2027, 3, 31, 9, 0, 0).unwrap());

        sub.roll_over(sub.period_end).unwrap();
        assert_eq!(sub.period_end, Utc.with_ymd_and_hms(2027, 4, 30, 9, 0, 0).unwrap());
    }

    #[test]
    fn rollover_skips_whole_missed_periods() {
        let mut sub = test_subscription();
        let now = sub.period_end + Duration::days(70);
        assert_eq!(sub.roll_over(now), Ok(true));
        assert!(sub.period_start <= now && now < sub.period_end);
    }

    #[test]
    fn cancelled_subscription_does_not_roll_over() {
        let mut sub = test_subscription();
        sub.cancel(test_time()).unwrap();
        sub.status = SubscriptionStatus::Active;
        let late = sub.period_end + Duration::days(1);
        let decision = sub.check_and_reserve(JobId::new(), ResourceKind::Images, 1, late);
        assert_eq!(decision, Decision::Denied(DenialReason::PeriodExpired));
    }

    #[test]
    fn change_plan_keeps_counters() {
        let mut sub = test_subscription();
        sub.counters = sub.counters.with(ResourceKind::SlideExports, 4);
        sub.change_plan(PlanTier::Pro, test_time());
        assert_eq!(sub.limit(ResourceKind::SlideExports), 100);
        assert_eq!(sub.used(ResourceKind::SlideExports), 4);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: whatever the request sequence, holds plus committed usage
        /// never exceed the limit.
        #[test]
        fn admissions_never_exceed_limit(
            limit in 0u64..500,
            requests in prop::collection::vec(0u64..120, 1..40)
        ) {
            let mut sub = test_subscription()
                .with_limits(ResourceAmounts::default().with(ResourceKind::VideoSeconds, limit));
            let now = test_time();

            for amount in requests {
                let job = JobId::new();
                if sub.check_and_reserve(job, ResourceKind::VideoSeconds, amount, now).is_allowed() {
                    sub.commit(job, ResourceKind::VideoSeconds, amount, now).unwrap();
                }
                let in_use = sub.used(ResourceKind::VideoSeconds) + sub.reserved(ResourceKind::VideoSeconds);
                prop_assert!(in_use <= limit);
            }
        }

        /// Property: after rollover the current period always contains `now`.
        #[test]
        fn rollover_period_contains_now(days_late in 0i64..2_000) {
            let mut sub = test_subscription();
            let now = sub.period_end + Duration::days(days_late);
            sub.roll_over(now).unwrap();
            prop_assert!(sub.period_start <= now);
            prop_assert!(now < sub.period_end);
        }
    }
}
