//! Usage ledger: the single authority on quota admission and accounting.

use std::sync::Arc;

use tracing::{debug, info, warn};

use pulse_billing::{
    Decision, PlanTier, ResourceKind, Subscription, SubscriptionStatus, UsageEvent, UsageMetadata,
    UsageSummary, reconciles,
};
use pulse_core::{ExpectedVersion, JobId, UserId};

use super::store::{LedgerStore, LedgerStoreError, RecordOutcome};
use crate::clock::{Clock, SystemClock};
use crate::error::{ServiceError, SubscriptionProblem};

/// Attempts for read-modify-write operations that race other writers.
const CAS_ATTEMPTS: usize = 5;

#[derive(Debug, Clone)]
pub struct UsageLedger {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl UsageLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Open a subscription on `plan`, or return the user's live one unchanged.
    pub async fn open_subscription(
        &self,
        user_id: UserId,
        plan: PlanTier,
    ) -> Result<Subscription, ServiceError> {
        if let Some(existing) = self.live_subscription(user_id).await? {
            return Ok(existing);
        }

        let subscription = Subscription::open(user_id, plan, self.clock.now());
        match self.store.insert_subscription(&subscription).await {
            Ok(()) => {
                info!(user_id = %user_id, plan = plan.as_str(), "subscription opened");
                Ok(subscription)
            }
            // Lost a race against a concurrent open; the winner's row stands.
            Err(LedgerStoreError::AlreadyExists(_)) => self
                .live_subscription(user_id)
                .await?
                .ok_or_else(|| ServiceError::Conflict("subscription open raced".to_string())),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn subscription(&self, user_id: UserId) -> Result<Option<Subscription>, ServiceError> {
        Ok(self.store.subscription_for_user(user_id).await?)
    }

    async fn live_subscription(&self, user_id: UserId) -> Result<Option<Subscription>, ServiceError> {
        Ok(self
            .subscription(user_id)
            .await?
            .filter(|s| s.status != SubscriptionStatus::Cancelled))
    }

    /// Atomically admit `amount` of `resource` for `job_id`, holding it as a
    /// reservation until [`record_actual`](Self::record_actual) or
    /// [`release`](Self::release).
    pub async fn check_and_reserve(
        &self,
        user_id: UserId,
        job_id: JobId,
        resource: ResourceKind,
        amount: u64,
    ) -> Result<Decision, ServiceError> {
        let decision = self
            .store
            .reserve(user_id, job_id, resource, amount, self.clock.now())
            .await?;
        match decision {
            Decision::Allowed => {
                debug!(user_id = %user_id, job_id = %job_id, resource = %resource, amount, "quota reserved")
            }
            Decision::Denied(reason) => {
                info!(user_id = %user_id, job_id = %job_id, resource = %resource, amount, ?reason, "admission denied")
            }
        }
        Ok(decision)
    }

    /// [`check_and_reserve`](Self::check_and_reserve), with a denial turned
    /// into the matching [`ServiceError`].
    pub async fn admit(
        &self,
        user_id: UserId,
        job_id: JobId,
        resource: ResourceKind,
        amount: u64,
    ) -> Result<(), ServiceError> {
        match self
            .check_and_reserve(user_id, job_id, resource, amount)
            .await?
        {
            Decision::Allowed => Ok(()),
            Decision::Denied(reason) => Err(reason.into()),
        }
    }

    /// Commit actual consumption for a job. Idempotent per `(job_id, resource)`.
    pub async fn record_actual(
        &self,
        user_id: UserId,
        job_id: JobId,
        resource: ResourceKind,
        amount: u64,
        metadata: UsageMetadata,
    ) -> Result<RecordOutcome, ServiceError> {
        let outcome = self
            .store
            .record(user_id, job_id, resource, amount, metadata, self.clock.now())
            .await
            .inspect_err(|e| {
                if matches!(e, LedgerStoreError::ConflictingUsage { .. }) {
                    warn!(user_id = %user_id, job_id = %job_id, error = %e, "conflicting usage report");
                }
            })?;
        match &outcome {
            RecordOutcome::Recorded(event) => info!(
                user_id = %user_id,
                job_id = %job_id,
                resource = %resource,
                amount,
                approximate = event.metadata.approximate,
                "usage recorded"
            ),
            RecordOutcome::Duplicate(_) => {
                debug!(job_id = %job_id, resource = %resource, "duplicate usage report ignored")
            }
        }
        Ok(outcome)
    }

    /// Drop a job's hold without charging anything.
    pub async fn release(
        &self,
        user_id: UserId,
        job_id: JobId,
        resource: ResourceKind,
    ) -> Result<bool, ServiceError> {
        let released = self
            .store
            .release(user_id, job_id, resource, self.clock.now())
            .await?;
        if released {
            debug!(user_id = %user_id, job_id = %job_id, resource = %resource, "reservation released");
        }
        Ok(released)
    }

    /// Usage view of the current period, rolling the period over first when it
    /// has ended.
    pub async fn summary(&self, user_id: UserId) -> Result<UsageSummary, ServiceError> {
        let subscription = self.current_period(user_id).await?;
        Ok(UsageSummary::of(&subscription))
    }

    pub async fn change_plan(
        &self,
        user_id: UserId,
        plan: PlanTier,
    ) -> Result<Subscription, ServiceError> {
        let updated = self
            .modify_live(user_id, |sub, now| {
                sub.change_plan(plan, now);
                Ok(())
            })
            .await?;
        info!(user_id = %user_id, plan = plan.as_str(), "plan changed");
        Ok(updated)
    }

    pub async fn cancel_subscription(&self, user_id: UserId) -> Result<Subscription, ServiceError> {
        let updated = self
            .modify_live(user_id, |sub, now| Ok(sub.cancel(now)?))
            .await?;
        info!(user_id = %user_id, "subscription cancelled");
        Ok(updated)
    }

    /// Ledger entries charged to the current period.
    pub async fn usage_events(&self, user_id: UserId) -> Result<Vec<UsageEvent>, ServiceError> {
        let subscription = self.current_period(user_id).await?;
        Ok(self
            .store
            .usage_events(subscription.id, Some(subscription.period_start))
            .await?)
    }

    /// Whether the current period's ledger entries sum to the live counters.
    pub async fn reconcile(&self, user_id: UserId) -> Result<bool, ServiceError> {
        let subscription = self.current_period(user_id).await?;
        let events = self
            .store
            .usage_events(subscription.id, Some(subscription.period_start))
            .await?;
        let balanced = reconciles(&subscription, &events);
        if !balanced {
            warn!(user_id = %user_id, subscription_id = %subscription.id, "ledger does not reconcile");
        }
        Ok(balanced)
    }

    async fn current_period(&self, user_id: UserId) -> Result<Subscription, ServiceError> {
        for _ in 0..CAS_ATTEMPTS {
            let mut subscription = self
                .subscription(user_id)
                .await?
                .ok_or(ServiceError::SubscriptionInvalid(SubscriptionProblem::Missing))?;
            let expected = ExpectedVersion::of(&subscription);
            if !matches!(subscription.roll_over(self.clock.now()), Ok(true)) {
                return Ok(subscription);
            }
            match self.store.update_subscription(&subscription, expected).await {
                Ok(stored) => {
                    info!(user_id = %user_id, period_start = %stored.period_start, "period rolled over");
                    return Ok(stored);
                }
                Err(LedgerStoreError::Concurrency(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ServiceError::Conflict(format!(
            "subscription for {user_id} kept changing"
        )))
    }

    async fn modify_live<F>(&self, user_id: UserId, apply: F) -> Result<Subscription, ServiceError>
    where
        F: Fn(&mut Subscription, chrono::DateTime<chrono::Utc>) -> Result<(), ServiceError>,
    {
        for _ in 0..CAS_ATTEMPTS {
            let mut subscription = self
                .live_subscription(user_id)
                .await?
                .ok_or(ServiceError::SubscriptionInvalid(SubscriptionProblem::Missing))?;
            let expected = ExpectedVersion::of(&subscription);
            let now = self.clock.now();
            let _ = subscription.roll_over(now);
            apply(&mut subscription, now)?;
            match self.store.update_subscription(&subscription, expected).await {
                Ok(stored) => return Ok(stored),
                Err(LedgerStoreError::Concurrency(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ServiceError::Conflict(format!(
            "subscription for {user_id} kept changing"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use pulse_billing::{DenialReason, ResourceAmounts};

    use crate::clock::ManualClock;
    use crate::ledger::InMemoryLedgerStore;

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn test_ledger() -> (UsageLedger, ManualClock) {
        let clock = ManualClock::new(test_time());
        let ledger =
            UsageLedger::new(InMemoryLedgerStore::arc()).with_clock(Arc::new(clock.clone()));
        (ledger, clock)
    }

    /// Open a subscription with a custom limit snapshot.
    async fn seed(ledger: &UsageLedger, user: UserId, limits: ResourceAmounts) {
        let sub = Subscription::open(user, PlanTier::Starter, test_time()).with_limits(limits);
        ledger.store().insert_subscription(&sub).await.unwrap();
    }

    #[tokio::test]
    async fn third_image_is_denied_and_no_reservation_is_taken() {
        let (ledger, _) = test_ledger();
        let user = UserId::new();
        seed(&ledger, user, PlanTier::Starter.limits().with(ResourceKind::Images, 2)).await;

        for _ in 0..2 {
            let job = JobId::new();
            ledger.admit(user, job, ResourceKind::Images, 1).await.unwrap();
            ledger
                .record_actual(user, job, ResourceKind::Images, 1, UsageMetadata::default())
                .await
                .unwrap();
        }

        let err = ledger
            .admit(user, JobId::new(), ResourceKind::Images, 1)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ServiceError::QuotaExceeded {
                resource: ResourceKind::Images,
                limit: 2,
                used: 2
            }
        );

        let summary = ledger.summary(user).await.unwrap();
        assert_eq!(summary.usage.images.used, 2);
        assert_eq!(summary.usage.images.reserved, 0);
        assert_eq!(summary.usage.images.percentage, 100.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_admissions_never_overshoot_the_limit() {
        let (ledger, _) = test_ledger();
        let user = UserId::new();
        seed(&ledger, user, PlanTier::Starter.limits().with(ResourceKind::Images, 3)).await;

        let mut handles = Vec::new();
        for _ in 0..40 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .check_and_reserve(user, JobId::new(), ResourceKind::Images, 1)
                    .await
                    .unwrap()
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap().is_allowed() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 3);
        let summary = ledger.summary(user).await.unwrap();
        assert_eq!(summary.usage.images.reserved, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_full_quota_reservations_admit_exactly_one() {
        let (ledger, _) = test_ledger();
        let user = UserId::new();
        seed(&ledger, user, PlanTier::Starter.limits().with(ResourceKind::VideoSeconds, 10)).await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .admit(user, JobId::new(), ResourceKind::VideoSeconds, 10)
                    .await
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => admitted += 1,
                Err(err) => assert!(matches!(err, ServiceError::QuotaExceeded { limit: 10, .. }), "{err}"),
            }
        }
        assert_eq!(admitted, 1);
        let summary = ledger.summary(user).await.unwrap();
        assert_eq!(summary.usage.video_seconds.reserved, 10);
        assert!(ledger.reconcile(user).await.unwrap());
    }

    #[tokio::test]
    async fn released_reservations_free_quota() {
        let (ledger, _) = test_ledger();
        let user = UserId::new();
        seed(&ledger, user, PlanTier::Starter.limits().with(ResourceKind::VideoSeconds, 4)).await;

        let job = JobId::new();
        ledger.admit(user, job, ResourceKind::VideoSeconds, 4).await.unwrap();
        assert!(
            ledger
                .admit(user, JobId::new(), ResourceKind::VideoSeconds, 1)
                .await
                .is_err()
        );

        assert!(ledger.release(user, job, ResourceKind::VideoSeconds).await.unwrap());
        assert!(!ledger.release(user, job, ResourceKind::VideoSeconds).await.unwrap());
        ledger
            .admit(user, JobId::new(), ResourceKind::VideoSeconds, 4)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn expired_period_rolls_over_on_next_admission() {
        let (ledger, clock) = test_ledger();
        let user = UserId::new();
        ledger.open_subscription(user, PlanTier::Starter).await.unwrap();

        let job = JobId::new();
        ledger.admit(user, job, ResourceKind::CvExports, 1).await.unwrap();
        ledger
            .record_actual(user, job, ResourceKind::CvExports, 1, UsageMetadata::default())
            .await
            .unwrap();

        clock.advance(Duration::days(65));
        ledger
            .admit(user, JobId::new(), ResourceKind::CvExports, 1)
            .await
            .unwrap();

        let summary = ledger.summary(user).await.unwrap();
        assert_eq!(summary.usage.cv_exports.used, 0);
        assert!(summary.period_start <= clock.now() && clock.now() < summary.period_end);
        assert_eq!(
            summary.period_start,
            Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap()
        );
        assert!(ledger.reconcile(user).await.unwrap());
    }

    #[tokio::test]
    async fn summary_rolls_over_without_any_admission() {
        let (ledger, clock) = test_ledger();
        let user = UserId::new();
        ledger.open_subscription(user, PlanTier::Plus).await.unwrap();
        let job = JobId::new();
        ledger.admit(user, job, ResourceKind::Images, 1).await.unwrap();
        ledger
            .record_actual(user, job, ResourceKind::Images, 1, UsageMetadata::default())
            .await
            .unwrap();

        clock.advance(Duration::days(31));
        let summary = ledger.summary(user).await.unwrap();
        assert_eq!(summary.usage.images.used, 0);
        assert!(ledger.usage_events(user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_subscription_admits_nothing_but_settles_in_flight_work() {
        let (ledger, _) = test_ledger();
        let user = UserId::new();
        ledger.open_subscription(user, PlanTier::Pro).await.unwrap();
        let job = JobId::new();
        ledger.admit(user, job, ResourceKind::ChatTokens, 500).await.unwrap();

        ledger.cancel_subscription(user).await.unwrap();
        let decision = ledger
            .check_and_reserve(user, JobId::new(), ResourceKind::ChatTokens, 1)
            .await
            .unwrap();
        assert_eq!(decision, Decision::Denied(DenialReason::SubscriptionInactive));

        ledger
            .record_actual(user, job, ResourceKind::ChatTokens, 420, UsageMetadata::default())
            .await
            .unwrap();
        let summary = ledger.summary(user).await.unwrap();
        assert_eq!(summary.status, SubscriptionStatus::Cancelled);
        assert_eq!(summary.usage.chat_tokens.used, 420);
        assert!(ledger.reconcile(user).await.unwrap());

        let reopened = ledger.open_subscription(user, PlanTier::Starter).await.unwrap();
        assert_eq!(reopened.status, SubscriptionStatus::Active);
        assert_eq!(reopened.used(ResourceKind::ChatTokens), 0);
    }

    #[tokio::test]
    async fn missing_subscription_is_reported_as_invalid() {
        let (ledger, _) = test_ledger();
        let err = ledger
            .admit(UserId::new(), JobId::new(), ResourceKind::Images, 1)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ServiceError::SubscriptionInvalid(SubscriptionProblem::Missing)
        );
    }

    #[tokio::test]
    async fn plan_change_keeps_counters_and_swaps_limits() {
        let (ledger, _) = test_ledger();
        let user = UserId::new();
        ledger.open_subscription(user, PlanTier::Starter).await.unwrap();
        let job = JobId::new();
        ledger.admit(user, job, ResourceKind::Images, 1).await.unwrap();
        ledger
            .record_actual(user, job, ResourceKind::Images, 1, UsageMetadata::default())
            .await
            .unwrap();

        let upgraded = ledger.change_plan(user, PlanTier::Pro).await.unwrap();
        assert_eq!(upgraded.limit(ResourceKind::Images), 1000);
        assert_eq!(upgraded.used(ResourceKind::Images), 1);
    }

    #[tokio::test]
    async fn opening_twice_returns_the_live_subscription() {
        let (ledger, _) = test_ledger();
        let user = UserId::new();
        let first = ledger.open_subscription(user, PlanTier::Starter).await.unwrap();
        let second = ledger.open_subscription(user, PlanTier::Pro).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.plan, PlanTier::Starter);
    }
}
