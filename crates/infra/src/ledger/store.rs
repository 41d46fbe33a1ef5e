//! Subscription and usage-event storage.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use pulse_billing::{
    Decision, DenialReason, ResourceKind, Subscription, SubscriptionStatus, UsageEvent,
    UsageMetadata,
};
use pulse_core::{DomainError, ExpectedVersion, JobId, SubscriptionId, UserId};

/// Result of [`LedgerStore::record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// A new ledger entry was appended and the counter incremented.
    Recorded(UsageEvent),
    /// The identical amount had already been recorded; nothing changed.
    Duplicate(UsageEvent),
}

impl RecordOutcome {
    pub fn event(&self) -> &UsageEvent {
        match self {
            RecordOutcome::Recorded(e) | RecordOutcome::Duplicate(e) => e,
        }
    }
}

/// Storage of subscriptions and the append-only usage ledger.
///
/// `reserve`, `record` and `release` are atomic read-modify-write steps: the
/// implementation holds the subscription exclusively (lock or row lock) while
/// it applies the domain method and writes the result back, so admissions for
/// one user are linearizable.
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync + std::fmt::Debug {
    async fn insert_subscription(&self, subscription: &Subscription)
    -> Result<(), LedgerStoreError>;

    /// The user's live subscription, else their most recent cancelled one.
    async fn subscription_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Option<Subscription>, LedgerStoreError>;

    /// Compare-and-swap on [`Subscription::version`]; returns the stored row.
    async fn update_subscription(
        &self,
        subscription: &Subscription,
        expected: ExpectedVersion,
    ) -> Result<Subscription, LedgerStoreError>;

    async fn reserve(
        &self,
        user_id: UserId,
        job_id: JobId,
        resource: ResourceKind,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Decision, LedgerStoreError>;

    /// Commit actual usage once per `(job_id, resource)`.
    ///
    /// A repeat with the same amount is a [`RecordOutcome::Duplicate`]; a repeat
    /// with a different amount is [`LedgerStoreError::ConflictingUsage`].
    async fn record(
        &self,
        user_id: UserId,
        job_id: JobId,
        resource: ResourceKind,
        amount: u64,
        metadata: UsageMetadata,
        now: DateTime<Utc>,
    ) -> Result<RecordOutcome, LedgerStoreError>;

    /// Drop an outstanding hold; `false` when there was none.
    async fn release(
        &self,
        user_id: UserId,
        job_id: JobId,
        resource: ResourceKind,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerStoreError>;

    /// Events of a subscription, optionally only those charged to the period
    /// starting at `period_start`, oldest first.
    async fn usage_events(
        &self,
        subscription_id: SubscriptionId,
        period_start: Option<DateTime<Utc>>,
    ) -> Result<Vec<UsageEvent>, LedgerStoreError>;
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum LedgerStoreError {
    #[error("no subscription for user {0}")]
    NoSubscription(UserId),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("concurrent subscription update: {0}")]
    Concurrency(String),
    #[error("usage for job {job_id} ({resource}) already recorded as {recorded}, got {attempted}")]
    ConflictingUsage {
        job_id: JobId,
        resource: ResourceKind,
        recorded: u64,
        attempted: u64,
    },
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Check a repeat `record` against the stored entry.
pub(crate) fn check_duplicate(
    existing: &UsageEvent,
    amount: u64,
) -> Result<RecordOutcome, LedgerStoreError> {
    if existing.amount == amount {
        Ok(RecordOutcome::Duplicate(existing.clone()))
    } else {
        Err(LedgerStoreError::ConflictingUsage {
            job_id: existing.job_id,
            resource: existing.resource,
            recorded: existing.amount,
            attempted: amount,
        })
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    subscriptions: HashMap<SubscriptionId, Subscription>,
    /// Per user, oldest first.
    by_user: HashMap<UserId, Vec<SubscriptionId>>,
    events: Vec<UsageEvent>,
    recorded: HashMap<(JobId, ResourceKind), usize>,
}

impl LedgerState {
    fn current_id(&self, user_id: UserId) -> Option<SubscriptionId> {
        let ids = self.by_user.get(&user_id)?;
        ids.iter()
            .rev()
            .find(|id| {
                self.subscriptions
                    .get(id)
                    .is_some_and(|s| s.status != SubscriptionStatus::Cancelled)
            })
            .or_else(|| ids.last())
            .copied()
    }

    /// The subscription holding `job_id`'s reservation, else the current one.
    fn holder_id(&self, user_id: UserId, job_id: JobId, resource: ResourceKind) -> Option<SubscriptionId> {
        self.by_user
            .get(&user_id)
            .and_then(|ids| {
                ids.iter().rev().find(|id| {
                    self.subscriptions
                        .get(id)
                        .is_some_and(|s| s.reservation(job_id, resource).is_some())
                })
            })
            .copied()
            .or_else(|| self.current_id(user_id))
    }

    fn bump(&mut self, id: SubscriptionId) {
        if let Some(sub) = self.subscriptions.get_mut(&id) {
            sub.version += 1;
        }
    }
}

/// In-memory ledger for tests/dev. A single mutex serializes every
/// read-modify-write, which trivially linearizes admissions.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    state: Mutex<LedgerState>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LedgerState>, LedgerStoreError> {
        self.state
            .lock()
            .map_err(|_| LedgerStoreError::Storage("ledger lock poisoned".to_string()))
    }
}

#[async_trait::async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn insert_subscription(
        &self,
        subscription: &Subscription,
    ) -> Result<(), LedgerStoreError> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        if state.subscriptions.contains_key(&subscription.id) {
            return Err(LedgerStoreError::AlreadyExists(format!(
                "subscription {}",
                subscription.id
            )));
        }
        let live = state.current_id(subscription.user_id).and_then(|id| {
            state
                .subscriptions
                .get(&id)
                .filter(|s| s.status != SubscriptionStatus::Cancelled)
        });
        if live.is_some() && subscription.status != SubscriptionStatus::Cancelled {
            return Err(LedgerStoreError::AlreadyExists(format!(
                "live subscription for user {}",
                subscription.user_id
            )));
        }

        state
            .by_user
            .entry(subscription.user_id)
            .or_default()
            .push(subscription.id);
        state
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn subscription_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Option<Subscription>, LedgerStoreError> {
        let state = self.lock()?;
        Ok(state
            .current_id(user_id)
            .and_then(|id| state.subscriptions.get(&id).cloned()))
    }

    async fn update_subscription(
        &self,
        subscription: &Subscription,
        expected: ExpectedVersion,
    ) -> Result<Subscription, LedgerStoreError> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let stored = state
            .subscriptions
            .get_mut(&subscription.id)
            .ok_or(LedgerStoreError::NoSubscription(subscription.user_id))?;
        if !expected.matches(stored.version) {
            return Err(LedgerStoreError::Concurrency(format!(
                "subscription {} expected {:?}, found version {}",
                subscription.id, expected, stored.version
            )));
        }
        let mut next = subscription.clone();
        next.version = stored.version + 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn reserve(
        &self,
        user_id: UserId,
        job_id: JobId,
        resource: ResourceKind,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Decision, LedgerStoreError> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let Some(id) = state.current_id(user_id) else {
            return Ok(Decision::Denied(DenialReason::NoSubscription));
        };
        let Some(sub) = state.subscriptions.get_mut(&id) else {
            return Ok(Decision::Denied(DenialReason::NoSubscription));
        };

        let before = sub.clone();
        let decision = sub.check_and_reserve(job_id, resource, amount, now);
        if *sub != before {
            state.bump(id);
        }
        Ok(decision)
    }

    async fn record(
        &self,
        user_id: UserId,
        job_id: JobId,
        resource: ResourceKind,
        amount: u64,
        metadata: UsageMetadata,
        now: DateTime<Utc>,
    ) -> Result<RecordOutcome, LedgerStoreError> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        if let Some(&idx) = state.recorded.get(&(job_id, resource)) {
            return check_duplicate(&state.events[idx], amount);
        }

        let id = state
            .holder_id(user_id, job_id, resource)
            .ok_or(LedgerStoreError::NoSubscription(user_id))?;
        let sub = state
            .subscriptions
            .get_mut(&id)
            .ok_or(LedgerStoreError::NoSubscription(user_id))?;

        let mut next = sub.clone();
        next.commit(job_id, resource, amount, now)?;
        let event = UsageEvent::for_commit(&next, job_id, resource, amount, metadata, now);
        next.version += 1;
        *sub = next;

        let idx = state.events.len();
        state.recorded.insert((job_id, resource), idx);
        state.events.push(event.clone());
        Ok(RecordOutcome::Recorded(event))
    }

    async fn release(
        &self,
        user_id: UserId,
        job_id: JobId,
        resource: ResourceKind,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerStoreError> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let Some(id) = state.holder_id(user_id, job_id, resource) else {
            return Ok(false);
        };
        let released = state
            .subscriptions
            .get_mut(&id)
            .is_some_and(|sub| sub.release(job_id, resource, now));
        if released {
            state.bump(id);
        }
        Ok(released)
    }

    async fn usage_events(
        &self,
        subscription_id: SubscriptionId,
        period_start: Option<DateTime<Utc>>,
    ) -> Result<Vec<UsageEvent>, LedgerStoreError> {
        let state = self.lock()?;
        Ok(state
            .events
            .iter()
            .filter(|e| {
                e.subscription_id == subscription_id
                    && period_start.is_none_or(|start| e.period_start == start)
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_billing::{PlanTier, reconciles};

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    async fn store_with_subscription() -> (InMemoryLedgerStore, UserId) {
        let store = InMemoryLedgerStore::new();
        let user = UserId::new();
        store
            .insert_subscription(&Subscription::open(user, PlanTier::Starter, now()))
            .await
            .unwrap();
        (store, user)
    }

    #[tokio::test]
    async fn reserve_without_subscription_is_denied() {
        let store = InMemoryLedgerStore::new();
        let decision = store
            .reserve(UserId::new(), JobId::new(), ResourceKind::Images, 1, now())
            .await
            .unwrap();
        assert_eq!(decision, Decision::Denied(DenialReason::NoSubscription));
    }

    #[tokio::test]
    async fn second_live_subscription_is_rejected() {
        let (store, user) = store_with_subscription().await;
        let err = store
            .insert_subscription(&Subscription::open(user, PlanTier::Pro, now()))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerStoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn record_is_idempotent_per_job_and_resource() {
        let (store, user) = store_with_subscription().await;
        let job = JobId::new();
        store
            .reserve(user, job, ResourceKind::Images, 1, now())
            .await
            .unwrap();

        let first = store
            .record(user, job, ResourceKind::Images, 1, UsageMetadata::default(), now())
            .await
            .unwrap();
        assert!(matches!(first, RecordOutcome::Recorded(_)));

        let again = store
            .record(user, job, ResourceKind::Images, 1, UsageMetadata::default(), now())
            .await
            .unwrap();
        assert!(matches!(again, RecordOutcome::Duplicate(_)));

        let conflict = store
            .record(user, job, ResourceKind::Images, 2, UsageMetadata::default(), now())
            .await
            .unwrap_err();
        assert!(matches!(
            conflict,
            LedgerStoreError::ConflictingUsage {
                recorded: 1,
                attempted: 2,
                ..
            }
        ));

        let sub = store.subscription_for_user(user).await.unwrap().unwrap();
        assert_eq!(sub.used(ResourceKind::Images), 1);
        assert_eq!(sub.reserved(ResourceKind::Images), 0);
        let events = store
            .usage_events(sub.id, Some(sub.period_start))
            .await
            .unwrap();
        assert!(reconciles(&sub, &events));
    }

    #[tokio::test]
    async fn late_usage_settles_against_the_subscription_holding_the_reservation() {
        let (store, user) = store_with_subscription().await;
        let job = JobId::new();
        store
            .reserve(user, job, ResourceKind::VideoSeconds, 4, now())
            .await
            .unwrap();

        let mut old = store.subscription_for_user(user).await.unwrap().unwrap();
        old.cancel(now()).unwrap();
        store
            .update_subscription(&old, ExpectedVersion::of(&old))
            .await
            .unwrap();
        store
            .insert_subscription(&Subscription::open(user, PlanTier::Plus, now()))
            .await
            .unwrap();

        let outcome = store
            .record(user, job, ResourceKind::VideoSeconds, 4, UsageMetadata::default(), now())
            .await
            .unwrap();
        assert_eq!(outcome.event().subscription_id, old.id);

        let current = store.subscription_for_user(user).await.unwrap().unwrap();
        assert_eq!(current.plan, PlanTier::Plus);
        assert_eq!(current.used(ResourceKind::VideoSeconds), 0);
    }

    #[tokio::test]
    async fn stale_subscription_update_is_rejected() {
        let (store, user) = store_with_subscription().await;
        let sub = store.subscription_for_user(user).await.unwrap().unwrap();
        store
            .reserve(user, JobId::new(), ResourceKind::Images, 1, now())
            .await
            .unwrap();

        let err = store
            .update_subscription(&sub, ExpectedVersion::of(&sub))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerStoreError::Concurrency(_)));
    }
}
