//! Postgres-backed ledger.
//!
//! Every read-modify-write runs in one transaction that first locks the
//! subscription row with `SELECT ... FOR UPDATE`; concurrent admissions for the
//! same user queue on that lock. Usage events are unique on
//! `(job_id, resource)`, which backs the idempotency of `record`.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use pulse_billing::{
    Decision, DenialReason, ResourceAmounts, ResourceKind, Reservation, Subscription, UsageEvent,
    UsageMetadata,
};
use pulse_core::{ExpectedVersion, JobId, SubscriptionId, UsageEventId, UserId};

use super::store::{LedgerStore, LedgerStoreError, RecordOutcome, check_duplicate};
use crate::db::{UNIQUE_VIOLATION, from_db_int, sqlstate, to_db_int};

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, plan, status, limits, counters, reservations, \
     period_start, period_end, cancel_at_period_end, created_at, updated_at, version";

const EVENT_COLUMNS: &str =
    "id, subscription_id, user_id, job_id, resource, amount, period_start, metadata, recorded_at";

#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, LedgerStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    /// Lock and load the user's current subscription, or the one holding
    /// `job_id`'s reservation when given.
    async fn lock_subscription(
        tx: &mut Transaction<'static, Postgres>,
        user_id: UserId,
        holding: Option<(JobId, ResourceKind)>,
    ) -> Result<Option<Subscription>, LedgerStoreError> {
        let holder = holding.map(|(job_id, resource)| {
            serde_json::json!([{ "job_id": job_id, "resource": resource }])
        });
        let row = sqlx::query(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
            WHERE user_id = $1
            ORDER BY ($2::JSONB IS NOT NULL AND reservations @> $2::JSONB) DESC,
                     (status <> 'cancelled') DESC,
                     created_at DESC
            LIMIT 1
            FOR UPDATE
            "#
        ))
        .bind(user_id.as_uuid())
        .bind(holder)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_subscription", e))?;

        row.as_ref().map(subscription_from_row).transpose()
    }

    /// Write back a subscription loaded under lock in `tx`.
    async fn write_locked(
        tx: &mut Transaction<'static, Postgres>,
        subscription: &Subscription,
    ) -> Result<Subscription, LedgerStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE subscriptions SET
                plan = $2, status = $3, limits = $4, counters = $5, reservations = $6,
                period_start = $7, period_end = $8, cancel_at_period_end = $9,
                updated_at = $10, version = version + 1
            WHERE id = $1
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(subscription.id.as_uuid())
        .bind(subscription.plan.as_str())
        .bind(subscription.status.as_str())
        .bind(Json(&subscription.limits))
        .bind(Json(&subscription.counters))
        .bind(Json(&subscription.reservations))
        .bind(subscription.period_start)
        .bind(subscription.period_end)
        .bind(subscription.cancel_at_period_end)
        .bind(subscription.updated_at)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("write_subscription", e))?;

        subscription_from_row(&row)
    }
}

#[async_trait::async_trait]
impl LedgerStore for PostgresLedgerStore {
    #[instrument(skip(self, subscription), fields(user_id = %subscription.user_id, plan = subscription.plan.as_str()), err)]
    async fn insert_subscription(
        &self,
        subscription: &Subscription,
    ) -> Result<(), LedgerStoreError> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, user_id, plan, status, limits, counters, reservations, period_start,
                period_end, cancel_at_period_end, created_at, updated_at, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(subscription.id.as_uuid())
        .bind(subscription.user_id.as_uuid())
        .bind(subscription.plan.as_str())
        .bind(subscription.status.as_str())
        .bind(Json(&subscription.limits))
        .bind(Json(&subscription.counters))
        .bind(Json(&subscription.reservations))
        .bind(subscription.period_start)
        .bind(subscription.period_end)
        .bind(subscription.cancel_at_period_end)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .bind(to_db_int(subscription.version))
        .execute(&self.pool)
        .await
        .map_err(|e| match sqlstate(&e).as_deref() {
            Some(UNIQUE_VIOLATION) => LedgerStoreError::AlreadyExists(format!(
                "live subscription for user {}",
                subscription.user_id
            )),
            _ => map_sqlx_error("insert_subscription", e),
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn subscription_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Option<Subscription>, LedgerStoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
            WHERE user_id = $1
            ORDER BY (status <> 'cancelled') DESC, created_at DESC
            LIMIT 1
            "#
        ))
        .bind(user_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("subscription_for_user", e))?;

        row.as_ref().map(subscription_from_row).transpose()
    }

    #[instrument(skip(self, subscription), fields(subscription_id = %subscription.id, expected_version = ?expected), err)]
    async fn update_subscription(
        &self,
        subscription: &Subscription,
        expected: ExpectedVersion,
    ) -> Result<Subscription, LedgerStoreError> {
        let mut tx = self.begin().await?;
        let current: Option<i64> =
            sqlx::query_scalar("SELECT version FROM subscriptions WHERE id = $1 FOR UPDATE")
                .bind(subscription.id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("update_subscription", e))?;

        let Some(current) = current.map(from_db_int) else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(LedgerStoreError::NoSubscription(subscription.user_id));
        };
        if !expected.matches(current) {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(LedgerStoreError::Concurrency(format!(
                "subscription {} expected {:?}, found version {}",
                subscription.id, expected, current
            )));
        }

        let stored = Self::write_locked(&mut tx, subscription).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(stored)
    }

    #[instrument(skip(self), fields(user_id = %user_id, job_id = %job_id, resource = %resource, amount), err)]
    async fn reserve(
        &self,
        user_id: UserId,
        job_id: JobId,
        resource: ResourceKind,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Decision, LedgerStoreError> {
        let mut tx = self.begin().await?;
        let Some(mut subscription) = Self::lock_subscription(&mut tx, user_id, None).await? else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(Decision::Denied(DenialReason::NoSubscription));
        };

        let before = subscription.clone();
        let decision = subscription.check_and_reserve(job_id, resource, amount, now);
        if subscription != before {
            Self::write_locked(&mut tx, &subscription).await?;
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(decision)
    }

    #[instrument(skip(self, metadata), fields(user_id = %user_id, job_id = %job_id, resource = %resource, amount), err)]
    async fn record(
        &self,
        user_id: UserId,
        job_id: JobId,
        resource: ResourceKind,
        amount: u64,
        metadata: UsageMetadata,
        now: DateTime<Utc>,
    ) -> Result<RecordOutcome, LedgerStoreError> {
        let mut tx = self.begin().await?;
        let Some(mut subscription) =
            Self::lock_subscription(&mut tx, user_id, Some((job_id, resource))).await?
        else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(LedgerStoreError::NoSubscription(user_id));
        };

        // Checked under the subscription lock so a concurrent first record
        // cannot slip in between.
        if let Some(existing) = find_event(&mut tx, job_id, resource).await? {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return check_duplicate(&existing, amount);
        }

        subscription.commit(job_id, resource, amount, now)?;
        let event = UsageEvent::for_commit(&subscription, job_id, resource, amount, metadata, now);
        Self::write_locked(&mut tx, &subscription).await?;

        sqlx::query(
            r#"
            INSERT INTO usage_events (
                id, subscription_id, user_id, job_id, resource, amount, period_start,
                metadata, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(event.id.as_uuid())
        .bind(event.subscription_id.as_uuid())
        .bind(event.user_id.as_uuid())
        .bind(event.job_id.as_uuid())
        .bind(event.resource.as_str())
        .bind(to_db_int(event.amount))
        .bind(event.period_start)
        .bind(Json(&event.metadata))
        .bind(event.recorded_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_usage_event", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(RecordOutcome::Recorded(event))
    }

    #[instrument(skip(self), fields(user_id = %user_id, job_id = %job_id, resource = %resource), err)]
    async fn release(
        &self,
        user_id: UserId,
        job_id: JobId,
        resource: ResourceKind,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerStoreError> {
        let mut tx = self.begin().await?;
        let Some(mut subscription) =
            Self::lock_subscription(&mut tx, user_id, Some((job_id, resource))).await?
        else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(false);
        };

        let released = subscription.release(job_id, resource, now);
        if released {
            Self::write_locked(&mut tx, &subscription).await?;
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(released)
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id), err)]
    async fn usage_events(
        &self,
        subscription_id: SubscriptionId,
        period_start: Option<DateTime<Utc>>,
    ) -> Result<Vec<UsageEvent>, LedgerStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM usage_events
            WHERE subscription_id = $1
              AND ($2::TIMESTAMPTZ IS NULL OR period_start = $2)
            ORDER BY recorded_at ASC, id ASC
            "#
        ))
        .bind(subscription_id.as_uuid())
        .bind(period_start)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("usage_events", e))?;

        rows.iter().map(event_from_row).collect()
    }
}

async fn find_event(
    tx: &mut Transaction<'static, Postgres>,
    job_id: JobId,
    resource: ResourceKind,
) -> Result<Option<UsageEvent>, LedgerStoreError> {
    let row = sqlx::query(&format!(
        "SELECT {EVENT_COLUMNS} FROM usage_events WHERE job_id = $1 AND resource = $2"
    ))
    .bind(job_id.as_uuid())
    .bind(resource.as_str())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("find_usage_event", e))?;

    row.as_ref().map(event_from_row).transpose()
}

fn decode(e: sqlx::Error) -> LedgerStoreError {
    LedgerStoreError::Storage(format!("failed to decode ledger row: {e}"))
}

fn subscription_from_row(row: &PgRow) -> Result<Subscription, LedgerStoreError> {
    let plan: String = row.try_get("plan").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let limits: Json<ResourceAmounts> = row.try_get("limits").map_err(decode)?;
    let counters: Json<ResourceAmounts> = row.try_get("counters").map_err(decode)?;
    let reservations: Json<Vec<Reservation>> = row.try_get("reservations").map_err(decode)?;
    let version: i64 = row.try_get("version").map_err(decode)?;

    Ok(Subscription {
        id: SubscriptionId::from_uuid(row.try_get("id").map_err(decode)?),
        user_id: UserId::from_uuid(row.try_get("user_id").map_err(decode)?),
        plan: plan.parse()?,
        limits: limits.0,
        status: status.parse()?,
        period_start: row.try_get("period_start").map_err(decode)?,
        period_end: row.try_get("period_end").map_err(decode)?,
        counters: counters.0,
        reservations: reservations.0,
        cancel_at_period_end: row.try_get("cancel_at_period_end").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
        version: from_db_int(version),
    })
}

fn event_from_row(row: &PgRow) -> Result<UsageEvent, LedgerStoreError> {
    let resource: String = row.try_get("resource").map_err(decode)?;
    let amount: i64 = row.try_get("amount").map_err(decode)?;
    let metadata: Json<UsageMetadata> = row.try_get("metadata").map_err(decode)?;

    Ok(UsageEvent {
        id: UsageEventId::from_uuid(row.try_get("id").map_err(decode)?),
        subscription_id: SubscriptionId::from_uuid(row.try_get("subscription_id").map_err(decode)?),
        user_id: UserId::from_uuid(row.try_get("user_id").map_err(decode)?),
        job_id: JobId::from_uuid(row.try_get("job_id").map_err(decode)?),
        resource: resource.parse()?,
        amount: from_db_int(amount),
        period_start: row.try_get("period_start").map_err(decode)?,
        metadata: metadata.0,
        recorded_at: row.try_get("recorded_at").map_err(decode)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some(UNIQUE_VIOLATION) => LedgerStoreError::Concurrency(msg),
                _ => LedgerStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            LedgerStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => LedgerStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
