//! Job lifecycle: admission, state transitions and their ledger side effects.
//!
//! Every transition of one job runs under that job's async lock and is written
//! back with a version check, so the ledger sees at most one settlement per job
//! even when a worker completion races a user cancellation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use pulse_core::{ExpectedVersion, JobId, UserId};

use super::store::{JobFilter, JobStore};
use super::types::{Job, JobKind, JobOutput, JobStatus, JobUsage, Transition, estimate_usage};
use crate::clock::{Clock, SystemClock};
use crate::error::ServiceError;
use crate::ledger::UsageLedger;

/// Request to create a job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub kind: JobKind,
    pub params: JsonValue,
}

impl NewJob {
    pub fn new(kind: JobKind, params: JsonValue) -> Self {
        Self { kind, params }
    }
}

#[derive(Debug, Default)]
struct InFlight {
    locks: HashMap<JobId, Arc<tokio::sync::Mutex<()>>>,
    tokens: HashMap<JobId, CancellationToken>,
}

#[derive(Debug)]
pub struct JobLifecycleManager {
    jobs: Arc<dyn JobStore>,
    ledger: UsageLedger,
    clock: Arc<dyn Clock>,
    in_flight: Mutex<InFlight>,
}

impl JobLifecycleManager {
    pub fn new(jobs: Arc<dyn JobStore>, ledger: UsageLedger) -> Self {
        Self {
            jobs,
            ledger,
            clock: Arc::new(SystemClock),
            in_flight: Mutex::new(InFlight::default()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    /// Admit and persist a new pending job.
    ///
    /// The estimate is reserved first; if persisting the job fails the hold is
    /// released again.
    #[instrument(skip(self, request), fields(user_id = %user_id, kind = %request.kind), err)]
    pub async fn create(&self, user_id: UserId, request: NewJob) -> Result<Job, ServiceError> {
        let estimate = estimate_usage(request.kind, &request.params)?;
        let job = Job::pending(
            JobId::new(),
            user_id,
            request.kind,
            request.params,
            estimate,
            self.clock.now(),
        );
        let resource = job.kind.resource();

        self.ledger.admit(user_id, job.id, resource, estimate).await?;
        if let Err(err) = self.jobs.insert(&job).await {
            if let Err(release_err) = self.ledger.release(user_id, job.id, resource).await {
                warn!(job_id = %job.id, error = %release_err, "failed to release hold of unsaved job");
            }
            return Err(err.into());
        }

        info!(job_id = %job.id, estimate, "job created");
        Ok(job)
    }

    /// `pending -> processing`. A job in any other state is returned unchanged.
    ///
    /// Starting a job registers its cancellation token (see
    /// [`cancellation_token`](Self::cancellation_token)).
    pub async fn begin(&self, job_id: JobId) -> Result<Job, ServiceError> {
        let _held = self.lock_job(job_id).await?;

        let current = self.load(job_id).await?;
        let mut next = current.clone();
        if next.begin(self.clock.now()) == Transition::Unchanged {
            debug!(job_id = %job_id, status = %current.status, "begin ignored");
            return Ok(current);
        }

        let stored = self.jobs.update(&next, ExpectedVersion::of(&current)).await?;
        self.with_in_flight(|f| {
            f.tokens.entry(job_id).or_default();
        })?;
        info!(job_id = %job_id, kind = %stored.kind, "job started");
        Ok(stored)
    }

    /// `processing -> completed`, committing `usage` to the ledger.
    ///
    /// A repeat with identical usage returns the stored job; any other call on
    /// a non-processing job is an invalid transition.
    #[instrument(skip(self, output, usage), fields(job_id = %job_id, amount = usage.amount), err)]
    pub async fn complete(
        &self,
        job_id: JobId,
        output: JobOutput,
        usage: JobUsage,
    ) -> Result<Job, ServiceError> {
        let _held = self.lock_job(job_id).await?;

        let current = self.load(job_id).await?;
        let mut next = current.clone();
        if next.complete(output, usage.clone(), self.clock.now())? == Transition::Unchanged {
            return Ok(current);
        }

        self.ledger
            .record_actual(
                current.user_id,
                job_id,
                usage.resource,
                usage.amount,
                usage.metadata(),
            )
            .await?;
        let stored = self.jobs.update(&next, ExpectedVersion::of(&current)).await?;
        self.settled(job_id)?;
        info!(job_id = %job_id, "job completed");
        Ok(stored)
    }

    /// `processing -> failed`. Partial usage is charged; otherwise the hold is
    /// released.
    #[instrument(skip(self, error, partial), fields(job_id = %job_id), err)]
    pub async fn fail(
        &self,
        job_id: JobId,
        error: &str,
        partial: Option<JobUsage>,
    ) -> Result<Job, ServiceError> {
        let _held = self.lock_job(job_id).await?;

        let current = self.load(job_id).await?;
        let mut next = current.clone();
        if next.fail(error, partial.clone(), self.clock.now())? == Transition::Unchanged {
            return Ok(current);
        }

        self.settle_partial(&current, partial.as_ref()).await?;
        let stored = self.jobs.update(&next, ExpectedVersion::of(&current)).await?;
        self.settled(job_id)?;
        warn!(job_id = %job_id, error = %truncated_for_log(error), "job failed");
        Ok(stored)
    }

    /// `pending | processing -> cancelled`, on behalf of the job's owner.
    ///
    /// Fires the job's cancellation token. Partial usage is charged; otherwise
    /// the hold is released.
    #[instrument(skip(self, partial), fields(user_id = %user_id, job_id = %job_id), err)]
    pub async fn cancel(
        &self,
        user_id: UserId,
        job_id: JobId,
        partial: Option<JobUsage>,
    ) -> Result<Job, ServiceError> {
        let _held = self.lock_job(job_id).await?;

        let current = self.owned(user_id, job_id).await?;
        let mut next = current.clone();
        next.cancel(partial.clone(), self.clock.now())?;

        self.settle_partial(&current, partial.as_ref()).await?;
        let stored = self.jobs.update(&next, ExpectedVersion::of(&current)).await?;
        if let Some(token) = self.settled(job_id)? {
            token.cancel();
        }
        info!(job_id = %job_id, "job cancelled");
        Ok(stored)
    }

    /// Charge usage that arrived after the job was cancelled (a provider call
    /// that finished anyway). Ignored for jobs in any other state.
    pub async fn account_abandoned(
        &self,
        job_id: JobId,
        usage: JobUsage,
    ) -> Result<(), ServiceError> {
        let job = self.load(job_id).await?;
        if job.status != JobStatus::Cancelled {
            debug!(job_id = %job_id, status = %job.status, "late usage ignored");
            return Ok(());
        }
        if usage.resource != job.kind.resource() {
            return Err(ServiceError::validation(format!(
                "{} job cannot report {} usage",
                job.kind, usage.resource
            )));
        }
        self.ledger
            .record_actual(
                job.user_id,
                job_id,
                usage.resource,
                usage.amount,
                usage.metadata(),
            )
            .await?;
        info!(job_id = %job_id, amount = usage.amount, "usage of abandoned job recorded");
        Ok(())
    }

    /// The caller's job. Soft-deleted jobs and other users' jobs are not found.
    pub async fn get(&self, user_id: UserId, job_id: JobId) -> Result<Job, ServiceError> {
        self.owned(user_id, job_id).await
    }

    /// Any job by id, for trusted callers (workers, executors).
    pub async fn load(&self, job_id: JobId) -> Result<Job, ServiceError> {
        self.jobs
            .get(job_id)
            .await?
            .ok_or(ServiceError::JobNotFound(job_id))
    }

    pub async fn list(&self, user_id: UserId, filter: &JobFilter) -> Result<Vec<Job>, ServiceError> {
        Ok(self.jobs.list(user_id, filter).await?)
    }

    /// Soft-delete a finished job.
    pub async fn delete(&self, user_id: UserId, job_id: JobId) -> Result<Job, ServiceError> {
        let _held = self.lock_job(job_id).await?;

        let current = self.owned(user_id, job_id).await?;
        let mut next = current.clone();
        next.soft_delete(self.clock.now())?;
        let stored = self.jobs.update(&next, ExpectedVersion::of(&current)).await?;
        info!(job_id = %job_id, "job deleted");
        Ok(stored)
    }

    /// Token fired when the job is cancelled; `None` once the job has settled
    /// or before it has started.
    pub fn cancellation_token(&self, job_id: JobId) -> Option<CancellationToken> {
        self.in_flight
            .lock()
            .ok()
            .and_then(|f| f.tokens.get(&job_id).cloned())
    }

    async fn owned(&self, user_id: UserId, job_id: JobId) -> Result<Job, ServiceError> {
        match self.jobs.get(job_id).await? {
            Some(job) if job.user_id == user_id && !job.is_deleted() => Ok(job),
            _ => Err(ServiceError::JobNotFound(job_id)),
        }
    }

    async fn settle_partial(&self, job: &Job, partial: Option<&JobUsage>) -> Result<(), ServiceError> {
        let resource = job.kind.resource();
        match partial {
            Some(usage) => {
                self.ledger
                    .record_actual(job.user_id, job.id, resource, usage.amount, usage.metadata())
                    .await?;
            }
            None => {
                self.ledger.release(job.user_id, job.id, resource).await?;
            }
        }
        Ok(())
    }

    fn with_in_flight<T>(&self, f: impl FnOnce(&mut InFlight) -> T) -> Result<T, ServiceError> {
        let mut in_flight = self
            .in_flight
            .lock()
            .map_err(|_| ServiceError::storage("job registry lock poisoned"))?;
        Ok(f(&mut in_flight))
    }

    /// Serialize transitions of one job. The registry entry is dropped with the
    /// last holder, whatever the outcome of the transition.
    async fn lock_job(&self, job_id: JobId) -> Result<JobLock<'_>, ServiceError> {
        let mutex = self.with_in_flight(|f| f.locks.entry(job_id).or_default().clone())?;
        let mut held = JobLock {
            in_flight: &self.in_flight,
            job_id,
            guard: None,
        };
        held.guard = Some(mutex.lock_owned().await);
        Ok(held)
    }

    /// Forget the cancellation token of a job that reached a terminal state.
    fn settled(&self, job_id: JobId) -> Result<Option<CancellationToken>, ServiceError> {
        self.with_in_flight(|f| f.tokens.remove(&job_id))
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.in_flight.lock().map(|f| f.locks.len()).unwrap_or_default()
    }
}

struct JobLock<'a> {
    in_flight: &'a Mutex<InFlight>,
    job_id: JobId,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for JobLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let Ok(mut in_flight) = self.in_flight.lock() else {
            return;
        };
        // Waiters hold their own clone; only the registry's copy is left when idle.
        if in_flight
            .locks
            .get(&self.job_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            in_flight.locks.remove(&self.job_id);
        }
    }
}

fn truncated_for_log(error: &str) -> &str {
    match error.char_indices().nth(200) {
        Some((idx, _)) => &error[..idx],
        None => error,
    }
}
