//! In-process job executor.
//!
//! Runs registered [`WorkHandler`]s on tokio tasks, one task per job, bounded
//! by a semaphore. Failures are terminal: there are no automatic retries.
//! Kinds without a registered handler are left to an external worker that
//! reports back through the lifecycle manager.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pulse_ai::{AiError, ModelTarget, ProviderRouter};
use pulse_core::JobId;

use super::manager::JobLifecycleManager;
use super::types::{ChatParams, Job, JobKind, JobOutput, JobStatus, JobUsage};
use crate::error::ServiceError;

/// Successful handler result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkOutput {
    pub output: JobOutput,
    pub usage: JobUsage,
}

/// Failed handler result, with whatever was consumed before the failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkFailure {
    pub message: String,
    pub partial: Option<JobUsage>,
}

impl WorkFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            partial: None,
        }
    }
}

/// Performs the work of one job kind.
///
/// Handlers should stop promptly when `cancel` fires; the executor settles the
/// job either way.
#[async_trait::async_trait]
pub trait WorkHandler: Send + Sync {
    async fn run(&self, job: &Job, cancel: CancellationToken) -> Result<WorkOutput, WorkFailure>;
}

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// Maximum concurrent jobs
    pub max_concurrent: usize,
    /// Upper bound on one handler run
    pub timeout: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 16,
            timeout: Duration::from_secs(120),
            name: "job-executor".to_string(),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub current_running: usize,
}

pub struct JobExecutor {
    manager: Arc<JobLifecycleManager>,
    handlers: HashMap<JobKind, Arc<dyn WorkHandler>>,
    config: JobExecutorConfig,
    permits: Arc<Semaphore>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&str> = self.handlers.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("JobExecutor")
            .field("name", &self.config.name)
            .field("handlers", &kinds)
            .finish()
    }
}

impl JobExecutor {
    pub fn new(manager: Arc<JobLifecycleManager>, config: JobExecutorConfig) -> Self {
        Self {
            manager,
            handlers: HashMap::new(),
            permits: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            stats: Arc::new(Mutex::new(ExecutorStats::default())),
        }
    }

    /// Register the handler for a job kind.
    pub fn register_handler(&mut self, kind: JobKind, handler: impl WorkHandler + 'static) {
        self.handlers.insert(kind, Arc::new(handler));
    }

    pub fn handles(&self, kind: JobKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Run a job on its own task.
    ///
    /// The job settles whether or not the handle is awaited; dropping the
    /// handle only detaches the caller.
    pub fn submit(self: &Arc<Self>, job_id: JobId) -> JoinHandle<Result<Job, ServiceError>> {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = executor
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| ServiceError::storage("executor is shut down"))?;
            let result = executor.execute_one(job_id).await;
            if let Err(err) = &result {
                error!(executor = %executor.config.name, job_id = %job_id, error = %err, "job execution failed");
            }
            result
        })
    }

    /// Start, run and settle one job, returning its final record.
    ///
    /// A job that is no longer pending is returned as stored.
    pub async fn execute_one(&self, job_id: JobId) -> Result<Job, ServiceError> {
        let job = self.manager.load(job_id).await?;
        let handler = self
            .handlers
            .get(&job.kind)
            .cloned()
            .ok_or_else(|| ServiceError::validation(format!("no handler for {} jobs", job.kind)))?;

        let job = self.manager.begin(job_id).await?;
        if job.status != JobStatus::Processing {
            debug!(job_id = %job_id, status = %job.status, "job not runnable");
            return Ok(job);
        }
        let Some(cancel) = self.manager.cancellation_token(job_id) else {
            // Cancelled between start and here.
            return self.manager.load(job_id).await;
        };

        self.update_stats(|s| s.current_running += 1);
        let outcome = tokio::time::timeout(self.config.timeout, handler.run(&job, cancel.clone())).await;
        let settled = self.settle(job_id, &cancel, outcome).await;
        self.update_stats(|s| {
            s.current_running = s.current_running.saturating_sub(1);
            s.jobs_processed += 1;
            match settled.as_ref().map(|j| j.status) {
                Ok(JobStatus::Completed) => s.jobs_succeeded += 1,
                Ok(JobStatus::Cancelled) => s.jobs_cancelled += 1,
                _ => s.jobs_failed += 1,
            }
        });
        settled
    }

    async fn settle(
        &self,
        job_id: JobId,
        cancel: &CancellationToken,
        outcome: Result<Result<WorkOutput, WorkFailure>, tokio::time::error::Elapsed>,
    ) -> Result<Job, ServiceError> {
        let result = match outcome {
            Ok(Ok(work)) => {
                let usage = work.usage.clone();
                match self.manager.complete(job_id, work.output, work.usage).await {
                    Err(ServiceError::InvalidTransition(_)) if cancel.is_cancelled() => {
                        self.manager.account_abandoned(job_id, usage).await?;
                        return self.manager.load(job_id).await;
                    }
                    other => other,
                }
            }
            Ok(Err(failure)) if cancel.is_cancelled() => {
                if let Some(partial) = failure.partial {
                    self.manager.account_abandoned(job_id, partial).await?;
                }
                return self.manager.load(job_id).await;
            }
            Ok(Err(failure)) => {
                self.manager
                    .fail(job_id, &failure.message, failure.partial)
                    .await
            }
            Err(_) => {
                warn!(job_id = %job_id, timeout_secs = self.config.timeout.as_secs(), "job timed out");
                cancel.cancel();
                let message = format!("timed out after {}s", self.config.timeout.as_secs());
                self.manager.fail(job_id, &message, None).await
            }
        };

        match result {
            Ok(job) => {
                info!(executor = %self.config.name, job_id = %job_id, status = %job.status, "job settled");
                Ok(job)
            }
            // Cancelled while settling: the cancellation already did the accounting.
            Err(ServiceError::InvalidTransition(_)) => self.manager.load(job_id).await,
            Err(err) => Err(err),
        }
    }

    fn update_stats(&self, f: impl FnOnce(&mut ExecutorStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}

/// Runs chat jobs synchronously against the provider router.
#[derive(Debug, Clone)]
pub struct ChatWorkHandler {
    router: Arc<ProviderRouter>,
}

impl ChatWorkHandler {
    pub fn new(router: Arc<ProviderRouter>) -> Self {
        Self { router }
    }
}

#[async_trait::async_trait]
impl WorkHandler for ChatWorkHandler {
    async fn run(&self, job: &Job, cancel: CancellationToken) -> Result<WorkOutput, WorkFailure> {
        let params =
            ChatParams::from_json(&job.params).map_err(|e| WorkFailure::new(e.to_string()))?;
        let target = ModelTarget::parse(params.provider.as_deref(), &params.model)
            .map_err(|e| WorkFailure::new(e.to_string()))?;
        let mut request = params.to_request();
        request.model = target.model.clone();

        let response = self
            .router
            .complete(target.provider, &request, &cancel)
            .await
            .map_err(|e: AiError| WorkFailure::new(e.to_string()))?;

        Ok(WorkOutput {
            output: JobOutput::text(response.content),
            usage: JobUsage::tokens(
                response.usage.tokens_in,
                response.usage.tokens_out,
                response.usage.approximate,
            )
            .with_source(response.provider, response.model),
        })
    }
}
