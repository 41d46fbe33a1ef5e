//! Poll-based status streams for long-running jobs.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio_util::sync::CancellationToken;

use pulse_core::{JobId, UserId};

use super::event::{JobProgress, StreamEvent};
use crate::jobs::{JobLifecycleManager, JobStatus};

/// Progress estimate for the `attempt`-th poll (0-based), never below `last`.
///
/// Pending jobs sit at 0; processing jobs creep from 10 towards a 90 cap; a
/// completed job is 100; failed and cancelled jobs keep the last estimate.
pub fn estimate_progress(status: JobStatus, attempt: u32, last: u8) -> u8 {
    let estimate = match status {
        JobStatus::Pending => 0,
        JobStatus::Processing => {
            let creep = 10u32.saturating_add(attempt.saturating_mul(2)).min(90);
            u8::try_from(creep).unwrap_or(90)
        }
        JobStatus::Completed => 100,
        JobStatus::Failed | JobStatus::Cancelled => last,
    };
    estimate.max(last)
}

/// Poll the job every `interval`, at most `max_attempts` times.
///
/// The first read happens immediately. The stream ends after the job reaches a
/// terminal state (`Progress` then `Done`), with `Timeout` once the attempts are
/// exhausted, or silently when `shutdown` fires.
pub(crate) fn poll_job(
    manager: Arc<JobLifecycleManager>,
    user_id: UserId,
    job_id: JobId,
    interval: Duration,
    max_attempts: u32,
    shutdown: CancellationToken,
) -> impl Stream<Item = StreamEvent> + Send + 'static {
    async_stream::stream! {
        let mut last = 0u8;
        let mut finished = false;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let stop = tokio::select! {
                    _ = shutdown.cancelled() => true,
                    _ = tokio::time::sleep(interval) => false,
                };
                if stop {
                    finished = true;
                    break;
                }
            }

            let job = match manager.get(user_id, job_id).await {
                Ok(job) => job,
                Err(err) => {
                    tracing::warn!(job_id = %job_id, error = %err, "status poll failed");
                    yield StreamEvent::error("Job is no longer available");
                    finished = true;
                    break;
                }
            };

            last = estimate_progress(job.status, attempt, last);
            yield StreamEvent::Progress(JobProgress::of(&job, last));
            if job.status.is_terminal() {
                yield StreamEvent::Done;
                finished = true;
                break;
            }
        }

        if !finished {
            yield StreamEvent::Timeout;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processing_progress_creeps_and_caps() {
        assert_eq!(estimate_progress(JobStatus::Processing, 0, 0), 10);
        assert_eq!(estimate_progress(JobStatus::Processing, 5, 0), 20);
        assert_eq!(estimate_progress(JobStatus::Processing, 1000, 0), 90);
    }

    #[test]
    fn progress_never_decreases() {
        assert_eq!(estimate_progress(JobStatus::Pending, 3, 40), 40);
        assert_eq!(estimate_progress(JobStatus::Failed, 3, 40), 40);
        assert_eq!(estimate_progress(JobStatus::Completed, 0, 40), 100);
    }
}
