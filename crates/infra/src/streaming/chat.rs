//! Chat pass-through: provider chunks are forwarded as they arrive.
//!
//! The provider stream is drained by a spawned task, not by the client: a
//! client that disconnects mid-stream stops receiving events, but the job still
//! runs to completion and its usage is recorded.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use pulse_ai::{AiError, ChatRequest, ModelTarget, ProviderRouter, TokenCount, TokenUsage};
use pulse_core::JobId;

use super::event::StreamEvent;
use crate::error::ServiceError;
use crate::jobs::{JobLifecycleManager, JobOutput, JobStatus, JobUsage};

pub(crate) const CANCELLED_MESSAGE: &str = "Job was cancelled";
const PROVIDER_FAILED_MESSAGE: &str = "The AI provider failed to complete the request";
const INTERNAL_MESSAGE: &str = "Internal error while streaming";

/// Start the chat job and forward its output into `events`.
pub(crate) async fn drive_chat(
    manager: Arc<JobLifecycleManager>,
    router: Arc<ProviderRouter>,
    job_id: JobId,
    target: ModelTarget,
    request: ChatRequest,
    events: mpsc::UnboundedSender<StreamEvent>,
) {
    let emit = |event: StreamEvent| {
        // A closed channel means the client went away; keep draining.
        let _ = events.send(event);
    };

    let job = match manager.begin(job_id).await {
        Ok(job) => job,
        Err(err) => {
            warn!(job_id = %job_id, error = %err, "failed to start chat job");
            emit(StreamEvent::error(INTERNAL_MESSAGE));
            return;
        }
    };
    let cancel = match manager.cancellation_token(job_id) {
        Some(token) if job.status == JobStatus::Processing => token,
        _ => {
            emit(StreamEvent::error(CANCELLED_MESSAGE));
            return;
        }
    };

    let mut stream = match router.stream(target.provider, &request, &cancel) {
        Ok(stream) => stream,
        Err(err) => {
            if let Err(fail_err) = manager.fail(job_id, &err.to_string(), None).await {
                warn!(job_id = %job_id, error = %fail_err, "failed to settle unopened stream");
            }
            emit(StreamEvent::error(PROVIDER_FAILED_MESSAGE));
            return;
        }
    };

    let mut content = String::new();
    let mut reported: Option<TokenUsage> = None;
    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => {
                if chunk.usage.is_some() {
                    reported = chunk.usage;
                }
                content.push_str(&chunk.content_delta);
                // A finish-only chunk still carries the finish reason.
                if !chunk.content_delta.is_empty() || chunk.finish_reason.is_some() {
                    emit(StreamEvent::Chunk {
                        content: chunk.content_delta,
                        finish_reason: chunk.finish_reason,
                    });
                }
            }
            Err(AiError::Cancelled) => {
                debug!(job_id = %job_id, "chat stream cancelled");
                let usage = usage_for(&router, &target, &request, &content, None);
                if let Err(err) = manager.account_abandoned(job_id, usage).await {
                    warn!(job_id = %job_id, error = %err, "failed to record usage of cancelled stream");
                }
                emit(StreamEvent::error(CANCELLED_MESSAGE));
                return;
            }
            Err(err) => {
                let partial = (!content.is_empty())
                    .then(|| usage_for(&router, &target, &request, &content, reported));
                if let Err(fail_err) = manager.fail(job_id, &err.to_string(), partial).await {
                    warn!(job_id = %job_id, error = %fail_err, "failed to settle failed stream");
                }
                emit(StreamEvent::error(PROVIDER_FAILED_MESSAGE));
                return;
            }
        }
    }

    let usage = usage_for(&router, &target, &request, &content, reported);
    match manager
        .complete(job_id, JobOutput::text(content), usage.clone())
        .await
    {
        Ok(_) => emit(StreamEvent::Done),
        Err(ServiceError::InvalidTransition(_)) => {
            // Cancelled after the last chunk arrived.
            if let Err(err) = manager.account_abandoned(job_id, usage).await {
                warn!(job_id = %job_id, error = %err, "failed to record usage of cancelled stream");
            }
            emit(StreamEvent::error(CANCELLED_MESSAGE));
        }
        Err(err) => {
            warn!(job_id = %job_id, error = %err, "failed to complete chat job");
            emit(StreamEvent::error(INTERNAL_MESSAGE));
        }
    }
}

/// Reported usage when the provider sent it, else the provider's own estimate.
fn usage_for(
    router: &ProviderRouter,
    target: &ModelTarget,
    request: &ChatRequest,
    content: &str,
    reported: Option<TokenUsage>,
) -> JobUsage {
    let count = |text: &str| {
        router
            .count_tokens(target.provider, text)
            .unwrap_or_else(|_| TokenCount::approximate(text))
    };
    let usage = match reported {
        Some(u) => JobUsage::tokens(u.tokens_in, u.tokens_out, u.approximate),
        None => {
            let (tokens_in, tokens_out) = (count(&request.prompt_text()), count(content));
            JobUsage::tokens(
                tokens_in.tokens,
                tokens_out.tokens,
                tokens_in.approximate || tokens_out.approximate,
            )
        }
    };
    usage.with_source(target.provider.as_str(), target.model.clone())
}
