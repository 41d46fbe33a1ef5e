use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    response::{IntoResponse, sse::Event as SseEvent},
    routing::{get, post},
};
use futures::StreamExt;
use serde_json::json;

use pulse_ai::ModelTarget;
use pulse_core::JobId;
use pulse_infra::jobs::{ChatParams, Job, JobKind, JobStatus};
use pulse_infra::{NewJob, ServiceError, StreamEvent};

use crate::app::dto::{self, ChatCompletionRequest};
use crate::app::errors::{ApiResult, service_error_to_response};
use crate::app::routes::sse_response;
use crate::app::services::AppServices;
use crate::context::UserContext;

pub fn router() -> axum::Router {
    Router::new()
        .route("/models", get(list_models))
        .route("/completions", post(complete))
        .route("/stream", post(stream))
}

pub async fn list_models(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    Json(json!({ "models": services.router.models() }))
}

/// Resolve the target and admit a chat job for it.
///
/// Unknown and unconfigured providers are rejected before anything is
/// reserved.
pub(crate) async fn admit_chat(
    services: &AppServices,
    user: &UserContext,
    mut params: ChatParams,
) -> Result<(Job, ModelTarget, ChatParams), ServiceError> {
    let target = ModelTarget::parse(params.provider.as_deref(), &params.model)?;
    services.router.resolve(target.provider)?;

    params.provider = Some(target.provider.as_str().to_string());
    params.model = target.model.clone();
    let json = serde_json::to_value(&params)
        .map_err(|e| ServiceError::validation(format!("invalid chat parameters: {e}")))?;

    let job = services
        .jobs
        .create(user.user_id(), NewJob::new(JobKind::Chat, json))
        .await?;
    Ok((job, target, params))
}

/// Run a chat job to its end and map the final status.
///
/// The job runs on an executor task, so a client that disconnects while
/// waiting does not leave it `processing` with its quota reserved.
pub(crate) async fn run_to_completion(services: &AppServices, job_id: JobId) -> Result<Job, ServiceError> {
    let job = services
        .executor
        .submit(job_id)
        .await
        .map_err(|e| ServiceError::storage(format!("job task ended abnormally: {e}")))??;
    match job.status {
        JobStatus::Completed => Ok(job),
        JobStatus::Cancelled => Err(ServiceError::Cancelled(job.id)),
        _ => Err(ServiceError::ProviderError(
            job.error_message.unwrap_or_else(|| "job did not complete".to_string()),
        )),
    }
}

pub async fn complete(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<ChatCompletionRequest>,
) -> ApiResult {
    let (job, target, _) = admit_chat(&services, &user, body.into_params())
        .await
        .map_err(service_error_to_response)?;
    let job = run_to_completion(&services, job.id)
        .await
        .map_err(service_error_to_response)?;

    Ok(Json(json!({
        "job_id": job.id.to_string(),
        "content": job.result_text.unwrap_or_default(),
        "provider": target.provider,
        "model": target.model,
        "usage": job.usage.as_ref().map(dto::usage_json),
    }))
    .into_response())
}

pub async fn stream(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<ChatCompletionRequest>,
) -> ApiResult {
    let (job, target, params) = admit_chat(&services, &user, body.into_params())
        .await
        .map_err(service_error_to_response)?;

    let job_id = job.id;
    let events = services
        .streamer
        .stream_chat(job_id, target, params.to_request())
        .map(move |event| Ok::<_, Infallible>(chat_sse_event(job_id, &event)));

    Ok(sse_response(events))
}

/// Chunks carry the job id so clients can look the job up afterwards.
fn chat_sse_event(job_id: JobId, event: &StreamEvent) -> SseEvent {
    let data = match event {
        StreamEvent::Chunk {
            content,
            finish_reason,
        } => json!({
            "job_id": job_id.to_string(),
            "content": content,
            "finish_reason": finish_reason,
        })
        .to_string(),
        other => other.data(),
    };
    SseEvent::default().data(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_include_the_job_id_and_done_is_literal() {
        let job_id = JobId::new();
        let chunk = chat_sse_event(job_id, &StreamEvent::chunk("Hi"));
        let rendered = format!("{chunk:?}");
        assert!(rendered.contains(&job_id.to_string()));

        let done = format!("{:?}", chat_sse_event(job_id, &StreamEvent::Done));
        assert!(done.contains("[DONE]"));
    }
}
