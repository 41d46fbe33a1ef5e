use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{Path, Query},
    response::{IntoResponse, sse::Event as SseEvent},
    routing::{get, post},
};
use futures::StreamExt;
use serde_json::json;

use pulse_core::JobId;
use pulse_infra::jobs::{JobFilter, JobKind};

use crate::app::dto::{self, ListJobsQuery};
use crate::app::errors::{ApiResult, bad_request, parse_id, service_error_to_response};
use crate::app::routes::sse_response;
use crate::app::services::AppServices;
use crate::context::UserContext;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_jobs))
        .route("/:id", get(get_job).delete(delete_job))
        .route("/:id/cancel", post(cancel_job))
        .route("/:id/stream", get(stream_job))
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult {
    let mut filter = JobFilter::default();
    if let Some(status) = &query.status {
        filter = filter.with_status(dto::parse_status(status)?);
    }
    if let Some(kind) = &query.kind {
        let kind: JobKind = kind
            .parse()
            .map_err(|_| bad_request(format!("unknown job type: {kind}")))?;
        filter = filter.with_kind(kind);
    }
    if let Some(limit) = query.limit {
        filter = filter.with_limit(limit);
    }
    if let Some(offset) = query.offset {
        filter = filter.with_offset(offset);
    }

    let jobs = services
        .jobs
        .list(user.user_id(), &filter)
        .await
        .map_err(service_error_to_response)?;

    Ok(Json(json!({
        "jobs": jobs.iter().map(dto::job_json).collect::<Vec<_>>(),
        "limit": filter.limit,
        "offset": filter.offset,
    }))
    .into_response())
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(id): Path<String>,
) -> ApiResult {
    let job_id: JobId = parse_id(&id, "job")?;
    let job = services
        .jobs
        .get(user.user_id(), job_id)
        .await
        .map_err(service_error_to_response)?;
    Ok(Json(dto::job_json(&job)).into_response())
}

/// Soft delete; only finished jobs can be deleted.
pub async fn delete_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(id): Path<String>,
) -> ApiResult {
    let job_id: JobId = parse_id(&id, "job")?;
    services
        .jobs
        .delete(user.user_id(), job_id)
        .await
        .map_err(service_error_to_response)?;
    Ok(Json(json!({ "deleted": true, "job_id": job_id.to_string() })).into_response())
}

pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(id): Path<String>,
) -> ApiResult {
    let job_id: JobId = parse_id(&id, "job")?;
    let job = services
        .jobs
        .cancel(user.user_id(), job_id, None)
        .await
        .map_err(service_error_to_response)?;
    Ok(Json(dto::job_json(&job)).into_response())
}

/// SSE status stream. Ownership is checked before the stream opens so a
/// foreign or unknown job is a plain 404.
pub async fn stream_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(id): Path<String>,
) -> ApiResult {
    let job_id: JobId = parse_id(&id, "job")?;
    services
        .jobs
        .get(user.user_id(), job_id)
        .await
        .map_err(service_error_to_response)?;

    let events = services
        .streamer
        .stream_job_status(user.user_id(), job_id)
        .map(|event| Ok::<_, Infallible>(SseEvent::default().data(event.data())));
    Ok(sse_response(events))
}
