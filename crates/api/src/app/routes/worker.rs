//! Endpoints called by media workers and the payment collaborator.
//!
//! Authenticated with the shared worker token, not a user bearer token, so no
//! ownership checks apply.

use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::Path,
    response::IntoResponse,
};

use pulse_core::{JobId, UserId};
use pulse_infra::jobs::{JobOutput, JobUsage};

use crate::app::dto::{self, ChangePlanRequest, WorkerCompleteRequest, WorkerFailRequest};
use crate::app::errors::{ApiResult, bad_request, parse_id, service_error_to_response};
use crate::app::services::AppServices;

pub async fn begin_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> ApiResult {
    let job_id: JobId = parse_id(&id, "job")?;
    let job = services
        .jobs
        .begin(job_id)
        .await
        .map_err(service_error_to_response)?;
    Ok(Json(dto::job_json(&job)).into_response())
}

pub async fn complete_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<WorkerCompleteRequest>,
) -> ApiResult {
    let job_id: JobId = parse_id(&id, "job")?;
    if body.result_url.is_none() && body.result_text.is_none() {
        return Err(bad_request("result_url or result_text is required"));
    }
    let job = services
        .jobs
        .load(job_id)
        .await
        .map_err(service_error_to_response)?;

    let mut usage = JobUsage::new(job.kind.resource(), body.amount);
    if let (Some(provider), Some(model)) = (body.provider, body.model) {
        usage = usage.with_source(provider, model);
    }
    let output = JobOutput {
        result_url: body.result_url,
        result_text: body.result_text,
    };

    let job = services
        .jobs
        .complete(job_id, output, usage)
        .await
        .map_err(service_error_to_response)?;
    Ok(Json(dto::job_json(&job)).into_response())
}

pub async fn fail_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<WorkerFailRequest>,
) -> ApiResult {
    let job_id: JobId = parse_id(&id, "job")?;
    let job = services
        .jobs
        .load(job_id)
        .await
        .map_err(service_error_to_response)?;

    let partial = body
        .partial_amount
        .map(|amount| JobUsage::new(job.kind.resource(), amount));
    let job = services
        .jobs
        .fail(job_id, &body.error, partial)
        .await
        .map_err(service_error_to_response)?;
    Ok(Json(dto::job_json(&job)).into_response())
}

pub async fn change_plan(
    Extension(services): Extension<Arc<AppServices>>,
    Path(user_id): Path<String>,
    Json(body): Json<ChangePlanRequest>,
) -> ApiResult {
    let user_id: UserId = parse_id(&user_id, "user")?;
    services
        .ledger
        .change_plan(user_id, body.plan)
        .await
        .map_err(service_error_to_response)?;
    let summary = services
        .ledger
        .summary(user_id)
        .await
        .map_err(service_error_to_response)?;
    Ok(Json(summary).into_response())
}
