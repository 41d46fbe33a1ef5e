//! Image, video, slide and CV generation.
//!
//! These jobs are admitted here and left `pending` for a media worker; only the
//! slide outline runs inline, as a chat job.

use std::sync::Arc;

use axum::{Extension, Json, http::StatusCode, response::IntoResponse};
use serde_json::{Value as JsonValue, json};

use pulse_ai::{OutlineBrief, parse_outline};
use pulse_infra::jobs::{ChatParams, Job, JobKind};
use pulse_infra::{NewJob, ServiceError};

use crate::app::dto::{self, ImageGenerateRequest, SlidesRequest, VideoGenerateRequest};
use crate::app::errors::{ApiResult, bad_request, service_error_to_response};
use crate::app::routes::chat::run_to_completion;
use crate::app::services::AppServices;
use crate::context::UserContext;

/// Rough seconds of render time per second of video.
const VIDEO_RENDER_FACTOR: u64 = 10;
const DEFAULT_VIDEO_SECONDS: u64 = 4;

async fn create_job(
    services: &AppServices,
    user: &UserContext,
    kind: JobKind,
    params: JsonValue,
) -> Result<Job, axum::response::Response> {
    let job = services
        .jobs
        .create(user.user_id(), NewJob::new(kind, params))
        .await
        .map_err(service_error_to_response)?;
    tracing::info!(job_id = %job.id, user_id = %user.user_id(), kind = %kind, "job accepted");
    Ok(job)
}

fn require_prompt(prompt: &str) -> Result<(), axum::response::Response> {
    if prompt.trim().is_empty() {
        return Err(bad_request("prompt must not be empty"));
    }
    Ok(())
}

fn to_params<T: serde::Serialize>(body: &T) -> Result<JsonValue, axum::response::Response> {
    serde_json::to_value(body).map_err(|e| bad_request(format!("invalid parameters: {e}")))
}

fn brief_of(body: &SlidesRequest) -> Result<OutlineBrief, axum::response::Response> {
    let brief = OutlineBrief {
        topic: body.topic.clone(),
        num_slides: body.num_slides,
        audience: body.audience.clone(),
        style: body.style.clone(),
    };
    brief
        .validate()
        .map_err(|e| service_error_to_response(e.into()))?;
    Ok(brief)
}

pub async fn generate_images(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<ImageGenerateRequest>,
) -> ApiResult {
    require_prompt(&body.prompt)?;
    let job = create_job(&services, &user, JobKind::Image, to_params(&body)?).await?;
    Ok((StatusCode::ACCEPTED, Json(dto::accepted_json(&job))).into_response())
}

pub async fn generate_video(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<VideoGenerateRequest>,
) -> ApiResult {
    require_prompt(&body.prompt)?;
    let duration = body.duration.unwrap_or(DEFAULT_VIDEO_SECONDS);
    let job = create_job(&services, &user, JobKind::Video, to_params(&body)?).await?;

    let mut response = dto::accepted_json(&job);
    response["estimated_time"] = json!(duration * VIDEO_RENDER_FACTOR);
    Ok((StatusCode::ACCEPTED, Json(response)).into_response())
}

pub async fn generate_slides(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<SlidesRequest>,
) -> ApiResult {
    brief_of(&body)?;
    let job = create_job(&services, &user, JobKind::Slides, to_params(&body)?).await?;
    Ok((StatusCode::ACCEPTED, Json(dto::accepted_json(&job))).into_response())
}

/// Synchronous outline, charged as chat tokens.
pub async fn generate_outline(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<SlidesRequest>,
) -> ApiResult {
    let brief = brief_of(&body)?;
    let target = services
        .router
        .outline_target()
        .map_err(|e| service_error_to_response(e.into()))?
        .clone();

    let request = brief.to_request(&target.model);
    let params = ChatParams {
        provider: Some(target.provider.as_str().to_string()),
        model: target.model.clone(),
        messages: request.messages,
        system: request.system,
        temperature: Some(request.temperature),
        max_tokens: Some(request.max_tokens),
    };
    let job = create_job(&services, &user, JobKind::Chat, to_params(&params)?).await?;
    let job = run_to_completion(&services, job.id)
        .await
        .map_err(service_error_to_response)?;

    let content = job.result_text.unwrap_or_default();
    let slides = parse_outline(&content, brief.num_slides)
        .map_err(|e| service_error_to_response(ServiceError::from(e)))?;

    Ok(Json(json!({
        "job_id": job.id.to_string(),
        "topic": brief.topic.trim(),
        "slides": slides,
    }))
    .into_response())
}

/// CV content is free-form; it is stored as the job's parameters.
pub async fn generate_cv(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<JsonValue>,
) -> ApiResult {
    if !body.is_object() {
        return Err(bad_request("CV data must be a JSON object"));
    }
    let job = create_job(&services, &user, JobKind::Cv, body).await?;
    Ok((StatusCode::ACCEPTED, Json(dto::accepted_json(&job))).into_response())
}
