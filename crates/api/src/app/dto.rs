use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use pulse_ai::ChatMessage;
use pulse_billing::PlanTier;
use pulse_infra::jobs::{ChatParams, Job, JobStatus, JobUsage};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub provider: Option<String>,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl ChatCompletionRequest {
    pub fn into_params(self) -> ChatParams {
        ChatParams {
            provider: self.provider,
            model: self.model,
            messages: self.messages,
            system: self.system,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ImageGenerateRequest {
    pub prompt: String,
    #[serde(default)]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct VideoGenerateRequest {
    pub prompt: String,
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SlidesRequest {
    pub topic: String,
    pub num_slides: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct WorkerCompleteRequest {
    #[serde(default)]
    pub result_url: Option<String>,
    #[serde(default)]
    pub result_text: Option<String>,
    pub amount: u64,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WorkerFailRequest {
    pub error: String,
    #[serde(default)]
    pub partial_amount: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ChangePlanRequest {
    pub plan: PlanTier,
}

// -------------------------
// Response mapping
// -------------------------

/// Public view of a job; the stored parameters are not echoed back.
pub fn job_json(job: &Job) -> JsonValue {
    json!({
        "id": job.id.to_string(),
        "type": job.kind.as_str(),
        "status": job.status.as_str(),
        "model_name": job.model_name,
        "result_url": job.result_url,
        "result_text": job.result_text,
        "error_message": job.error_message,
        "usage": job.usage.as_ref().map(usage_json),
        "created_at": job.created_at,
        "updated_at": job.updated_at,
        "started_at": job.started_at,
        "completed_at": job.completed_at,
    })
}

pub fn usage_json(usage: &JobUsage) -> JsonValue {
    json!({
        "resource": usage.resource,
        "amount": usage.amount,
        "tokens_in": usage.tokens_in,
        "tokens_out": usage.tokens_out,
        "approximate": usage.approximate,
    })
}

/// Body of a 202 for an accepted asynchronous job.
pub fn accepted_json(job: &Job) -> JsonValue {
    json!({
        "job_id": job.id.to_string(),
        "status": job.status.as_str(),
    })
}

pub fn parse_status(raw: &str) -> Result<JobStatus, axum::response::Response> {
    raw.parse()
        .map_err(|_| crate::app::errors::bad_request(format!("unknown job status: {raw}")))
}
