//! Job record, its status machine and usage estimates.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use pulse_ai::{ChatMessage, ChatRequest, approximate_tokens};
use pulse_billing::{ResourceKind, UsageMetadata};
use pulse_core::{DomainError, DomainResult, JobId, UserId, Versioned};

/// Longest error message stored on a job; longer ones are truncated.
pub const MAX_ERROR_LEN: usize = 1000;

pub const DEFAULT_IMAGE_COUNT: u64 = 1;
pub const MAX_IMAGE_COUNT: u64 = 4;
pub const DEFAULT_VIDEO_SECONDS: u64 = 4;
pub const MIN_VIDEO_SECONDS: u64 = 2;
pub const MAX_VIDEO_SECONDS: u64 = 10;

/// Kind of work a job performs; decides the quota resource it is charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Chat,
    Image,
    Video,
    Slides,
    Cv,
}

impl JobKind {
    pub const ALL: [JobKind; 5] = [
        JobKind::Chat,
        JobKind::Image,
        JobKind::Video,
        JobKind::Slides,
        JobKind::Cv,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Chat => "chat",
            JobKind::Image => "image",
            JobKind::Video => "video",
            JobKind::Slides => "slides",
            JobKind::Cv => "cv",
        }
    }

    pub fn resource(&self) -> ResourceKind {
        match self {
            JobKind::Chat => ResourceKind::ChatTokens,
            JobKind::Image => ResourceKind::Images,
            JobKind::Video => ResourceKind::VideoSeconds,
            JobKind::Slides => ResourceKind::SlideExports,
            JobKind::Cv => ResourceKind::CvExports,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job kind: {s}")))
    }
}

/// Job execution status.
///
/// `Pending -> Processing -> {Completed | Failed}`; `Pending | Processing ->
/// Cancelled`. The three right-hand states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Actual consumption reported for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobUsage {
    pub resource: ResourceKind,
    pub amount: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_out: Option<u64>,
    #[serde(default)]
    pub approximate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl JobUsage {
    pub fn new(resource: ResourceKind, amount: u64) -> Self {
        Self {
            resource,
            amount,
            tokens_in: None,
            tokens_out: None,
            approximate: false,
            provider: None,
            model: None,
        }
    }

    /// Chat usage: the charged amount is `tokens_in + tokens_out`.
    pub fn tokens(tokens_in: u64, tokens_out: u64, approximate: bool) -> Self {
        Self {
            tokens_in: Some(tokens_in),
            tokens_out: Some(tokens_out),
            approximate,
            ..Self::new(ResourceKind::ChatTokens, tokens_in.saturating_add(tokens_out))
        }
    }

    pub fn with_source(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self.model = Some(model.into());
        self
    }

    pub fn metadata(&self) -> UsageMetadata {
        UsageMetadata {
            provider: self.provider.clone(),
            model: self.model.clone(),
            approximate: self.approximate,
        }
    }
}

/// Output of a completed job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutput {
    /// Where a generated artifact lives (images, videos, exports).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    /// Inline result (chat replies, slide outlines).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_text: Option<String>,
}

impl JobOutput {
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            result_url: Some(url.into()),
            result_text: None,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            result_url: None,
            result_text: Some(text.into()),
        }
    }
}

/// Whether a transition changed the job or was an idempotent repeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    Unchanged,
}

/// A unit of user-requested AI work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub user_id: UserId,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Request parameters as submitted.
    pub params: JsonValue,
    /// Amount reserved at admission.
    pub estimate: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<JobUsage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl Versioned for Job {
    fn version(&self) -> u64 {
        self.version
    }
}

impl Job {
    pub fn pending(
        id: JobId,
        user_id: UserId,
        kind: JobKind,
        params: JsonValue,
        estimate: u64,
        now: DateTime<Utc>,
    ) -> Self {
        let model_name = params
            .get("model")
            .and_then(JsonValue::as_str)
            .map(str::to_string);
        Self {
            id,
            user_id,
            kind,
            status: JobStatus::Pending,
            params,
            estimate,
            model_name,
            result_url: None,
            result_text: None,
            error_message: None,
            usage: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            deleted_at: None,
            version: 0,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// `Pending -> Processing`. Any other source state is left alone and
    /// reported as `Unchanged`.
    pub fn begin(&mut self, now: DateTime<Utc>) -> Transition {
        if self.status != JobStatus::Pending {
            return Transition::Unchanged;
        }
        self.status = JobStatus::Processing;
        self.started_at = Some(now);
        self.updated_at = now;
        Transition::Applied
    }

    /// `Processing -> Completed`. Repeating a completion with identical usage
    /// is `Unchanged`; any other repeat is an invalid transition.
    pub fn complete(
        &mut self,
        output: JobOutput,
        usage: JobUsage,
        now: DateTime<Utc>,
    ) -> DomainResult<Transition> {
        match self.status {
            JobStatus::Processing => {
                self.ensure_resource(&usage)?;
                self.status = JobStatus::Completed;
                self.result_url = output.result_url;
                self.result_text = output.result_text;
                self.usage = Some(usage);
                self.completed_at = Some(now);
                self.updated_at = now;
                Ok(Transition::Applied)
            }
            JobStatus::Completed if self.usage.as_ref() == Some(&usage) => {
                Ok(Transition::Unchanged)
            }
            from => Err(DomainError::invalid_transition(
                from.as_str(),
                JobStatus::Completed.as_str(),
            )),
        }
    }

    /// `Processing -> Failed`. The message is truncated to [`MAX_ERROR_LEN`].
    pub fn fail(
        &mut self,
        error: &str,
        partial: Option<JobUsage>,
        now: DateTime<Utc>,
    ) -> DomainResult<Transition> {
        let message = truncate_error(error);
        match self.status {
            JobStatus::Processing => {
                if let Some(usage) = &partial {
                    self.ensure_resource(usage)?;
                }
                self.status = JobStatus::Failed;
                self.error_message = Some(message);
                self.usage = partial;
                self.completed_at = Some(now);
                self.updated_at = now;
                Ok(Transition::Applied)
            }
            JobStatus::Failed if self.error_message.as_deref() == Some(message.as_str()) => {
                Ok(Transition::Unchanged)
            }
            from => Err(DomainError::invalid_transition(
                from.as_str(),
                JobStatus::Failed.as_str(),
            )),
        }
    }

    /// `Pending | Processing -> Cancelled`.
    pub fn cancel(&mut self, partial: Option<JobUsage>, now: DateTime<Utc>) -> DomainResult<()> {
        match self.status {
            JobStatus::Pending | JobStatus::Processing => {
                if let Some(usage) = &partial {
                    self.ensure_resource(usage)?;
                }
                self.status = JobStatus::Cancelled;
                self.usage = partial;
                self.completed_at = Some(now);
                self.updated_at = now;
                Ok(())
            }
            from => Err(DomainError::invalid_transition(
                from.as_str(),
                JobStatus::Cancelled.as_str(),
            )),
        }
    }

    /// Hide a finished job from listings. In-flight jobs must be cancelled
    /// first.
    pub fn soft_delete(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.is_terminal() {
            return Err(DomainError::invalid_transition(self.status.as_str(), "deleted"));
        }
        if self.deleted_at.is_none() {
            self.deleted_at = Some(now);
            self.updated_at = now;
        }
        Ok(())
    }

    fn ensure_resource(&self, usage: &JobUsage) -> DomainResult<()> {
        if usage.resource != self.kind.resource() {
            return Err(DomainError::validation(format!(
                "{} job cannot report {} usage",
                self.kind, usage.resource
            )));
        }
        Ok(())
    }
}

fn truncate_error(error: &str) -> String {
    match error.char_indices().nth(MAX_ERROR_LEN) {
        Some((idx, _)) => error[..idx].to_string(),
        None => error.to_string(),
    }
}

/// Chat parameters as stored on a chat job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ChatParams {
    pub fn from_json(params: &JsonValue) -> DomainResult<Self> {
        serde_json::from_value(params.clone())
            .map_err(|e| DomainError::validation(format!("invalid chat parameters: {e}")))
    }

    pub fn to_request(&self) -> ChatRequest {
        let mut request = ChatRequest::new(self.model.clone(), self.messages.clone());
        if let Some(system) = &self.system {
            request = request.with_system(system.clone());
        }
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        request
    }
}

/// Amount to reserve for a job of `kind` with `params`.
///
/// Chat reserves the approximate prompt size plus `max_tokens`; images their
/// count; videos their duration; exports one unit.
pub fn estimate_usage(kind: JobKind, params: &JsonValue) -> DomainResult<u64> {
    match kind {
        JobKind::Chat => {
            let request = ChatParams::from_json(params)?.to_request();
            Ok(approximate_tokens(&request.prompt_text()) + u64::from(request.max_tokens))
        }
        JobKind::Image => {
            let count = optional_u64(params, "count")?.unwrap_or(DEFAULT_IMAGE_COUNT);
            if !(1..=MAX_IMAGE_COUNT).contains(&count) {
                return Err(DomainError::validation(format!(
                    "count must be between 1 and {MAX_IMAGE_COUNT}"
                )));
            }
            Ok(count)
        }
        JobKind::Video => {
            let seconds = optional_u64(params, "duration")?.unwrap_or(DEFAULT_VIDEO_SECONDS);
            if !(MIN_VIDEO_SECONDS..=MAX_VIDEO_SECONDS).contains(&seconds) {
                return Err(DomainError::validation(format!(
                    "duration must be between {MIN_VIDEO_SECONDS} and {MAX_VIDEO_SECONDS} seconds"
                )));
            }
            Ok(seconds)
        }
        JobKind::Slides | JobKind::Cv => Ok(1),
    }
}

fn optional_u64(params: &JsonValue, key: &str) -> DomainResult<Option<u64>> {
    match params.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| DomainError::validation(format!("{key} must be a non-negative integer"))),
    }
}
