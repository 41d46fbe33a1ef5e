//! Events emitted to streaming clients and their SSE framing.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use pulse_core::JobId;

use crate::jobs::{Job, JobStatus};

/// Payload of the final frame of every successful stream.
pub const DONE_DATA: &str = "[DONE]";

pub const TIMEOUT_MESSAGE: &str = "Timeout waiting for job completion";

/// Snapshot of a job for status streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobProgress {
    pub job_id: JobId,
    pub status: JobStatus,
    /// Estimated completion, 0..=100.
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobProgress {
    pub fn of(job: &Job, progress: u8) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            progress,
            result_url: job.result_url.clone(),
            error_message: job.error_message.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Incremental model output.
    Chunk {
        content: String,
        finish_reason: Option<String>,
    },
    Progress(JobProgress),
    /// Successful end of stream.
    Done,
    /// Failed end of stream; the message is safe to show to clients.
    Error { message: String },
    /// The job did not finish within the polling budget.
    Timeout,
}

impl StreamEvent {
    pub fn chunk(content: impl Into<String>) -> Self {
        StreamEvent::Chunk {
            content: content.into(),
            finish_reason: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        StreamEvent::Error {
            message: message.into(),
        }
    }

    /// Whether no further events follow this one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::Done | StreamEvent::Error { .. } | StreamEvent::Timeout
        )
    }

    /// The `data:` payload of the event.
    pub fn data(&self) -> String {
        match self {
            StreamEvent::Chunk {
                content,
                finish_reason: None,
            } => json!({ "content": content }).to_string(),
            StreamEvent::Chunk {
                content,
                finish_reason: Some(reason),
            } => json!({ "content": content, "finish_reason": reason }).to_string(),
            StreamEvent::Progress(progress) => {
                serde_json::to_string(progress).unwrap_or_else(|_| "{}".to_string())
            }
            StreamEvent::Done => DONE_DATA.to_string(),
            StreamEvent::Error { message } => json!({ "error": message }).to_string(),
            StreamEvent::Timeout => json!({ "error": TIMEOUT_MESSAGE }).to_string(),
        }
    }

    /// Full SSE frame: `data: <payload>\n\n`.
    pub fn to_sse_frame(&self) -> String {
        format!("data: {}\n\n", self.data())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_use_the_data_prefix_and_blank_line() {
        assert_eq!(
            StreamEvent::chunk("Hel").to_sse_frame(),
            "data: {\"content\":\"Hel\"}\n\n"
        );
        assert_eq!(StreamEvent::Done.to_sse_frame(), "data: [DONE]\n\n");
    }

    #[test]
    fn timeout_is_an_error_payload() {
        let value: serde_json::Value = serde_json::from_str(&StreamEvent::Timeout.data()).unwrap();
        assert_eq!(value["error"], TIMEOUT_MESSAGE);
        assert!(StreamEvent::Timeout.is_terminal());
        assert!(!StreamEvent::chunk("x").is_terminal());
    }
}
