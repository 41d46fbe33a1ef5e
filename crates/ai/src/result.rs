use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Token counts for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub tokens_in: u64,
    pub tokens_out: u64,
    /// Counts were estimated (chars / 4) rather than reported by the backend.
    pub approximate: bool,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.tokens_in.saturating_add(self.tokens_out)
    }
}

/// Synchronous completion result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub provider: String,
    pub usage: TokenUsage,
    pub finish_reason: Option<String>,
}

/// One streamed increment.
///
/// Backends that report usage attach it to the chunk that carries it (usually
/// the last one); such a chunk may have an empty `content_delta`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatChunk {
    pub content_delta: String,
    pub finish_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl ChatChunk {
    pub fn delta(content: impl Into<String>) -> Self {
        Self {
            content_delta: content.into(),
            ..Self::default()
        }
    }

    pub fn finish(reason: impl Into<String>) -> Self {
        Self {
            finish_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Carries neither content nor a finish reason (usage-only frames).
    pub fn is_empty(&self) -> bool {
        self.content_delta.is_empty() && self.finish_reason.is_none()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AiError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("provider not configured: {0}")]
    ProviderUnavailable(String),

    #[error("invalid request: {0}")]
    InvalidInput(String),

    #[error("{provider} returned HTTP {status}: {body}")]
    Upstream {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("{provider} request failed: {message}")]
    Transport {
        provider: &'static str,
        message: String,
    },

    #[error("{provider} timed out after {}s", .after.as_secs())]
    Timeout {
        provider: &'static str,
        after: Duration,
    },

    #[error("malformed response from {provider}: {message}")]
    Decode {
        provider: &'static str,
        message: String,
    },

    #[error("request cancelled")]
    Cancelled,
}

impl AiError {
    /// Misconfiguration (not transient): the request named a provider that
    /// cannot serve it.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            AiError::UnknownProvider(_) | AiError::ProviderUnavailable(_)
        )
    }

    /// Transient, request-specific upstream failure.
    pub fn is_provider_error(&self) -> bool {
        matches!(
            self,
            AiError::Upstream { .. }
                | AiError::Transport { .. }
                | AiError::Timeout { .. }
                | AiError::Decode { .. }
        )
    }

    pub(crate) fn transport(provider: &'static str, err: reqwest::Error) -> Self {
        AiError::Transport {
            provider,
            message: err.to_string(),
        }
    }

    pub(crate) fn decode(provider: &'static str, message: impl Into<String>) -> Self {
        AiError::Decode {
            provider,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classes_do_not_overlap() {
        let errors = [
            AiError::UnknownProvider("mistral".into()),
            AiError::ProviderUnavailable("google".into()),
            AiError::Timeout {
                provider: "openai",
                after: Duration::from_secs(60),
            },
            AiError::Cancelled,
        ];
        for err in errors {
            assert!(!(err.is_unavailable() && err.is_provider_error()), "{err}");
        }
    }

    #[test]
    fn timeout_message_names_the_duration() {
        let err = AiError::Timeout {
            provider: "anthropic",
            after: Duration::from_secs(120),
        };
        assert_eq!(err.to_string(), "anthropic timed out after 120s");
    }

    #[test]
    fn usage_only_chunks_are_empty() {
        let chunk = ChatChunk {
            usage: Some(TokenUsage::default()),
            ..ChatChunk::default()
        };
        assert!(chunk.is_empty());
        assert!(!ChatChunk::finish("stop").is_empty());
    }
}
