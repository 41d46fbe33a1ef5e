//! Offline backend with a fixed script.
//!
//! Registered in place of a real provider for local development
//! (`PULSE_SCRIPTED_PROVIDER=true`) and in tests. Never reports native usage.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::StreamExt;

use crate::provider::ChunkStream;
use crate::request::{ChatRequest, ChatRole};
use crate::result::{AiError, ChatChunk, ChatResponse, TokenUsage};
use crate::tokens::approximate_tokens;

const PROVIDER: &str = "scripted";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedReply {
    /// Reply with the last user message, one word per chunk.
    Echo,
    /// Reply with exactly these chunks.
    Chunks(Vec<String>),
    /// Emit `chunks`, then fail with `error`.
    FailAfter { chunks: Vec<String>, error: String },
}

#[derive(Debug, Clone)]
pub struct ScriptedProvider {
    reply: ScriptedReply,
    chunk_delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    pub fn new(reply: ScriptedReply) -> Self {
        Self {
            reply,
            chunk_delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn echo() -> Self {
        Self::new(ScriptedReply::Echo)
    }

    pub fn chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(ScriptedReply::Chunks(
            chunks.into_iter().map(Into::into).collect(),
        ))
    }

    pub fn failing_after<I, S>(chunks: I, error: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(ScriptedReply::FailAfter {
            chunks: chunks.into_iter().map(Into::into).collect(),
            error: error.into(),
        })
    }

    /// Pause before each chunk (and once before a synchronous reply).
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Number of `complete`/`stream` calls served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn script(&self, request: &ChatRequest) -> (Vec<String>, Option<String>) {
        match &self.reply {
            ScriptedReply::Echo => {
                let last = request
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.role == ChatRole::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or_default();
                let mut chunks = vec!["Echo:".to_string()];
                chunks.extend(last.split_whitespace().map(|word| format!(" {word}")));
                (chunks, None)
            }
            ScriptedReply::Chunks(chunks) => (chunks.clone(), None),
            ScriptedReply::FailAfter { chunks, error } => (chunks.clone(), Some(error.clone())),
        }
    }

    pub async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, AiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.chunk_delay.is_zero() {
            tokio::time::sleep(self.chunk_delay).await;
        }

        let (chunks, error) = self.script(request);
        if let Some(error) = error {
            return Err(upstream(error));
        }

        let content = chunks.concat();
        Ok(ChatResponse {
            usage: TokenUsage {
                tokens_in: approximate_tokens(&request.prompt_text()),
                tokens_out: approximate_tokens(&content),
                approximate: true,
            },
            content,
            model: request.model.clone(),
            provider: PROVIDER.to_string(),
            finish_reason: Some("stop".to_string()),
        })
    }

    pub fn stream(&self, request: &ChatRequest) -> ChunkStream {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (chunks, error) = self.script(request);
        let delay = self.chunk_delay;

        async_stream::stream! {
            for chunk in chunks {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(ChatChunk::delta(chunk));
            }
            match error {
                Some(error) => yield Err(upstream(error)),
                None => yield Ok(ChatChunk::finish("stop")),
            }
        }
        .boxed()
    }
}

fn upstream(error: String) -> AiError {
    AiError::Upstream {
        provider: PROVIDER,
        status: 502,
        body: error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ChatMessage;

    fn test_request(text: &str) -> ChatRequest {
        ChatRequest::new("scripted-1", vec![ChatMessage::user(text)])
    }

    #[tokio::test]
    async fn echo_streams_one_word_per_chunk() {
        let provider = ScriptedProvider::echo();
        let chunks: Vec<_> = provider.stream(&test_request("hello there")).collect().await;
        let deltas: Vec<String> = chunks
            .into_iter()
            .map(|c| c.unwrap())
            .map(|c| c.content_delta)
            .collect();
        assert_eq!(deltas, ["Echo:", " hello", " there", ""]);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn failing_script_errors_after_its_chunks() {
        let provider = ScriptedProvider::failing_after(["a", "b"], "upstream timeout");
        let items: Vec<_> = provider.stream(&test_request("x")).collect().await;
        assert_eq!(items.len(), 3);
        assert!(items[2].is_err());

        let err = provider.complete(&test_request("x")).await.unwrap_err();
        assert!(err.to_string().contains("upstream timeout"));
    }

    #[tokio::test]
    async fn complete_reports_approximate_usage() {
        let provider = ScriptedProvider::chunks(["abcd", "efgh"]);
        let response = provider.complete(&test_request("12345678")).await.unwrap();
        assert_eq!(response.content, "abcdefgh");
        assert_eq!(response.usage.tokens_in, 2);
        assert_eq!(response.usage.tokens_out, 2);
        assert!(response.usage.approximate);
    }
}
