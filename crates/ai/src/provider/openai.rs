//! OpenAI chat completions backend.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tracing::debug;

use crate::provider::{ChunkStream, upstream_error};
use crate::request::ChatRequest;
use crate::result::{AiError, ChatChunk, ChatResponse, TokenUsage};
use crate::sse::{DONE_MARKER, SseDecoder};
use crate::tokens::approximate_tokens;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const PROVIDER: &str = "openai";

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(http: reqwest::Client, api_key: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    pub async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, AiError> {
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&request_body(request, false))
            .send()
            .await
            .map_err(|e| AiError::transport(PROVIDER, e))?;

        if !response.status().is_success() {
            return Err(upstream_error(PROVIDER, response).await);
        }

        let body: CompletionBody = response
            .json()
            .await
            .map_err(|e| AiError::decode(PROVIDER, e.to_string()))?;
        Ok(body.into_response(request))
    }

    pub fn stream(&self, request: &ChatRequest) -> ChunkStream {
        let http = self.http.clone();
        let url = self.endpoint();
        let api_key = self.api_key.clone();
        let body = request_body(request, true);

        async_stream::try_stream! {
            let response = http
                .post(url)
                .bearer_auth(api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| AiError::transport(PROVIDER, e))?;

            let response = if response.status().is_success() {
                response
            } else {
                Err::<reqwest::Response, AiError>(upstream_error(PROVIDER, response).await)?
            };

            let mut bytes = response.bytes_stream();
            let mut decoder = SseDecoder::new();
            'read: while let Some(next) = bytes.next().await {
                let next = next.map_err(|e| AiError::transport(PROVIDER, e))?;
                for data in decoder.push(&next) {
                    if data == DONE_MARKER {
                        break 'read;
                    }
                    if let Some(chunk) = parse_stream_data(&data)? {
                        yield chunk;
                    }
                }
            }
            debug!(provider = PROVIDER, "stream finished");
        }
        .boxed()
    }
}

fn request_body(request: &ChatRequest, stream: bool) -> JsonValue {
    let mut messages = Vec::new();
    if let Some(system) = request.system_prompt() {
        messages.push(json!({"role": "system", "content": system}));
    }
    for message in request.conversation() {
        messages.push(json!({"role": message.role.as_str(), "content": message.content}));
    }

    let mut body = json!({
        "model": request.model,
        "messages": messages,
        "temperature": request.temperature,
        "max_tokens": request.max_tokens,
        "stream": stream,
    });
    if stream {
        body["stream_options"] = json!({"include_usage": true});
    }
    body
}

#[derive(Debug, Deserialize, Serialize)]
struct WireUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

impl From<WireUsage> for TokenUsage {
    fn from(usage: WireUsage) -> Self {
        TokenUsage {
            tokens_in: usage.prompt_tokens,
            tokens_out: usage.completion_tokens,
            approximate: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompletionBody {
    model: Option<String>,
    choices: Vec<CompletionChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

impl CompletionBody {
    fn into_response(self, request: &ChatRequest) -> ChatResponse {
        let (content, finish_reason) = self
            .choices
            .into_iter()
            .next()
            .map(|c| (c.message.content.unwrap_or_default(), c.finish_reason))
            .unwrap_or_default();

        let usage = match self.usage {
            Some(usage) => usage.into(),
            None => TokenUsage {
                tokens_in: approximate_tokens(&request.prompt_text()),
                tokens_out: approximate_tokens(&content),
                approximate: true,
            },
        };

        ChatResponse {
            content,
            model: self.model.unwrap_or_else(|| request.model.clone()),
            provider: PROVIDER.to_string(),
            usage,
            finish_reason,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamBody {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

/// Parse one `data:` payload of a streamed completion.
fn parse_stream_data(data: &str) -> Result<Option<ChatChunk>, AiError> {
    let body: StreamBody =
        serde_json::from_str(data).map_err(|e| AiError::decode(PROVIDER, e.to_string()))?;

    let (content_delta, finish_reason) = body
        .choices
        .into_iter()
        .next()
        .map(|c| (c.delta.content.unwrap_or_default(), c.finish_reason))
        .unwrap_or_default();

    let chunk = ChatChunk {
        content_delta,
        finish_reason,
        usage: body.usage.map(Into::into),
    };
    if chunk.is_empty() && chunk.usage.is_none() {
        Ok(None)
    } else {
        Ok(Some(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ChatMessage;

    fn test_request() -> ChatRequest {
        ChatRequest::new("gpt-4", vec![ChatMessage::user("hello")]).with_system("be nice")
    }

    #[test]
    fn system_prompt_becomes_the_first_message() {
        let body = request_body(&test_request(), false);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hello");
        assert!(body.get("stream_options").is_none());
    }

    #[test]
    fn streaming_requests_ask_for_usage() {
        let body = request_body(&test_request(), true);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn completion_uses_native_usage() {
        let body: CompletionBody = serde_json::from_value(json!({
            "model": "gpt-4-0613",
            "choices": [{"message": {"content": "hi there"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 9, "completion_tokens": 3}
        }))
        .unwrap();
        let response = body.into_response(&test_request());
        assert_eq!(response.content, "hi there");
        assert_eq!(response.model, "gpt-4-0613");
        assert_eq!(response.usage.total(), 12);
        assert!(!response.usage.approximate);
    }

    #[test]
    fn stream_frames_map_to_chunks() {
        let delta = parse_stream_data(r#"{"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#)
            .unwrap()
            .unwrap();
        assert_eq!(delta.content_delta, "Hel");

        let finish = parse_stream_data(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#)
            .unwrap()
            .unwrap();
        assert_eq!(finish.finish_reason.as_deref(), Some("stop"));

        let usage = parse_stream_data(r#"{"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":7}}"#)
            .unwrap()
            .unwrap();
        assert!(usage.is_empty());
        assert_eq!(usage.usage.unwrap().tokens_out, 7);

        assert!(parse_stream_data(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#)
            .unwrap()
            .is_none());
    }

    #[test]
    fn malformed_frames_are_decode_errors() {
        assert!(matches!(
            parse_stream_data("not json"),
            Err(AiError::Decode { provider: "openai", .. })
        ));
    }
}
