//! Anthropic messages backend.

use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};

use crate::provider::{ChunkStream, upstream_error};
use crate::request::ChatRequest;
use crate::result::{AiError, ChatChunk, ChatResponse, TokenUsage};
use crate::sse::SseDecoder;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const PROVIDER: &str = "anthropic";

#[derive(Debug, Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicClient {
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

    fn post(&self, body: &JsonValue) -> reqwest::RequestBuilder {
        self.http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(body)
    }

    pub async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, AiError> {
        let response = self
            .post(&request_body(request, false))
            .send()
            .await
            .map_err(|e| AiError::transport(PROVIDER, e))?;

        if !response.status().is_success() {
            return Err(upstream_error(PROVIDER, response).await);
        }

        let body: MessageBody = response
            .json()
            .await
            .map_err(|e| AiError::decode(PROVIDER, e.to_string()))?;
        Ok(body.into_response(request))
    }

    pub fn stream(&self, request: &ChatRequest) -> ChunkStream {
        let builder = self.post(&request_body(request, true));

        async_stream::try_stream! {
            let response = builder
                .send()
                .await
                .map_err(|e| AiError::transport(PROVIDER, e))?;

            let response = if response.status().is_success() {
                response
            } else {
                Err::<reqwest::Response, AiError>(upstream_error(PROVIDER, response).await)?
            };

            let mut state = StreamState::default();
            let mut bytes = response.bytes_stream();
            let mut decoder = SseDecoder::new();
            'read: while let Some(next) = bytes.next().await {
                let next = next.map_err(|e| AiError::transport(PROVIDER, e))?;
                for data in decoder.push(&next) {
                    match state.apply(&data)? {
                        StreamStep::Chunk(chunk) => yield chunk,
                        StreamStep::Skip => {}
                        StreamStep::Stop => break 'read,
                    }
                }
            }
        }
        .boxed()
    }
}

fn request_body(request: &ChatRequest, stream: bool) -> JsonValue {
    let messages: Vec<JsonValue> = request
        .conversation()
        .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
        .collect();

    let mut body = json!({
        "model": request.model,
        "messages": messages,
        "max_tokens": request.max_tokens,
        "temperature": request.temperature,
        "stream": stream,
    });
    if let Some(system) = request.system_prompt() {
        body["system"] = JsonValue::String(system);
    }
    body
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    model: Option<String>,
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

impl MessageBody {
    fn into_response(self, request: &ChatRequest) -> ChatResponse {
        let content = self
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text)
            .collect::<String>();

        ChatResponse {
            content,
            model: self.model.unwrap_or_else(|| request.model.clone()),
            provider: PROVIDER.to_string(),
            usage: TokenUsage {
                tokens_in: self.usage.input_tokens,
                tokens_out: self.usage.output_tokens,
                approximate: false,
            },
            finish_reason: self.stop_reason,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart { message: StartMessage },
    ContentBlockDelta { delta: BlockDelta },
    MessageDelta { delta: MessageDelta, usage: Option<WireUsage> },
    MessageStop,
    Error { error: StreamError },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StartMessage {
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
struct BlockDelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    message: String,
}

enum StreamStep {
    Chunk(ChatChunk),
    Skip,
    Stop,
}

/// Input tokens arrive in `message_start`, output tokens in `message_delta`.
#[derive(Debug, Default)]
struct StreamState {
    tokens_in: u64,
}

impl StreamState {
    fn apply(&mut self, data: &str) -> Result<StreamStep, AiError> {
        let event: StreamEvent =
            serde_json::from_str(data).map_err(|e| AiError::decode(PROVIDER, e.to_string()))?;

        Ok(match event {
            StreamEvent::MessageStart { message } => {
                self.tokens_in = message.usage.input_tokens;
                StreamStep::Skip
            }
            StreamEvent::ContentBlockDelta { delta } => match delta.text {
                Some(text) if !text.is_empty() => StreamStep::Chunk(ChatChunk::delta(text)),
                _ => StreamStep::Skip,
            },
            StreamEvent::MessageDelta { delta, usage } => StreamStep::Chunk(ChatChunk {
                content_delta: String::new(),
                finish_reason: delta.stop_reason,
                usage: usage.map(|u| TokenUsage {
                    tokens_in: self.tokens_in,
                    tokens_out: u.output_tokens,
                    approximate: false,
                }),
            }),
            StreamEvent::MessageStop => StreamStep::Stop,
            StreamEvent::Error { error } => {
                return Err(AiError::Upstream {
                    provider: PROVIDER,
                    status: 200,
                    body: error.message,
                });
            }
            StreamEvent::Other => StreamStep::Skip,
        })
    }
}
