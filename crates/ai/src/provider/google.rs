//! Google Generative Language (Gemini) backend.

use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};

use crate::provider::{ChunkStream, upstream_error};
use crate::request::{ChatRequest, ChatRole};
use crate::result::{AiError, ChatChunk, ChatResponse, TokenUsage};
use crate::sse::SseDecoder;
use crate::tokens::approximate_tokens;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const PROVIDER: &str = "google";

#[derive(Debug, Clone)]
pub struct GoogleClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GoogleClient {
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

    fn url(&self, model: &str, method: &str) -> String {
        format!("{}/v1beta/models/{}:{}", self.base_url, model, method)
    }

    pub async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, AiError> {
        let response = self
            .http
            .post(self.url(&request.model, "generateContent"))
            .query(&[("key", self.api_key.as_str())])
            .json(&request_body(request))
            .send()
            .await
            .map_err(|e| AiError::transport(PROVIDER, e))?;

        if !response.status().is_success() {
            return Err(upstream_error(PROVIDER, response).await);
        }

        let body: GenerateBody = response
            .json()
            .await
            .map_err(|e| AiError::decode(PROVIDER, e.to_string()))?;

        let text = body.text();
        let usage = body.usage(request, &text);
        Ok(ChatResponse {
            content: text,
            model: request.model.clone(),
            provider: PROVIDER.to_string(),
            usage,
            finish_reason: body.finish_reason(),
        })
    }

    pub fn stream(&self, request: &ChatRequest) -> ChunkStream {
        let builder = self
            .http
            .post(self.url(&request.model, "streamGenerateContent"))
            .query(&[("alt", "sse"), ("key", self.api_key.as_str())])
            .json(&request_body(request));

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

            let mut bytes = response.bytes_stream();
            let mut decoder = SseDecoder::new();
            while let Some(next) = bytes.next().await {
                let next = next.map_err(|e| AiError::transport(PROVIDER, e))?;
                for data in decoder.push(&next) {
                    if let Some(chunk) = parse_stream_data(&data)? {
                        yield chunk;
                    }
                }
            }
            if let Some(data) = decoder.finish() {
                if let Some(chunk) = parse_stream_data(&data)? {
                    yield chunk;
                }
            }
        }
        .boxed()
    }
}

fn request_body(request: &ChatRequest) -> JsonValue {
    let contents: Vec<JsonValue> = request
        .conversation()
        .map(|m| {
            let role = match m.role {
                ChatRole::Assistant => "model",
                _ => "user",
            };
            json!({"role": role, "parts": [{"text": m.content}]})
        })
        .collect();

    let mut body = json!({
        "contents": contents,
        "generationConfig": {
            "temperature": request.temperature,
            "maxOutputTokens": request.max_tokens,
        },
    });
    if let Some(system) = request.system_prompt() {
        body["systemInstruction"] = json!({"parts": [{"text": system}]});
    }
    body
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateBody {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

impl GenerateBody {
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<String>()
            })
            .unwrap_or_default()
    }

    fn finish_reason(&self) -> Option<String> {
        self.candidates.first().and_then(|c| c.finish_reason.clone())
    }

    fn usage(&self, request: &ChatRequest, text: &str) -> TokenUsage {
        match &self.usage_metadata {
            Some(meta) => TokenUsage {
                tokens_in: meta.prompt_token_count,
                tokens_out: meta.candidates_token_count,
                approximate: false,
            },
            None => TokenUsage {
                tokens_in: approximate_tokens(&request.prompt_text()),
                tokens_out: approximate_tokens(text),
                approximate: true,
            },
        }
    }
}

/// Gemini streams full `GenerateContentResponse` objects; usage metadata is
/// cumulative, so the value on the last frame is the total.
fn parse_stream_data(data: &str) -> Result<Option<ChatChunk>, AiError> {
    let body: GenerateBody =
        serde_json::from_str(data).map_err(|e| AiError::decode(PROVIDER, e.to_string()))?;

    let chunk = ChatChunk {
        content_delta: body.text(),
        finish_reason: body.finish_reason(),
        usage: body.usage_metadata.as_ref().map(|meta| TokenUsage {
            tokens_in: meta.prompt_token_count,
            tokens_out: meta.candidates_token_count,
            approximate: false,
        }),
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

    #[test]
    fn assistant_turns_use_the_model_role() {
        let request = ChatRequest::new(
            "gemini-pro",
            vec![
                ChatMessage::user("q"),
                ChatMessage::assistant("a"),
                ChatMessage::user("q2"),
            ],
        )
        .with_system("sys");
        let body = request_body(&request);
        let roles: Vec<&str> = body["contents"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, ["user", "model", "user"]);
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "sys");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 2048);
    }

    #[test]
    fn stream_frame_with_usage_and_finish() {
        let chunk = parse_stream_data(
            r#"{"candidates":[{"content":{"parts":[{"text":"done"}],"role":"model"},"finishReason":"STOP"}],
                "usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":9,"totalTokenCount":13}}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(chunk.content_delta, "done");
        assert_eq!(chunk.finish_reason.as_deref(), Some("STOP"));
        assert_eq!(chunk.usage.unwrap().total(), 13);
    }

    #[test]
    fn missing_usage_metadata_falls_back_to_approximation() {
        let body: GenerateBody = serde_json::from_value(json!({
            "candidates": [{"content": {"parts": [{"text": "12345678"}]}}]
        }))
        .unwrap();
        let request = ChatRequest::new("gemini-pro", vec![ChatMessage::user("abcd")]);
        let usage = body.usage(&request, &body.text());
        assert!(usage.approximate);
        assert_eq!((usage.tokens_in, usage.tokens_out), (1, 2));
    }
}
