//! Closed set of chat backends.
//!
//! Each variant wraps a concrete client; [`Provider`] dispatches the three
//! capabilities (`complete`, `stream`, `count_tokens`) with a `match` rather
//! than a trait object so the set stays explicit.

use core::str::FromStr;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::request::ChatRequest;
use crate::result::{AiError, ChatChunk, ChatResponse};
use crate::tokens::TokenCount;

pub mod anthropic;
pub mod google;
pub mod openai;
pub mod scripted;

pub use anthropic::AnthropicClient;
pub use google::GoogleClient;
pub use openai::OpenAiClient;
pub use scripted::{ScriptedProvider, ScriptedReply};

/// Lazy, finite, non-restartable sequence of chunks.
pub type ChunkStream = BoxStream<'static, Result<ChatChunk, AiError>>;

/// Registry key: the provider identifier callers name explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Google,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::OpenAi,
        ProviderKind::Anthropic,
        ProviderKind::Google,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Google => "google",
        }
    }
}

impl core::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = AiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" => Ok(ProviderKind::Anthropic),
            "google" => Ok(ProviderKind::Google),
            other => Err(AiError::UnknownProvider(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Provider {
    OpenAi(OpenAiClient),
    Anthropic(AnthropicClient),
    Google(GoogleClient),
    /// Offline deterministic backend (local development, tests).
    Scripted(ScriptedProvider),
}

impl Provider {
    pub fn name(&self) -> &'static str {
        match self {
            Provider::OpenAi(_) => "openai",
            Provider::Anthropic(_) => "anthropic",
            Provider::Google(_) => "google",
            Provider::Scripted(_) => "scripted",
        }
    }

    pub async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, AiError> {
        match self {
            Provider::OpenAi(client) => client.complete(request).await,
            Provider::Anthropic(client) => client.complete(request).await,
            Provider::Google(client) => client.complete(request).await,
            Provider::Scripted(scripted) => scripted.complete(request).await,
        }
    }

    pub fn stream(&self, request: &ChatRequest) -> ChunkStream {
        match self {
            Provider::OpenAi(client) => client.stream(request),
            Provider::Anthropic(client) => client.stream(request),
            Provider::Google(client) => client.stream(request),
            Provider::Scripted(scripted) => scripted.stream(request),
        }
    }

    /// Local estimate of the token count of `text`.
    ///
    /// None of the backends expose an offline tokenizer here, so every variant
    /// uses the chars / 4 approximation and labels it as such.
    pub fn count_tokens(&self, text: &str) -> TokenCount {
        TokenCount::approximate(text)
    }
}

/// Read a non-success response body for the error message.
pub(crate) async fn upstream_error(provider: &'static str, response: reqwest::Response) -> AiError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    AiError::Upstream {
        provider,
        status,
        body: truncate(&body, 512),
    }
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_ids_parse_case_insensitively() {
        assert_eq!("OpenAI".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAi);
        assert_eq!(" google ".parse::<ProviderKind>().unwrap(), ProviderKind::Google);
        assert_eq!(
            "mistral".parse::<ProviderKind>().unwrap_err(),
            AiError::UnknownProvider("mistral".to_string())
        );
    }

    /// Local HTTP endpoint that answers every request with `status` and `body`.
    async fn failing_upstream(status: u16, body: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut request = Vec::new();
                let mut buf = [0u8; 4096];
                // Read the whole request so the client is not cut off mid-send.
                loop {
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                    let text = String::from_utf8_lossy(&request);
                    if let Some(end) = text.find("\r\n\r\n") {
                        let length = text[..end]
                            .lines()
                            .find_map(|l| {
                                let (name, value) = l.split_once(':')?;
                                name.eq_ignore_ascii_case("content-length")
                                    .then(|| value.trim().parse::<usize>().ok())?
                            })
                            .unwrap_or(0);
                        if request.len() >= end + 4 + length {
                            break;
                        }
                    }
                }
                let response = format!(
                    "HTTP/1.1 {status} Upstream\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn streams_surface_non_success_statuses_as_upstream_errors() {
        let base_url = failing_upstream(503, "overloaded").await;
        let http = reqwest::Client::builder().no_proxy().build().unwrap();
        let providers = [
            Provider::OpenAi(OpenAiClient::new(http.clone(), "k").with_base_url(&base_url)),
            Provider::Anthropic(AnthropicClient::new(http.clone(), "k").with_base_url(&base_url)),
            Provider::Google(GoogleClient::new(http, "k").with_base_url(&base_url)),
        ];
        let request = ChatRequest::new("m", vec![crate::request::ChatMessage::user("hi")]);

        for provider in providers {
            let items: Vec<_> = futures::StreamExt::collect(provider.stream(&request)).await;
            assert_eq!(items.len(), 1, "{provider:?}");
            match &items[0] {
                Err(AiError::Upstream { status, body, .. }) => {
                    assert_eq!(*status, 503);
                    assert_eq!(body, "overloaded");
                }
                other => panic!("unexpected stream item: {other:?}"),
            }
        }
    }

    #[test]
    fn count_tokens_is_labelled_approximate() {
        let provider = Provider::Scripted(ScriptedProvider::echo());
        let count = provider.count_tokens("twelve chars");
        assert_eq!(count.tokens, 3);
        assert!(count.approximate);
    }
}
