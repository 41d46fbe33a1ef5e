//! Provider registry and call wrapper.
//!
//! The router is constructed once by the composition root and shared behind an
//! `Arc`. It owns the timeout policy and the cancellation contract:
//! - synchronous calls check the token on entry and race it against the call,
//! - streams check it at every chunk boundary,
//! - nothing is retried.

use std::collections::HashMap;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::provider::{ChunkStream, Provider, ProviderKind};
use crate::request::ChatRequest;
use crate::result::{AiError, ChatResponse};
use crate::tokens::TokenCount;

/// Per-call limits. Media rendering happens in external workers, so the
/// only in-process calls are chat completions and streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderTimeouts {
    pub chat: Duration,
}

impl Default for ProviderTimeouts {
    fn default() -> Self {
        Self {
            chat: Duration::from_secs(60),
        }
    }
}

/// A concrete provider + model pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelTarget {
    pub provider: ProviderKind,
    pub model: String,
}

impl ModelTarget {
    pub fn new(provider: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    /// Resolve the caller's provider/model pair.
    ///
    /// `model` may carry its own `provider:model` prefix; when it does, it must
    /// agree with `provider` if that is also given.
    pub fn parse(provider: Option<&str>, model: &str) -> Result<Self, AiError> {
        // Only a known provider name counts as a prefix; `ft:gpt-3.5-turbo:org`
        // is a model id.
        let (prefix, bare_model) = match model.split_once(':') {
            Some((prefix, rest)) => match prefix.parse::<ProviderKind>() {
                Ok(kind) => (Some(kind), rest),
                Err(_) => (None, model),
            },
            None => (None, model),
        };

        let kind = match (provider, prefix) {
            (Some(p), Some(q)) => {
                let p = p.parse::<ProviderKind>()?;
                if p != q {
                    return Err(AiError::InvalidInput(format!(
                        "model prefix {q} does not match provider {p}"
                    )));
                }
                p
            }
            (Some(p), None) => p.parse()?,
            (None, Some(q)) => q,
            (None, None) => {
                return Err(AiError::InvalidInput(
                    "provider is required (or use provider:model)".to_string(),
                ));
            }
        };

        if bare_model.trim().is_empty() {
            return Err(AiError::InvalidInput("model must not be empty".to_string()));
        }
        Ok(Self::new(kind, bare_model))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub provider: ProviderKind,
}

const KNOWN_MODELS: &[ModelInfo] = &[
    ModelInfo { id: "gpt-4", name: "GPT-4", provider: ProviderKind::OpenAi },
    ModelInfo { id: "gpt-4-turbo-preview", name: "GPT-4 Turbo", provider: ProviderKind::OpenAi },
    ModelInfo { id: "gpt-3.5-turbo", name: "GPT-3.5 Turbo", provider: ProviderKind::OpenAi },
    ModelInfo { id: "claude-3-opus-20240229", name: "Claude 3 Opus", provider: ProviderKind::Anthropic },
    ModelInfo { id: "claude-3-sonnet-20240229", name: "Claude 3 Sonnet", provider: ProviderKind::Anthropic },
    ModelInfo { id: "claude-3-haiku-20240307", name: "Claude 3 Haiku", provider: ProviderKind::Anthropic },
    ModelInfo { id: "gemini-pro", name: "Gemini Pro", provider: ProviderKind::Google },
    ModelInfo { id: "gemini-pro-vision", name: "Gemini Pro Vision", provider: ProviderKind::Google },
];

/// Outline generation preference, in order.
const OUTLINE_CANDIDATES: &[(ProviderKind, &str)] = &[
    (ProviderKind::OpenAi, "gpt-3.5-turbo"),
    (ProviderKind::Anthropic, "claude-3-haiku-20240307"),
];

#[derive(Debug, Default)]
pub struct RouterBuilder {
    providers: HashMap<ProviderKind, Provider>,
    timeouts: ProviderTimeouts,
}

impl RouterBuilder {
    pub fn with_provider(mut self, kind: ProviderKind, provider: Provider) -> Self {
        self.providers.insert(kind, provider);
        self
    }

    pub fn with_timeouts(mut self, timeouts: ProviderTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Freeze the registry. The outline target is chosen here, once.
    pub fn build(self) -> ProviderRouter {
        let outline = OUTLINE_CANDIDATES
            .iter()
            .find(|(kind, _)| self.providers.contains_key(kind))
            .map(|(kind, model)| ModelTarget::new(*kind, *model));

        let mut configured: Vec<&str> = self.providers.keys().map(|k| k.as_str()).collect();
        configured.sort_unstable();
        info!(
            providers = ?configured,
            outline = ?outline.as_ref().map(|t| t.provider.as_str()),
            "provider router built"
        );
        if outline.is_none() {
            warn!("no provider available for outline generation");
        }

        ProviderRouter {
            providers: self.providers,
            timeouts: self.timeouts,
            outline,
        }
    }
}

#[derive(Debug)]
pub struct ProviderRouter {
    providers: HashMap<ProviderKind, Provider>,
    timeouts: ProviderTimeouts,
    outline: Option<ModelTarget>,
}

impl ProviderRouter {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::default()
    }

    pub fn timeouts(&self) -> ProviderTimeouts {
        self.timeouts
    }

    pub fn is_configured(&self, kind: ProviderKind) -> bool {
        self.providers.contains_key(&kind)
    }

    pub fn resolve(&self, kind: ProviderKind) -> Result<&Provider, AiError> {
        self.providers
            .get(&kind)
            .ok_or_else(|| AiError::ProviderUnavailable(kind.as_str().to_string()))
    }

    /// Target used for slide outlines, fixed at construction.
    pub fn outline_target(&self) -> Result<&ModelTarget, AiError> {
        self.outline
            .as_ref()
            .ok_or_else(|| AiError::ProviderUnavailable("outline".to_string()))
    }

    /// Known models of the configured providers.
    pub fn models(&self) -> Vec<ModelInfo> {
        KNOWN_MODELS
            .iter()
            .filter(|m| self.is_configured(m.provider))
            .cloned()
            .collect()
    }

    /// Token count of `text` as the named provider would estimate it.
    pub fn count_tokens(&self, kind: ProviderKind, text: &str) -> Result<TokenCount, AiError> {
        Ok(self.resolve(kind)?.count_tokens(text))
    }

    /// Synchronous completion with the chat timeout.
    pub async fn complete(
        &self,
        kind: ProviderKind,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, AiError> {
        request.validate()?;
        let provider = self.resolve(kind)?;
        if cancel.is_cancelled() {
            return Err(AiError::Cancelled);
        }

        let limit = self.timeouts.chat;
        debug!(provider = kind.as_str(), model = %request.model, "provider call");

        let mut response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AiError::Cancelled),
            outcome = tokio::time::timeout(limit, provider.complete(request)) => match outcome {
                Ok(result) => result?,
                Err(_) => {
                    return Err(AiError::Timeout {
                        provider: kind.as_str(),
                        after: limit,
                    });
                }
            },
        };
        response.provider = kind.as_str().to_string();
        Ok(response)
    }

    /// Open a stream. Resolution and validation errors are returned eagerly;
    /// everything after that arrives as stream items.
    ///
    /// The chat timeout bounds the wait for each chunk. A fired token ends the
    /// stream with `Cancelled` at the next chunk boundary.
    pub fn stream(
        &self,
        kind: ProviderKind,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, AiError> {
        request.validate()?;
        let provider = self.resolve(kind)?;
        if cancel.is_cancelled() {
            return Err(AiError::Cancelled);
        }

        let mut inner = provider.stream(request);
        let cancel = cancel.clone();
        let idle = self.timeouts.chat;
        let name = kind.as_str();

        Ok(async_stream::stream! {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    next = tokio::time::timeout(idle, inner.next()) => Some(next),
                };
                let Some(next) = next else {
                    yield Err(AiError::Cancelled);
                    break;
                };

                match next {
                    Err(_) => {
                        yield Err(AiError::Timeout { provider: name, after: idle });
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(err))) => {
                        yield Err(err);
                        break;
                    }
                    Ok(Some(Ok(chunk))) => yield Ok(chunk),
                }
            }
        }
        .boxed())
    }
}
