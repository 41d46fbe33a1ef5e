//! `pulse-ai`
//!
//! **Responsibility:** the provider router.
//!
//! One request/response contract ([`ChatRequest`], [`ChatResponse`],
//! [`ChatChunk`]) over a closed set of backends ([`Provider`]), selected through
//! an explicitly constructed [`ProviderRouter`]:
//! - no silent fallback: an unknown or unconfigured provider is rejected,
//! - no retries: upstream failures are returned to the caller,
//! - cancellation is cooperative via `tokio_util::sync::CancellationToken`.

pub mod outline;
pub mod provider;
pub mod request;
pub mod result;
pub mod router;
pub mod sse;
pub mod tokens;

pub use outline::{OutlineBrief, SlideOutline, parse_outline};
pub use provider::{
    AnthropicClient, ChunkStream, GoogleClient, OpenAiClient, Provider, ProviderKind,
    ScriptedProvider, ScriptedReply,
};
pub use request::{ChatMessage, ChatRequest, ChatRole};
pub use result::{AiError, ChatChunk, ChatResponse, TokenUsage};
pub use router::{ModelInfo, ModelTarget, ProviderRouter, ProviderTimeouts, RouterBuilder};
pub use tokens::{TokenCount, approximate_tokens};
