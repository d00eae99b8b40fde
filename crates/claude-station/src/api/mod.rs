//! Two-channel transport to the provider: foreground streaming chat and
//! background, rate-limit-yielding compression.

pub mod client;
pub mod sse;
pub mod types;

pub use client::{ApiClient, CompressPermit, CompressionGate, StreamSummary};
pub use types::{
    CacheControl, ChatRequest, ContextManagement, MessageContent, MessageParam, SystemBlock,
    ThinkingConfig, COMPACTION_BETA,
};

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::pricing::Usage;

/// The provider seam the orchestrator and worker talk through. Production
/// uses [`ApiClient`]; tests script it.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Stream one chat turn, emitting deltas into `sink`.
    async fn chat(
        &self,
        request: &ChatRequest,
        beta: Option<&str>,
        sink: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<StreamSummary, ApiError>;

    /// One non-streaming summariser call on the background channel.
    async fn compress(
        &self,
        system_text: &str,
        user_text: &str,
        cancel: &CancellationToken,
    ) -> Result<(String, Usage), ApiError>;
}

#[async_trait::async_trait]
impl Transport for ApiClient {
    async fn chat(
        &self,
        request: &ChatRequest,
        beta: Option<&str>,
        sink: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<StreamSummary, ApiError> {
        ApiClient::chat(self, request, beta, sink, cancel).await
    }

    async fn compress(
        &self,
        system_text: &str,
        user_text: &str,
        cancel: &CancellationToken,
    ) -> Result<(String, Usage), ApiError> {
        ApiClient::compress(self, system_text, user_text, cancel).await
    }
}

/// Fallback when a 429 arrives without a usable `retry-after` header.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Events emitted into the foreground sink while a response streams.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Text(String),
    Thinking(String),
}

/// Transport and provider errors, classified the way the rest of the core
/// reacts to them.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Timeout, connection reset, DNS failure. Retryable pre-emission.
    #[error("network error: {0}")]
    Transport(String),

    /// Non-2xx from the provider. 5xx is retryable, other statuses are not.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// 429 or provider `rate_limit_error`. Chat waits it out; compression
    /// yields and re-queues.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Duration },

    /// 401/403. The user has to fix their key; retrying is pointless.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The cancellation signal fired.
    #[error("cancelled")]
    Cancelled,

    /// The stream broke after output had already been emitted.
    #[error("stream error: {0}")]
    Stream(String),
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Transport(_) | ApiError::RateLimited { .. } => true,
            ApiError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}
