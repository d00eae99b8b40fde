//! The provider client.
//!
//! `chat` streams the foreground turn and may retry while nothing has been
//! emitted; `compress` is the background channel and must get through the
//! [`CompressionGate`] first. A 429 on either channel trips the gate:
//! in-flight compression is cancelled and new ones wait out the window,
//! while chat keeps its right of way.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, Semaphore, SemaphorePermit};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::sse;
use crate::api::types::{
    ChatRequest, ErrorBody, ErrorEnvelope, MessageParam, MessageResponse, SseDelta, SseEvent,
    SystemBlock,
};
use crate::api::{ApiError, StreamEvent, DEFAULT_RETRY_AFTER};
use crate::config::MAX_SUMMARY_TOKENS;
use crate::pricing::{Usage, COMPRESS_MODEL};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const RETRY_DELAYS: [Duration; 3] =
    [Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)];

/// What a finished (or cancelled) chat stream reported about itself. The
/// accumulated text lives with the caller, who watched the sink.
#[derive(Debug, Clone, Default)]
pub struct StreamSummary {
    /// `None` when the stream was cut before the provider reported usage.
    pub usage: Option<Usage>,
    pub stop_reason: Option<String>,
    pub cancelled: bool,
}

/// Process-global priority gate for the background channel.
///
/// `compress` must hold the single permit; `chat` never touches it. A 429
/// trips the gate: the in-flight compression token is cancelled and new
/// acquisitions sleep until the retry window has passed.
pub struct CompressionGate {
    semaphore: Semaphore,
    state: Mutex<GateState>,
}

#[derive(Default)]
struct GateState {
    backoff_until: Option<Instant>,
    inflight: Option<CancellationToken>,
}

impl CompressionGate {
    pub fn new() -> Self {
        Self { semaphore: Semaphore::new(1), state: Mutex::new(GateState::default()) }
    }

    /// Record a rate-limit window and pre-empt the in-flight compression.
    pub fn trip(&self, retry_after: Duration) {
        let mut state = self.state.lock().expect("gate mutex poisoned");
        let until = Instant::now() + retry_after;
        state.backoff_until = Some(state.backoff_until.map_or(until, |u| u.max(until)));
        if let Some(token) = state.inflight.take() {
            info!("Rate limit: cancelling in-flight compression");
            token.cancel();
        }
    }

    fn backoff_remaining(&self) -> Option<Duration> {
        let state = self.state.lock().expect("gate mutex poisoned");
        state
            .backoff_until
            .and_then(|until| until.checked_duration_since(Instant::now()))
            .filter(|d| !d.is_zero())
    }

    /// Wait out any rate-limit window, then take the permit.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<CompressPermit<'_>, ApiError> {
        loop {
            if let Some(wait) = self.backoff_remaining() {
                debug!("Compression gated for {:?}", wait);
                tokio::select! {
                    () = tokio::time::sleep(wait) => {}
                    () = cancel.cancelled() => return Err(ApiError::Cancelled),
                }
            }

            let permit = tokio::select! {
                permit = self.semaphore.acquire() => {
                    permit.map_err(|_| ApiError::Cancelled)?
                }
                () = cancel.cancelled() => return Err(ApiError::Cancelled),
            };

            // A trip may have landed while we queued on the permit.
            if self.backoff_remaining().is_some() {
                drop(permit);
                continue;
            }

            let token = cancel.child_token();
            self.state.lock().expect("gate mutex poisoned").inflight = Some(token.clone());
            return Ok(CompressPermit { _permit: permit, gate: self, token });
        }
    }
}

impl Default for CompressionGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Held for the duration of one compression call.
pub struct CompressPermit<'a> {
    _permit: SemaphorePermit<'a>,
    gate: &'a CompressionGate,
    token: CancellationToken,
}

impl CompressPermit<'_> {
    /// Resolves when the caller's signal or a gate trip cancels this call.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for CompressPermit<'_> {
    fn drop(&mut self) {
        // Only one compression holds the permit at a time, so whatever is
        // registered is ours.
        self.gate.state.lock().expect("gate mutex poisoned").inflight = None;
    }
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    gate: Arc<CompressionGate>,
}

impl ApiClient {
    pub fn new(base_url: &str, api_key: &str, proxy: Option<&str>) -> Result<Self, ApiError> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(600));
        if let Some(proxy_url) = proxy {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| ApiError::Transport(format!("invalid proxy: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let http = builder
            .build()
            .map_err(|e| ApiError::Transport(format!("failed to build HTTP client: {e}")))?;

        if api_key.len() >= 6 {
            info!("API client initialized (key: ...{})", &api_key[api_key.len() - 6..]);
        }
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            gate: Arc::new(CompressionGate::new()),
        })
    }

    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    pub fn gate(&self) -> Arc<CompressionGate> {
        Arc::clone(&self.gate)
    }

    // ── Foreground channel ─────────────────────────────

    /// Stream one chat turn, emitting deltas into `sink`.
    ///
    /// Transient failures retry with backoff (1s/2s/4s) as long as nothing
    /// has reached the sink; once output flowed the stream is
    /// non-idempotent and errors surface directly. Cancellation yields a
    /// summary with `cancelled = true` and whatever usage had arrived.
    pub async fn chat(
        &self,
        request: &ChatRequest,
        beta: Option<&str>,
        sink: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<StreamSummary, ApiError> {
        let mut attempt: usize = 0;
        loop {
            if cancel.is_cancelled() {
                return Ok(StreamSummary { cancelled: true, ..StreamSummary::default() });
            }

            let mut emitted = false;
            let result = match self.post_messages(request, beta).await {
                Ok(response) => self.consume_stream(response, sink, cancel, &mut emitted).await,
                Err(e) => Err(e),
            };

            let error = match result {
                Ok(summary) => return Ok(summary),
                Err(e) => e,
            };

            if let ApiError::RateLimited { retry_after } = &error {
                // Foreground keeps priority: background work yields first.
                self.gate.trip(*retry_after);
            }

            if emitted || !error.is_retryable() || attempt >= RETRY_DELAYS.len() {
                return Err(error);
            }

            let delay = error.retry_after().unwrap_or(RETRY_DELAYS[attempt]);
            attempt += 1;
            warn!("Chat attempt {} failed ({}), retrying in {:?}", attempt, error, delay);
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => {
                    return Ok(StreamSummary { cancelled: true, ..StreamSummary::default() });
                }
            }
        }
    }

    async fn consume_stream(
        &self,
        response: reqwest::Response,
        sink: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
        emitted: &mut bool,
    ) -> Result<StreamSummary, ApiError> {
        let lines = sse::data_lines(response.bytes_stream());
        futures_util::pin_mut!(lines);

        let mut usage = Usage::default();
        let mut saw_usage = false;
        let mut stop_reason: Option<String> = None;

        loop {
            let line = tokio::select! {
                line = lines.next() => line,
                () = cancel.cancelled() => {
                    debug!("Chat stream cancelled at chunk boundary");
                    return Ok(StreamSummary {
                        usage: saw_usage.then_some(usage),
                        stop_reason,
                        cancelled: true,
                    });
                }
            };

            let Some(line) = line else { break };
            let data = line.map_err(|e| {
                if *emitted {
                    ApiError::Stream(e.to_string())
                } else {
                    ApiError::Transport(e.to_string())
                }
            })?;

            let event: SseEvent = match serde_json::from_str(&data) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Skipping unparseable SSE event: {} ({})", e, truncate(&data, 120));
                    continue;
                }
            };

            match event {
                SseEvent::MessageStart { message } => {
                    let wire: Usage = message.usage.into();
                    usage.input_tokens = wire.input_tokens;
                    usage.cache_creation_tokens = wire.cache_creation_tokens;
                    usage.cache_read_tokens = wire.cache_read_tokens;
                    saw_usage = true;
                }
                SseEvent::ContentBlockDelta { delta, .. } => match delta {
                    SseDelta::TextDelta { text } => {
                        *emitted = true;
                        if sink.send(StreamEvent::Text(text)).await.is_err() {
                            return Err(ApiError::Cancelled);
                        }
                    }
                    SseDelta::ThinkingDelta { thinking } => {
                        *emitted = true;
                        if sink.send(StreamEvent::Thinking(thinking)).await.is_err() {
                            return Err(ApiError::Cancelled);
                        }
                    }
                    SseDelta::SignatureDelta { .. } => {}
                },
                SseEvent::MessageDelta { delta, usage: usage_delta } => {
                    if delta.stop_reason.is_some() {
                        stop_reason = delta.stop_reason;
                    }
                    if let Some(u) = usage_delta {
                        usage.output_tokens = u.output_tokens;
                    }
                }
                SseEvent::MessageStop => break,
                SseEvent::Error { error } => return Err(provider_error(&error)),
                SseEvent::ContentBlockStart { .. }
                | SseEvent::ContentBlockStop { .. }
                | SseEvent::Ping => {}
            }
        }

        Ok(StreamSummary { usage: saw_usage.then_some(usage), stop_reason, cancelled: false })
    }

    // ── Background channel ─────────────────────────────

    /// Run one compression call on the Haiku tier. No retries; a 429
    /// trips the gate and surfaces so the worker can re-queue.
    pub async fn compress(
        &self,
        system_text: &str,
        user_text: &str,
        cancel: &CancellationToken,
    ) -> Result<(String, Usage), ApiError> {
        let permit = self.gate.acquire(cancel).await?;

        let request = ChatRequest {
            model: COMPRESS_MODEL.into(),
            max_tokens: MAX_SUMMARY_TOKENS as u32,
            system: vec![SystemBlock::text(system_text)],
            messages: vec![MessageParam::text("user", user_text)],
            stream: false,
            thinking: None,
            context_management: None,
        };

        let response = tokio::select! {
            result = self.post_messages(&request, None) => {
                result.inspect_err(|e| {
                    if let ApiError::RateLimited { retry_after } = e {
                        self.gate.trip(*retry_after);
                    }
                })?
            }
            () = permit.cancelled() => return Err(ApiError::Cancelled),
        };

        let parsed: MessageResponse = tokio::select! {
            body = response.json() => {
                body.map_err(|e| ApiError::Transport(e.to_string()))?
            }
            () = permit.cancelled() => return Err(ApiError::Cancelled),
        };

        Ok((parsed.text().trim().to_string(), parsed.usage.into()))
    }

    /// Minimal round trip to verify key and connectivity.
    pub async fn test_connection(&self) -> Result<String, ApiError> {
        let request = ChatRequest {
            model: COMPRESS_MODEL.into(),
            max_tokens: 10,
            system: vec![],
            messages: vec![MessageParam::text("user", "Hi")],
            stream: false,
            thinking: None,
            context_management: None,
        };
        let response = self.post_messages(&request, None).await?;
        let parsed: MessageResponse =
            response.json().await.map_err(|e| ApiError::Transport(e.to_string()))?;
        Ok(parsed.model.unwrap_or_default())
    }

    // ── Shared plumbing ────────────────────────────────

    async fn post_messages(
        &self,
        request: &ChatRequest,
        beta: Option<&str>,
    ) -> Result<reqwest::Response, ApiError> {
        if !self.is_configured() {
            return Err(ApiError::Auth("API key not configured".into()));
        }

        let mut builder = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION);
        if let Some(beta) = beta {
            builder = builder.header("anthropic-beta", beta);
        }

        let response = builder
            .json(request)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status.as_u16(), retry_after, &body))
    }
}

/// Map an HTTP status + body into the error taxonomy.
fn classify_status(status: u16, retry_after_secs: Option<u64>, body: &str) -> ApiError {
    let message = serde_json::from_str::<ErrorEnvelope>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| truncate(body, 200).to_string());

    match status {
        401 | 403 => ApiError::Auth(message),
        429 => ApiError::RateLimited {
            retry_after: retry_after_secs.map(Duration::from_secs).unwrap_or(DEFAULT_RETRY_AFTER),
        },
        _ => ApiError::Api { status, message },
    }
}

/// Map an in-stream provider error event.
fn provider_error(error: &ErrorBody) -> ApiError {
    match error.error_type.as_str() {
        "rate_limit_error" => ApiError::RateLimited { retry_after: DEFAULT_RETRY_AFTER },
        "authentication_error" | "permission_error" => ApiError::Auth(error.message.clone()),
        "overloaded_error" => ApiError::Api { status: 529, message: error.message.clone() },
        _ => ApiError::Stream(format!("{}: {}", error.error_type, error.message)),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
