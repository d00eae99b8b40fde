//! Wire types for the Anthropic Messages API.
//!
//! Request serialization is fully typed: field order comes from the struct
//! definitions and optional fields vanish via `skip_serializing_if`, so
//! identical inputs produce identical bytes. The provider's prefix cache
//! depends on that.

use serde::{Deserialize, Serialize};

use crate::pricing::{CacheTtl, Usage};

// ── Request side ───────────────────────────────────────

/// `cache_control` marker on a system block. The 5-minute TTL is the
/// provider default and is expressed by omitting the `ttl` key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheControl {
    #[serde(rename = "type")]
    pub control_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
}

impl CacheControl {
    pub fn ephemeral(ttl: CacheTtl) -> Self {
        Self {
            control_type: "ephemeral".into(),
            ttl: match ttl {
                CacheTtl::FiveMinutes => None,
                CacheTtl::OneHour => Some("1h".into()),
            },
        }
    }
}

/// One block of the `system` array.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

impl SystemBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self { block_type: "text".into(), text: text.into(), cache_control: None }
    }

    pub fn text_cached(text: impl Into<String>, ttl: CacheTtl) -> Self {
        Self {
            block_type: "text".into(),
            text: text.into(),
            cache_control: Some(CacheControl::ephemeral(ttl)),
        }
    }

    pub fn is_cached(&self) -> bool {
        self.cache_control.is_some()
    }
}

/// Message content: a bare string for plain text, or a block array when
/// attachments ride along.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<serde_json::Value>),
}

/// One entry of the `messages` array.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageParam {
    pub role: String,
    pub content: MessageContent,
}

impl MessageParam {
    pub fn text(role: &str, content: impl Into<String>) -> Self {
        Self { role: role.into(), content: MessageContent::Text(content.into()) }
    }
}

/// Extended-thinking request configuration.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ThinkingConfig {
    #[serde(rename = "type")]
    pub config_type: String,
    pub budget_tokens: u32,
}

impl ThinkingConfig {
    pub fn enabled(budget_tokens: u32) -> Self {
        Self { config_type: "enabled".into(), budget_tokens }
    }
}

/// Server-side compaction safety net, requested via beta header plus a
/// context-management edit.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ContextManagement {
    pub edits: Vec<CompactionEdit>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CompactionEdit {
    #[serde(rename = "type")]
    pub edit_type: String,
    pub trigger: CompactionTrigger,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CompactionTrigger {
    #[serde(rename = "type")]
    pub trigger_type: String,
    pub value: u64,
}

/// Beta flag enabling server-side compaction.
pub const COMPACTION_BETA: &str = "compact-2026-01-12";

impl ContextManagement {
    /// The standard compaction edit with the given input-token trigger.
    pub fn compaction(trigger_tokens: u64) -> Self {
        Self {
            edits: vec![CompactionEdit {
                edit_type: "compact_20260112".into(),
                trigger: CompactionTrigger { trigger_type: "input_tokens".into(), value: trigger_tokens },
            }],
        }
    }
}

/// Messages API request body.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub max_tokens: u32,
    pub system: Vec<SystemBlock>,
    pub messages: Vec<MessageParam>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_management: Option<ContextManagement>,
}

// ── Response side (non-streaming) ──────────────────────

/// Usage counters as the provider spells them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl From<WireUsage> for Usage {
    fn from(w: WireUsage) -> Self {
        Usage {
            input_tokens: w.input_tokens,
            output_tokens: w.output_tokens,
            cache_creation_tokens: w.cache_creation_input_tokens,
            cache_read_tokens: w.cache_read_input_tokens,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ResponseBlock {
    #[serde(rename = "text")]
    Text {
        #[serde(default)]
        text: String,
    },
    #[serde(rename = "thinking")]
    Thinking {
        #[serde(default)]
        thinking: String,
    },
}

/// Non-streaming Messages API response.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageResponse {
    pub model: Option<String>,
    #[serde(default)]
    pub content: Vec<ResponseBlock>,
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: WireUsage,
}

impl MessageResponse {
    /// Concatenated text content.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let ResponseBlock::Text { text } = block {
                out.push_str(text);
            }
        }
        out
    }
}

/// Provider error envelope (`{"type":"error","error":{...}}`).
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

// ── Response side (SSE events) ─────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum SseEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: SseMessage },
    #[serde(rename = "content_block_start")]
    ContentBlockStart {
        #[serde(default)]
        index: usize,
    },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta {
        #[serde(default)]
        index: usize,
        delta: SseDelta,
    },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop {
        #[serde(default)]
        index: usize,
    },
    #[serde(rename = "message_delta")]
    MessageDelta {
        delta: SseMessageDelta,
        #[serde(default)]
        usage: Option<SseUsageDelta>,
    },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "error")]
    Error { error: ErrorBody },
}

#[derive(Debug, Clone, Deserialize)]
pub struct SseMessage {
    pub model: Option<String>,
    #[serde(default)]
    pub usage: WireUsage,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum SseDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "thinking_delta")]
    ThinkingDelta { thinking: String },
    #[serde(rename = "signature_delta")]
    SignatureDelta { signature: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct SseMessageDelta {
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SseUsageDelta {
    #[serde(default)]
    pub output_tokens: u64,
}
