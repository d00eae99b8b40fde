//! The four-layer request assembler.
//!
//! Layer 1 (system prompt + documents) and Layer 2 (rolling summary) sit
//! behind cache breakpoints; Layer 3 (recent messages) and Layer 4 (the
//! new user turn) are sent uncached. Every formatting decision here is a
//! cache-correctness decision: the provider keys on the full byte prefix
//! up to each marker, so identical inputs must serialize to identical
//! bytes turn after turn.

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::types::{
    ChatRequest, ContextManagement, MessageContent, MessageParam, SystemBlock, ThinkingConfig,
    COMPACTION_BETA,
};
use crate::config::{CACHE_BREAKPOINT_THRESHOLD, COMPACTION_TRIGGER_TOKENS, RESPONSE_TOKEN_RESERVE};
use crate::pricing::{estimate_tokens, model_info, TokenTracker};
use crate::store::conversation_store::uncompressed_slice;
use crate::store::schema::{Attachment, Conversation, Document, Message, Project};

#[derive(Debug, Error)]
pub enum ContextError {
    /// Even the Layer-1 + Layer-2 + Layer-4 baseline exceeds the window.
    /// Fatal for the turn; the user has to reset the summary or start a
    /// new conversation.
    #[error("context too large: baseline {baseline} tokens exceeds budget {budget}")]
    TooLarge { baseline: usize, budget: usize },
}

/// Everything the assembler reads for one turn. `history` is the full
/// ordered transcript; the compressed boundary is applied here.
pub struct BuildInput<'a> {
    pub project: &'a Project,
    pub documents: &'a [Document],
    pub conversation: &'a Conversation,
    pub history: &'a [Message],
    pub user_message: &'a str,
    pub attachments: &'a [Attachment],
    pub model_id: &'a str,
}

/// The assembled request, plus the numbers the estimator shares with it.
#[derive(Debug, Clone)]
pub struct BuiltContext {
    pub system: Vec<SystemBlock>,
    pub messages: Vec<MessageParam>,
    pub estimated_tokens: usize,
    /// Tokens sitting behind cache-control markers.
    pub cached_tokens: usize,
    pub thinking: Option<ThinkingConfig>,
    pub context_management: ContextManagement,
}

impl BuiltContext {
    /// Beta flag that must accompany the compaction extension.
    pub fn beta(&self) -> &'static str {
        COMPACTION_BETA
    }

    pub fn into_request(self, model_id: &str, max_tokens: u32, stream: bool) -> ChatRequest {
        let max_tokens = match &self.thinking {
            // Extended thinking needs headroom beyond its budget.
            Some(thinking) => max_tokens.max(thinking.budget_tokens + 4096),
            None => max_tokens,
        };
        ChatRequest {
            model: model_id.to_string(),
            max_tokens,
            system: self.system,
            messages: self.messages,
            stream,
            thinking: self.thinking,
            context_management: Some(self.context_management),
        }
    }
}

/// Pre-send estimate for display. Produced from the same assembly as
/// [`ContextBuilder::build`], never a heuristic on the side.
#[derive(Debug, Clone)]
pub struct TurnEstimate {
    pub estimated_input_tokens: usize,
    pub estimated_cached_tokens: usize,
    pub estimated_cost_usd: f64,
    pub savings_percent: f64,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ContextBuilder;

impl ContextBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Assemble the four layers and fit them into the model window.
    pub fn build(&self, input: &BuildInput<'_>) -> Result<BuiltContext, ContextError> {
        let settings = &input.project.settings;
        let model = model_info(input.model_id);
        let budget = model.context_window - RESPONSE_TOKEN_RESERVE;

        // ── Layer 1: system prompt + documents (cached) ──
        let system_text = build_system_text(&input.project.system_prompt, input.documents);
        let system_tokens = estimate_tokens(&system_text);
        let mut system = vec![SystemBlock::text_cached(system_text, settings.cache_ttl)];

        // ── Layer 2: rolling summary (conditionally cached) ──
        let mut summary_tokens = 0;
        let mut summary_cached = false;
        if let Some(summary) = input.conversation.rolling_summary.as_deref() {
            let summary_text = wrap_summary(summary);
            summary_tokens = estimate_tokens(&summary_text);
            // Below 1024 tokens the backend silently refuses to cache the
            // block; marking it would only pretend.
            if input.conversation.summary_token_count >= CACHE_BREAKPOINT_THRESHOLD as i64 {
                summary_cached = true;
                system.push(SystemBlock::text_cached(summary_text, settings.cache_ttl));
            } else {
                debug!(
                    "Summary {} tokens, below cache threshold; sending plain",
                    input.conversation.summary_token_count
                );
                system.push(SystemBlock::text(summary_text));
            }
        }

        // ── Layer 4 first: its size is part of the non-negotiable baseline ──
        let user_param = build_user_param(input.user_message, input.attachments);
        let user_tokens = estimate_tokens(input.user_message);

        let baseline = system_tokens + summary_tokens + user_tokens;
        if baseline > budget {
            warn!("Context baseline {} exceeds budget {}", baseline, budget);
            return Err(ContextError::TooLarge { baseline, budget });
        }

        // ── Layer 3: uncompressed recent messages (uncached) ──
        let recent = uncompressed_slice(
            input.history,
            input.conversation.last_compressed_msg_id.as_deref(),
        );
        let mut history: Vec<&Message> = recent.iter().collect();
        // The provider requires the message array to open on a user turn.
        while history.first().is_some_and(|m| m.is_assistant()) {
            history.remove(0);
        }

        let mut history_tokens: usize = history.iter().map(|m| estimate_tokens(&m.content)).sum();
        while baseline + history_tokens > budget && !history.is_empty() {
            // Drop the oldest turn as a pair so roles keep alternating.
            let drop_count = 2.min(history.len());
            for dropped in history.drain(..drop_count) {
                history_tokens -= estimate_tokens(&dropped.content);
            }
            while history.first().is_some_and(|m| m.is_assistant()) {
                let dropped = history.remove(0);
                history_tokens -= estimate_tokens(&dropped.content);
            }
        }

        let mut messages: Vec<MessageParam> = history
            .iter()
            .map(|m| MessageParam::text(&m.role, m.content.clone()))
            .collect();
        messages.push(user_param);

        let estimated_tokens = baseline + history_tokens;
        let cached_tokens = system_tokens + if summary_cached { summary_tokens } else { 0 };

        info!(
            "Context built [4-layer]: L1={}, L2={} (cached={}), L3={}, L4={}, total={}/{} tokens",
            system_tokens,
            summary_tokens,
            summary_cached,
            history_tokens,
            user_tokens,
            estimated_tokens,
            model.context_window,
        );

        let thinking = settings
            .thinking_enabled
            .then(|| ThinkingConfig::enabled(settings.thinking_budget));

        Ok(BuiltContext {
            system,
            messages,
            estimated_tokens,
            cached_tokens,
            thinking,
            context_management: ContextManagement::compaction(COMPACTION_TRIGGER_TOKENS),
        })
    }

    /// Cost estimate for the turn, sharing `build`'s assembly. The cache
    /// prediction is simply "has this conversation sent anything before":
    /// the Layer-1 prefix is warm from the second turn on.
    pub fn estimate(&self, input: &BuildInput<'_>) -> Result<TurnEstimate, ContextError> {
        let built = self.build(input)?;
        let cache_hit = !input.history.is_empty();
        let uncached = built.estimated_tokens - built.cached_tokens;

        let tracker = TokenTracker::new(input.project.settings.cache_ttl);
        let cost = tracker.estimate_cost_with_cache(
            input.model_id,
            built.cached_tokens,
            uncached,
            cache_hit,
        );

        Ok(TurnEstimate {
            estimated_input_tokens: built.estimated_tokens,
            estimated_cached_tokens: cost.cached_tokens,
            estimated_cost_usd: cost.estimated_input_cost,
            savings_percent: cost.savings_percent,
            cache_hit,
        })
    }
}

/// Layer-1 byte sequence. Identical inputs must yield identical bytes:
/// document order is upload order and nothing here is ever reformatted.
pub fn build_system_text(system_prompt: &str, documents: &[Document]) -> String {
    let mut parts: Vec<String> = Vec::new();
    let prompt = system_prompt.trim();
    if !prompt.is_empty() {
        parts.push(prompt.to_string());
    }
    if !documents.is_empty() {
        let docs: Vec<String> = documents
            .iter()
            .map(|d| format!("<document name=\"{}\">\n{}\n</document>", d.filename, d.extracted_text))
            .collect();
        parts.push(format!("<project_knowledge>\n{}\n</project_knowledge>", docs.join("\n\n")));
    }
    if parts.is_empty() {
        return "You are a helpful AI assistant.".to_string();
    }
    parts.join("\n\n")
}

fn wrap_summary(summary: &str) -> String {
    format!("<conversation_summary>\n{summary}\n</conversation_summary>")
}

fn build_user_param(user_message: &str, attachments: &[Attachment]) -> MessageParam {
    if attachments.is_empty() {
        return MessageParam::text("user", user_message);
    }
    let mut blocks = vec![serde_json::json!({"type": "text", "text": user_message})];
    for attachment in attachments {
        blocks.push(serde_json::json!({
            "type": attachment.kind,
            "source": {
                "type": "base64",
                "media_type": attachment.media_type,
                "data": attachment.data,
            },
        }));
    }
    MessageParam { role: "user".into(), content: MessageContent::Blocks(blocks) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    use crate::config::ProjectSettings;
    use crate::pricing::{CacheTtl, DEFAULT_MODEL};

    fn project() -> Project {
        Project {
            id: "p".into(),
            name: "Test".into(),
            system_prompt: "You are a Python expert.".into(),
            default_model: DEFAULT_MODEL.into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            settings: ProjectSettings::default(),
        }
    }

    fn conversation() -> Conversation {
        Conversation {
            id: "c".into(),
            project_id: "p".into(),
            title: "t".into(),
            model_override: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            is_archived: false,
            rolling_summary: None,
            last_compressed_msg_id: None,
            summary_token_count: 0,
        }
    }

    fn document(name: &str, text: &str) -> Document {
        Document {
            id: Uuid::new_v4().to_string(),
            project_id: "p".into(),
            filename: name.into(),
            extracted_text: text.into(),
            token_count: estimate_tokens(text) as i64,
            file_type: ".md".into(),
            created_at: Utc::now(),
        }
    }

    fn message(role: &str, content: &str) -> Message {
        Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: "c".into(),
            role: role.into(),
            content: content.into(),
            thinking: None,
            attachments: vec![],
            model_used: None,
            input_tokens: 0,
            output_tokens: 0,
            cache_read_tokens: 0,
            cache_creation_tokens: 0,
            cost_usd: None,
            created_at: Utc::now(),
        }
    }

    fn turns(n: usize) -> Vec<Message> {
        let mut out = Vec::new();
        for i in 0..n {
            out.push(message("user", &format!("question {i}")));
            out.push(message("assistant", &format!("answer {i}")));
        }
        out
    }

    fn input<'a>(
        project: &'a Project,
        documents: &'a [Document],
        conversation: &'a Conversation,
        history: &'a [Message],
        user_message: &'a str,
    ) -> BuildInput<'a> {
        BuildInput {
            project,
            documents,
            conversation,
            history,
            user_message,
            attachments: &[],
            model_id: DEFAULT_MODEL,
        }
    }

    // ===== Layer-1 Byte Stability Tests =====

    #[test]
    fn test_layer1_bytes_stable_across_turns() {
        let project = project();
        let docs = vec![document("a.md", "alpha"), document("b.md", "beta")];
        let conv = conversation();
        let builder = ContextBuilder::new();

        let history1 = turns(1);
        let first = builder.build(&input(&project, &docs, &conv, &history1, "one")).unwrap();
        let history2 = turns(5);
        let second = builder.build(&input(&project, &docs, &conv, &history2, "two")).unwrap();

        assert_eq!(first.system[0], second.system[0]);
        assert_eq!(
            serde_json::to_string(&first.system[0]).unwrap(),
            serde_json::to_string(&second.system[0]).unwrap(),
        );
    }

    #[test]
    fn test_layer1_changes_when_document_added() {
        let project = project();
        let conv = conversation();
        let builder = ContextBuilder::new();
        let history = turns(1);

        let docs1 = vec![document("a.md", "alpha")];
        let before = builder.build(&input(&project, &docs1, &conv, &history, "hi")).unwrap();
        let docs2 = vec![docs1[0].clone(), document("b.md", "beta")];
        let after = builder.build(&input(&project, &docs2, &conv, &history, "hi")).unwrap();

        assert_ne!(before.system[0].text, after.system[0].text);
    }

    #[test]
    fn test_system_text_format() {
        let docs = vec![document("a.md", "alpha")];
        let text = build_system_text("Prompt.", &docs);
        assert_eq!(
            text,
            "Prompt.\n\n<project_knowledge>\n<document name=\"a.md\">\nalpha\n</document>\n</project_knowledge>"
        );
    }

    #[test]
    fn test_system_text_fallback_when_empty() {
        assert_eq!(build_system_text("  ", &[]), "You are a helpful AI assistant.");
    }

    #[test]
    fn test_layer1_always_cache_marked() {
        let project = project();
        let conv = conversation();
        let builder = ContextBuilder::new();
        let built = builder.build(&input(&project, &[], &conv, &[], "hi")).unwrap();
        assert!(built.system[0].is_cached());
    }

    #[test]
    fn test_cache_ttl_reaches_marker() {
        let mut project = project();
        project.settings.cache_ttl = CacheTtl::OneHour;
        let conv = conversation();
        let builder = ContextBuilder::new();
        let built = builder.build(&input(&project, &[], &conv, &[], "hi")).unwrap();
        let control = built.system[0].cache_control.as_ref().unwrap();
        assert_eq!(control.ttl.as_deref(), Some("1h"));
    }

    // ===== Layer-2 Tests =====

    #[test]
    fn test_no_summary_no_layer2() {
        let project = project();
        let conv = conversation();
        let builder = ContextBuilder::new();
        let built = builder.build(&input(&project, &[], &conv, &[], "hi")).unwrap();
        assert_eq!(built.system.len(), 1);
    }

    #[test]
    fn test_small_summary_not_cache_marked() {
        let project = project();
        let mut conv = conversation();
        conv.rolling_summary = Some("short summary".into());
        conv.last_compressed_msg_id = Some("m".into());
        conv.summary_token_count = 400;

        let builder = ContextBuilder::new();
        let built = builder.build(&input(&project, &[], &conv, &[], "hi")).unwrap();
        assert_eq!(built.system.len(), 2);
        assert!(!built.system[1].is_cached());
        assert!(built.system[1].text.starts_with("<conversation_summary>\n"));
        // Uncached summary bytes bill at full input price.
        assert_eq!(built.cached_tokens, estimate_tokens(&built.system[0].text));
    }

    #[test]
    fn test_large_summary_cache_marked() {
        let project = project();
        let mut conv = conversation();
        conv.rolling_summary = Some("long summary ".repeat(500));
        conv.last_compressed_msg_id = Some("m".into());
        conv.summary_token_count = 1500;

        let builder = ContextBuilder::new();
        let built = builder.build(&input(&project, &[], &conv, &[], "hi")).unwrap();
        assert!(built.system[1].is_cached());
        assert!(built.cached_tokens > estimate_tokens(&built.system[0].text));
    }

    // ===== Layer-3 Tests =====

    #[test]
    fn test_history_excludes_compressed_messages() {
        let project = project();
        let history = turns(3);
        let mut conv = conversation();
        conv.rolling_summary = Some("s".into());
        conv.summary_token_count = 1;
        conv.last_compressed_msg_id = Some(history[1].id.clone());

        let builder = ContextBuilder::new();
        let built = builder.build(&input(&project, &[], &conv, &history, "next")).unwrap();
        // 4 uncompressed + the new user turn.
        assert_eq!(built.messages.len(), 5);
        assert_eq!(
            built.messages[0].content,
            MessageContent::Text("question 1".into())
        );
    }

    #[test]
    fn test_history_starts_with_user_role() {
        let project = project();
        let conv = conversation();
        let mut history = turns(2);
        history.remove(0); // orphan assistant at the front

        let builder = ContextBuilder::new();
        let built = builder.build(&input(&project, &[], &conv, &history, "next")).unwrap();
        assert_eq!(built.messages[0].role, "user");
    }

    #[test]
    fn test_budget_drops_oldest_pairs() {
        let project = project();
        let conv = conversation();
        // Each message ~12.5k tokens; 8 turns won't fit under 191 808.
        let big = "x".repeat(50_000);
        let mut history = Vec::new();
        for _ in 0..8 {
            history.push(message("user", &big));
            history.push(message("assistant", &big));
        }

        let builder = ContextBuilder::new();
        let built = builder.build(&input(&project, &[], &conv, &history, "hi")).unwrap();
        let budget = 200_000 - RESPONSE_TOKEN_RESERVE;
        assert!(built.estimated_tokens <= budget);
        // Oldest dropped, newest kept, user leads.
        assert!(built.messages.len() < 17);
        assert_eq!(built.messages[0].role, "user");
        assert_eq!(built.messages.last().unwrap().content, MessageContent::Text("hi".into()));
    }

    #[test]
    fn test_baseline_overflow_fails() {
        let project = project();
        let conv = conversation();
        let docs = vec![document("huge.md", &"y".repeat(1_000_000))];

        let builder = ContextBuilder::new();
        let result = builder.build(&input(&project, &docs, &conv, &[], "hi"));
        assert!(matches!(result, Err(ContextError::TooLarge { .. })));
    }

    // ===== Layer-4 / Request Shape Tests =====

    #[test]
    fn test_attachments_become_blocks() {
        let project = project();
        let conv = conversation();
        let attachments = vec![Attachment {
            kind: "image".into(),
            media_type: "image/png".into(),
            data: "AAAA".into(),
        }];
        let build_input = BuildInput {
            project: &project,
            documents: &[],
            conversation: &conv,
            history: &[],
            user_message: "look at this",
            attachments: &attachments,
            model_id: DEFAULT_MODEL,
        };
        let built = ContextBuilder::new().build(&build_input).unwrap();
        match &built.messages.last().unwrap().content {
            MessageContent::Blocks(blocks) => {
                assert_eq!(blocks.len(), 2);
                assert_eq!(blocks[1]["type"], "image");
            }
            other => panic!("expected blocks, got {other:?}"),
        }
    }

    #[test]
    fn test_compaction_extension_attached() {
        let project = project();
        let conv = conversation();
        let built = ContextBuilder::new().build(&input(&project, &[], &conv, &[], "hi")).unwrap();
        assert_eq!(built.beta(), "compact-2026-01-12");
        assert_eq!(built.context_management.edits[0].trigger.value, 160_000);
    }

    #[test]
    fn test_thinking_config_from_settings() {
        let mut project = project();
        project.settings.thinking_enabled = true;
        project.settings.thinking_budget = 2048;
        let conv = conversation();

        let built = ContextBuilder::new().build(&input(&project, &[], &conv, &[], "hi")).unwrap();
        let request = built.into_request(DEFAULT_MODEL, 1024, true);
        assert_eq!(request.thinking.as_ref().unwrap().budget_tokens, 2048);
        // Thinking requires headroom beyond the budget.
        assert!(request.max_tokens >= 2048 + 4096);
    }

    // ===== Estimate Tests =====

    #[test]
    fn test_estimate_shares_build_numbers() {
        let project = project();
        let docs = vec![document("a.md", &"d".repeat(40_000))];
        let conv = conversation();
        let history = turns(2);

        let builder = ContextBuilder::new();
        let build_input = input(&project, &docs, &conv, &history, "hi");
        let built = builder.build(&build_input).unwrap();
        let estimate = builder.estimate(&build_input).unwrap();

        assert_eq!(estimate.estimated_input_tokens, built.estimated_tokens);
        assert!(estimate.cache_hit);
        assert_eq!(estimate.estimated_cached_tokens, built.cached_tokens);
        assert!(estimate.savings_percent > 0.0);
    }

    #[test]
    fn test_estimate_first_turn_predicts_miss() {
        let project = project();
        let conv = conversation();
        let estimate = ContextBuilder::new()
            .estimate(&input(&project, &[], &conv, &[], "hello"))
            .unwrap();
        assert!(!estimate.cache_hit);
        assert_eq!(estimate.estimated_cached_tokens, 0);
    }

    #[test]
    fn test_reset_summary_equals_fresh_conversation() {
        let project = project();
        let history = turns(2);
        let builder = ContextBuilder::new();

        // Conversation after a reset: triple cleared.
        let reset_conv = conversation();
        let reset = builder.build(&input(&project, &[], &reset_conv, &history, "hi")).unwrap();

        // Fresh conversation with identical messages.
        let fresh_conv = conversation();
        let fresh = builder.build(&input(&project, &[], &fresh_conv, &history, "hi")).unwrap();

        assert_eq!(reset.system, fresh.system);
        assert_eq!(reset.messages, fresh.messages);
        assert_eq!(reset.system.len(), 1); // no Layer 2
    }
}
