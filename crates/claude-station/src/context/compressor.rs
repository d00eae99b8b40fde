//! Compression policy: when to fold history, which turns to fold, and the
//! exact prompt handed to the summariser tier.
//!
//! Project documents are deliberately absent from the prompt. Compression
//! is a linguistic task; shipping the knowledge base with every summariser
//! call would multiply its cost for nothing. The summariser gets the
//! project name and an instruction to copy domain terms verbatim.

use tracing::debug;

use crate::config::{MAX_SUMMARY_TOKENS, SUMMARY_RECOMPRESS_THRESHOLD};
use crate::pricing::estimate_tokens;
use crate::store::conversation_store::uncompressed_slice;
use crate::store::schema::{Conversation, Message};

/// The prompt pair for one summariser call.
#[derive(Debug, Clone)]
pub struct CompressionPrompt {
    pub system: String,
    pub user: String,
    /// Estimated tokens going in, for cost accounting.
    pub input_tokens: usize,
}

/// The oldest complete turns selected for folding.
#[derive(Debug, Clone)]
pub struct CompressionBatch<'a> {
    pub messages: Vec<&'a Message>,
    /// Last message of the batch; becomes the new compressed boundary.
    pub cutoff_msg_id: &'a str,
}

#[derive(Debug, Clone, Default)]
pub struct Compressor;

impl Compressor {
    pub fn new() -> Self {
        Self
    }

    /// True iff the uncompressed *complete* turns strictly exceed the
    /// project's threshold. A turn is one user message plus its assistant
    /// response; a trailing unpaired user message does not count.
    pub fn should_compress(
        &self,
        conversation: &Conversation,
        history: &[Message],
        compress_after_turns: u32,
    ) -> bool {
        let uncompressed =
            uncompressed_slice(history, conversation.last_compressed_msg_id.as_deref());
        let turns = complete_turns(uncompressed);
        let should = turns > compress_after_turns as usize;
        debug!(
            "Compression check for conv {}: {} turns > {} threshold = {}",
            &conversation.id[..8.min(conversation.id.len())],
            turns,
            compress_after_turns,
            should,
        );
        should
    }

    /// The oldest `batch_size` complete turns among the uncompressed
    /// messages. `None` when there is not a single complete turn.
    pub fn select_batch<'a>(
        &self,
        conversation: &Conversation,
        history: &'a [Message],
        batch_size: u32,
    ) -> Option<CompressionBatch<'a>> {
        let uncompressed =
            uncompressed_slice(history, conversation.last_compressed_msg_id.as_deref());

        let mut selected: Vec<&Message> = Vec::new();
        let mut pending_user: Option<&Message> = None;
        let mut turns_taken = 0usize;

        for message in uncompressed {
            if turns_taken >= batch_size as usize {
                break;
            }
            if message.is_user() {
                // A user turn without an assistant reply restarts the pair.
                pending_user = Some(message);
            } else if message.is_assistant() {
                if let Some(user) = pending_user.take() {
                    selected.push(user);
                    selected.push(message);
                    turns_taken += 1;
                }
            }
        }

        let cutoff_msg_id = selected.last().map(|m| m.id.as_str())?;
        Some(CompressionBatch { messages: selected, cutoff_msg_id })
    }

    /// Prompt for folding `batch` into the rolling summary.
    pub fn build_prompt(
        &self,
        project_name: &str,
        prior_summary: Option<&str>,
        batch: &CompressionBatch<'_>,
    ) -> CompressionPrompt {
        let transcript = format_transcript(&batch.messages);
        self.prompt_from_parts(project_name, prior_summary, &transcript)
    }

    /// Prompt for collapsing an oversized summary back under the cap. Runs
    /// against an empty prior so the result replaces, not appends.
    pub fn build_recompress_prompt(&self, project_name: &str, summary: &str) -> CompressionPrompt {
        self.prompt_from_parts(project_name, None, summary)
    }

    fn prompt_from_parts(
        &self,
        project_name: &str,
        prior_summary: Option<&str>,
        content: &str,
    ) -> CompressionPrompt {
        let system = format!(
            "You are a conversation summarizer for project '{project_name}'. \
             Output ONLY the summary in the same language as the conversation. \
             No preamble, no explanation."
        );
        let existing = match prior_summary {
            Some(prior) if !prior.is_empty() => prior,
            _ => "(none)",
        };
        let user = format!(
            "Compress the following conversation into a concise summary. Rules:\n\
             1. Preserve all key decisions and conclusions.\n\
             2. Preserve code signatures and core logic verbatim - do not paraphrase code.\n\
             3. Preserve domain terms, data points, and numeric values verbatim.\n\
             4. Preserve user preferences and constraints.\n\
             5. Remove pleasantries, repetition, and filler.\n\
             6. Keep the summary under {MAX_SUMMARY_TOKENS} tokens.\n\
             \n\
             Existing summary:\n{existing}\n\
             \n\
             New conversation content:\n{content}"
        );
        let input_tokens = estimate_tokens(&system) + estimate_tokens(&user);
        CompressionPrompt { system, user, input_tokens }
    }

    /// Append a fresh batch summary onto the rolling one.
    pub fn merge_summaries(&self, prior: Option<&str>, new_summary: &str) -> String {
        match prior {
            Some(prior) if !prior.is_empty() => format!("{prior}\n\n{new_summary}"),
            _ => new_summary.to_string(),
        }
    }

    /// Whether the merged summary has outgrown the recompression gate.
    /// The 500-token cap per cycle plus this gate keeps the summary O(1)
    /// in conversation length.
    pub fn needs_recompression(&self, summary: &str) -> bool {
        estimate_tokens(summary) > SUMMARY_RECOMPRESS_THRESHOLD
    }
}

/// Number of complete user+assistant pairs, in order.
fn complete_turns(messages: &[Message]) -> usize {
    let mut turns = 0;
    let mut pending_user = false;
    for message in messages {
        if message.is_user() {
            pending_user = true;
        } else if message.is_assistant() && pending_user {
            turns += 1;
            pending_user = false;
        }
    }
    turns
}

fn format_transcript(messages: &[&Message]) -> String {
    let parts: Vec<String> = messages
        .iter()
        .map(|m| {
            let role = if m.is_user() { "User" } else { "Assistant" };
            format!("[{}]: {}", role, m.content)
        })
        .collect();
    parts.join("\n\n")
}
