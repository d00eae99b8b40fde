//! Conversation, message, and rolling-summary storage.
//!
//! Messages are append-only and totally ordered by `(created_at, id)`.
//! The summary triple is only ever written through [`ConversationStore::update_summary`]
//! and [`ConversationStore::reset_summary`], both atomic.

use std::sync::Arc;

use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::pricing::Usage;
use crate::store::schema::{Attachment, Conversation, ConversationStats, Message, ProjectStats};
use crate::store::{parse_datetime, StoreError, StoreResult};

/// Parameters for one message append.
pub struct NewMessage<'a> {
    pub conversation_id: &'a str,
    pub role: &'a str,
    pub content: &'a str,
    pub thinking: Option<&'a str>,
    pub attachments: &'a [Attachment],
    pub model_used: Option<&'a str>,
    pub usage: Option<Usage>,
    pub cost_usd: Option<f64>,
}

impl<'a> NewMessage<'a> {
    /// A plain user message with no attachments.
    pub fn user(conversation_id: &'a str, content: &'a str) -> Self {
        Self {
            conversation_id,
            role: "user",
            content,
            thinking: None,
            attachments: &[],
            model_used: None,
            usage: None,
            cost_usd: None,
        }
    }
}

pub struct ConversationStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl ConversationStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn conn(&self) -> StoreResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    // ── Conversations ──────────────────────────────────

    pub fn create(
        &self,
        project_id: &str,
        title: &str,
        model_override: Option<&str>,
    ) -> StoreResult<Conversation> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO conversations (id, project_id, title, model_override, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, project_id, title, model_override, now.to_rfc3339(), now.to_rfc3339()],
        )?;
        conn.execute(
            "UPDATE projects SET updated_at = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), project_id],
        )?;
        info!("Created conversation '{}' in project {}", title, &project_id[..8.min(project_id.len())]);

        Ok(Conversation {
            id,
            project_id: project_id.to_string(),
            title: title.to_string(),
            model_override: model_override.map(str::to_string),
            created_at: now,
            updated_at: now,
            is_archived: false,
            rolling_summary: None,
            last_compressed_msg_id: None,
            summary_token_count: 0,
        })
    }

    pub fn get(&self, conversation_id: &str) -> StoreResult<Conversation> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("{CONVERSATION_SELECT} WHERE id = ?1"))?;
        let mut rows = stmt.query([conversation_id])?;
        match rows.next()? {
            Some(row) => row_to_conversation(row),
            None => Err(StoreError::NotFound { entity: "conversation", id: conversation_id.to_string() }),
        }
    }

    pub fn list(&self, project_id: &str, include_archived: bool) -> StoreResult<Vec<Conversation>> {
        let conn = self.conn()?;
        let sql = if include_archived {
            format!("{CONVERSATION_SELECT} WHERE project_id = ?1 ORDER BY updated_at DESC")
        } else {
            format!(
                "{CONVERSATION_SELECT} WHERE project_id = ?1 AND is_archived = 0 ORDER BY updated_at DESC"
            )
        };
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([project_id])?;
        let mut conversations = Vec::new();
        while let Some(row) = rows.next()? {
            conversations.push(row_to_conversation(row)?);
        }
        Ok(conversations)
    }

    pub fn rename(&self, conversation_id: &str, title: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE conversations SET title = ?1, updated_at = ?2 WHERE id = ?3",
            params![title, Utc::now().to_rfc3339(), conversation_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound { entity: "conversation", id: conversation_id.to_string() });
        }
        Ok(())
    }

    pub fn set_archived(&self, conversation_id: &str, archived: bool) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE conversations SET is_archived = ?1 WHERE id = ?2",
            params![archived as i64, conversation_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound { entity: "conversation", id: conversation_id.to_string() });
        }
        Ok(())
    }

    pub fn delete(&self, conversation_id: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM conversations WHERE id = ?1", [conversation_id])?;
        if deleted == 0 {
            return Err(StoreError::NotFound { entity: "conversation", id: conversation_id.to_string() });
        }
        info!("Deleted conversation {}", &conversation_id[..8.min(conversation_id.len())]);
        Ok(())
    }

    // ── Messages ───────────────────────────────────────

    /// Append one message atomically and touch the conversation.
    pub fn append_message(&self, new: NewMessage<'_>) -> StoreResult<Message> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let attachments_json = serde_json::to_string(new.attachments)?;
        let usage = new.usage.unwrap_or_default();

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO messages
             (id, conversation_id, role, content, thinking_content, attachments_json, model_used,
              input_tokens, output_tokens, cache_read_tokens, cache_creation_tokens, cost_usd, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                id,
                new.conversation_id,
                new.role,
                new.content,
                new.thinking,
                attachments_json,
                new.model_used,
                usage.input_tokens as i64,
                usage.output_tokens as i64,
                usage.cache_read_tokens as i64,
                usage.cache_creation_tokens as i64,
                new.cost_usd,
                now.to_rfc3339(),
            ],
        )?;
        tx.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), new.conversation_id],
        )?;
        tx.commit()?;

        debug!(
            "Saved {} message ({} in / {} out tokens) in conv {}",
            new.role,
            usage.input_tokens,
            usage.output_tokens,
            &new.conversation_id[..8.min(new.conversation_id.len())],
        );

        Ok(Message {
            id,
            conversation_id: new.conversation_id.to_string(),
            role: new.role.to_string(),
            content: new.content.to_string(),
            thinking: new.thinking.map(str::to_string),
            attachments: new.attachments.to_vec(),
            model_used: new.model_used.map(str::to_string),
            input_tokens: usage.input_tokens as i64,
            output_tokens: usage.output_tokens as i64,
            cache_read_tokens: usage.cache_read_tokens as i64,
            cache_creation_tokens: usage.cache_creation_tokens as i64,
            cost_usd: new.cost_usd,
            created_at: now,
        })
    }

    /// All messages of a conversation, ordered by `(created_at, id)`.
    pub fn get_messages(&self, conversation_id: &str) -> StoreResult<Vec<Message>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{MESSAGE_SELECT} WHERE conversation_id = ?1 ORDER BY created_at ASC, id ASC"
        ))?;
        let mut rows = stmt.query([conversation_id])?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            messages.push(row_to_message(row)?);
        }
        Ok(messages)
    }

    /// Messages strictly after the conversation's compressed boundary.
    pub fn get_uncompressed_messages(&self, conversation_id: &str) -> StoreResult<Vec<Message>> {
        let conv = self.get(conversation_id)?;
        let messages = self.get_messages(conversation_id)?;
        Ok(uncompressed_slice(&messages, conv.last_compressed_msg_id.as_deref()).to_vec())
    }

    // ── Rolling summary ────────────────────────────────

    /// Commit a new rolling summary: a single three-field write.
    ///
    /// Rejects with [`StoreError::StaleCutoff`] when `cutoff_msg_id` is
    /// not a message of this conversation or does not strictly advance the
    /// current compressed boundary (a concurrent update or reset won the
    /// race).
    pub fn update_summary(
        &self,
        conversation_id: &str,
        summary: &str,
        cutoff_msg_id: &str,
        token_count: i64,
    ) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let cutoff: Option<(String, String)> = tx
            .query_row(
                "SELECT created_at, id FROM messages WHERE id = ?1 AND conversation_id = ?2",
                params![cutoff_msg_id, conversation_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let cutoff = cutoff.ok_or(StoreError::StaleCutoff)?;

        let current: Option<String> = tx
            .query_row(
                "SELECT last_compressed_msg_id FROM conversations WHERE id = ?1",
                [conversation_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        if let Some(current_id) = current {
            let boundary: Option<(String, String)> = tx
                .query_row(
                    "SELECT created_at, id FROM messages WHERE id = ?1",
                    [&current_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            if let Some(boundary) = boundary {
                if cutoff <= boundary {
                    return Err(StoreError::StaleCutoff);
                }
            }
        }

        let changed = tx.execute(
            "UPDATE conversations
             SET rolling_summary = ?1, last_compressed_msg_id = ?2, summary_token_count = ?3,
                 updated_at = ?4
             WHERE id = ?5",
            params![summary, cutoff_msg_id, token_count, Utc::now().to_rfc3339(), conversation_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound { entity: "conversation", id: conversation_id.to_string() });
        }
        tx.commit()?;

        info!(
            "Summary updated for conv {}: {} tokens, cutoff {}",
            &conversation_id[..8.min(conversation_id.len())],
            token_count,
            &cutoff_msg_id[..8.min(cutoff_msg_id.len())],
        );
        Ok(())
    }

    /// Clear the summary triple atomically. The raw transcript is the
    /// source of truth; nothing else changes.
    pub fn reset_summary(&self, conversation_id: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE conversations
             SET rolling_summary = NULL, last_compressed_msg_id = NULL, summary_token_count = 0,
                 updated_at = ?1
             WHERE id = ?2",
            params![Utc::now().to_rfc3339(), conversation_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound { entity: "conversation", id: conversation_id.to_string() });
        }
        info!("Summary reset for conv {}", &conversation_id[..8.min(conversation_id.len())]);
        Ok(())
    }

    // ── Statistics ─────────────────────────────────────

    pub fn conversation_stats(&self, conversation_id: &str) -> StoreResult<ConversationStats> {
        let conn = self.conn()?;
        let stats = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(input_tokens), 0),
                    COALESCE(SUM(output_tokens), 0),
                    COALESCE(SUM(cache_read_tokens), 0),
                    COALESCE(SUM(cache_creation_tokens), 0),
                    COALESCE(SUM(cost_usd), 0.0)
             FROM messages WHERE conversation_id = ?1",
            [conversation_id],
            |row| {
                Ok(ConversationStats {
                    message_count: row.get(0)?,
                    total_input: row.get(1)?,
                    total_output: row.get(2)?,
                    total_cache_read: row.get(3)?,
                    total_cache_creation: row.get(4)?,
                    total_cost: row.get(5)?,
                })
            },
        )?;
        Ok(stats)
    }

    pub fn project_stats(&self, project_id: &str) -> StoreResult<ProjectStats> {
        let conn = self.conn()?;
        let stats = conn.query_row(
            "SELECT COUNT(DISTINCT c.id),
                    COUNT(m.id),
                    COALESCE(SUM(m.input_tokens), 0),
                    COALESCE(SUM(m.output_tokens), 0),
                    COALESCE(SUM(m.cache_read_tokens), 0),
                    COALESCE(SUM(m.cost_usd), 0.0)
             FROM conversations c
             LEFT JOIN messages m ON m.conversation_id = c.id
             WHERE c.project_id = ?1",
            [project_id],
            |row| {
                Ok(ProjectStats {
                    conversation_count: row.get(0)?,
                    message_count: row.get(1)?,
                    total_input: row.get(2)?,
                    total_output: row.get(3)?,
                    total_cache_read: row.get(4)?,
                    total_cost: row.get(5)?,
                })
            },
        )?;
        Ok(stats)
    }

    /// Record the cache counters of one API response for hit-rate stats.
    pub fn log_api_call(
        &self,
        project_id: &str,
        conversation_id: &str,
        model_id: &str,
        usage: &Usage,
    ) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO api_call_log
             (project_id, conversation_id, model_id, input_tokens, cache_read_tokens, cache_creation_tokens, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                project_id,
                conversation_id,
                model_id,
                usage.input_tokens as i64,
                usage.cache_read_tokens as i64,
                usage.cache_creation_tokens as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Share of input-side tokens served from cache, across all logged
    /// calls of a project. `None` before the first call.
    pub fn cache_hit_rate(&self, project_id: &str) -> StoreResult<Option<f64>> {
        let conn = self.conn()?;
        let (read, creation, input): (i64, i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(cache_read_tokens), 0),
                    COALESCE(SUM(cache_creation_tokens), 0),
                    COALESCE(SUM(input_tokens), 0)
             FROM api_call_log WHERE project_id = ?1",
            [project_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let total = read + creation + input;
        if total == 0 {
            return Ok(None);
        }
        Ok(Some(read as f64 / total as f64))
    }
}

/// Slice of `messages` strictly after the compressed boundary. With no
/// boundary, or a boundary id that is not in the list, the whole slice is
/// returned.
pub fn uncompressed_slice<'a>(messages: &'a [Message], cutoff_msg_id: Option<&str>) -> &'a [Message] {
    match cutoff_msg_id {
        Some(cutoff) => match messages.iter().position(|m| m.id == cutoff) {
            Some(idx) => &messages[idx + 1..],
            None => messages,
        },
        None => messages,
    }
}

const CONVERSATION_SELECT: &str = "SELECT id, project_id, title, model_override, created_at, updated_at,
        is_archived, rolling_summary, last_compressed_msg_id, summary_token_count
 FROM conversations";

const MESSAGE_SELECT: &str = "SELECT id, conversation_id, role, content, thinking_content, attachments_json, model_used,
        input_tokens, output_tokens, cache_read_tokens, cache_creation_tokens, cost_usd, created_at
 FROM messages";

fn row_to_conversation(row: &Row) -> StoreResult<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        model_override: row.get(3)?,
        created_at: parse_datetime(&row.get::<_, String>(4)?),
        updated_at: parse_datetime(&row.get::<_, String>(5)?),
        is_archived: row.get::<_, i64>(6)? != 0,
        rolling_summary: row.get(7)?,
        last_compressed_msg_id: row.get(8)?,
        summary_token_count: row.get(9)?,
    })
}

fn row_to_message(row: &Row) -> StoreResult<Message> {
    let attachments_json: String = row.get(5)?;
    let attachments: Vec<Attachment> = serde_json::from_str(&attachments_json).unwrap_or_default();
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        thinking: row.get(4)?,
        attachments,
        model_used: row.get(6)?,
        input_tokens: row.get(7)?,
        output_tokens: row.get(8)?,
        cache_read_tokens: row.get(9)?,
        cache_creation_tokens: row.get(10)?,
        cost_usd: row.get(11)?,
        created_at: parse_datetime(&row.get::<_, String>(12)?),
    })
}
