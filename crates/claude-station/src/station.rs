//! The UI-facing facade: projects, documents, conversations, turns.
//!
//! The GUI shell holds one [`ClaudeStation`] and drives everything through
//! it; the event receiver from [`ClaudeStation::subscribe`] is the only
//! other contact surface.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::{ApiClient, Transport};
use crate::config::{file_type_of, ProjectSettings, StationConfig};
use crate::context::{BuildInput, ContextBuilder, TurnEstimate};
use crate::orchestrator::{Orchestrator, TurnEvent};
use crate::pricing::estimate_tokens;
use crate::store::{
    Attachment, Conversation, ConversationStats, Document, Message, Project, ProjectStats,
    StationDatabase,
};

/// Extraction seam for binary document formats. The core ships plain-text
/// extraction only; PDF/DOCX/XLSX adapters implement this outside.
pub trait TextExtractor: Send + Sync {
    fn supports(&self, file_type: &str) -> bool;
    fn extract(&self, path: &Path) -> Result<String>;
}

/// Reads the file as UTF-8 text (lossy on invalid sequences).
pub struct PlainTextExtractor;

impl TextExtractor for PlainTextExtractor {
    fn supports(&self, _file_type: &str) -> bool {
        true
    }

    fn extract(&self, path: &Path) -> Result<String> {
        let raw = std::fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }
}

pub struct ClaudeStation {
    config: StationConfig,
    db: Arc<StationDatabase>,
    client: Option<Arc<ApiClient>>,
    orchestrator: Orchestrator,
    builder: ContextBuilder,
    extractor: Box<dyn TextExtractor>,
}

impl ClaudeStation {
    /// Open the database and wire the runtime against the live API.
    pub fn new(config: StationConfig, api_key: &str) -> Result<Self> {
        let db = Arc::new(StationDatabase::open(&config.db_path())?);
        let client = Arc::new(ApiClient::new(
            &config.api_base_url,
            api_key,
            config.proxy_url.as_deref(),
        )?);
        let orchestrator =
            Orchestrator::new(Arc::clone(&db), client.clone(), config.max_output_tokens);
        Ok(Self {
            config,
            db,
            client: Some(client),
            orchestrator,
            builder: ContextBuilder::new(),
            extractor: Box::new(PlainTextExtractor),
        })
    }

    /// Wire the runtime over an arbitrary transport (tests, embedded fakes).
    pub fn with_transport(
        config: StationConfig,
        db: Arc<StationDatabase>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let orchestrator =
            Orchestrator::new(Arc::clone(&db), transport, config.max_output_tokens);
        Self {
            config,
            db,
            client: None,
            orchestrator,
            builder: ContextBuilder::new(),
            extractor: Box::new(PlainTextExtractor),
        }
    }

    /// Swap in a richer document extractor.
    pub fn set_extractor(&mut self, extractor: Box<dyn TextExtractor>) {
        self.extractor = extractor;
    }

    pub fn config(&self) -> &StationConfig {
        &self.config
    }

    pub fn database(&self) -> &StationDatabase {
        &self.db
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TurnEvent> {
        self.orchestrator.subscribe()
    }

    pub fn shutdown(&self) {
        self.orchestrator.shutdown();
    }

    // ── Projects ───────────────────────────────────────

    pub fn create_project(&self, name: &str, model: &str, system_prompt: &str) -> Result<Project> {
        Ok(self.db.projects.create(name, model, system_prompt)?)
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        Ok(self.db.projects.list()?)
    }

    pub fn update_project_settings(&self, project_id: &str, settings: &ProjectSettings) -> Result<()> {
        Ok(self.db.projects.update_settings(project_id, settings)?)
    }

    /// Changing the system prompt invalidates the Layer-1 cache prefix;
    /// the next turn in every conversation pays a fresh cache write.
    pub fn update_system_prompt(&self, project_id: &str, system_prompt: &str) -> Result<()> {
        Ok(self.db.projects.update_system_prompt(project_id, system_prompt)?)
    }

    pub fn delete_project(&self, project_id: &str) -> Result<()> {
        self.db.projects.delete(project_id)?;
        let dir = self.config.documents_dir().join(project_id);
        if dir.exists() {
            let _ = std::fs::remove_dir_all(&dir);
        }
        Ok(())
    }

    pub fn project_stats(&self, project_id: &str) -> Result<ProjectStats> {
        Ok(self.db.conversations.project_stats(project_id)?)
    }

    pub fn cache_hit_rate(&self, project_id: &str) -> Result<Option<f64>> {
        Ok(self.db.conversations.cache_hit_rate(project_id)?)
    }

    // ── Documents ──────────────────────────────────────

    /// Upload a document: copy it into the data directory, extract its
    /// text once, and register it. The extracted text never changes
    /// afterwards.
    pub fn upload_document(&self, project_id: &str, source: &Path) -> Result<Document> {
        let filename = source
            .file_name()
            .and_then(|n| n.to_str())
            .context("Source path has no filename")?
            .to_string();
        let file_type = file_type_of(&filename);

        if !self.extractor.supports(&file_type) {
            anyhow::bail!("No text extractor available for '{}' files", file_type);
        }
        let extracted = self.extractor.extract(source)?;
        let token_count = estimate_tokens(&extracted) as i64;

        let document = self.db.projects.add_document(
            project_id,
            &filename,
            &extracted,
            token_count,
            &file_type,
        )?;

        let dest = self.config.document_path(project_id, &document.id, &filename);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(source, &dest)
            .with_context(|| format!("Failed to copy document to {}", dest.display()))?;
        info!("Stored document copy at {}", dest.display());

        Ok(document)
    }

    /// Delete a document. This mutates Layer 1, so every conversation in
    /// the project re-creates its cache prefix on the next turn; warn,
    /// never block.
    pub fn delete_document(&self, project_id: &str, document_id: &str) -> Result<()> {
        let documents = self.db.projects.list_documents(project_id)?;
        let doc = documents.iter().find(|d| d.id == document_id);

        self.db.projects.remove_document(document_id)?;
        if let Some(doc) = doc {
            let path = self.config.document_path(project_id, &doc.id, &doc.filename);
            if path.exists() {
                let _ = std::fs::remove_file(&path);
            }
        }
        warn!(
            "Document {} deleted: project context changed, next turn pays a fresh cache write",
            document_id
        );
        Ok(())
    }

    pub fn list_documents(&self, project_id: &str) -> Result<Vec<Document>> {
        Ok(self.db.projects.list_documents(project_id)?)
    }

    // ── Conversations ──────────────────────────────────

    pub fn create_conversation(
        &self,
        project_id: &str,
        title: &str,
        model_override: Option<&str>,
    ) -> Result<Conversation> {
        Ok(self.db.conversations.create(project_id, title, model_override)?)
    }

    pub fn list_conversations(&self, project_id: &str, include_archived: bool) -> Result<Vec<Conversation>> {
        Ok(self.db.conversations.list(project_id, include_archived)?)
    }

    pub fn rename_conversation(&self, conversation_id: &str, title: &str) -> Result<()> {
        Ok(self.db.conversations.rename(conversation_id, title)?)
    }

    pub fn archive_conversation(&self, conversation_id: &str) -> Result<()> {
        Ok(self.db.conversations.set_archived(conversation_id, true)?)
    }

    pub fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        Ok(self.db.conversations.delete(conversation_id)?)
    }

    pub fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        Ok(self.db.conversations.get_messages(conversation_id)?)
    }

    pub fn conversation_stats(&self, conversation_id: &str) -> Result<ConversationStats> {
        Ok(self.db.conversations.conversation_stats(conversation_id)?)
    }

    /// Raw-transcript export. Compression never touches messages, so this
    /// output is byte-identical before and after any number of
    /// compression cycles.
    pub fn export_transcript(&self, conversation_id: &str) -> Result<String> {
        let conversation = self.db.conversations.get(conversation_id)?;
        let messages = self.db.conversations.get_messages(conversation_id)?;

        let mut out = format!("# {}\n", conversation.title);
        for message in &messages {
            let role = if message.is_user() { "User" } else { "Assistant" };
            out.push_str(&format!("\n## {}\n\n{}\n", role, message.content));
        }
        Ok(out)
    }

    // ── Turns ──────────────────────────────────────────

    /// Run one foreground turn. Deltas and completion arrive on the event
    /// stream; the committed assistant message is returned.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        text: &str,
        attachments: &[Attachment],
        cancel: &CancellationToken,
    ) -> Result<Message> {
        Ok(self
            .orchestrator
            .send(conversation_id, text, attachments, cancel)
            .await?)
    }

    /// Pre-send token/cost estimate for a draft message, produced by the
    /// same assembly that `send_message` would use.
    pub fn estimate_turn(&self, conversation_id: &str, draft: &str) -> Result<TurnEstimate> {
        let conversation = self.db.conversations.get(conversation_id)?;
        let project = self.db.projects.get(&conversation.project_id)?;
        let documents = self.db.projects.list_documents(&project.id)?;
        let history = self.db.conversations.get_messages(conversation_id)?;
        let model_id = conversation
            .model_override
            .clone()
            .unwrap_or_else(|| project.default_model.clone());

        Ok(self.builder.estimate(&BuildInput {
            project: &project,
            documents: &documents,
            conversation: &conversation,
            history: &history,
            user_message: draft,
            attachments: &[],
            model_id: &model_id,
        })?)
    }

    pub fn reset_summary(&self, conversation_id: &str) -> Result<()> {
        Ok(self.orchestrator.reset_summary(conversation_id)?)
    }

    /// Minimal API round trip for the settings dialog.
    pub async fn test_connection(&self) -> Result<String> {
        let client = self
            .client
            .as_ref()
            .context("No live API client configured for this station")?;
        Ok(client.test_connection().await?)
    }
}
