//! The foreground turn lifecycle and its coupling to the background
//! compression worker.
//!
//! One turn walks `Idle -> Building -> Streaming -> Finalising -> Idle`.
//! The draft assistant message lives here until finalisation and is handed
//! to the store exactly once; the worker only ever touches the summary
//! triple, under the same per-conversation lock the commit path uses.

pub mod worker;

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ApiError, StreamEvent, Transport};
use crate::context::{BuildInput, Compressor, ContextBuilder, ContextError};
use crate::pricing::{TokenTracker, Usage};
use crate::store::{Attachment, Message, NewMessage, StationDatabase, StoreError};

/// Events the UI subscribes to.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    TextDelta { conversation_id: String, text: String },
    ThinkingDelta { conversation_id: String, text: String },
    ResponseComplete {
        conversation_id: String,
        message_id: String,
        usage: Usage,
        cost_usd: Option<f64>,
        cancelled: bool,
    },
    TurnFailed { conversation_id: String, error: String },
    SummaryUpdated { conversation_id: String, summary_token_count: i64 },
    /// Compression failed; the previous summary stays in effect. A yellow
    /// warning, never a blocked turn.
    CompressionFailed { conversation_id: String, error: String },
}

/// Foreground turn phases, tracked per conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Building,
    Streaming,
    Finalising,
}

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("a turn is already streaming in this conversation")]
    Busy,
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Api(#[from] ApiError),
}

const EVENT_CAPACITY: usize = 256;
const COMPRESS_QUEUE_CAPACITY: usize = 64;

type ConvLocks = Arc<DashMap<String, Arc<Mutex<()>>>>;

pub struct Orchestrator {
    db: Arc<StationDatabase>,
    transport: Arc<dyn Transport>,
    builder: ContextBuilder,
    max_output_tokens: u32,
    events: broadcast::Sender<TurnEvent>,
    turn_states: DashMap<String, TurnState>,
    conv_locks: ConvLocks,
    compress_tx: mpsc::Sender<String>,
    queued: Arc<DashSet<String>>,
    worker_cancel: CancellationToken,
}

impl Orchestrator {
    /// Wire up the orchestrator and spawn the compression worker task.
    pub fn new(
        db: Arc<StationDatabase>,
        transport: Arc<dyn Transport>,
        max_output_tokens: u32,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (compress_tx, compress_rx) = mpsc::channel(COMPRESS_QUEUE_CAPACITY);
        let conv_locks: ConvLocks = Arc::new(DashMap::new());
        let queued = Arc::new(DashSet::new());
        let worker_cancel = CancellationToken::new();

        let _worker = worker::spawn(worker::WorkerContext {
            db: Arc::clone(&db),
            transport: Arc::clone(&transport),
            compressor: Compressor::new(),
            conv_locks: Arc::clone(&conv_locks),
            queued: Arc::clone(&queued),
            events: events.clone(),
            requeue_tx: compress_tx.clone(),
            cancel: worker_cancel.clone(),
            rx: compress_rx,
        });

        Self {
            db,
            transport,
            builder: ContextBuilder::new(),
            max_output_tokens,
            events,
            turn_states: DashMap::new(),
            conv_locks,
            compress_tx,
            queued,
            worker_cancel,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TurnEvent> {
        self.events.subscribe()
    }

    /// Stop the background worker. In-flight compression is abandoned
    /// without mutating state.
    pub fn shutdown(&self) {
        self.worker_cancel.cancel();
    }

    pub fn turn_state(&self, conversation_id: &str) -> TurnState {
        self.turn_states
            .get(conversation_id)
            .map(|s| *s)
            .unwrap_or(TurnState::Idle)
    }

    fn set_state(&self, conversation_id: &str, state: TurnState) {
        self.turn_states.insert(conversation_id.to_string(), state);
    }

    pub(crate) fn conv_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        worker::conv_lock(&self.conv_locks, conversation_id)
    }

    /// Run one foreground turn: build, stream, commit, then kick the
    /// compression worker. Returns the committed assistant message.
    pub async fn send(
        &self,
        conversation_id: &str,
        text: &str,
        attachments: &[Attachment],
        cancel: &CancellationToken,
    ) -> Result<Message, TurnError> {
        if self.turn_state(conversation_id) != TurnState::Idle {
            return Err(TurnError::Busy);
        }
        self.set_state(conversation_id, TurnState::Building);
        let _turn = TurnReset { orchestrator: self, conversation_id };

        let result = self.run_turn(conversation_id, text, attachments, cancel).await;
        if let Err(e) = &result {
            let _ = self.events.send(TurnEvent::TurnFailed {
                conversation_id: conversation_id.to_string(),
                error: e.to_string(),
            });
        }
        result
    }

    async fn run_turn(
        &self,
        conversation_id: &str,
        text: &str,
        attachments: &[Attachment],
        cancel: &CancellationToken,
    ) -> Result<Message, TurnError> {
        // ── Building ──
        let conversation = self.db.conversations.get(conversation_id)?;
        let project = self.db.projects.get(&conversation.project_id)?;
        let documents = self.db.projects.list_documents(&project.id)?;
        let history = self.db.conversations.get_messages(conversation_id)?;
        let model_id = conversation
            .model_override
            .clone()
            .unwrap_or_else(|| project.default_model.clone());

        let built = self.builder.build(&BuildInput {
            project: &project,
            documents: &documents,
            conversation: &conversation,
            history: &history,
            user_message: text,
            attachments,
            model_id: &model_id,
        })?;
        let beta = built.beta();

        // The request is committed; persist the user turn.
        {
            let lock = self.conv_lock(conversation_id);
            let _guard = lock.lock().await;
            self.db.conversations.append_message(NewMessage {
                conversation_id,
                role: "user",
                content: text,
                thinking: None,
                attachments,
                model_used: None,
                usage: None,
                cost_usd: None,
            })?;
        }

        // ── Streaming ──
        self.set_state(conversation_id, TurnState::Streaming);
        let request = built.into_request(&model_id, self.max_output_tokens, true);

        let (tx, mut rx) = mpsc::channel::<StreamEvent>(EVENT_CAPACITY);
        let chat = async {
            let result = self.transport.chat(&request, Some(beta), &tx, cancel).await;
            drop(tx);
            result
        };
        let accumulate = async {
            let mut text_acc = String::new();
            let mut thinking_acc = String::new();
            while let Some(event) = rx.recv().await {
                match event {
                    StreamEvent::Text(delta) => {
                        text_acc.push_str(&delta);
                        let _ = self.events.send(TurnEvent::TextDelta {
                            conversation_id: conversation_id.to_string(),
                            text: delta,
                        });
                    }
                    StreamEvent::Thinking(delta) => {
                        thinking_acc.push_str(&delta);
                        let _ = self.events.send(TurnEvent::ThinkingDelta {
                            conversation_id: conversation_id.to_string(),
                            text: delta,
                        });
                    }
                }
            }
            (text_acc, thinking_acc)
        };
        let (chat_result, (text_acc, thinking_acc)) = tokio::join!(chat, accumulate);

        // ── Finalising ──
        self.set_state(conversation_id, TurnState::Finalising);
        let summary = match chat_result {
            Ok(summary) => summary,
            Err(e) => {
                // Keep whatever partial text arrived; the transcript stays
                // honest and the turn surfaces its failure.
                if !text_acc.is_empty() {
                    self.commit_assistant(
                        conversation_id,
                        &model_id,
                        &text_acc,
                        &thinking_acc,
                        None,
                        None,
                    )
                    .await?;
                }
                return Err(e.into());
            }
        };

        let tracker = TokenTracker::new(project.settings.cache_ttl);
        let cost_usd = match (&summary.usage, summary.cancelled) {
            (Some(usage), false) => Some(tracker.calculate_cost(&model_id, usage)),
            // Aborted stream: counters may be incomplete, cost stays null.
            _ => None,
        };

        let message = self
            .commit_assistant(
                conversation_id,
                &model_id,
                &text_acc,
                &thinking_acc,
                summary.usage,
                cost_usd,
            )
            .await?;

        if let Some(usage) = &summary.usage {
            if !summary.cancelled {
                self.db
                    .conversations
                    .log_api_call(&project.id, conversation_id, &model_id, usage)?;
            }
        }

        info!(
            "Turn complete in conv {} ({} chars, cancelled={})",
            &conversation_id[..8.min(conversation_id.len())],
            text_acc.len(),
            summary.cancelled,
        );
        let _ = self.events.send(TurnEvent::ResponseComplete {
            conversation_id: conversation_id.to_string(),
            message_id: message.id.clone(),
            usage: summary.usage.unwrap_or_default(),
            cost_usd,
            cancelled: summary.cancelled,
        });

        self.maybe_schedule_compression(conversation_id);
        Ok(message)
    }

    async fn commit_assistant(
        &self,
        conversation_id: &str,
        model_id: &str,
        text: &str,
        thinking: &str,
        usage: Option<Usage>,
        cost_usd: Option<f64>,
    ) -> Result<Message, StoreError> {
        let lock = self.conv_lock(conversation_id);
        let _guard = lock.lock().await;
        self.db.conversations.append_message(NewMessage {
            conversation_id,
            role: "assistant",
            content: text,
            thinking: (!thinking.is_empty()).then_some(thinking),
            attachments: &[],
            model_used: Some(model_id),
            usage,
            cost_usd,
        })
    }

    /// Enqueue the conversation for the worker. Already-queued or
    /// in-flight ids are a no-op; the worker re-checks the trigger itself.
    pub fn maybe_schedule_compression(&self, conversation_id: &str) {
        if !self.queued.insert(conversation_id.to_string()) {
            debug!("Conversation {} already queued for compression", conversation_id);
            return;
        }
        if self.compress_tx.try_send(conversation_id.to_string()).is_err() {
            self.queued.remove(conversation_id);
            warn!("Compression queue full, dropping {}", conversation_id);
        }
    }

    /// User-triggered summary reset: the three fields clear atomically and
    /// the next turn is byte-identical to a fresh conversation's.
    pub fn reset_summary(&self, conversation_id: &str) -> Result<(), StoreError> {
        self.db.conversations.reset_summary(conversation_id)
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.worker_cancel.cancel();
    }
}

/// Resets the turn state to Idle on every exit path of `send`.
struct TurnReset<'a> {
    orchestrator: &'a Orchestrator,
    conversation_id: &'a str,
}

impl Drop for TurnReset<'_> {
    fn drop(&mut self) {
        self.orchestrator.set_state(self.conversation_id, TurnState::Idle);
    }
}
