//! The background compression worker.
//!
//! One dedicated task drains a bounded queue of conversation ids. It never
//! blocks the foreground: the summariser call sits behind the compression
//! gate, and a rate-limited or raced attempt re-queues the id instead of
//! mutating anything.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ApiError, Transport};
use crate::context::{CompressionBatch, Compressor};
use crate::orchestrator::TurnEvent;
use crate::pricing::{estimate_tokens, COMPRESS_MODEL};
use crate::store::{StationDatabase, StoreError};

pub struct WorkerContext {
    pub db: Arc<StationDatabase>,
    pub transport: Arc<dyn Transport>,
    pub compressor: Compressor,
    pub conv_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    pub queued: Arc<DashSet<String>>,
    pub events: broadcast::Sender<TurnEvent>,
    pub requeue_tx: mpsc::Sender<String>,
    pub cancel: CancellationToken,
    pub rx: mpsc::Receiver<String>,
}

pub(crate) fn conv_lock(
    locks: &DashMap<String, Arc<Mutex<()>>>,
    conversation_id: &str,
) -> Arc<Mutex<()>> {
    locks
        .entry(conversation_id.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// How one compression attempt ended.
enum Outcome {
    /// Summary committed, or nothing needed doing.
    Done,
    /// Transient condition (rate limit, cancellation, stale cutoff): put
    /// the id back and try again later.
    Requeue(&'static str),
    /// Real failure: keep the last good summary, surface a warning.
    Failed(String),
}

pub fn spawn(mut ctx: WorkerContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Compression worker started");
        loop {
            let conversation_id = tokio::select! {
                () = ctx.cancel.cancelled() => break,
                id = ctx.rx.recv() => match id {
                    Some(id) => id,
                    None => break,
                },
            };

            let outcome = process(&ctx, &conversation_id).await;
            match outcome {
                Outcome::Done => {
                    ctx.queued.remove(&conversation_id);
                }
                Outcome::Requeue(reason) => {
                    if ctx.cancel.is_cancelled() {
                        ctx.queued.remove(&conversation_id);
                        break;
                    }
                    debug!("Re-queueing compression for {} ({})", conversation_id, reason);
                    // The id stays in the dedup set; the gate makes the
                    // retry wait out any rate-limit window. try_send so a
                    // full queue can never wedge the only consumer.
                    if ctx.requeue_tx.try_send(conversation_id.clone()).is_err() {
                        ctx.queued.remove(&conversation_id);
                        warn!("Compression queue full, dropping re-queue of {}", conversation_id);
                    }
                }
                Outcome::Failed(error) => {
                    ctx.queued.remove(&conversation_id);
                    warn!("Compression failed for {}: {}", conversation_id, error);
                    let _ = ctx.events.send(TurnEvent::CompressionFailed {
                        conversation_id: conversation_id.clone(),
                        error,
                    });
                }
            }
        }
        info!("Compression worker stopped");
    })
}

async fn process(ctx: &WorkerContext, conversation_id: &str) -> Outcome {
    let (conversation, project, history) = match load(ctx, conversation_id) {
        Ok(loaded) => loaded,
        Err(StoreError::NotFound { .. }) => {
            // Conversation deleted while queued.
            return Outcome::Done;
        }
        Err(e) => return Outcome::Failed(e.to_string()),
    };

    let settings = &project.settings;
    if !ctx
        .compressor
        .should_compress(&conversation, &history, settings.compress_after_turns)
    {
        return Outcome::Done;
    }

    let Some(batch) =
        ctx.compressor
            .select_batch(&conversation, &history, settings.compress_batch_size)
    else {
        // Zero-turn batch: nothing to fold.
        return Outcome::Done;
    };

    let prior = conversation.rolling_summary.as_deref();
    let prompt = ctx.compressor.build_prompt(&project.name, prior, &batch);
    debug!(
        "Compressing {} messages of conv {} (~{} prompt tokens)",
        batch.messages.len(),
        &conversation_id[..8.min(conversation_id.len())],
        prompt.input_tokens,
    );

    let (batch_summary, usage) =
        match ctx.transport.compress(&prompt.system, &prompt.user, &ctx.cancel).await {
            Ok(result) => result,
            Err(ApiError::RateLimited { .. }) => return Outcome::Requeue("rate limited"),
            Err(ApiError::Cancelled) => return Outcome::Requeue("cancelled"),
            Err(e) => return Outcome::Failed(e.to_string()),
        };
    if batch_summary.is_empty() {
        return Outcome::Failed("summariser returned empty output".into());
    }

    let mut merged = ctx.compressor.merge_summaries(prior, &batch_summary);

    // Bound the summary: past the gate it collapses back under the cap.
    if ctx.compressor.needs_recompression(&merged) {
        let recompress = ctx.compressor.build_recompress_prompt(&project.name, &merged);
        match ctx.transport.compress(&recompress.system, &recompress.user, &ctx.cancel).await {
            Ok((collapsed, _)) if !collapsed.is_empty() => {
                info!(
                    "Summary recompressed: {} -> {} tokens",
                    estimate_tokens(&merged),
                    estimate_tokens(&collapsed),
                );
                merged = collapsed;
            }
            Ok(_) => warn!("Summary recompression returned empty output, keeping merged"),
            Err(e) => warn!("Summary recompression failed ({}), keeping merged", e),
        }
    }

    commit(ctx, conversation_id, &project.id, &merged, &batch, &usage).await
}

fn load(
    ctx: &WorkerContext,
    conversation_id: &str,
) -> Result<
    (crate::store::Conversation, crate::store::Project, Vec<crate::store::Message>),
    StoreError,
> {
    let conversation = ctx.db.conversations.get(conversation_id)?;
    let project = ctx.db.projects.get(&conversation.project_id)?;
    let history = ctx.db.conversations.get_messages(conversation_id)?;
    Ok((conversation, project, history))
}

async fn commit(
    ctx: &WorkerContext,
    conversation_id: &str,
    project_id: &str,
    merged: &str,
    batch: &CompressionBatch<'_>,
    usage: &crate::pricing::Usage,
) -> Outcome {
    let token_count = estimate_tokens(merged) as i64;

    let lock = conv_lock(&ctx.conv_locks, conversation_id);
    let _guard = lock.lock().await;
    match ctx
        .db
        .conversations
        .update_summary(conversation_id, merged, batch.cutoff_msg_id, token_count)
    {
        Ok(()) => {}
        Err(StoreError::StaleCutoff) => return Outcome::Requeue("stale cutoff"),
        Err(e) => return Outcome::Failed(e.to_string()),
    }

    let _ = ctx
        .db
        .conversations
        .log_api_call(project_id, conversation_id, COMPRESS_MODEL, usage);

    info!(
        "Compression complete for conv {}: summary now {} tokens",
        &conversation_id[..8.min(conversation_id.len())],
        token_count,
    );
    let _ = ctx.events.send(TurnEvent::SummaryUpdated {
        conversation_id: conversation_id.to_string(),
        summary_token_count: token_count,
    });
    Outcome::Done
}
