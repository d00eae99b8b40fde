//! End-to-end turn and compression flows over a scripted transport.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use claude_station::api::{ApiError, ChatRequest, StreamEvent, StreamSummary, Transport};
use claude_station::orchestrator::{Orchestrator, TurnEvent};
use claude_station::pricing::{estimate_tokens, Usage, DEFAULT_MODEL};
use claude_station::store::StationDatabase;
use claude_station::ProjectSettings;

/// How the fake responds to compression calls.
#[derive(Clone)]
enum CompressMode {
    Succeed(String),
    FailTransport,
    /// Rate-limit the first N calls, then succeed.
    RateLimitThenSucceed(usize, String),
}

struct FakeTransport {
    chat_requests: Mutex<Vec<ChatRequest>>,
    chat_usage: Mutex<VecDeque<Usage>>,
    chat_reply: String,
    compress_mode: Mutex<CompressMode>,
    compress_calls: Mutex<Vec<String>>,
}

impl FakeTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            chat_requests: Mutex::new(Vec::new()),
            chat_usage: Mutex::new(VecDeque::new()),
            chat_reply: "assistant reply".into(),
            compress_mode: Mutex::new(CompressMode::Succeed("summary text".into())),
            compress_calls: Mutex::new(Vec::new()),
        })
    }

    fn push_usage(&self, usage: Usage) {
        self.chat_usage.lock().unwrap().push_back(usage);
    }

    fn set_compress_mode(&self, mode: CompressMode) {
        *self.compress_mode.lock().unwrap() = mode;
    }

    fn requests(&self) -> Vec<ChatRequest> {
        self.chat_requests.lock().unwrap().clone()
    }

    fn compress_call_count(&self) -> usize {
        self.compress_calls.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn chat(
        &self,
        request: &ChatRequest,
        _beta: Option<&str>,
        sink: &mpsc::Sender<StreamEvent>,
        _cancel: &CancellationToken,
    ) -> Result<StreamSummary, ApiError> {
        self.chat_requests.lock().unwrap().push(request.clone());
        let usage = self.chat_usage.lock().unwrap().pop_front().unwrap_or(Usage {
            input_tokens: 10,
            output_tokens: 5,
            ..Usage::default()
        });

        let (head, tail) = self.chat_reply.split_at(self.chat_reply.len() / 2);
        let _ = sink.send(StreamEvent::Text(head.to_string())).await;
        let _ = sink.send(StreamEvent::Text(tail.to_string())).await;

        Ok(StreamSummary {
            usage: Some(usage),
            stop_reason: Some("end_turn".into()),
            cancelled: false,
        })
    }

    async fn compress(
        &self,
        _system_text: &str,
        user_text: &str,
        _cancel: &CancellationToken,
    ) -> Result<(String, Usage), ApiError> {
        let call_index = {
            let mut calls = self.compress_calls.lock().unwrap();
            calls.push(user_text.to_string());
            calls.len() - 1
        };
        let mode = self.compress_mode.lock().unwrap().clone();
        match mode {
            CompressMode::Succeed(summary) => Ok((summary, compress_usage())),
            CompressMode::FailTransport => Err(ApiError::Transport("connection reset".into())),
            CompressMode::RateLimitThenSucceed(n, summary) => {
                if call_index < n {
                    Err(ApiError::RateLimited { retry_after: Duration::from_millis(1) })
                } else {
                    Ok((summary, compress_usage()))
                }
            }
        }
    }
}

fn compress_usage() -> Usage {
    Usage { input_tokens: 200, output_tokens: 40, ..Usage::default() }
}

struct Fixture {
    db: Arc<StationDatabase>,
    transport: Arc<FakeTransport>,
    orchestrator: Orchestrator,
    project_id: String,
    conv_id: String,
}

/// Low thresholds so flows trigger in a handful of turns: compress after
/// 5 turns, 3 turns per batch.
fn fixture(system_prompt: &str) -> Fixture {
    let db = Arc::new(StationDatabase::in_memory().unwrap());
    let project = db.projects.create("Widget", DEFAULT_MODEL, system_prompt).unwrap();
    let settings = ProjectSettings {
        compress_after_turns: 5,
        compress_batch_size: 3,
        ..ProjectSettings::default()
    };
    db.projects.update_settings(&project.id, &settings).unwrap();
    let conv = db.conversations.create(&project.id, "Chat", None).unwrap();

    let transport = FakeTransport::new();
    let transport_dyn: Arc<dyn Transport> = transport.clone();
    let orchestrator = Orchestrator::new(Arc::clone(&db), transport_dyn, 8192);

    Fixture { db, transport, orchestrator, project_id: project.id, conv_id: conv.id }
}

async fn send(fixture: &Fixture, text: &str) {
    let cancel = CancellationToken::new();
    fixture
        .orchestrator
        .send(&fixture.conv_id, text, &[], &cancel)
        .await
        .unwrap();
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<TurnEvent>, mut pred: F) -> TurnEvent
where
    F: FnMut(&TurnEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

// ===== Scenario: cache warm-up =====

#[tokio::test]
async fn cache_warm_first_turn_creates_second_turn_reads() {
    let fixture = fixture("You are a Python expert.");

    // A ~50k-token document in the project.
    let doc_text = "x".repeat(200_000);
    fixture
        .db
        .projects
        .add_document(&fixture.project_id, "big.md", &doc_text, 50_000, ".md")
        .unwrap();

    fixture.transport.push_usage(Usage {
        input_tokens: 7,
        output_tokens: 5,
        cache_creation_tokens: 50_000,
        ..Usage::default()
    });
    send(&fixture, "Hello").await;

    fixture.transport.push_usage(Usage {
        input_tokens: 20,
        output_tokens: 5,
        cache_read_tokens: 50_000,
        ..Usage::default()
    });
    send(&fixture, "And now?").await;

    let requests = fixture.transport.requests();
    assert_eq!(requests.len(), 2);

    // Layer 1 is cache-marked and byte-identical across the two turns.
    assert!(requests[0].system[0].cache_control.is_some());
    assert_eq!(requests[0].system[0], requests[1].system[0]);

    // First request: just the new user turn. Second: prior turn + new one.
    assert_eq!(requests[0].messages.len(), 1);
    assert_eq!(requests[1].messages.len(), 3);

    // Usage counters landed on the stored assistant messages.
    let messages = fixture.db.conversations.get_messages(&fixture.conv_id).unwrap();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[1].cache_creation_tokens, 50_000);
    assert_eq!(messages[3].cache_read_tokens, 50_000);
    assert!(messages[1].cost_usd.unwrap() > messages[3].cost_usd.unwrap());

    // And in the call log: half the input-side tokens came from cache.
    let rate = fixture.db.conversations.cache_hit_rate(&fixture.project_id).unwrap().unwrap();
    assert!(rate > 0.45 && rate < 0.55);
}

// ===== Scenario: compression trigger =====

#[tokio::test]
async fn compression_triggers_after_threshold_and_shapes_next_request() {
    let fixture = fixture("system");
    let mut events = fixture.orchestrator.subscribe();

    for i in 0..6 {
        send(&fixture, &format!("question {i}")).await;
    }

    let event = wait_for(&mut events, |e| matches!(e, TurnEvent::SummaryUpdated { .. })).await;
    match event {
        TurnEvent::SummaryUpdated { summary_token_count, .. } => {
            assert_eq!(summary_token_count, estimate_tokens("summary text") as i64);
        }
        _ => unreachable!(),
    }

    // The store reflects the fold: batch of 3 turns, cutoff at message 6.
    let conv = fixture.db.conversations.get(&fixture.conv_id).unwrap();
    assert_eq!(conv.rolling_summary.as_deref(), Some("summary text"));
    let messages = fixture.db.conversations.get_messages(&fixture.conv_id).unwrap();
    assert_eq!(conv.last_compressed_msg_id.as_deref(), Some(messages[5].id.as_str()));

    // The summariser saw the folded turns but no documents.
    assert!(fixture.transport.compress_call_count() >= 1);

    // Next turn: Layer-2 block present, history starts after the cutoff.
    send(&fixture, "question 6").await;
    let requests = fixture.transport.requests();
    let last = requests.last().unwrap();
    assert_eq!(last.system.len(), 2);
    assert!(last.system[1].text.contains("<conversation_summary>"));
    // Turns 4-6 uncompressed (6 messages) + the new user message.
    assert_eq!(last.messages.len(), 7);
}

// ===== Scenario: summary below the 1024-token cache floor =====

#[tokio::test]
async fn small_summary_is_not_cache_marked() {
    let fixture = fixture("system");

    // One prior turn so a summary cutoff exists.
    send(&fixture, "q0").await;
    let messages = fixture.db.conversations.get_messages(&fixture.conv_id).unwrap();
    fixture
        .db
        .conversations
        .update_summary(&fixture.conv_id, &"s ".repeat(400), &messages[1].id, 400)
        .unwrap();

    send(&fixture, "q1").await;
    let requests = fixture.transport.requests();
    let last = requests.last().unwrap();
    assert_eq!(last.system.len(), 2);
    assert!(last.system[0].cache_control.is_some());
    assert!(last.system[1].cache_control.is_none());
}

// ===== Scenario: compression failure =====

#[tokio::test]
async fn compression_failure_keeps_state_and_foreground_flows() {
    let fixture = fixture("system");
    fixture.transport.set_compress_mode(CompressMode::FailTransport);
    let mut events = fixture.orchestrator.subscribe();

    for i in 0..6 {
        send(&fixture, &format!("question {i}")).await;
    }
    wait_for(&mut events, |e| matches!(e, TurnEvent::CompressionFailed { .. })).await;

    // No state mutation on failure.
    let conv = fixture.db.conversations.get(&fixture.conv_id).unwrap();
    assert!(conv.rolling_summary.is_none());
    assert!(conv.last_compressed_msg_id.is_none());
    assert_eq!(conv.summary_token_count, 0);

    // The next foreground turn proceeds on the full history.
    send(&fixture, "still works?").await;
    let requests = fixture.transport.requests();
    let last = requests.last().unwrap();
    assert_eq!(last.system.len(), 1);
    assert_eq!(last.messages.len(), 13);
}

// ===== Scenario: rate-limited compression re-queues =====

#[tokio::test]
async fn rate_limited_compression_retries_and_completes() {
    let fixture = fixture("system");
    fixture
        .transport
        .set_compress_mode(CompressMode::RateLimitThenSucceed(2, "eventual summary".into()));
    let mut events = fixture.orchestrator.subscribe();

    for i in 0..6 {
        send(&fixture, &format!("question {i}")).await;
    }
    wait_for(&mut events, |e| matches!(e, TurnEvent::SummaryUpdated { .. })).await;

    let conv = fixture.db.conversations.get(&fixture.conv_id).unwrap();
    assert_eq!(conv.rolling_summary.as_deref(), Some("eventual summary"));
    // At least the two rate-limited attempts plus the success.
    assert!(fixture.transport.compress_call_count() >= 3);
}

// ===== Scenario: reset summary =====

#[tokio::test]
async fn reset_summary_restores_fresh_conversation_shape() {
    let fixture = fixture("system");
    let mut events = fixture.orchestrator.subscribe();

    for i in 0..6 {
        send(&fixture, &format!("question {i}")).await;
    }
    wait_for(&mut events, |e| matches!(e, TurnEvent::SummaryUpdated { .. })).await;

    fixture.orchestrator.reset_summary(&fixture.conv_id).unwrap();
    let conv = fixture.db.conversations.get(&fixture.conv_id).unwrap();
    assert!(conv.rolling_summary.is_none());
    assert!(conv.last_compressed_msg_id.is_none());
    assert_eq!(conv.summary_token_count, 0);

    send(&fixture, "after reset").await;
    let requests = fixture.transport.requests();
    let last = requests.last().unwrap();
    // No Layer 2, full Layer-3 history again.
    assert_eq!(last.system.len(), 1);
    assert_eq!(last.messages.len(), 13);
}

// ===== Turn events and transcript integrity =====

#[tokio::test]
async fn deltas_and_completion_reach_subscribers() {
    let fixture = fixture("system");
    let mut events = fixture.orchestrator.subscribe();

    send(&fixture, "hello").await;

    let mut text = String::new();
    loop {
        let event = wait_for(&mut events, |_| true).await;
        match event {
            TurnEvent::TextDelta { text: delta, .. } => text.push_str(&delta),
            TurnEvent::ResponseComplete { usage, cost_usd, cancelled, .. } => {
                assert_eq!(usage.input_tokens, 10);
                assert!(cost_usd.is_some());
                assert!(!cancelled);
                break;
            }
            _ => {}
        }
    }
    assert_eq!(text, "assistant reply");

    let messages = fixture.db.conversations.get_messages(&fixture.conv_id).unwrap();
    assert_eq!(messages[1].content, "assistant reply");
    assert_eq!(messages[1].model_used.as_deref(), Some(DEFAULT_MODEL));
}

#[tokio::test]
async fn user_message_persisted_with_turn() {
    let fixture = fixture("system");
    send(&fixture, "the question").await;

    let messages = fixture.db.conversations.get_messages(&fixture.conv_id).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, "user");
    assert_eq!(messages[0].content, "the question");
    assert_eq!(messages[1].role, "assistant");
}

#[tokio::test]
async fn compression_input_contains_transcript_not_documents() {
    let fixture = fixture("system");
    fixture
        .db
        .projects
        .add_document(&fixture.project_id, "kb.md", "<secret knowledge base>", 6, ".md")
        .unwrap();
    let mut events = fixture.orchestrator.subscribe();

    for i in 0..6 {
        send(&fixture, &format!("question {i}")).await;
    }
    wait_for(&mut events, |e| matches!(e, TurnEvent::SummaryUpdated { .. })).await;

    let calls = fixture.transport.compress_calls.lock().unwrap().clone();
    let prompt = calls.first().unwrap();
    assert!(prompt.contains("[User]: question 0"));
    assert!(!prompt.contains("secret knowledge base"));
}

// ===== Cancellation =====

struct CancellingTransport;

#[async_trait::async_trait]
impl Transport for CancellingTransport {
    async fn chat(
        &self,
        _request: &ChatRequest,
        _beta: Option<&str>,
        sink: &mpsc::Sender<StreamEvent>,
        _cancel: &CancellationToken,
    ) -> Result<StreamSummary, ApiError> {
        let _ = sink.send(StreamEvent::Text("partial ".into())).await;
        let _ = sink.send(StreamEvent::Text("answer".into())).await;
        // User hit Escape mid-stream: no usage block ever arrived.
        Ok(StreamSummary { usage: None, stop_reason: None, cancelled: true })
    }

    async fn compress(
        &self,
        _system_text: &str,
        _user_text: &str,
        _cancel: &CancellationToken,
    ) -> Result<(String, Usage), ApiError> {
        Err(ApiError::Cancelled)
    }
}

#[tokio::test]
async fn cancelled_stream_commits_partial_message_with_null_cost() {
    let db = Arc::new(StationDatabase::in_memory().unwrap());
    let project = db.projects.create("P", DEFAULT_MODEL, "").unwrap();
    let conv = db.conversations.create(&project.id, "Chat", None).unwrap();
    let orchestrator = Orchestrator::new(Arc::clone(&db), Arc::new(CancellingTransport), 8192);

    let cancel = CancellationToken::new();
    let message = orchestrator.send(&conv.id, "tell me everything", &[], &cancel).await.unwrap();

    assert_eq!(message.content, "partial answer");
    assert!(message.cost_usd.is_none());
    assert_eq!(message.input_tokens, 0);

    // The partial turn is a complete pair in the transcript.
    let messages = db.conversations.get_messages(&conv.id).unwrap();
    assert_eq!(messages.len(), 2);
    orchestrator.shutdown();
}

// ===== Concurrency: summary update vs. appends =====

#[tokio::test]
async fn stale_cutoff_requeues_and_recovers() {
    let fixture = fixture("system");
    let mut events = fixture.orchestrator.subscribe();

    // Race a manual summary commit ahead of the worker by folding further
    // than the worker's batch will.
    for i in 0..6 {
        send(&fixture, &format!("question {i}")).await;
    }
    let messages = fixture.db.conversations.get_messages(&fixture.conv_id).unwrap();
    // Manually advance the boundary past where the worker's cutoff lands.
    let _ = fixture.db.conversations.update_summary(
        &fixture.conv_id,
        "manual fold",
        &messages[9].id,
        3,
    );

    // The worker's commit is stale; it re-queues, re-reads, and either
    // no-ops (too few turns now) or folds the remainder. Either way the
    // boundary only ever advances.
    send(&fixture, "one more").await;
    let _ = tokio::time::timeout(Duration::from_millis(500), async {
        loop {
            let _ = events.recv().await;
        }
    })
    .await;

    let conv = fixture.db.conversations.get(&fixture.conv_id).unwrap();
    let boundary_idx = messages.iter().position(|m| {
        Some(m.id.as_str()) == conv.last_compressed_msg_id.as_deref()
    });
    assert!(boundary_idx.unwrap_or(0) >= 9);
    fixture.orchestrator.shutdown();
}
