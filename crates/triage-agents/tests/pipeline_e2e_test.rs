//! End-to-end ingest runs against a scripted chat backend.
//!
//! Each test wires the real merger, gatekeeper and generator through
//! `LocalExecutor` and `IngestOrchestrator` over an in-memory store. The
//! backend replays canned model replies in order and records every request,
//! so tests can assert both on outcomes and on what the model was asked.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use triage::{
    AuditAction, AuditFilter, AuditQuery, EntityType, Gatekeeper, MemoryStore, Priority,
    RecommendationAction, ThreadStatus, TriageStore, Visibility, WorkItemStatus, WorkItemType,
};
use triage_agents::llm::{ChatBackend, ChatRequest, ChatRole, CompletionClient};
use triage_agents::{
    CompletionError, DebounceScheduler, IngestOrchestrator, IngestRequest, LlmConfig,
    LocalExecutor, ThreadStateMerger, WorkItemGenerator,
};

// ── Scripted backend ─────────────────────────────────────────────────────────

struct ScriptedChat {
    replies: Mutex<VecDeque<Result<String, CompletionError>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedChat {
    fn new<I>(replies: I) -> Arc<Self>
    where
        I: IntoIterator<Item = &'static str>,
    {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.to_string())).collect()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn push_error(&self, err: CompletionError) {
        self.replies.lock().unwrap().push_back(Err(err));
    }

    fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatBackend for ScriptedChat {
    async fn chat(&self, request: &ChatRequest) -> Result<String, CompletionError> {
        self.requests.lock().unwrap().push(request.clone());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("I have nothing more to say.".to_string()))
    }
}

fn orchestrator(chat: Arc<ScriptedChat>) -> (IngestOrchestrator, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let llm = LlmConfig::default();
    let client = CompletionClient::new(chat);
    let executor = LocalExecutor::new(
        store.clone(),
        ThreadStateMerger::new(client.clone(), store.clone(), &llm),
        WorkItemGenerator::new(client, store.clone(), &llm),
        Gatekeeper::new(),
    );
    let orchestrator = IngestOrchestrator::new(
        store.clone(),
        Arc::new(executor),
        DebounceScheduler::new(Duration::from_secs(3)),
    );
    (orchestrator, store)
}

const SAFARI_MESSAGE: &str = "Login crashes on Safari 17 after entering password";

const CONFIDENT_BUG: &str = r#"{
    "summary": "Login crashes on Safari 17 after the password is entered",
    "intent": "Bug",
    "knownEnvironment": {"browser": "Safari 17"},
    "reproSteps": ["Open login page in Safari 17", "Enter password", "Submit"],
    "actualBehavior": "The page crashes",
    "recommendation": {"action": "CreateBugWorkItem", "confidence": 0.95, "reason": "Clear repro"}
}"#;

const HESITANT_BUG: &str = r#"{
    "summary": "Login may crash on Safari 17",
    "intent": "Bug",
    "recommendation": {"action": "CreateBugWorkItem", "confidence": 0.4}
}"#;

const BUG_TICKET: &str = r###"{
    "title": "Login crashes on Safari 17 after password entry",
    "type": "bug",
    "structuredDescription": "## Problem\nSafari 17 crashes on login.",
    "acceptanceCriteria": ["Login succeeds on Safari 17"],
    "priority": "high",
    "severity": 4,
    "riskLevel": "medium",
    "estimatedEffort": {"tShirt": "S", "hoursMin": 2, "hoursMax": 6, "confidence": 0.7},
    "labels": ["auth", "safari"]
}"###;

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn confident_bug_report_becomes_pending_work_item() {
    let chat = ScriptedChat::new([CONFIDENT_BUG, BUG_TICKET]);
    let (orchestrator, store) = orchestrator(chat.clone());

    let outcome = orchestrator
        .run_ingest_pipeline(IngestRequest::new("thread-1", SAFARI_MESSAGE))
        .await
        .unwrap();

    assert!(outcome.state_updated);
    assert!(outcome.decision.should_create_work_item);
    assert_eq!(outcome.decision.work_item_type, Some(WorkItemType::Bug));
    assert_eq!(outcome.decision.thread_status, ThreadStatus::Open);

    let item = outcome.work_item.expect("work item created");
    assert_eq!(item.item_type, WorkItemType::Bug);
    assert_eq!(item.status, WorkItemStatus::PendingApproval);
    assert_eq!(item.priority, Priority::P1);
    assert_eq!(item.confidence_score, 0.95);
    assert_eq!(item.thread_id, "thread-1");

    let thread = store.get_thread("thread-1").await.unwrap().unwrap();
    assert_eq!(thread.status, ThreadStatus::Open);
    assert_eq!(thread.messages[0].content, SAFARI_MESSAGE);
    assert_eq!(
        thread.thread_state().recommendation.action,
        RecommendationAction::CreateBugWorkItem
    );

    let actions: Vec<AuditAction> = store
        .query_audit(&AuditQuery {
            filter: Some(AuditFilter::PipelineActivity),
            ..AuditQuery::default()
        })
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert!(actions.contains(&AuditAction::ThreadStateUpdated));
    assert!(actions.contains(&AuditAction::GatekeeperDecided));
    assert!(actions.contains(&AuditAction::WorkItemCreated));

    // One merger call, one generator call; the message reached the model.
    let requests = chat.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].messages[1].content.contains(SAFARI_MESSAGE));
}

#[tokio::test]
async fn low_confidence_keeps_state_without_ticket() {
    let chat = ScriptedChat::new([HESITANT_BUG]);
    let (orchestrator, store) = orchestrator(chat.clone());

    let outcome = orchestrator
        .run_ingest_pipeline(IngestRequest::new("thread-1", SAFARI_MESSAGE))
        .await
        .unwrap();

    assert!(!outcome.decision.should_create_work_item);
    assert!(outcome.work_item.is_none());
    assert!(store.list_work_items(None).await.unwrap().is_empty());

    let thread = store.get_thread("thread-1").await.unwrap().unwrap();
    assert_eq!(thread.thread_state().summary, "Login may crash on Safari 17");
    assert_eq!(chat.requests().len(), 1, "generator must not be called");
}

#[tokio::test]
async fn sloppy_generator_output_is_coerced() {
    let chat = ScriptedChat::new([
        CONFIDENT_BUG,
        r#"{"title": "Login crash", "type": "bug", "priority": "URGENT!!", "acceptanceCriteria": [{"name": "x"}]}"#,
    ]);
    let (orchestrator, _store) = orchestrator(chat);

    let item = orchestrator
        .run_ingest_pipeline(IngestRequest::new("thread-1", SAFARI_MESSAGE))
        .await
        .unwrap()
        .work_item
        .unwrap();
    assert_eq!(item.priority, Priority::P0);
    assert_eq!(item.acceptance_criteria, vec!["x".to_string()]);
}

#[tokio::test]
async fn malformed_merger_reply_is_salvaged() {
    let chat = ScriptedChat::new([
        "Here you go:\n```json\n{summary: 'Export to CSV wanted', intent: 'FeatureRequest', \
         recommendation: {action: 'AskQuestions', confidence: 0.5,},}\n```",
    ]);
    let (orchestrator, store) = orchestrator(chat.clone());

    let outcome = orchestrator
        .run_ingest_pipeline(IngestRequest::new("thread-2", "Can I export to CSV?"))
        .await
        .unwrap();

    assert!(outcome.state_updated);
    assert_eq!(outcome.state.summary, "Export to CSV wanted");
    assert_eq!(outcome.decision.thread_status, ThreadStatus::WaitingOnUser);
    assert_eq!(chat.requests().len(), 1, "salvage avoids a corrective retry");

    let thread = store.get_thread("thread-2").await.unwrap().unwrap();
    assert_eq!(thread.status, ThreadStatus::WaitingOnUser);
}

#[tokio::test]
async fn unusable_reply_triggers_one_corrective_retry() {
    let chat = ScriptedChat::new(["I think this is a bug in login.", HESITANT_BUG]);
    let (orchestrator, _store) = orchestrator(chat.clone());

    let outcome = orchestrator
        .run_ingest_pipeline(IngestRequest::new("thread-1", SAFARI_MESSAGE))
        .await
        .unwrap();
    assert!(outcome.state_updated);

    let requests = chat.requests();
    assert_eq!(requests.len(), 2);
    let retry = &requests[1].messages;
    assert_eq!(retry.len(), 4);
    assert_eq!(retry[2].role, ChatRole::Assistant);
    assert_eq!(retry[2].content, "I think this is a bug in login.");
    assert_eq!(retry[3].role, ChatRole::User);
}

#[tokio::test]
async fn merger_transport_failure_keeps_previous_state() {
    let chat = ScriptedChat::new([CONFIDENT_BUG, BUG_TICKET]);
    let (orchestrator, store) = orchestrator(chat.clone());
    orchestrator
        .run_ingest_pipeline(IngestRequest::new("thread-1", SAFARI_MESSAGE))
        .await
        .unwrap();

    chat.push_error(CompletionError::Transport {
        endpoint: "http://localhost:11434/v1/chat/completions".into(),
        message: "connection refused".into(),
    });
    let outcome = orchestrator
        .run_ingest_pipeline(IngestRequest::new("thread-1", "Any update?"))
        .await
        .unwrap();

    assert!(!outcome.state_updated);
    assert_eq!(
        outcome.state.summary,
        "Login crashes on Safari 17 after the password is entered"
    );

    let errors = store
        .query_audit(&AuditQuery {
            entity_type: Some(EntityType::Thread),
            entity_id: Some("thread-1".into()),
            action: Some(AuditAction::ThreadStateUpdateFailed),
            ..AuditQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].details_json["category"], "transport");
    assert_eq!(
        errors[0].details_json["endpoint"],
        "http://localhost:11434/v1/chat/completions"
    );
}

#[tokio::test]
async fn failed_merge_on_escalated_thread_creates_no_second_ticket() {
    let chat = ScriptedChat::new([CONFIDENT_BUG, BUG_TICKET]);
    let (orchestrator, store) = orchestrator(chat.clone());
    orchestrator
        .run_ingest_pipeline(IngestRequest::new("thread-1", SAFARI_MESSAGE))
        .await
        .unwrap();
    assert_eq!(store.list_work_items(Some("thread-1")).await.unwrap().len(), 1);

    chat.push_error(CompletionError::Transport {
        endpoint: "http://localhost:11434/v1/chat/completions".into(),
        message: "connection refused".into(),
    });
    // Would be accepted if the generator were asked.
    chat.replies.lock().unwrap().push_back(Ok(BUG_TICKET.to_string()));

    let outcome = orchestrator
        .run_ingest_pipeline(IngestRequest::new("thread-1", "Still broken"))
        .await
        .unwrap();

    assert!(!outcome.state_updated);
    assert!(outcome.work_item.is_none());
    assert_eq!(store.list_work_items(Some("thread-1")).await.unwrap().len(), 1);
    assert_eq!(chat.requests().len(), 3, "only the failed merger call was added");
}

#[tokio::test]
async fn background_run_posts_internal_note_and_clears_flag() {
    let chat = ScriptedChat::new([CONFIDENT_BUG, BUG_TICKET]);
    let (orchestrator, store) = orchestrator(chat);

    let handle = orchestrator
        .run_ingest_pipeline_async(IngestRequest::new("thread-1", SAFARI_MESSAGE))
        .await
        .unwrap();
    handle.await.unwrap();

    let thread = store.get_thread("thread-1").await.unwrap().unwrap();
    assert!(!thread.ai_processing);
    assert_eq!(thread.messages.len(), 2);
    assert_eq!(thread.messages[1].visibility, Visibility::Internal);
    assert_eq!(store.list_work_items(Some("thread-1")).await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn burst_of_messages_reaches_the_model_once() {
    let chat = ScriptedChat::new([HESITANT_BUG]);
    let (orchestrator, store) = orchestrator(chat.clone());

    let mut last = None;
    for (i, message) in ["It crashed", "On Safari", SAFARI_MESSAGE].into_iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        last = Some(
            orchestrator
                .submit_message(IngestRequest::new("thread-1", message))
                .await
                .unwrap(),
        );
    }
    last.unwrap().await.unwrap();

    let requests = chat.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].messages[1].content.contains(SAFARI_MESSAGE));

    let thread = store.get_thread("thread-1").await.unwrap().unwrap();
    assert_eq!(thread.messages.len(), 3);
    assert!(!thread.ai_processing);
}

#[tokio::test]
async fn explicit_generation_uses_stored_state() {
    let chat = ScriptedChat::new([HESITANT_BUG, BUG_TICKET]);
    let (orchestrator, _store) = orchestrator(chat);
    orchestrator
        .run_ingest_pipeline(IngestRequest::new("thread-1", SAFARI_MESSAGE))
        .await
        .unwrap();

    let item = orchestrator
        .generate_for_thread("thread-1", None)
        .await
        .unwrap()
        .expect("work item generated");
    assert_eq!(item.item_type, WorkItemType::Bug);
    assert_eq!(item.confidence_score, 0.4);
}
