//! Ingest orchestrator: records customer messages and drives pipeline runs.
//!
//! Three entry points share one run:
//! - [`IngestOrchestrator::run_ingest_pipeline`] waits for the full result.
//! - [`IngestOrchestrator::run_ingest_pipeline_async`] returns at once and
//!   tracks the run through the thread's AI-processing flag.
//! - [`IngestOrchestrator::submit_message`] debounces per thread so only the
//!   last message of a burst triggers a run.
//!
//! Where the run happens (in process or on the job service) is decided once,
//! by the [`PipelineExecutor`] handed to the orchestrator.
//!
//! Runs for the same thread never overlap: each one holds the thread's turn
//! for the whole merge/gatekeeper/generate sequence. A run is claimed when it
//! is submitted, so the AI-processing flag is only cleared by the last
//! outstanding run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context as _, Result};
use serde_json::json;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use triage::{
    AuditAction, AuditLogEntry, Gatekeeper, StoreError, ThreadMessage, TriageStore, WorkItem,
    WorkItemType,
};

use crate::config::TriageConfig;
use crate::debounce::DebounceScheduler;
use crate::errors::PipelineError;
use crate::generator::WorkItemGenerator;
use crate::llm::{CompletionClient, HttpChatBackend};
use crate::merger::{MessageMetadata, ThreadStateMerger};
use crate::pipeline::{
    GenerateRequest, IngestRequest, LocalExecutor, PipelineExecutor, PipelineOutcome,
};
use crate::remote::{HttpJobService, RemoteExecutor};

pub struct IngestOrchestrator {
    store: Arc<dyn TriageStore>,
    executor: Arc<dyn PipelineExecutor>,
    debounce: DebounceScheduler,
    runs: ThreadRuns,
}

impl IngestOrchestrator {
    pub fn new(
        store: Arc<dyn TriageStore>,
        executor: Arc<dyn PipelineExecutor>,
        debounce: DebounceScheduler,
    ) -> Self {
        Self {
            store,
            executor,
            debounce,
            runs: ThreadRuns::default(),
        }
    }

    /// Wire the orchestrator from configuration: local or remote executor,
    /// debounce window from the tuning section.
    pub fn from_config(config: &TriageConfig, store: Arc<dyn TriageStore>) -> Result<Self> {
        let executor = build_executor(config, Arc::clone(&store))?;
        Ok(Self::new(
            store,
            executor,
            DebounceScheduler::new(config.tuning.debounce_window()),
        ))
    }

    pub fn executor_name(&self) -> &'static str {
        self.executor.name()
    }

    pub fn debounce(&self) -> &DebounceScheduler {
        &self.debounce
    }

    /// Runs claimed for a thread and not yet finished, pending debounced
    /// runs included.
    pub fn active_runs(&self, thread_id: &str) -> usize {
        self.runs.active(thread_id)
    }

    /// Record the message and run the pipeline to completion.
    pub async fn run_ingest_pipeline(
        &self,
        request: IngestRequest,
    ) -> Result<PipelineOutcome, PipelineError> {
        record_message(self.store.as_ref(), &request).await?;
        let claim = self.runs.claim(&request.thread_id);
        let _turn = claim.turn().await;
        let outcome = self.executor.ingest(&request).await;
        finish_run(self.store.as_ref(), claim).await;
        outcome
    }

    /// Record the message, raise the AI-processing flag and run in the
    /// background. Failures are logged and audited, never returned.
    pub async fn run_ingest_pipeline_async(
        &self,
        request: IngestRequest,
    ) -> Result<JoinHandle<()>, StoreError> {
        record_message(self.store.as_ref(), &request).await?;
        let claim = self.runs.claim(&request.thread_id);
        self.store
            .set_ai_processing(&request.thread_id, true)
            .await?;

        let store = Arc::clone(&self.store);
        let executor = Arc::clone(&self.executor);
        Ok(tokio::spawn(async move {
            run_tracked(store, executor, request, claim).await;
        }))
    }

    /// Record the message now and run the pipeline once the thread has been
    /// quiet for the debounce window. A newer message for the same thread
    /// replaces the pending run.
    pub async fn submit_message(
        &self,
        request: IngestRequest,
    ) -> Result<JoinHandle<()>, StoreError> {
        record_message(self.store.as_ref(), &request).await?;
        // A superseded timer drops its closure, and with it this claim.
        let claim = self.runs.claim(&request.thread_id);
        self.store
            .set_ai_processing(&request.thread_id, true)
            .await?;

        let store = Arc::clone(&self.store);
        let executor = Arc::clone(&self.executor);
        let key = request.thread_id.clone();
        Ok(self.debounce.schedule(&key, move || async move {
            run_tracked(store, executor, request, claim).await;
        }))
    }

    /// Generate a work item for a thread outside the ingest flow.
    pub async fn generate_for_thread(
        &self,
        thread_id: &str,
        item_type: Option<WorkItemType>,
    ) -> Result<Option<WorkItem>, PipelineError> {
        self.executor
            .generate(&GenerateRequest {
                thread_id: thread_id.to_string(),
                item_type,
            })
            .await
    }
}

async fn record_message(store: &dyn TriageStore, request: &IngestRequest) -> Result<(), StoreError> {
    store.ensure_thread(&request.thread_id).await?;
    store
        .append_message(&request.thread_id, ThreadMessage::user(&request.message))
        .await
}

/// One background run. Waits for the thread's turn, and clears the
/// AI-processing flag when no other run for the thread is outstanding.
async fn run_tracked(
    store: Arc<dyn TriageStore>,
    executor: Arc<dyn PipelineExecutor>,
    request: IngestRequest,
    claim: RunClaim,
) {
    let thread_id = request.thread_id.as_str();
    let _turn = claim.turn().await;

    match executor.ingest(&request).await {
        Ok(outcome) => {
            if let Some(item) = &outcome.work_item {
                if let Err(e) = store
                    .append_message(thread_id, ThreadMessage::internal_note(ticket_note(item)))
                    .await
                {
                    warn!(thread_id = %thread_id, error = %e, "Failed to post work item note");
                }
            }
        }
        Err(err) => {
            error!(
                thread_id = %thread_id,
                executor = executor.name(),
                category = %err.retry_category(),
                error = %err,
                "Background ingest failed"
            );
            let entry = AuditLogEntry::thread(
                thread_id,
                AuditAction::PipelineFailed,
                json!({
                    "error": err.to_string(),
                    "category": err.retry_category().to_string(),
                    "executor": executor.name(),
                }),
            );
            if let Err(e) = store.append_audit(entry).await {
                warn!(thread_id = %thread_id, error = %e, "Failed to audit pipeline failure");
            }
        }
    }

    finish_run(store.as_ref(), claim).await;
}

/// Give back a run's claim. The last one out clears the AI-processing flag.
async fn finish_run(store: &dyn TriageStore, claim: RunClaim) {
    let runs = claim.runs.clone();
    let thread_id = claim.thread_id.clone();
    let thread_id = thread_id.as_str();
    let remaining = claim.release();
    if remaining > 0 {
        debug!(thread_id = %thread_id, remaining, "Runs still outstanding; flag stays up");
        return;
    }
    if let Err(e) = store.set_ai_processing(thread_id, false).await {
        warn!(thread_id = %thread_id, error = %e, "Failed to clear AI processing flag");
    }
    // A message may have been claimed between the release and the clear.
    if runs.active(thread_id) > 0 {
        if let Err(e) = store.set_ai_processing(thread_id, true).await {
            warn!(thread_id = %thread_id, error = %e, "Failed to restore AI processing flag");
        }
    }
}

struct ThreadSlot {
    turn: Arc<AsyncMutex<()>>,
    claims: usize,
}

/// Per-thread run registry. Slots are pruned once their last claim is gone.
#[derive(Clone, Default)]
struct ThreadRuns {
    slots: Arc<Mutex<HashMap<String, ThreadSlot>>>,
}

impl ThreadRuns {
    fn slots(&self) -> MutexGuard<'_, HashMap<String, ThreadSlot>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn claim(&self, thread_id: &str) -> RunClaim {
        let mut slots = self.slots();
        let slot = slots
            .entry(thread_id.to_string())
            .or_insert_with(|| ThreadSlot {
                turn: Arc::new(AsyncMutex::new(())),
                claims: 0,
            });
        slot.claims += 1;
        RunClaim {
            runs: self.clone(),
            thread_id: thread_id.to_string(),
            turn: Arc::clone(&slot.turn),
            released: false,
        }
    }

    fn active(&self, thread_id: &str) -> usize {
        self.slots().get(thread_id).map_or(0, |slot| slot.claims)
    }

    /// Drop one claim; returns how many are left for the thread.
    fn release_one(&self, thread_id: &str) -> usize {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(thread_id) else {
            return 0;
        };
        slot.claims = slot.claims.saturating_sub(1);
        let remaining = slot.claims;
        if remaining == 0 {
            slots.remove(thread_id);
        }
        remaining
    }
}

/// One submitted run. Dropping it unreleased (a superseded debounce timer)
/// gives the claim back.
struct RunClaim {
    runs: ThreadRuns,
    thread_id: String,
    turn: Arc<AsyncMutex<()>>,
    released: bool,
}

impl RunClaim {
    /// Wait until no other run for the thread is executing.
    async fn turn(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.turn).lock_owned().await
    }

    fn release(mut self) -> usize {
        self.released = true;
        self.runs.release_one(&self.thread_id)
    }
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        if !self.released {
            self.runs.release_one(&self.thread_id);
        }
    }
}

fn ticket_note(item: &WorkItem) -> String {
    format!(
        "AI created work item {} ({}, {}): {}. Awaiting approval.",
        item.id, item.item_type, item.priority, item.title
    )
}

/// Remote when a job service is configured, in process otherwise.
pub fn build_executor(
    config: &TriageConfig,
    store: Arc<dyn TriageStore>,
) -> Result<Arc<dyn PipelineExecutor>> {
    if let Some(jobs) = &config.jobs {
        let service = HttpJobService::new(jobs).context("Failed to build job service client")?;
        info!(url = %jobs.url, "Delegating pipeline runs to job service");
        return Ok(Arc::new(RemoteExecutor::new(Arc::new(service), jobs)));
    }

    let backend = HttpChatBackend::new(&config.llm).context("Failed to build LLM client")?;
    let client = CompletionClient::new(Arc::new(backend));
    info!(endpoint = %config.llm.base_url, model = %config.llm.model, "Running pipeline in process");
    Ok(Arc::new(LocalExecutor::new(
        Arc::clone(&store),
        ThreadStateMerger::new(client.clone(), Arc::clone(&store), &config.llm),
        WorkItemGenerator::new(client, store, &config.llm),
        Gatekeeper::with_threshold(config.tuning.confidence_threshold),
    )))
}

/// Convenience for callers that only have a message and a channel.
pub fn ingest_request(thread_id: &str, message: &str, channel: Option<&str>) -> IngestRequest {
    let request = IngestRequest::new(thread_id, message);
    match channel {
        Some(channel) => request.with_metadata(MessageMetadata::channel(channel)),
        None => request,
    }
}
