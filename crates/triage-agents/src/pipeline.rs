//! One ingest run: merger → gatekeeper → conditional generator.
//!
//! The generator only runs after a successful merge.
//!
//! [`PipelineExecutor`] is the seam between running the pipeline in process
//! ([`LocalExecutor`]) and delegating it to the remote job service
//! ([`crate::remote::RemoteExecutor`]). Both produce the same result and
//! error shapes.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use triage::{
    AuditAction, AuditLogEntry, Gatekeeper, GatekeeperResult, Intent, StoreError, ThreadState,
    TriageStore, WorkItem, WorkItemType,
};

use crate::errors::PipelineError;
use crate::generator::WorkItemGenerator;
use crate::merger::{MessageMetadata, ThreadStateMerger};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    pub thread_id: String,
    pub message: String,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl IngestRequest {
    pub fn new(thread_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            message: message.into(),
            metadata: MessageMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Explicit work item generation for a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub thread_id: String,
    /// Inferred from the thread state when absent.
    #[serde(default)]
    pub item_type: Option<WorkItemType>,
}

/// Full result of one ingest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineOutcome {
    pub thread_id: String,
    pub state: ThreadState,
    /// `false` when the merge failed and `state` is the previous state.
    pub state_updated: bool,
    pub decision: GatekeeperResult,
    pub work_item: Option<WorkItem>,
}

#[async_trait]
pub trait PipelineExecutor: Send + Sync {
    /// Short name for logs: `local` or `remote`.
    fn name(&self) -> &'static str;

    async fn ingest(&self, request: &IngestRequest) -> Result<PipelineOutcome, PipelineError>;

    async fn generate(&self, request: &GenerateRequest) -> Result<Option<WorkItem>, PipelineError>;
}

/// Runs every step in process against the store.
pub struct LocalExecutor {
    store: Arc<dyn TriageStore>,
    merger: ThreadStateMerger,
    generator: WorkItemGenerator,
    gatekeeper: Gatekeeper,
}

impl LocalExecutor {
    pub fn new(
        store: Arc<dyn TriageStore>,
        merger: ThreadStateMerger,
        generator: WorkItemGenerator,
        gatekeeper: Gatekeeper,
    ) -> Self {
        Self {
            store,
            merger,
            generator,
            gatekeeper,
        }
    }

    async fn record_decision(
        &self,
        thread_id: &str,
        decision: &GatekeeperResult,
    ) -> Result<(), StoreError> {
        self.store
            .append_audit(AuditLogEntry::thread(
                thread_id,
                AuditAction::GatekeeperDecided,
                json!({
                    "decision": decision,
                    "threshold": self.gatekeeper.threshold(),
                }),
            ))
            .await?;
        self.store
            .set_thread_status(thread_id, decision.thread_status)
            .await
    }
}

#[async_trait]
impl PipelineExecutor for LocalExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn ingest(&self, request: &IngestRequest) -> Result<PipelineOutcome, PipelineError> {
        let thread = self.store.ensure_thread(&request.thread_id).await?;
        let current = thread.thread_state();

        let merged = self
            .merger
            .update_thread_state(
                &request.thread_id,
                Some(&current),
                &request.message,
                &request.metadata,
            )
            .await?;

        let decision = self.gatekeeper.decide(&merged.state);
        debug!(
            thread_id = %request.thread_id,
            create = decision.should_create_work_item,
            reason = %decision.reason,
            "Gatekeeper decided"
        );
        self.record_decision(&request.thread_id, &decision).await?;

        // A failed merge means nothing new was learned; the previous run
        // already acted on this state.
        let work_item = match (decision.should_create_work_item, decision.work_item_type) {
            (true, Some(_)) if !merged.updated => {
                debug!(thread_id = %request.thread_id, "Merge failed; skipping generation");
                None
            }
            (true, Some(item_type)) => {
                self.generator
                    .generate(&request.thread_id, &merged.state, item_type)
                    .await?
            }
            _ => None,
        };

        info!(
            thread_id = %request.thread_id,
            state_updated = merged.updated,
            work_item = work_item.as_ref().map(|w| w.id.as_str()).unwrap_or("none"),
            "Ingest pipeline finished"
        );

        Ok(PipelineOutcome {
            thread_id: request.thread_id.clone(),
            state: merged.state,
            state_updated: merged.updated,
            decision,
            work_item,
        })
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<Option<WorkItem>, PipelineError> {
        let thread = self
            .store
            .get_thread(&request.thread_id)
            .await?
            .ok_or_else(|| StoreError::thread_not_found(&request.thread_id))?;
        let state = thread.thread_state();
        let item_type = request
            .item_type
            .unwrap_or_else(|| infer_type(&self.gatekeeper, &state));

        Ok(self
            .generator
            .generate(&request.thread_id, &state, item_type)
            .await?)
    }
}

/// The gatekeeper's choice when it has one, otherwise Bug for bug-like
/// intents and Feature for everything else.
pub fn infer_type(gatekeeper: &Gatekeeper, state: &ThreadState) -> WorkItemType {
    if let Some(item_type) = gatekeeper.decide(state).work_item_type {
        return item_type;
    }
    match state.intent {
        Intent::Bug | Intent::Performance => WorkItemType::Bug,
        _ => WorkItemType::Feature,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infer_type_falls_back_to_intent() {
        let gatekeeper = Gatekeeper::new();
        let mut state = ThreadState::empty();
        assert_eq!(infer_type(&gatekeeper, &state), WorkItemType::Feature);

        state.intent = Intent::Performance;
        assert_eq!(infer_type(&gatekeeper, &state), WorkItemType::Bug);
    }

    #[test]
    fn ingest_request_accepts_missing_metadata() {
        let request: IngestRequest =
            serde_json::from_value(json!({"threadId": "t1", "message": "hi"})).unwrap();
        assert_eq!(request, IngestRequest::new("t1", "hi"));
    }
}
