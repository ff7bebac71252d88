//! Work item generator: a structured ticket from a thread's state.

use std::sync::Arc;

use serde_json::json;
use tracing::{error, info};

use triage::{
    AuditAction, AuditLogEntry, StoreError, ThreadState, TriageStore, WorkItem, WorkItemGenOutput,
    WorkItemType,
};

use crate::config::LlmConfig;
use crate::llm::{CompletionClient, StructuredRequest};
use crate::merger::failure_details;
use crate::prompts::{generator_user_prompt, GENERATOR_SYSTEM_PROMPT, PROMPT_VERSION};

pub struct WorkItemGenerator {
    client: CompletionClient,
    store: Arc<dyn TriageStore>,
    temperature: f32,
    max_tokens: u32,
    max_retries: u32,
}

impl WorkItemGenerator {
    pub fn new(client: CompletionClient, store: Arc<dyn TriageStore>, llm: &LlmConfig) -> Self {
        Self {
            client,
            store,
            temperature: llm.generator_temperature,
            max_tokens: llm.max_tokens,
            max_retries: llm.generator_max_retries,
        }
    }

    /// Generate and persist a work item awaiting approval.
    ///
    /// Returns `Ok(None)` when the model never produced a usable ticket; the
    /// failure is logged with the raw output and audited on the thread.
    pub async fn generate(
        &self,
        thread_id: &str,
        state: &ThreadState,
        item_type: WorkItemType,
    ) -> Result<Option<WorkItem>, StoreError> {
        let request = StructuredRequest {
            system_prompt: GENERATOR_SYSTEM_PROMPT,
            user_prompt: generator_user_prompt(state, item_type),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            max_retries: self.max_retries,
        };

        let output = match self
            .client
            .complete_structured(request, WorkItemGenOutput::from_value)
            .await
        {
            Ok(output) => output,
            Err(err) => {
                error!(
                    thread_id = %thread_id,
                    requested_type = %item_type,
                    error = %err,
                    raw = err.raw_snippet().as_deref().unwrap_or(""),
                    "Work item generation failed"
                );
                let mut details = failure_details(&err);
                details["requestedType"] = json!(item_type);
                self.store
                    .append_audit(AuditLogEntry::thread(
                        thread_id,
                        AuditAction::WorkItemGenerationFailed,
                        details,
                    ))
                    .await?;
                return Ok(None);
            }
        };

        let item = WorkItem::from_generated(thread_id, output, state.recommendation.confidence);
        self.store
            .append_audit(AuditLogEntry::work_item(
                &item.id,
                AuditAction::WorkItemCreated,
                json!({
                    "threadId": thread_id,
                    "type": item.item_type,
                    "requestedType": item_type,
                    "priority": item.priority,
                    "confidenceScore": item.confidence_score,
                    "promptVersion": PROMPT_VERSION,
                }),
            ))
            .await?;
        self.store.insert_work_item(&item).await?;

        info!(
            thread_id = %thread_id,
            work_item_id = %item.id,
            item_type = %item.item_type,
            priority = %item.priority,
            "Work item created"
        );
        Ok(Some(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockChatBackend;
    use triage::{AuditFilter, AuditQuery, MemoryStore, Priority, WorkItemStatus};

    fn generator(replies: Vec<&'static str>) -> (WorkItemGenerator, Arc<MemoryStore>) {
        let mut backend = MockChatBackend::new();
        let mut replies = replies.into_iter();
        backend
            .expect_chat()
            .returning(move |_| Ok(replies.next().unwrap_or("still not json").to_string()));
        let store = Arc::new(MemoryStore::new());
        let generator = WorkItemGenerator::new(
            CompletionClient::new(Arc::new(backend)),
            store.clone(),
            &LlmConfig::default(),
        );
        (generator, store)
    }

    fn confident_state() -> ThreadState {
        ThreadState::from_value(json!({
            "summary": "Login crashes",
            "recommendation": {"action": "CreateBugWorkItem", "confidence": 0.95}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn sloppy_output_is_coerced_into_a_ticket() {
        let (generator, store) = generator(vec![
            r#"{"title": "Login crash", "type": "bug", "priority": "URGENT!!", "acceptanceCriteria": [{"name": "x"}]}"#,
        ]);

        let item = generator
            .generate("t1", &confident_state(), WorkItemType::Bug)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.priority, Priority::P0);
        assert_eq!(item.acceptance_criteria, vec!["x"]);
        assert_eq!(item.status, WorkItemStatus::PendingApproval);
        assert_eq!(item.confidence_score, 0.95);
        assert_eq!(store.list_work_items(Some("t1")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_yield_none_and_audit() {
        let (generator, store) = generator(vec![]);

        let item = generator
            .generate("t1", &confident_state(), WorkItemType::Feature)
            .await
            .unwrap();
        assert!(item.is_none());
        assert!(store.list_work_items(None).await.unwrap().is_empty());

        let errors = store
            .query_audit(&AuditQuery {
                filter: Some(AuditFilter::ErrorsOnly),
                ..AuditQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].action, AuditAction::WorkItemGenerationFailed);
        assert_eq!(errors[0].details_json["requestedType"], "Feature");
    }
}
