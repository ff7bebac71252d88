//! ThreadState merger: folds one new message into the cumulative state.
//!
//! Completion failures never lose state: the previous ThreadState is returned
//! unchanged and the failure is audited. Store failures propagate.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use triage::{AuditAction, AuditLogEntry, StoreError, ThreadState, TriageStore};

use crate::config::LlmConfig;
use crate::errors::CompletionError;
use crate::llm::{CompletionClient, StructuredRequest};
use crate::prompts::{merger_user_prompt, MERGER_SYSTEM_PROMPT, PROMPT_VERSION};

/// Where a message came from. Passed to the model as context only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageMetadata {
    pub channel: Option<String>,
    pub author: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl MessageMetadata {
    pub fn channel(channel: impl Into<String>) -> Self {
        Self {
            channel: Some(channel.into()),
            ..Self::default()
        }
    }

    /// `key: value` lines for the prompt.
    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        if let Some(channel) = &self.channel {
            lines.push(format!("channel: {channel}"));
        }
        if let Some(author) = &self.author {
            lines.push(format!("author: {author}"));
        }
        for (key, value) in &self.extra {
            lines.push(format!("{key}: {value}"));
        }
        lines.join("\n")
    }
}

/// Result of one merge.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub state: ThreadState,
    /// `false` when the model call failed and `state` is the previous state.
    pub updated: bool,
}

pub struct ThreadStateMerger {
    client: CompletionClient,
    store: Arc<dyn TriageStore>,
    temperature: f32,
    max_tokens: u32,
    max_retries: u32,
}

impl ThreadStateMerger {
    pub fn new(client: CompletionClient, store: Arc<dyn TriageStore>, llm: &LlmConfig) -> Self {
        Self {
            client,
            store,
            temperature: llm.merger_temperature,
            max_tokens: llm.max_tokens,
            max_retries: llm.merger_max_retries,
        }
    }

    /// Merge `message` into `current` (or an empty state) for `thread_id`.
    pub async fn update_thread_state(
        &self,
        thread_id: &str,
        current: Option<&ThreadState>,
        message: &str,
        metadata: &MessageMetadata,
    ) -> Result<MergeOutcome, StoreError> {
        let previous = current.cloned().unwrap_or_default();

        let request = StructuredRequest {
            system_prompt: MERGER_SYSTEM_PROMPT,
            user_prompt: merger_user_prompt(&previous, message, &metadata.render()),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            max_retries: self.max_retries,
        };

        match self
            .client
            .complete_structured(request, ThreadState::from_value)
            .await
        {
            Ok(merged) => {
                let state = merged.reconcile(&previous);
                self.store
                    .append_audit(AuditLogEntry::thread(
                        thread_id,
                        AuditAction::ThreadStateUpdated,
                        json!({
                            "recommendation": state.recommendation,
                            "intent": state.intent,
                            "promptVersion": PROMPT_VERSION,
                        }),
                    ))
                    .await?;
                self.store.save_thread_state(thread_id, &state).await?;
                info!(
                    thread_id = %thread_id,
                    action = %state.recommendation.action,
                    confidence = state.recommendation.confidence,
                    "Thread state updated"
                );
                Ok(MergeOutcome {
                    state,
                    updated: true,
                })
            }
            Err(err) => {
                error!(thread_id = %thread_id, error = %err, "Thread state merge failed; keeping previous state");
                self.store
                    .append_audit(AuditLogEntry::thread(
                        thread_id,
                        AuditAction::ThreadStateUpdateFailed,
                        failure_details(&err),
                    ))
                    .await?;
                Ok(MergeOutcome {
                    state: previous,
                    updated: false,
                })
            }
        }
    }
}

/// Audit details for a failed completion: category, endpoint and raw snippet.
pub(crate) fn failure_details(err: &CompletionError) -> serde_json::Value {
    json!({
        "error": err.to_string(),
        "category": err.retry_category().to_string(),
        "endpoint": err.endpoint(),
        "rawSnippet": err.raw_snippet(),
        "promptVersion": PROMPT_VERSION,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockChatBackend;
    use triage::{AuditQuery, EntityType, MemoryStore, RecommendationAction};

    async fn merger_with(reply: Result<String, ()>) -> (ThreadStateMerger, Arc<MemoryStore>) {
        let mut backend = MockChatBackend::new();
        backend.expect_chat().returning(move |_| match &reply {
            Ok(text) => Ok(text.clone()),
            Err(()) => Err(CompletionError::Timeout {
                endpoint: "http://llm/v1/chat/completions".into(),
                timeout_secs: 120,
            }),
        });
        let store = Arc::new(MemoryStore::new());
        store.ensure_thread("t1").await.unwrap();
        let merger = ThreadStateMerger::new(
            CompletionClient::new(Arc::new(backend)),
            store.clone(),
            &LlmConfig::default(),
        );
        (merger, store)
    }

    #[test]
    fn metadata_renders_as_lines() {
        let mut meta = MessageMetadata::channel("slack");
        meta.extra.insert("plan".into(), "pro".into());
        assert_eq!(meta.render(), "channel: slack\nplan: pro");
        assert_eq!(MessageMetadata::default().render(), "");
    }

    #[tokio::test]
    async fn success_persists_and_audits() {
        let (merger, store) = merger_with(Ok(r#"{
            "summary": "Login crashes on Safari 17",
            "intent": "Bug",
            "recommendation": {"action": "CreateBugWorkItem", "confidence": 0.95}
        }"#
        .to_string()))
        .await;

        let outcome = merger
            .update_thread_state("t1", None, "Login crashes", &MessageMetadata::default())
            .await
            .unwrap();
        assert!(outcome.updated);
        assert_eq!(
            outcome.state.recommendation.action,
            RecommendationAction::CreateBugWorkItem
        );

        let thread = store.get_thread("t1").await.unwrap().unwrap();
        assert_eq!(thread.thread_state().summary, "Login crashes on Safari 17");
        let audit = store
            .query_audit(&AuditQuery::for_entity(EntityType::Thread, "t1"))
            .await
            .unwrap();
        assert_eq!(audit[0].action, AuditAction::ThreadStateUpdated);
    }

    #[tokio::test]
    async fn failure_returns_previous_state_and_audits_error() {
        let (merger, store) = merger_with(Err(())).await;
        let previous = ThreadState {
            summary: "Known summary".into(),
            ..ThreadState::default()
        };

        let outcome = merger
            .update_thread_state("t1", Some(&previous), "more", &MessageMetadata::default())
            .await
            .unwrap();
        assert!(!outcome.updated);
        assert_eq!(outcome.state, previous);

        let audit = store
            .query_audit(&AuditQuery::for_entity(EntityType::Thread, "t1"))
            .await
            .unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, AuditAction::ThreadStateUpdateFailed);
        assert_eq!(
            audit[0].details_json["endpoint"],
            "http://llm/v1/chat/completions"
        );
    }
}
