//! Persistence port for threads, work items and the audit log.
//!
//! [`TriageStore`] is the boundary the pipeline writes through. Each call is
//! an independent transaction: a failure in a later step never rolls back an
//! earlier one. Callers that audit a change append the audit entry before
//! writing the change. [`MemoryStore`] keeps everything in process and can load and
//! save a JSON snapshot file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::audit::{AuditLogEntry, AuditQuery, EntityType};
use crate::gatekeeper::ThreadStatus;
use crate::thread_state::ThreadState;
use crate::work_item::WorkItem;

/// Errors that can occur in store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: EntityType, id: String },

    #[error("Snapshot I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn thread_not_found(id: &str) -> Self {
        Self::NotFound {
            entity: EntityType::Thread,
            id: id.to_string(),
        }
    }

    pub fn work_item_not_found(id: &str) -> Self {
        Self::NotFound {
            entity: EntityType::WorkItem,
            id: id.to_string(),
        }
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadMessage {
    pub role: MessageRole,
    pub visibility: Visibility,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ThreadMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            visibility: Visibility::Public,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    /// A note for staff only; never shown to the customer.
    pub fn internal_note(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            visibility: Visibility::Internal,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// A feedback conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadRecord {
    pub id: String,
    /// Opaque [`ThreadState`] document.
    pub state: serde_json::Value,
    pub status: ThreadStatus,
    pub ai_processing: bool,
    pub messages: Vec<ThreadMessage>,
    pub created_at: DateTime<Utc>,
}

impl ThreadRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: ThreadState::empty().to_document(),
            status: ThreadStatus::Open,
            ai_processing: false,
            messages: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn thread_state(&self) -> ThreadState {
        ThreadState::from_document(Some(self.state.clone()))
    }
}

#[async_trait]
pub trait TriageStore: Send + Sync {
    /// Fetch a thread, creating it with an empty state if it does not exist.
    async fn ensure_thread(&self, thread_id: &str) -> StoreResult<ThreadRecord>;

    async fn get_thread(&self, thread_id: &str) -> StoreResult<Option<ThreadRecord>>;

    /// Delete a thread with its state and messages. The audit log is
    /// append-only and keeps the thread's entries. Returns whether the
    /// thread existed.
    async fn delete_thread(&self, thread_id: &str) -> StoreResult<bool>;

    async fn save_thread_state(&self, thread_id: &str, state: &ThreadState) -> StoreResult<()>;

    async fn set_thread_status(&self, thread_id: &str, status: ThreadStatus) -> StoreResult<()>;

    async fn set_ai_processing(&self, thread_id: &str, processing: bool) -> StoreResult<()>;

    async fn append_message(&self, thread_id: &str, message: ThreadMessage) -> StoreResult<()>;

    async fn insert_work_item(&self, item: &WorkItem) -> StoreResult<()>;

    async fn get_work_item(&self, item_id: &str) -> StoreResult<Option<WorkItem>>;

    /// Replace an existing work item.
    async fn update_work_item(&self, item: &WorkItem) -> StoreResult<()>;

    /// All work items, optionally for one thread, oldest first.
    async fn list_work_items(&self, thread_id: Option<&str>) -> StoreResult<Vec<WorkItem>>;

    async fn append_audit(&self, entry: AuditLogEntry) -> StoreResult<()>;

    /// Newest-first audit entries matching the query.
    async fn query_audit(&self, query: &AuditQuery) -> StoreResult<Vec<AuditLogEntry>>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Snapshot {
    threads: HashMap<String, ThreadRecord>,
    work_items: Vec<WorkItem>,
    audit_log: Vec<AuditLogEntry>,
}

/// In-process store with optional JSON snapshot persistence.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Snapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a snapshot file; a missing file yields an empty store.
    pub async fn load(path: &Path) -> StoreResult<Self> {
        let snapshot = match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Serialization(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No snapshot found, starting empty");
                Snapshot::default()
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Ok(Self {
            inner: RwLock::new(snapshot),
        })
    }

    /// Write the whole store to `path` atomically (temp file + rename).
    pub async fn save(&self, path: &Path) -> StoreResult<()> {
        let bytes = {
            let snapshot = self.inner.read().await;
            serde_json::to_vec_pretty(&*snapshot)
                .map_err(|e| StoreError::Serialization(e.to_string()))?
        };
        let io_err = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, path).await.map_err(io_err)?;

        info!(path = %path.display(), bytes = bytes.len(), "Saved store snapshot");
        Ok(())
    }

    async fn with_thread<F>(&self, thread_id: &str, f: F) -> StoreResult<()>
    where
        F: FnOnce(&mut ThreadRecord) + Send,
    {
        let mut snapshot = self.inner.write().await;
        let thread = snapshot
            .threads
            .get_mut(thread_id)
            .ok_or_else(|| StoreError::thread_not_found(thread_id))?;
        f(thread);
        Ok(())
    }
}

#[async_trait]
impl TriageStore for MemoryStore {
    async fn ensure_thread(&self, thread_id: &str) -> StoreResult<ThreadRecord> {
        let mut snapshot = self.inner.write().await;
        Ok(snapshot
            .threads
            .entry(thread_id.to_string())
            .or_insert_with(|| ThreadRecord::new(thread_id))
            .clone())
    }

    async fn get_thread(&self, thread_id: &str) -> StoreResult<Option<ThreadRecord>> {
        Ok(self.inner.read().await.threads.get(thread_id).cloned())
    }

    async fn delete_thread(&self, thread_id: &str) -> StoreResult<bool> {
        Ok(self.inner.write().await.threads.remove(thread_id).is_some())
    }

    async fn save_thread_state(&self, thread_id: &str, state: &ThreadState) -> StoreResult<()> {
        let document = state.to_document();
        self.with_thread(thread_id, move |t| t.state = document).await
    }

    async fn set_thread_status(&self, thread_id: &str, status: ThreadStatus) -> StoreResult<()> {
        self.with_thread(thread_id, move |t| t.status = status).await
    }

    async fn set_ai_processing(&self, thread_id: &str, processing: bool) -> StoreResult<()> {
        self.with_thread(thread_id, move |t| t.ai_processing = processing)
            .await
    }

    async fn append_message(&self, thread_id: &str, message: ThreadMessage) -> StoreResult<()> {
        self.with_thread(thread_id, move |t| t.messages.push(message))
            .await
    }

    async fn insert_work_item(&self, item: &WorkItem) -> StoreResult<()> {
        self.inner.write().await.work_items.push(item.clone());
        Ok(())
    }

    async fn get_work_item(&self, item_id: &str) -> StoreResult<Option<WorkItem>> {
        Ok(self
            .inner
            .read()
            .await
            .work_items
            .iter()
            .find(|w| w.id == item_id)
            .cloned())
    }

    async fn update_work_item(&self, item: &WorkItem) -> StoreResult<()> {
        let mut snapshot = self.inner.write().await;
        let slot = snapshot
            .work_items
            .iter_mut()
            .find(|w| w.id == item.id)
            .ok_or_else(|| StoreError::work_item_not_found(&item.id))?;
        *slot = item.clone();
        Ok(())
    }

    async fn list_work_items(&self, thread_id: Option<&str>) -> StoreResult<Vec<WorkItem>> {
        Ok(self
            .inner
            .read()
            .await
            .work_items
            .iter()
            .filter(|w| thread_id.is_none_or(|id| w.thread_id == id))
            .cloned()
            .collect())
    }

    async fn append_audit(&self, entry: AuditLogEntry) -> StoreResult<()> {
        debug!(
            entity_type = %entry.entity_type,
            entity_id = %entry.entity_id,
            action = %entry.action,
            "Audit entry"
        );
        self.inner.write().await.audit_log.push(entry);
        Ok(())
    }

    async fn query_audit(&self, query: &AuditQuery) -> StoreResult<Vec<AuditLogEntry>> {
        Ok(query.run(self.inner.read().await.audit_log.iter()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditAction;
    use serde_json::json;

    #[tokio::test]
    async fn ensure_thread_starts_empty_and_open() {
        let store = MemoryStore::new();
        let thread = store.ensure_thread("t1").await.unwrap();
        assert_eq!(thread.status, ThreadStatus::Open);
        assert!(!thread.ai_processing);
        assert!(thread.thread_state().is_empty());
    }

    #[tokio::test]
    async fn missing_thread_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .set_ai_processing("nope", true)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: EntityType::Thread, .. }));
    }

    #[tokio::test]
    async fn delete_thread_keeps_its_audit_entries() {
        let store = MemoryStore::new();
        store.ensure_thread("t1").await.unwrap();
        store
            .append_audit(AuditLogEntry::thread("t1", AuditAction::ThreadStateUpdated, json!({})))
            .await
            .unwrap();
        store
            .append_audit(AuditLogEntry::thread("t2", AuditAction::ThreadStateUpdated, json!({})))
            .await
            .unwrap();

        assert!(store.delete_thread("t1").await.unwrap());
        assert!(!store.delete_thread("t1").await.unwrap());
        assert!(store.get_thread("t1").await.unwrap().is_none());
        let remaining = store
            .query_audit(&AuditQuery::for_entity(EntityType::Thread, "t1"))
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].action, AuditAction::ThreadStateUpdated);
        assert_eq!(store.query_audit(&AuditQuery::default()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = MemoryStore::new();
        store.ensure_thread("t1").await.unwrap();
        store
            .append_message("t1", ThreadMessage::user("hello"))
            .await
            .unwrap();
        store.save(&path).await.unwrap();

        let loaded = MemoryStore::load(&path).await.unwrap();
        let thread = loaded.get_thread("t1").await.unwrap().unwrap();
        assert_eq!(thread.messages.len(), 1);
        assert_eq!(thread.messages[0].content, "hello");
    }

    #[tokio::test]
    async fn loading_missing_snapshot_gives_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::load(&dir.path().join("absent.json")).await.unwrap();
        assert!(store.list_work_items(None).await.unwrap().is_empty());
    }
}
