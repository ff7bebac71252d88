//! Append-only audit log records and the query surface over them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Thread,
    WorkItem,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thread => write!(f, "Thread"),
            Self::WorkItem => write!(f, "WorkItem"),
        }
    }
}

/// Every mutating step of the pipeline and lifecycle records one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    #[serde(rename = "thread_state.updated")]
    ThreadStateUpdated,
    #[serde(rename = "thread_state.update_failed")]
    ThreadStateUpdateFailed,
    #[serde(rename = "gatekeeper.decided")]
    GatekeeperDecided,
    #[serde(rename = "pipeline.failed")]
    PipelineFailed,
    #[serde(rename = "work_item.created")]
    WorkItemCreated,
    #[serde(rename = "work_item.generation_failed")]
    WorkItemGenerationFailed,
    #[serde(rename = "work_item.updated")]
    WorkItemUpdated,
    #[serde(rename = "work_item.submitted")]
    WorkItemSubmitted,
    #[serde(rename = "work_item.approved")]
    WorkItemApproved,
    #[serde(rename = "work_item.rejected")]
    WorkItemRejected,
    #[serde(rename = "work_item.put_on_hold")]
    WorkItemPutOnHold,
    #[serde(rename = "work_item.started")]
    WorkItemStarted,
    #[serde(rename = "work_item.review_requested")]
    WorkItemReviewRequested,
    #[serde(rename = "work_item.completed")]
    WorkItemCompleted,
    #[serde(rename = "work_item.failed")]
    WorkItemFailed,
    #[serde(rename = "work_item.canceled")]
    WorkItemCanceled,
}

impl AuditAction {
    pub const ALL: [AuditAction; 16] = [
        Self::ThreadStateUpdated,
        Self::ThreadStateUpdateFailed,
        Self::GatekeeperDecided,
        Self::PipelineFailed,
        Self::WorkItemCreated,
        Self::WorkItemGenerationFailed,
        Self::WorkItemUpdated,
        Self::WorkItemSubmitted,
        Self::WorkItemApproved,
        Self::WorkItemRejected,
        Self::WorkItemPutOnHold,
        Self::WorkItemStarted,
        Self::WorkItemReviewRequested,
        Self::WorkItemCompleted,
        Self::WorkItemFailed,
        Self::WorkItemCanceled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ThreadStateUpdated => "thread_state.updated",
            Self::ThreadStateUpdateFailed => "thread_state.update_failed",
            Self::GatekeeperDecided => "gatekeeper.decided",
            Self::PipelineFailed => "pipeline.failed",
            Self::WorkItemCreated => "work_item.created",
            Self::WorkItemGenerationFailed => "work_item.generation_failed",
            Self::WorkItemUpdated => "work_item.updated",
            Self::WorkItemSubmitted => "work_item.submitted",
            Self::WorkItemApproved => "work_item.approved",
            Self::WorkItemRejected => "work_item.rejected",
            Self::WorkItemPutOnHold => "work_item.put_on_hold",
            Self::WorkItemStarted => "work_item.started",
            Self::WorkItemReviewRequested => "work_item.review_requested",
            Self::WorkItemCompleted => "work_item.completed",
            Self::WorkItemFailed => "work_item.failed",
            Self::WorkItemCanceled => "work_item.canceled",
        }
    }

    /// Look up an action by its dotted name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == name)
    }

    /// Failures of a pipeline step. A work item moving to `Failed` is a
    /// lifecycle event, not a pipeline error.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            Self::ThreadStateUpdateFailed | Self::WorkItemGenerationFailed | Self::PipelineFailed
        )
    }

    /// Steps written by the ingest pipeline itself.
    pub fn is_pipeline(self) -> bool {
        matches!(
            self,
            Self::ThreadStateUpdated
                | Self::ThreadStateUpdateFailed
                | Self::GatekeeperDecided
                | Self::PipelineFailed
                | Self::WorkItemCreated
                | Self::WorkItemGenerationFailed
        )
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub action: AuditAction,
    pub details_json: Value,
    pub created_at: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        action: AuditAction,
        details_json: Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entity_type,
            entity_id: entity_id.into(),
            action,
            details_json,
            created_at: Utc::now(),
        }
    }

    pub fn thread(thread_id: impl Into<String>, action: AuditAction, details: Value) -> Self {
        Self::new(EntityType::Thread, thread_id, action, details)
    }

    pub fn work_item(item_id: impl Into<String>, action: AuditAction, details: Value) -> Self {
        Self::new(EntityType::WorkItem, item_id, action, details)
    }
}

/// Named views over the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditFilter {
    PipelineActivity,
    WorkItemActivity,
    ErrorsOnly,
}

impl AuditFilter {
    pub fn matches(self, entry: &AuditLogEntry) -> bool {
        match self {
            Self::PipelineActivity => entry.action.is_pipeline(),
            Self::WorkItemActivity => entry.entity_type == EntityType::WorkItem,
            Self::ErrorsOnly => entry.action.is_error(),
        }
    }
}

impl std::str::FromStr for AuditFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "pipeline" | "pipeline_activity" => Ok(Self::PipelineActivity),
            "work_item" | "work_item_activity" | "workitem" => Ok(Self::WorkItemActivity),
            "errors" | "errors_only" => Ok(Self::ErrorsOnly),
            other => Err(format!("unknown audit filter '{other}'")),
        }
    }
}

/// Audit query. Every set criterion must match; results are newest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditQuery {
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<String>,
    pub action: Option<AuditAction>,
    pub filter: Option<AuditFilter>,
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn for_entity(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: Some(entity_type),
            entity_id: Some(entity_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.entity_type.is_none_or(|t| t == entry.entity_type)
            && self
                .entity_id
                .as_deref()
                .is_none_or(|id| id == entry.entity_id)
            && self.action.is_none_or(|a| a == entry.action)
            && self.filter.is_none_or(|f| f.matches(entry))
    }

    /// Apply the query to a chronological log.
    pub fn run<'a>(&self, log: impl DoubleEndedIterator<Item = &'a AuditLogEntry>) -> Vec<AuditLogEntry> {
        log.rev()
            .filter(|entry| self.matches(entry))
            .take(self.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn log() -> Vec<AuditLogEntry> {
        vec![
            AuditLogEntry::thread("t1", AuditAction::ThreadStateUpdated, json!({})),
            AuditLogEntry::thread("t1", AuditAction::GatekeeperDecided, json!({})),
            AuditLogEntry::work_item("w1", AuditAction::WorkItemCreated, json!({})),
            AuditLogEntry::work_item("w1", AuditAction::WorkItemApproved, json!({})),
            AuditLogEntry::thread("t2", AuditAction::ThreadStateUpdateFailed, json!({})),
        ]
    }

    #[test]
    fn action_names_round_trip() {
        for action in AuditAction::ALL {
            assert_eq!(AuditAction::from_name(action.as_str()), Some(action));
            let encoded = serde_json::to_value(action).unwrap();
            assert_eq!(encoded, json!(action.as_str()));
        }
        assert_eq!(AuditAction::from_name("work_item.exploded"), None);
    }

    #[test]
    fn named_filters() {
        let log = log();
        let run = |filter| {
            AuditQuery {
                filter: Some(filter),
                ..AuditQuery::default()
            }
            .run(log.iter())
        };
        assert_eq!(run(AuditFilter::PipelineActivity).len(), 4);
        assert_eq!(run(AuditFilter::WorkItemActivity).len(), 2);
        let errors = run(AuditFilter::ErrorsOnly);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].entity_id, "t2");
    }

    #[test]
    fn query_is_newest_first_and_limited() {
        let log = log();
        let entries = AuditQuery {
            entity_type: Some(EntityType::Thread),
            entity_id: Some("t1".into()),
            limit: Some(1),
            ..AuditQuery::default()
        }
        .run(log.iter());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::GatekeeperDecided);
    }

    #[test]
    fn filter_names_parse() {
        assert_eq!("errors-only".parse::<AuditFilter>(), Ok(AuditFilter::ErrorsOnly));
        assert_eq!("Pipeline Activity".parse::<AuditFilter>(), Ok(AuditFilter::PipelineActivity));
        assert!("everything".parse::<AuditFilter>().is_err());
    }
}
