//! Work item lifecycle: explicit states and legal transition guards.
//!
//! Every successful transition is persisted together with exactly one audit
//! entry naming the action and the reason. Illegal transitions are rejected
//! with both states named and are never retried.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::audit::{AuditAction, AuditLogEntry};
use crate::store::{StoreError, TriageStore};
use crate::work_item::{WorkItem, WorkItemUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkItemStatus {
    Draft,
    PendingApproval,
    Approved,
    Rejected,
    OnHold,
    InProgress,
    NeedsReview,
    Done,
    Failed,
    Canceled,
}

impl WorkItemStatus {
    pub const ALL: [WorkItemStatus; 10] = [
        Self::Draft,
        Self::PendingApproval,
        Self::Approved,
        Self::Rejected,
        Self::OnHold,
        Self::InProgress,
        Self::NeedsReview,
        Self::Done,
        Self::Failed,
        Self::Canceled,
    ];

    /// Whether this is a terminal state (no further transitions allowed).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Canceled)
    }

    /// Whether moving into this state needs a human-readable reason.
    pub fn requires_reason(self) -> bool {
        matches!(self, Self::Rejected | Self::OnHold | Self::Failed)
    }

    /// Legal targets from this state.
    pub fn allowed_targets(self) -> Vec<WorkItemStatus> {
        Self::ALL
            .into_iter()
            .filter(|to| is_legal_transition(self, *to))
            .collect()
    }

    /// The audit action recorded when an item enters this state.
    pub fn entry_action(self) -> AuditAction {
        match self {
            Self::Draft | Self::PendingApproval => AuditAction::WorkItemSubmitted,
            Self::Approved => AuditAction::WorkItemApproved,
            Self::Rejected => AuditAction::WorkItemRejected,
            Self::OnHold => AuditAction::WorkItemPutOnHold,
            Self::InProgress => AuditAction::WorkItemStarted,
            Self::NeedsReview => AuditAction::WorkItemReviewRequested,
            Self::Done => AuditAction::WorkItemCompleted,
            Self::Failed => AuditAction::WorkItemFailed,
            Self::Canceled => AuditAction::WorkItemCanceled,
        }
    }
}

impl fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Draft => write!(f, "Draft"),
            Self::PendingApproval => write!(f, "PendingApproval"),
            Self::Approved => write!(f, "Approved"),
            Self::Rejected => write!(f, "Rejected"),
            Self::OnHold => write!(f, "OnHold"),
            Self::InProgress => write!(f, "InProgress"),
            Self::NeedsReview => write!(f, "NeedsReview"),
            Self::Done => write!(f, "Done"),
            Self::Failed => write!(f, "Failed"),
            Self::Canceled => write!(f, "Canceled"),
        }
    }
}

impl std::str::FromStr for WorkItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = crate::coerce::normalize_token(s);
        Self::ALL
            .into_iter()
            .find(|status| crate::coerce::normalize_token(&status.to_string()) == needle)
            .ok_or_else(|| format!("unknown work item status '{s}'"))
    }
}

/// Legal transitions between work item states.
///
/// ```text
/// Draft           → PendingApproval | Canceled
/// PendingApproval → Approved | Rejected | OnHold | Canceled
/// Approved        → InProgress | OnHold | Canceled
/// Rejected        → PendingApproval | Canceled
/// OnHold          → PendingApproval | Approved | Canceled
/// InProgress      → NeedsReview | Done | Failed | OnHold | Canceled
/// NeedsReview     → InProgress | Done | Failed | Canceled
/// Failed          → InProgress | PendingApproval | Canceled
/// Done, Canceled  → (terminal)
/// ```
pub fn is_legal_transition(from: WorkItemStatus, to: WorkItemStatus) -> bool {
    use WorkItemStatus::*;

    if from.is_terminal() {
        return false;
    }
    if to == Canceled {
        return true;
    }

    matches!(
        (from, to),
        (Draft, PendingApproval)
            | (PendingApproval, Approved)
            | (PendingApproval, Rejected)
            | (PendingApproval, OnHold)
            | (Approved, InProgress)
            | (Approved, OnHold)
            | (Rejected, PendingApproval)
            | (OnHold, PendingApproval)
            | (OnHold, Approved)
            | (InProgress, NeedsReview)
            | (InProgress, Done)
            | (InProgress, Failed)
            | (InProgress, OnHold)
            | (NeedsReview, InProgress)
            | (NeedsReview, Done)
            | (NeedsReview, Failed)
            | (Failed, InProgress)
            | (Failed, PendingApproval)
    )
}

#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("Illegal work item transition: {from} → {to}")]
    Illegal {
        from: WorkItemStatus,
        to: WorkItemStatus,
    },

    #[error("A reason is required to move a work item to {to}")]
    MissingReason { to: WorkItemStatus },

    #[error("Work item not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TransitionError {
    /// Lifecycle failures are never retried; only store hiccups might be.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Store(StoreError::Io { .. }))
    }
}

/// Validate a transition without touching any store.
pub fn check_transition(
    from: WorkItemStatus,
    to: WorkItemStatus,
    reason: Option<&str>,
) -> Result<AuditAction, TransitionError> {
    if !is_legal_transition(from, to) {
        return Err(TransitionError::Illegal { from, to });
    }
    let has_reason = reason.is_some_and(|r| !r.trim().is_empty());
    if to.requires_reason() && !has_reason {
        return Err(TransitionError::MissingReason { to });
    }
    Ok(to.entry_action())
}

/// Move a stored work item to `to`, persisting it and one audit entry.
pub async fn transition_work_item(
    store: &dyn TriageStore,
    item_id: &str,
    to: WorkItemStatus,
    reason: Option<&str>,
) -> Result<WorkItem, TransitionError> {
    let mut item = store
        .get_work_item(item_id)
        .await?
        .ok_or_else(|| TransitionError::NotFound(item_id.to_string()))?;

    let from = item.status;
    let action = check_transition(from, to, reason)?;
    let reason = reason.map(str::trim).filter(|r| !r.is_empty());

    item.status = to;
    item.updated_at = Utc::now();
    // Audit first: a failed save may leave an entry without a change, but
    // never a change without an entry.
    store
        .append_audit(AuditLogEntry::work_item(
            &item.id,
            action,
            json!({
                "from": from,
                "to": to,
                "reason": reason,
            }),
        ))
        .await?;
    store.update_work_item(&item).await?;

    info!(
        work_item_id = %item.id,
        %from,
        %to,
        action = %action,
        "Work item transitioned"
    );
    Ok(item)
}

/// Apply a field edit to a stored work item. An edit that changes nothing
/// writes no audit entry.
pub async fn update_work_item(
    store: &dyn TriageStore,
    item_id: &str,
    update: &WorkItemUpdate,
) -> Result<WorkItem, TransitionError> {
    let mut item = store
        .get_work_item(item_id)
        .await?
        .ok_or_else(|| TransitionError::NotFound(item_id.to_string()))?;

    let changed = update.apply(&mut item);
    if changed.is_empty() {
        return Ok(item);
    }

    store
        .append_audit(AuditLogEntry::work_item(
            &item.id,
            AuditAction::WorkItemUpdated,
            json!({ "changedFields": changed }),
        ))
        .await?;
    store.update_work_item(&item).await?;
    info!(work_item_id = %item.id, fields = ?changed, "Work item updated");
    Ok(item)
}
