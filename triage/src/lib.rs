//! Deterministic core of the feedback triage pipeline.
//!
//! This crate makes no LLM or network calls. It provides:
//! - JSON salvage for unreliable model output ([`salvage`])
//! - two-stage validation of model output into [`ThreadState`] and
//!   [`WorkItemGenOutput`], built on the field rules in [`coerce`]
//! - the [`Gatekeeper`] escalation decision
//! - the work item [`lifecycle`] state machine
//! - the audit log model and the [`TriageStore`] persistence port
//!
//! The LLM-facing side (completion client, merger, generator, orchestrator)
//! lives in the `triage-agents` crate.

pub mod audit;
pub mod coerce;
pub mod gatekeeper;
pub mod lifecycle;
pub mod salvage;
pub mod store;
pub mod thread_state;
pub mod work_item;

pub use audit::{AuditAction, AuditFilter, AuditLogEntry, AuditQuery, EntityType};
pub use gatekeeper::{decide, Gatekeeper, GatekeeperResult, ThreadStatus, CONFIDENCE_THRESHOLD};
pub use lifecycle::{
    check_transition, is_legal_transition, transition_work_item, update_work_item,
    TransitionError, WorkItemStatus,
};
pub use salvage::salvage;
pub use store::{
    MemoryStore, MessageRole, StoreError, StoreResult, ThreadMessage, ThreadRecord, TriageStore,
    Visibility,
};
pub use thread_state::{
    Intent, Recommendation, RecommendationAction, ThreadState, WorkItemCandidate,
};
pub use work_item::{
    EstimatedEffort, Priority, PromptBundle, RiskLevel, TShirtSize, WorkItem, WorkItemGenOutput,
    WorkItemType, WorkItemUpdate,
};
