//! Gatekeeper: deterministic escalation decision for a thread.
//!
//! Consumes a [`ThreadState`] and decides whether it warrants a work item.
//! No LLM calls and no I/O; the same state always yields the same result.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::thread_state::{RecommendationAction, ThreadState};
use crate::work_item::WorkItemType;

/// Minimum recommendation confidence for a ticket to be created.
pub const CONFIDENCE_THRESHOLD: f64 = 0.70;

/// Conversation status as seen by support staff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ThreadStatus {
    #[default]
    Open,
    WaitingOnUser,
}

impl std::fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "Open"),
            Self::WaitingOnUser => write!(f, "WaitingOnUser"),
        }
    }
}

/// Decision produced by the gatekeeper. Derived, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatekeeperResult {
    pub should_create_work_item: bool,
    pub work_item_type: Option<WorkItemType>,
    pub thread_status: ThreadStatus,
    pub reason: String,
}

impl GatekeeperResult {
    fn create(work_item_type: WorkItemType, reason: String) -> Self {
        Self {
            should_create_work_item: true,
            work_item_type: Some(work_item_type),
            thread_status: ThreadStatus::Open,
            reason,
        }
    }

    fn hold(thread_status: ThreadStatus, reason: String) -> Self {
        Self {
            should_create_work_item: false,
            work_item_type: None,
            thread_status,
            reason,
        }
    }
}

/// The gatekeeper with its confidence threshold.
#[derive(Debug, Clone, Copy)]
pub struct Gatekeeper {
    threshold: f64,
}

impl Default for Gatekeeper {
    fn default() -> Self {
        Self::new()
    }
}

impl Gatekeeper {
    pub fn new() -> Self {
        Self {
            threshold: CONFIDENCE_THRESHOLD,
        }
    }

    /// Use a custom threshold, clamped into `[0, 1]`.
    pub fn with_threshold(threshold: f64) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Decide what to do with a thread.
    ///
    /// | action                | confidence        | create                 | status        |
    /// |-----------------------|-------------------|------------------------|---------------|
    /// | NoTicket              | any               | no                     | Open          |
    /// | AskQuestions          | any               | no                     | WaitingOnUser |
    /// | CreateBug/Feature     | >= threshold      | Bug / Feature          | Open          |
    /// | CreateBug/Feature     | < threshold       | no                     | Open          |
    /// | SplitIntoTwo          | top >= threshold  | candidate type or Bug  | Open          |
    /// | SplitIntoTwo          | top < threshold   | no                     | Open          |
    pub fn decide(&self, state: &ThreadState) -> GatekeeperResult {
        let rec = &state.recommendation;

        match rec.action {
            RecommendationAction::NoTicket => GatekeeperResult::hold(
                ThreadStatus::Open,
                with_model_reason("No ticket recommended", &rec.reason),
            ),
            RecommendationAction::AskQuestions => GatekeeperResult::hold(
                ThreadStatus::WaitingOnUser,
                with_model_reason("More information needed from the user", &rec.reason),
            ),
            RecommendationAction::CreateBugWorkItem | RecommendationAction::CreateFeatureWorkItem => {
                let kind = if rec.action == RecommendationAction::CreateBugWorkItem {
                    WorkItemType::Bug
                } else {
                    WorkItemType::Feature
                };
                if rec.confidence >= self.threshold {
                    GatekeeperResult::create(
                        kind,
                        with_model_reason(
                            &format!(
                                "{kind} recommended with confidence {:.2} (threshold {:.2})",
                                rec.confidence, self.threshold
                            ),
                            &rec.reason,
                        ),
                    )
                } else {
                    GatekeeperResult::hold(
                        ThreadStatus::Open,
                        format!(
                            "{kind} recommended but confidence {:.2} is below threshold {:.2}",
                            rec.confidence, self.threshold
                        ),
                    )
                }
            }
            RecommendationAction::SplitIntoTwo => self.decide_split(state),
        }
    }

    fn decide_split(&self, state: &ThreadState) -> GatekeeperResult {
        let Some(top) = state.top_candidate() else {
            return GatekeeperResult::hold(
                ThreadStatus::Open,
                "Split recommended but no work item candidates were identified".to_string(),
            );
        };

        if top.confidence < self.threshold {
            return GatekeeperResult::hold(
                ThreadStatus::Open,
                format!(
                    "Split recommended but top candidate '{}' has confidence {:.2}, below threshold {:.2}",
                    top.short_title, top.confidence, self.threshold
                ),
            );
        }

        let kind = WorkItemType::parse(Some(&Value::String(top.kind.clone())))
            .unwrap_or(WorkItemType::Bug);
        GatekeeperResult::create(
            kind,
            format!(
                "Split recommended; creating {kind} for top candidate '{}' (confidence {:.2})",
                top.short_title, top.confidence
            ),
        )
    }
}

/// Decide with the default threshold.
pub fn decide(state: &ThreadState) -> GatekeeperResult {
    Gatekeeper::new().decide(state)
}

fn with_model_reason(prefix: &str, model_reason: &str) -> String {
    let model_reason = model_reason.trim();
    if model_reason.is_empty() {
        prefix.to_string()
    } else {
        format!("{prefix}: {model_reason}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(action: &str, confidence: f64) -> ThreadState {
        ThreadState::from_value(json!({
            "recommendation": {"action": action, "reason": "model says so", "confidence": confidence}
        }))
        .unwrap()
    }

    fn split_state(candidates: Value) -> ThreadState {
        ThreadState::from_value(json!({
            "recommendation": {"action": "SplitIntoTwo", "confidence": 0.9},
            "workItemCandidates": candidates,
        }))
        .unwrap()
    }

    #[test]
    fn no_ticket_never_creates() {
        let result = decide(&state("NoTicket", 1.0));
        assert!(!result.should_create_work_item);
        assert_eq!(result.thread_status, ThreadStatus::Open);
        assert_eq!(result.work_item_type, None);
    }

    #[test]
    fn ask_questions_waits_on_user() {
        let result = decide(&state("AskQuestions", 0.99));
        assert!(!result.should_create_work_item);
        assert_eq!(result.thread_status, ThreadStatus::WaitingOnUser);
    }

    #[test]
    fn create_at_threshold_escalates() {
        let result = decide(&state("CreateBugWorkItem", 0.70));
        assert!(result.should_create_work_item);
        assert_eq!(result.work_item_type, Some(WorkItemType::Bug));
        assert_eq!(result.thread_status, ThreadStatus::Open);

        let result = decide(&state("CreateFeatureWorkItem", 0.95));
        assert_eq!(result.work_item_type, Some(WorkItemType::Feature));
    }

    #[test]
    fn create_below_threshold_cites_gap() {
        let result = decide(&state("CreateBugWorkItem", 0.69));
        assert!(!result.should_create_work_item);
        assert_eq!(result.thread_status, ThreadStatus::Open);
        assert!(result.reason.contains("0.69"));
        assert!(result.reason.contains("0.70"));
    }

    #[test]
    fn split_uses_top_candidate_type() {
        let result = decide(&split_state(json!([
            {"type": "Bug", "shortTitle": "Crash", "confidence": 0.6},
            {"type": "docs", "shortTitle": "Update guide", "confidence": 0.8},
        ])));
        assert!(result.should_create_work_item);
        assert_eq!(result.work_item_type, Some(WorkItemType::Docs));
    }

    #[test]
    fn split_with_invalid_type_falls_back_to_bug() {
        let result = decide(&split_state(json!([
            {"type": "Epic", "shortTitle": "Everything", "confidence": 0.9},
        ])));
        assert_eq!(result.work_item_type, Some(WorkItemType::Bug));
    }

    #[test]
    fn split_without_confident_candidate_holds() {
        let low = decide(&split_state(json!([
            {"type": "Bug", "shortTitle": "Crash", "confidence": 0.5},
        ])));
        assert!(!low.should_create_work_item);

        let none = decide(&split_state(json!([])));
        assert!(!none.should_create_work_item);
        assert_eq!(none.thread_status, ThreadStatus::Open);
    }

    #[test]
    fn custom_threshold_is_respected() {
        let strict = Gatekeeper::with_threshold(0.9);
        assert!(!strict.decide(&state("CreateBugWorkItem", 0.8)).should_create_work_item);
        assert!(Gatekeeper::with_threshold(0.5)
            .decide(&state("CreateBugWorkItem", 0.5))
            .should_create_work_item);
        assert_eq!(Gatekeeper::with_threshold(7.0).threshold(), 1.0);
    }
}
