//! Cumulative conversation state maintained by the LLM merger.
//!
//! `ThreadState` is persisted as an opaque camelCase JSON document on the
//! thread record. It is always structurally complete: [`ThreadState::from_value`]
//! turns any JSON object into a fully populated state, and
//! [`ThreadState::reconcile`] guarantees a merge never drops what was already
//! known.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::coerce;

/// What the conversation is fundamentally about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Intent {
    Bug,
    Feature,
    Performance,
    Billing,
    #[default]
    Other,
}

impl Intent {
    const TABLE: &'static [(&'static str, Intent)] = &[
        ("Bug", Intent::Bug),
        ("Feature", Intent::Feature),
        ("FeatureRequest", Intent::Feature),
        ("Performance", Intent::Performance),
        ("Billing", Intent::Billing),
        ("Other", Intent::Other),
    ];

    /// Case-insensitive parse; unknown values become `Other`.
    pub fn coerce(value: Option<&Value>) -> Self {
        coerce::fold_enum(value, Self::TABLE).unwrap_or_default()
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bug => write!(f, "Bug"),
            Self::Feature => write!(f, "Feature"),
            Self::Performance => write!(f, "Performance"),
            Self::Billing => write!(f, "Billing"),
            Self::Other => write!(f, "Other"),
        }
    }
}

/// Recommended next step for the thread, as judged by the merger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RecommendationAction {
    #[default]
    NoTicket,
    AskQuestions,
    CreateBugWorkItem,
    CreateFeatureWorkItem,
    SplitIntoTwo,
}

impl RecommendationAction {
    const TABLE: &'static [(&'static str, RecommendationAction)] = &[
        ("NoTicket", RecommendationAction::NoTicket),
        ("AskQuestions", RecommendationAction::AskQuestions),
        ("CreateBugWorkItem", RecommendationAction::CreateBugWorkItem),
        ("CreateFeatureWorkItem", RecommendationAction::CreateFeatureWorkItem),
        ("SplitIntoTwo", RecommendationAction::SplitIntoTwo),
    ];

    /// Case-insensitive parse; unknown values become `NoTicket`.
    pub fn coerce(value: Option<&Value>) -> Self {
        coerce::fold_enum(value, Self::TABLE).unwrap_or_default()
    }
}

impl fmt::Display for RecommendationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoTicket => write!(f, "NoTicket"),
            Self::AskQuestions => write!(f, "AskQuestions"),
            Self::CreateBugWorkItem => write!(f, "CreateBugWorkItem"),
            Self::CreateFeatureWorkItem => write!(f, "CreateFeatureWorkItem"),
            Self::SplitIntoTwo => write!(f, "SplitIntoTwo"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub action: RecommendationAction,
    pub reason: String,
    /// Always within `[0, 1]`.
    pub confidence: f64,
}

/// A possible ticket spotted in the conversation.
///
/// `kind` keeps the model's free text; the gatekeeper folds it into a
/// work item type when it needs one.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItemCandidate {
    #[serde(rename = "type")]
    pub kind: String,
    pub short_title: String,
    pub reason: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateHint {
    pub possible_duplicate: bool,
    pub matched_work_item_id: Option<String>,
    pub matched_ticket_url: Option<String>,
}

/// Accumulated understanding of one feedback conversation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThreadState {
    pub summary: String,
    pub user_goal: Option<String>,
    pub intent: Intent,
    pub known_environment: Map<String, Value>,
    pub repro_steps: Vec<String>,
    pub expected_behavior: Option<String>,
    pub actual_behavior: Option<String>,
    pub open_questions: Vec<String>,
    pub resolved_questions: Vec<String>,
    pub signals: Map<String, Value>,
    pub work_item_candidates: Vec<WorkItemCandidate>,
    pub recommendation: Recommendation,
    pub duplicate_hint: DuplicateHint,
}

// ── Stage 1: permissive raw shape ────────────────────────────────────────────

/// Whatever the model sent, field by field. Nothing here can fail to
/// deserialize from a JSON object.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawThreadState {
    pub summary: Option<Value>,
    pub user_goal: Option<Value>,
    pub intent: Option<Value>,
    pub known_environment: Option<Value>,
    pub repro_steps: Option<Value>,
    pub expected_behavior: Option<Value>,
    pub actual_behavior: Option<Value>,
    pub open_questions: Option<Value>,
    pub resolved_questions: Option<Value>,
    pub signals: Option<Value>,
    pub work_item_candidates: Option<Value>,
    pub recommendation: Option<Value>,
    pub duplicate_hint: Option<Value>,
}

impl RawThreadState {
    /// Parse stage. Only a non-object top level is rejected.
    pub fn parse(value: Value) -> Result<Self, String> {
        if !value.is_object() {
            return Err(format!(
                "expected a JSON object for thread state, got {}",
                json_kind(&value)
            ));
        }
        serde_json::from_value(value).map_err(|e| format!("thread state shape: {e}"))
    }

    /// Coerce stage. Total: every field lands on a valid value.
    pub fn coerce(self) -> ThreadState {
        ThreadState {
            summary: coerce::string_field(self.summary.as_ref()).unwrap_or_default(),
            user_goal: coerce::string_field(self.user_goal.as_ref()),
            intent: Intent::coerce(self.intent.as_ref()),
            known_environment: coerce::sparse_map(self.known_environment.as_ref()),
            repro_steps: coerce::string_list(self.repro_steps.as_ref()),
            expected_behavior: coerce::string_field(self.expected_behavior.as_ref()),
            actual_behavior: coerce::string_field(self.actual_behavior.as_ref()),
            open_questions: coerce::string_list(self.open_questions.as_ref()),
            resolved_questions: coerce::string_list(self.resolved_questions.as_ref()),
            signals: coerce::sparse_map(self.signals.as_ref()),
            work_item_candidates: coerce_candidates(self.work_item_candidates.as_ref()),
            recommendation: coerce_recommendation(self.recommendation.as_ref()),
            duplicate_hint: coerce_duplicate_hint(self.duplicate_hint.as_ref()),
        }
    }
}

fn coerce_candidates(value: Option<&Value>) -> Vec<WorkItemCandidate> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let short_title = coerce::string_field(obj.get("shortTitle"))
                .or_else(|| coerce::string_field(obj.get("title")))?;
            Some(WorkItemCandidate {
                kind: coerce::string_field(obj.get("type")).unwrap_or_default(),
                short_title,
                reason: coerce::string_field(obj.get("reason")).unwrap_or_default(),
                confidence: coerce::confidence(obj.get("confidence")),
            })
        })
        .collect()
}

fn coerce_recommendation(value: Option<&Value>) -> Recommendation {
    let Some(obj) = value.and_then(Value::as_object) else {
        // A bare action string is still a usable recommendation.
        return Recommendation {
            action: RecommendationAction::coerce(value),
            ..Recommendation::default()
        };
    };
    Recommendation {
        action: RecommendationAction::coerce(obj.get("action")),
        reason: coerce::string_field(obj.get("reason")).unwrap_or_default(),
        confidence: coerce::confidence(obj.get("confidence")),
    }
}

fn coerce_duplicate_hint(value: Option<&Value>) -> DuplicateHint {
    let Some(obj) = value.and_then(Value::as_object) else {
        return DuplicateHint::default();
    };
    DuplicateHint {
        possible_duplicate: coerce::bool_field(obj.get("possibleDuplicate")),
        matched_work_item_id: coerce::string_field(obj.get("matchedWorkItemId")),
        matched_ticket_url: coerce::string_field(obj.get("matchedTicketUrl")),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ── Domain operations ────────────────────────────────────────────────────────

impl ThreadState {
    /// The state of a thread that has not seen any message yet.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether nothing has been learned yet.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Validate an LLM completion into a complete state (parse, then coerce).
    pub fn from_value(value: Value) -> Result<Self, String> {
        RawThreadState::parse(value).map(RawThreadState::coerce)
    }

    /// Read a persisted document, tolerating older or partial shapes.
    pub fn from_document(value: Option<Value>) -> Self {
        value
            .and_then(|v| Self::from_value(v).ok())
            .unwrap_or_default()
    }

    /// Guard a freshly merged state against information loss.
    ///
    /// - an empty summary keeps the previous one
    /// - previous repro steps, environment facts and candidates survive
    /// - a question resolved now or earlier is never listed as open
    /// - lists are de-duplicated
    pub fn reconcile(mut self, previous: &ThreadState) -> ThreadState {
        if self.summary.trim().is_empty() {
            self.summary = previous.summary.clone();
        }
        if self.user_goal.is_none() {
            self.user_goal = previous.user_goal.clone();
        }
        if self.expected_behavior.is_none() {
            self.expected_behavior = previous.expected_behavior.clone();
        }
        if self.actual_behavior.is_none() {
            self.actual_behavior = previous.actual_behavior.clone();
        }
        if self.intent == Intent::Other {
            self.intent = previous.intent;
        }

        for (key, value) in &previous.known_environment {
            self.known_environment
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        for (key, value) in &previous.signals {
            self.signals.entry(key.clone()).or_insert_with(|| value.clone());
        }

        self.repro_steps = union(&previous.repro_steps, self.repro_steps);

        let resolved = union(&previous.resolved_questions, self.resolved_questions);
        let open = union(&previous.open_questions, self.open_questions);
        self.open_questions = open
            .into_iter()
            .filter(|q| !resolved.iter().any(|r| same_text(r, q)))
            .collect();
        self.resolved_questions = resolved;

        for candidate in &previous.work_item_candidates {
            let known = self
                .work_item_candidates
                .iter()
                .any(|c| same_text(&c.short_title, &candidate.short_title));
            if !known {
                self.work_item_candidates.push(candidate.clone());
            }
        }

        if self.duplicate_hint == DuplicateHint::default() {
            self.duplicate_hint = previous.duplicate_hint.clone();
        }

        self
    }

    /// The highest-confidence work item candidate, if any.
    pub fn top_candidate(&self) -> Option<&WorkItemCandidate> {
        self.work_item_candidates
            .iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    }

    /// Serialize for persistence on the thread record.
    pub fn to_document(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Previous items first, then new ones not already present.
fn union(previous: &[String], next: Vec<String>) -> Vec<String> {
    let mut merged: Vec<String> = previous.to_vec();
    for item in next {
        if !merged.iter().any(|m| same_text(m, &item)) {
            merged.push(item);
        }
    }
    merged
}

fn same_text(a: &str, b: &str) -> bool {
    coerce::normalize_token(a) == coerce::normalize_token(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_object_yields_complete_default_state() {
        let state = ThreadState::from_value(json!({})).unwrap();
        assert_eq!(state, ThreadState::empty());

        let doc = state.to_document();
        for key in [
            "summary",
            "intent",
            "knownEnvironment",
            "reproSteps",
            "openQuestions",
            "resolvedQuestions",
            "signals",
            "workItemCandidates",
            "recommendation",
            "duplicateHint",
        ] {
            assert!(doc.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn non_object_is_rejected() {
        assert!(ThreadState::from_value(json!(["a"])).is_err());
        assert!(ThreadState::from_value(json!("summary")).is_err());
    }

    #[test]
    fn wrong_field_types_are_coerced_not_rejected() {
        let state = ThreadState::from_value(json!({
            "summary": "Login crash",
            "intent": "bug",
            "reproSteps": "open login page",
            "openQuestions": {"q": 1},
            "knownEnvironment": ["safari"],
            "recommendation": {"action": "create_bug_work_item", "confidence": "0.9"},
            "workItemCandidates": [{"type": "bug", "shortTitle": "Crash"}, "garbage"],
        }))
        .unwrap();

        assert_eq!(state.intent, Intent::Bug);
        assert_eq!(state.repro_steps, vec!["open login page"]);
        assert!(state.open_questions.is_empty());
        assert!(state.known_environment.is_empty());
        assert_eq!(
            state.recommendation.action,
            RecommendationAction::CreateBugWorkItem
        );
        assert_eq!(state.recommendation.confidence, 0.9);
        assert_eq!(state.work_item_candidates.len(), 1);
    }

    #[test]
    fn invalid_action_falls_back_to_no_ticket() {
        let state = ThreadState::from_value(json!({
            "recommendation": {"action": "EscalateToCEO", "confidence": 1.0}
        }))
        .unwrap();
        assert_eq!(state.recommendation.action, RecommendationAction::NoTicket);
    }

    #[test]
    fn reconcile_keeps_previous_knowledge() {
        let previous = ThreadState::from_value(json!({
            "summary": "Login crashes on Safari",
            "intent": "Bug",
            "knownEnvironment": {"browser": "Safari 17"},
            "reproSteps": ["open login", "enter password"],
            "openQuestions": ["Which macOS version?", "Does it happen in Chrome?"],
        }))
        .unwrap();

        let next = ThreadState::from_value(json!({
            "summary": "",
            "knownEnvironment": {"os": "macOS 14"},
            "reproSteps": ["enter password", "press enter"],
            "resolvedQuestions": ["which macOS version?"],
        }))
        .unwrap();

        let merged = next.reconcile(&previous);
        assert_eq!(merged.summary, "Login crashes on Safari");
        assert_eq!(merged.intent, Intent::Bug);
        assert_eq!(merged.known_environment.len(), 2);
        assert_eq!(
            merged.repro_steps,
            vec!["open login", "enter password", "press enter"]
        );
        assert_eq!(merged.open_questions, vec!["Does it happen in Chrome?"]);
        assert_eq!(merged.resolved_questions, vec!["which macOS version?"]);
    }

    #[test]
    fn top_candidate_picks_highest_confidence() {
        let state = ThreadState::from_value(json!({
            "workItemCandidates": [
                {"type": "Bug", "shortTitle": "Crash", "confidence": 0.5},
                {"type": "Feature", "shortTitle": "Dark mode", "confidence": 0.8},
            ]
        }))
        .unwrap();
        assert_eq!(state.top_candidate().unwrap().short_title, "Dark mode");
        assert!(ThreadState::empty().top_candidate().is_none());
    }

    #[test]
    fn document_round_trip_preserves_state() {
        let state = ThreadState::from_value(json!({
            "summary": "Slow dashboard",
            "intent": "Performance",
            "signals": {"urgency": "high"},
        }))
        .unwrap();
        assert_eq!(ThreadState::from_document(Some(state.to_document())), state);
        assert_eq!(ThreadState::from_document(None), ThreadState::empty());
    }
}
