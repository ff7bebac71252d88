//! Work items: the engineering tickets generated from a conversation.
//!
//! Generation output goes through the same two stages as thread state:
//! [`RawWorkItem`] accepts anything object-shaped, and [`RawWorkItem::coerce`]
//! maps it onto [`WorkItemGenOutput`], whose enumerated fields are always
//! valid. Near-miss output is coerced, never rejected; the only hard
//! requirement is a usable title.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::coerce;
use crate::lifecycle::WorkItemStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WorkItemType {
    Bug,
    #[default]
    Feature,
    Chore,
    Docs,
}

impl WorkItemType {
    const TABLE: &'static [(&'static str, WorkItemType)] = &[
        ("Bug", WorkItemType::Bug),
        ("Defect", WorkItemType::Bug),
        ("Feature", WorkItemType::Feature),
        ("Enhancement", WorkItemType::Feature),
        ("Chore", WorkItemType::Chore),
        ("Task", WorkItemType::Chore),
        ("Docs", WorkItemType::Docs),
        ("Documentation", WorkItemType::Docs),
    ];

    /// Case-insensitive parse without a fallback.
    pub fn parse(value: Option<&Value>) -> Option<Self> {
        coerce::fold_enum(value, Self::TABLE)
    }

    /// Case-insensitive parse; unknown values become `Feature`.
    pub fn coerce(value: Option<&Value>) -> Self {
        Self::parse(value).unwrap_or_default()
    }
}

impl fmt::Display for WorkItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bug => write!(f, "Bug"),
            Self::Feature => write!(f, "Feature"),
            Self::Chore => write!(f, "Chore"),
            Self::Docs => write!(f, "Docs"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    #[default]
    P2,
    P3,
}

impl Priority {
    /// Infer from free text or a number; see [`coerce::priority_level`].
    pub fn coerce(value: Option<&Value>) -> Self {
        match coerce::priority_level(value) {
            0 => Self::P0,
            1 => Self::P1,
            3 => Self::P3,
            _ => Self::P2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::P0 => write!(f, "P0"),
            Self::P1 => write!(f, "P1"),
            Self::P2 => write!(f, "P2"),
            Self::P3 => write!(f, "P3"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
}

impl RiskLevel {
    const TABLE: &'static [(&'static str, RiskLevel)] = &[
        ("Low", RiskLevel::Low),
        ("Medium", RiskLevel::Medium),
        ("Moderate", RiskLevel::Medium),
        ("High", RiskLevel::High),
    ];

    /// Case-insensitive parse; unknown values become `Medium`.
    pub fn coerce(value: Option<&Value>) -> Self {
        coerce::fold_enum(value, Self::TABLE).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TShirtSize {
    XS,
    S,
    #[default]
    M,
    L,
    XL,
}

impl TShirtSize {
    const TABLE: &'static [(&'static str, TShirtSize)] = &[
        ("XS", TShirtSize::XS),
        ("ExtraSmall", TShirtSize::XS),
        ("S", TShirtSize::S),
        ("Small", TShirtSize::S),
        ("M", TShirtSize::M),
        ("Medium", TShirtSize::M),
        ("L", TShirtSize::L),
        ("Large", TShirtSize::L),
        ("XL", TShirtSize::XL),
        ("ExtraLarge", TShirtSize::XL),
    ];

    /// Case-insensitive parse; unknown values become `M`.
    pub fn coerce(value: Option<&Value>) -> Self {
        coerce::fold_enum(value, Self::TABLE).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EstimatedEffort {
    pub t_shirt: TShirtSize,
    pub hours_min: f64,
    pub hours_max: f64,
    pub confidence: f64,
}

impl EstimatedEffort {
    fn coerce(value: Option<&Value>) -> Self {
        let Some(obj) = value.and_then(Value::as_object) else {
            return Self::default();
        };
        let hours = |key: &str| coerce::number_field(obj.get(key)).unwrap_or(0.0).max(0.0);
        let (min, max) = (hours("hoursMin"), hours("hoursMax"));
        Self {
            t_shirt: TShirtSize::coerce(obj.get("tShirt")),
            hours_min: min.min(max),
            hours_max: min.max(max),
            confidence: coerce::confidence(obj.get("confidence")),
        }
    }
}

/// Agent-facing material for whoever picks the item up.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptBundle {
    pub agent_prompt: String,
    pub verification_prompt: String,
    pub suspected_files: Vec<String>,
    pub suspected_tests: Vec<String>,
    pub suggested_commands: Vec<String>,
}

impl PromptBundle {
    fn coerce(value: Option<&Value>) -> Self {
        let Some(obj) = value.and_then(Value::as_object) else {
            return Self::default();
        };
        Self {
            agent_prompt: coerce::string_field(obj.get("agentPrompt")).unwrap_or_default(),
            verification_prompt: coerce::string_field(obj.get("verificationPrompt"))
                .unwrap_or_default(),
            suspected_files: coerce::string_list(obj.get("suspectedFiles")),
            suspected_tests: coerce::string_list(obj.get("suspectedTests")),
            suggested_commands: coerce::string_list(obj.get("suggestedCommands")),
        }
    }
}

/// Validated generator output, before it becomes a persisted [`WorkItem`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItemGenOutput {
    pub title: String,
    #[serde(rename = "type")]
    pub item_type: WorkItemType,
    pub structured_description: String,
    pub acceptance_criteria: Vec<String>,
    pub priority: Priority,
    pub severity: u8,
    pub risk_level: RiskLevel,
    pub estimated_effort: EstimatedEffort,
    pub prompt_bundle: PromptBundle,
    pub labels: Vec<String>,
}

impl WorkItemGenOutput {
    /// Validate an LLM completion (parse, then coerce).
    pub fn from_value(value: Value) -> Result<Self, String> {
        RawWorkItem::parse(value)?.coerce()
    }
}

/// Permissive stage-one shape for generator output.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawWorkItem {
    pub title: Option<Value>,
    pub name: Option<Value>,
    pub summary: Option<Value>,
    #[serde(rename = "type")]
    pub item_type: Option<Value>,
    pub structured_description: Option<Value>,
    pub description: Option<Value>,
    pub acceptance_criteria: Option<Value>,
    pub priority: Option<Value>,
    pub severity: Option<Value>,
    pub risk_level: Option<Value>,
    pub estimated_effort: Option<Value>,
    pub prompt_bundle: Option<Value>,
    pub labels: Option<Value>,
}

impl RawWorkItem {
    pub fn parse(value: Value) -> Result<Self, String> {
        // Some models wrap the ticket: {"workItem": {...}}
        let value = match value {
            Value::Object(mut map) if map.len() == 1 && map.contains_key("workItem") => {
                map.remove("workItem").unwrap_or(Value::Null)
            }
            other => other,
        };
        if !value.is_object() {
            return Err("expected a JSON object for the work item".to_string());
        }
        serde_json::from_value(value).map_err(|e| format!("work item shape: {e}"))
    }

    /// Coerce every field. Fails only when no title can be found.
    pub fn coerce(self) -> Result<WorkItemGenOutput, String> {
        let title = coerce::string_field(self.title.as_ref())
            .or_else(|| coerce::string_field(self.name.as_ref()))
            .or_else(|| coerce::string_field(self.summary.as_ref()))
            .ok_or_else(|| "work item has no title, name or summary".to_string())?;

        Ok(WorkItemGenOutput {
            title,
            item_type: WorkItemType::coerce(self.item_type.as_ref()),
            structured_description: description_text(
                self.structured_description
                    .as_ref()
                    .or(self.description.as_ref()),
            ),
            acceptance_criteria: coerce::string_list(self.acceptance_criteria.as_ref()),
            priority: Priority::coerce(self.priority.as_ref()),
            severity: coerce::severity(self.severity.as_ref()),
            risk_level: RiskLevel::coerce(self.risk_level.as_ref()),
            estimated_effort: EstimatedEffort::coerce(self.estimated_effort.as_ref()),
            prompt_bundle: PromptBundle::coerce(self.prompt_bundle.as_ref()),
            labels: coerce::string_list(self.labels.as_ref()),
        })
    }
}

/// Descriptions sometimes arrive as `{"problem": ..., "impact": ...}`;
/// render those as markdown sections.
fn description_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::Object(map)) => map
            .iter()
            .filter_map(|(key, v)| {
                let body = coerce::string_field(Some(v)).or_else(|| coerce::flatten_item(v))?;
                Some(format!("## {key}\n{body}"))
            })
            .collect::<Vec<_>>()
            .join("\n\n"),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(coerce::flatten_item)
            .collect::<Vec<_>>()
            .join("\n"),
        other => coerce::string_field(other).unwrap_or_default(),
    }
}

/// A persisted work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub id: String,
    pub thread_id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub item_type: WorkItemType,
    pub structured_description: String,
    pub acceptance_criteria: Vec<String>,
    pub priority: Priority,
    pub severity: u8,
    pub risk_level: RiskLevel,
    pub estimated_effort: EstimatedEffort,
    pub prompt_bundle: PromptBundle,
    pub labels: Vec<String>,
    pub status: WorkItemStatus,
    pub confidence_score: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    /// A new item awaiting human approval.
    pub fn from_generated(
        thread_id: impl Into<String>,
        output: WorkItemGenOutput,
        confidence_score: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            thread_id: thread_id.into(),
            title: output.title,
            item_type: output.item_type,
            structured_description: output.structured_description,
            acceptance_criteria: output.acceptance_criteria,
            priority: output.priority,
            severity: output.severity,
            risk_level: output.risk_level,
            estimated_effort: output.estimated_effort,
            prompt_bundle: output.prompt_bundle,
            labels: output.labels,
            status: WorkItemStatus::PendingApproval,
            confidence_score: confidence_score.clamp(0.0, 1.0),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Explicit field edits from the API layer. `None` leaves a field alone.
///
/// Enumerated fields take raw JSON values and go through the same coercion
/// as generator output, so an edit can never store an out-of-vocabulary value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkItemUpdate {
    pub title: Option<String>,
    #[serde(rename = "type")]
    pub item_type: Option<Value>,
    pub structured_description: Option<String>,
    pub acceptance_criteria: Option<Value>,
    pub priority: Option<Value>,
    pub severity: Option<Value>,
    pub risk_level: Option<Value>,
    pub estimated_effort: Option<Value>,
    pub labels: Option<Value>,
}

impl WorkItemUpdate {
    /// Apply the edit in place and return the names of fields that changed.
    pub fn apply(&self, item: &mut WorkItem) -> Vec<&'static str> {
        let mut changed = Vec::new();

        if let Some(title) = self.title.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            if item.title != title {
                item.title = title.to_string();
                changed.push("title");
            }
        }
        if let Some(kind) = WorkItemType::parse(self.item_type.as_ref()) {
            if item.item_type != kind {
                item.item_type = kind;
                changed.push("type");
            }
        }
        if let Some(description) = &self.structured_description {
            if &item.structured_description != description {
                item.structured_description = description.clone();
                changed.push("structuredDescription");
            }
        }
        if self.acceptance_criteria.is_some() {
            let criteria = coerce::string_list(self.acceptance_criteria.as_ref());
            if item.acceptance_criteria != criteria {
                item.acceptance_criteria = criteria;
                changed.push("acceptanceCriteria");
            }
        }
        if self.priority.is_some() {
            let priority = Priority::coerce(self.priority.as_ref());
            if item.priority != priority {
                item.priority = priority;
                changed.push("priority");
            }
        }
        if self.severity.is_some() {
            let severity = coerce::severity(self.severity.as_ref());
            if item.severity != severity {
                item.severity = severity;
                changed.push("severity");
            }
        }
        if self.risk_level.is_some() {
            let risk = RiskLevel::coerce(self.risk_level.as_ref());
            if item.risk_level != risk {
                item.risk_level = risk;
                changed.push("riskLevel");
            }
        }
        if self.estimated_effort.is_some() {
            let effort = EstimatedEffort::coerce(self.estimated_effort.as_ref());
            if item.estimated_effort != effort {
                item.estimated_effort = effort;
                changed.push("estimatedEffort");
            }
        }
        if self.labels.is_some() {
            let labels = coerce::string_list(self.labels.as_ref());
            if item.labels != labels {
                item.labels = labels;
                changed.push("labels");
            }
        }

        if !changed.is_empty() {
            item.updated_at = Utc::now();
        }
        changed
    }
}
