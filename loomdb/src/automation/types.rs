use crate::error::{LoomError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What kind of occurrence a rule reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    OnCreate,
    OnUpdate,
    OnDelete,
    Scheduled,
    Event,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::OnCreate => "on_create",
            TriggerType::OnUpdate => "on_update",
            TriggerType::OnDelete => "on_delete",
            TriggerType::Scheduled => "scheduled",
            TriggerType::Event => "event",
        }
    }
}

/// The normalized notification raised by record mutations, the scheduler
/// and external callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationEvent {
    pub name: String,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub module_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl AutomationEvent {
    pub fn new(name: impl Into<String>, trigger_type: TriggerType, payload: serde_json::Value) -> Self {
        AutomationEvent {
            name: name.into(),
            trigger_type,
            payload,
            module_id: None,
            correlation_id: None,
        }
    }

    pub fn with_module(mut self, module_id: impl Into<String>) -> Self {
        self.module_id = Some(module_id.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Record the event is about, if any.
    pub fn record_id(&self) -> Option<&str> {
        self.payload.get("record_id").and_then(|v| v.as_str())
    }

    /// Table the event is about: the payload's `table_id`, else the module.
    pub fn table_id(&self) -> Option<&str> {
        self.payload
            .get("table_id")
            .and_then(|v| v.as_str())
            .or(self.module_id.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Exists,
    NotExists,
    Equals,
    NotEquals,
    Contains,
    StartsWith,
    EndsWith,
    GreaterThan,
    LessThan,
}

/// `path operator value`, evaluated against the event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationCondition {
    /// Dot-separated path into the payload.
    pub path: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

impl AutomationCondition {
    pub fn new(path: impl Into<String>, operator: ConditionOperator, value: Option<serde_json::Value>) -> Self {
        AutomationCondition {
            path: path.into(),
            operator,
            value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// params: `tags` (list or string), optional `field`.
    Tag,
    /// params: `field`, and `value` or `value_from` (payload path).
    UpdateField,
    /// params: `table`, `values`, optional `link` relation.
    CreateNote,
    /// params: `message`, and `at` (RFC 3339) or `offset_minutes`.
    ScheduleReminder,
    /// params: `table`, `record_id`, optional `relation`.
    LinkRecords,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationAction {
    pub kind: ActionKind,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl AutomationAction {
    pub fn new(kind: ActionKind) -> Self {
        AutomationAction {
            kind,
            params: BTreeMap::new(),
        }
    }

    pub fn param(mut self, key: &str, value: serde_json::Value) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.str_param(key).ok_or_else(|| {
            LoomError::ActionFailure(format!("{:?} action needs a string '{key}' parameter", self.kind))
        })
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationRule {
    #[serde(default)]
    pub id: String,
    /// Table the rule belongs to; `None` matches events from any module.
    #[serde(default)]
    pub module_id: Option<String>,
    pub name: String,
    pub trigger_type: TriggerType,
    /// Event name, or cron expression for scheduled rules.
    #[serde(default)]
    pub trigger_filter: Option<String>,
    #[serde(default)]
    pub conditions: Vec<AutomationCondition>,
    #[serde(default)]
    pub actions: Vec<AutomationAction>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl AutomationRule {
    pub fn new(name: impl Into<String>, trigger_type: TriggerType) -> Self {
        AutomationRule {
            id: String::new(),
            module_id: None,
            name: name.into(),
            trigger_type,
            trigger_filter: None,
            conditions: Vec::new(),
            actions: Vec::new(),
            enabled: true,
        }
    }

    /// Whether this rule should run for `event`. Conditions are not
    /// considered here.
    pub fn matches(&self, event: &AutomationEvent) -> bool {
        if !self.enabled || self.trigger_type != event.trigger_type {
            return false;
        }
        if let Some(module) = &self.module_id {
            if event.module_id.as_deref() != Some(module.as_str()) {
                return false;
            }
        }
        if self.trigger_type == TriggerType::Scheduled {
            if let Some(rule_id) = event.payload.get("rule_id").and_then(|v| v.as_str()) {
                return rule_id == self.id;
            }
        }
        match self.trigger_filter.as_deref() {
            Some(filter) if !filter.is_empty() => filter == event.name,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Scheduled,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Scheduled => "scheduled",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(ExecutionStatus::Scheduled),
            "running" => Ok(ExecutionStatus::Running),
            "succeeded" => Ok(ExecutionStatus::Succeeded),
            "failed" => Ok(ExecutionStatus::Failed),
            "skipped" => Ok(ExecutionStatus::Skipped),
            other => Err(LoomError::InvalidData(format!("unknown execution status '{other}'"))),
        }
    }

    /// A prior execution in this state absorbs a replay of the same payload.
    pub fn absorbs_replay(&self) -> bool {
        matches!(self, ExecutionStatus::Running | ExecutionStatus::Succeeded)
    }
}

/// One run of a rule against one event payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AutomationExecution {
    pub id: String,
    pub rule_id: String,
    pub trigger_name: String,
    /// Serialized event payload; the idempotency key together with `rule_id`.
    pub payload_key: String,
    pub status: ExecutionStatus,
    pub outcome: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reminder {
    pub id: String,
    pub rule_id: String,
    pub record_id: Option<String>,
    pub message: String,
    pub due_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
