use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::conditions::ConditionGroup;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionType {
    MoveToContainer,
    MarkRead,
    Star,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::MoveToContainer => "moveToContainer",
            ActionType::MarkRead => "markRead",
            ActionType::Star => "star",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "moveToContainer" => Some(Self::MoveToContainer),
            "markRead" => Some(Self::MarkRead),
            "star" => Some(Self::Star),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub conditions: ConditionGroup,
    pub action_type: ActionType,
    pub action_config: Value,
    /// Containers this rule is scoped to. Empty means every container.
    pub container_ids: Vec<i64>,
    /// Lower runs first. Not required to be unique or contiguous.
    pub position: i64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    pub fn applies_to_container(&self, container_id: i64) -> bool {
        self.container_ids.is_empty() || self.container_ids.contains(&container_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewRule {
    pub name: String,
    pub conditions: ConditionGroup,
    pub action_type: ActionType,
    pub action_config: Value,
    pub container_ids: Vec<i64>,
    pub position: i64,
    pub enabled: bool,
}

/// Partial update. `None` leaves the stored value unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RulePatch {
    pub name: Option<String>,
    pub conditions: Option<ConditionGroup>,
    pub action_type: Option<ActionType>,
    pub action_config: Option<Value>,
    pub container_ids: Option<Vec<i64>>,
    pub position: Option<i64>,
    pub enabled: Option<bool>,
}

impl RulePatch {
    pub fn is_empty(&self) -> bool {
        *self == RulePatch::default()
    }

    pub(crate) fn apply_to(self, rule: &mut Rule) {
        if let Some(name) = self.name {
            rule.name = name;
        }
        if let Some(conditions) = self.conditions {
            rule.conditions = conditions;
        }
        if let Some(action_type) = self.action_type {
            rule.action_type = action_type;
        }
        if let Some(action_config) = self.action_config {
            rule.action_config = action_config;
        }
        if let Some(container_ids) = self.container_ids {
            rule.container_ids = container_ids;
        }
        if let Some(position) = self.position {
            rule.position = position;
        }
        if let Some(enabled) = self.enabled {
            rule.enabled = enabled;
        }
    }
}

/// One entry of a reorder request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulePosition {
    pub id: String,
    pub position: i64,
}

/// The winning rule for one message, carrying what the action applier needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleMatch {
    pub rule_id: String,
    pub rule_name: String,
    pub action_type: ActionType,
    pub action_config: Value,
}

impl From<&Rule> for RuleMatch {
    fn from(rule: &Rule) -> Self {
        Self {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            action_type: rule.action_type,
            action_config: rule.action_config.clone(),
        }
    }
}
