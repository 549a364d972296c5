use serde_json::Value;
use thiserror::Error;

use super::actions::{ActionConfigError, RuleAction};
use super::conditions::{ConditionError, ConditionGroup, validate_group};
use super::types::{ActionType, NewRule, Rule};

#[derive(Debug, Error)]
pub enum RuleValidationError {
    #[error("name is required")]
    EmptyName,
    #[error("invalid conditions: {0}")]
    Conditions(#[from] ConditionError),
    #[error("invalid action config: {0}")]
    Action(#[from] ActionConfigError),
    #[error("container {0} does not exist")]
    UnknownContainer(i64),
}

pub fn validate_new_rule(rule: &NewRule) -> Result<(), RuleValidationError> {
    validate_parts(
        &rule.name,
        &rule.conditions,
        rule.action_type,
        &rule.action_config,
    )
}

pub fn validate_rule(rule: &Rule) -> Result<(), RuleValidationError> {
    validate_parts(
        &rule.name,
        &rule.conditions,
        rule.action_type,
        &rule.action_config,
    )
}

fn validate_parts(
    name: &str,
    conditions: &ConditionGroup,
    action_type: ActionType,
    action_config: &Value,
) -> Result<(), RuleValidationError> {
    if name.trim().is_empty() {
        return Err(RuleValidationError::EmptyName);
    }
    validate_group(conditions)?;
    RuleAction::from_parts(action_type, action_config)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::conditions::{Condition, ConditionField, ConditionNode, GroupOperator, MatchType};
    use serde_json::json;

    fn new_rule() -> NewRule {
        NewRule {
            name: "Contacts".into(),
            conditions: ConditionGroup {
                operator: GroupOperator::And,
                conditions: vec![ConditionNode::Leaf(Condition {
                    field: ConditionField::SenderInContacts,
                    match_type: MatchType::InList,
                    value: r#"["a@example.com"]"#.into(),
                    negate: false,
                    header: None,
                })],
            },
            action_type: ActionType::MoveToContainer,
            action_config: json!({"container": 4}),
            container_ids: vec![],
            position: 0,
            enabled: true,
        }
    }

    #[test]
    fn accepts_well_formed_rule() {
        validate_new_rule(&new_rule()).expect("valid rule");
    }

    #[test]
    fn rejects_blank_name() {
        let mut rule = new_rule();
        rule.name = "   ".into();
        assert!(matches!(
            validate_new_rule(&rule),
            Err(RuleValidationError::EmptyName)
        ));
    }

    #[test]
    fn rejects_malformed_membership_list() {
        let mut rule = new_rule();
        if let ConditionNode::Leaf(condition) = &mut rule.conditions.conditions[0] {
            condition.value = "a@example.com".into();
        }
        assert!(matches!(
            validate_new_rule(&rule),
            Err(RuleValidationError::Conditions(ConditionError::MalformedList { .. }))
        ));
    }

    #[test]
    fn rejects_move_without_container() {
        let mut rule = new_rule();
        rule.action_config = json!({"folder": "Receipts"});
        assert!(matches!(
            validate_new_rule(&rule),
            Err(RuleValidationError::Action(ActionConfigError::MissingContainer))
        ));
    }
}
