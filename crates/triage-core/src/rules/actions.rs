use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::jobs::scope::{ItemRef, RuleTargetStore, StoreError};

use super::types::{ActionType, RuleMatch};

/// Side effect of a matched rule, decoded from its action type and config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RuleAction {
    #[serde(rename_all = "camelCase")]
    MoveToContainer { container_id: i64 },
    MarkRead,
    Star,
}

#[derive(Debug, Error, PartialEq)]
pub enum ActionConfigError {
    #[error("action config must be a JSON object")]
    NotAnObject,
    #[error("moveToContainer requires an integer \"container\"")]
    MissingContainer,
}

impl RuleAction {
    pub fn from_parts(action_type: ActionType, config: &Value) -> Result<Self, ActionConfigError> {
        let config = match config {
            Value::Null => None,
            Value::Object(map) => Some(map),
            _ => return Err(ActionConfigError::NotAnObject),
        };

        match action_type {
            ActionType::MoveToContainer => config
                .and_then(|map| map.get("container"))
                .and_then(Value::as_i64)
                .map(|container_id| RuleAction::MoveToContainer { container_id })
                .ok_or(ActionConfigError::MissingContainer),
            ActionType::MarkRead => Ok(RuleAction::MarkRead),
            ActionType::Star => Ok(RuleAction::Star),
        }
    }
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("rule {rule_id} has an unusable action: {source}")]
    InvalidConfig {
        rule_id: String,
        source: ActionConfigError,
    },
    #[error("action failed: {0}")]
    Store(#[from] StoreError),
}

/// Apply the winning rule's action to one item. Errors affect only this item.
pub async fn apply_match(
    store: &dyn RuleTargetStore,
    item: &ItemRef,
    rule_match: &RuleMatch,
) -> Result<RuleAction, ActionError> {
    let action = RuleAction::from_parts(rule_match.action_type, &rule_match.action_config)
        .map_err(|source| ActionError::InvalidConfig {
            rule_id: rule_match.rule_id.clone(),
            source,
        })?;
    store.apply_action(item, &action).await?;
    Ok(action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::InMemoryStore;
    use serde_json::json;

    fn rule_match(action_type: ActionType, action_config: Value) -> RuleMatch {
        RuleMatch {
            rule_id: "rule-1".into(),
            rule_name: "Receipts".into(),
            action_type,
            action_config,
        }
    }

    #[test]
    fn move_requires_integer_container() {
        assert_eq!(
            RuleAction::from_parts(ActionType::MoveToContainer, &json!({"container": 7})),
            Ok(RuleAction::MoveToContainer { container_id: 7 })
        );
        assert_eq!(
            RuleAction::from_parts(ActionType::MoveToContainer, &json!({})),
            Err(ActionConfigError::MissingContainer)
        );
        assert_eq!(
            RuleAction::from_parts(ActionType::MoveToContainer, &json!({"container": "7"})),
            Err(ActionConfigError::MissingContainer)
        );
        assert_eq!(
            RuleAction::from_parts(ActionType::MoveToContainer, &Value::Null),
            Err(ActionConfigError::MissingContainer)
        );
    }

    #[test]
    fn flag_actions_ignore_config() {
        assert_eq!(
            RuleAction::from_parts(ActionType::MarkRead, &Value::Null),
            Ok(RuleAction::MarkRead)
        );
        assert_eq!(
            RuleAction::from_parts(ActionType::Star, &json!({"extra": true})),
            Ok(RuleAction::Star)
        );
        assert_eq!(
            RuleAction::from_parts(ActionType::Star, &json!([1])),
            Err(ActionConfigError::NotAnObject)
        );
    }

    #[tokio::test]
    async fn apply_match_is_idempotent() {
        let store = InMemoryStore::with_messages(1, 1);
        let item = store.item(1);
        let matched = rule_match(ActionType::MoveToContainer, json!({"container": 2}));

        apply_match(&store, &item, &matched).await.expect("first apply");
        let after_first = store.snapshot();
        apply_match(&store, &item, &matched).await.expect("second apply");

        assert_eq!(store.snapshot(), after_first);
        assert_eq!(store.container_of(1), Some(2));
    }

    #[tokio::test]
    async fn invalid_config_is_reported_without_touching_store() {
        let store = InMemoryStore::with_messages(1, 1);
        let item = store.item(1);
        let matched = rule_match(ActionType::MoveToContainer, json!({}));

        let err = apply_match(&store, &item, &matched)
            .await
            .expect_err("config should be rejected");
        assert!(matches!(err, ActionError::InvalidConfig { .. }));
        assert_eq!(store.container_of(1), Some(1));
    }
}
