use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Row, params};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError};

use super::actions::RuleAction;
use super::types::{ActionType, NewRule, Rule, RulePatch, RulePosition};
use super::validation::{RuleValidationError, validate_new_rule, validate_rule};

const RULE_COLUMNS: &str = "id, name, conditions_json, action_type, action_config_json, container_ids_json, position, enabled, created_at, updated_at";

/// Priority order with declaration order (creation time, then insertion) breaking ties.
const RULE_ORDER: &str = "ORDER BY position ASC, created_at ASC, rowid ASC";

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("rule not found: {0}")]
    NotFound(String),
    #[error("invalid action_type value {0}")]
    InvalidActionType(String),
    #[error("invalid rule: {0}")]
    Validation(#[from] RuleValidationError),
}

#[derive(Clone)]
pub struct RuleRepository {
    db: Database,
}

impl RuleRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, new_rule: NewRule) -> Result<Rule, RuleError> {
        validate_new_rule(&new_rule)?;

        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let conditions_json = serde_json::to_string(&new_rule.conditions)?;
        let action_config_json = serde_json::to_string(&new_rule.action_config)?;
        let container_ids_json = serde_json::to_string(&new_rule.container_ids)?;
        let conn = self.db.connection().await?;
        ensure_move_target_exists(&conn, new_rule.action_type, &new_rule.action_config).await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO rules (
                        id, name, conditions_json, action_type, action_config_json, container_ids_json, position, enabled, created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                    RETURNING {RULE_COLUMNS}"
                ),
                params![
                    id,
                    new_rule.name,
                    conditions_json,
                    new_rule.action_type.as_str(),
                    action_config_json,
                    container_ids_json,
                    new_rule.position,
                    new_rule.enabled as i64,
                    now
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_rule(row),
            None => Err(RuleError::NotFound("insert failed".into())),
        }
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Rule, RuleError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {RULE_COLUMNS} FROM rules WHERE id = ?1"),
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_rule(row),
            None => Err(RuleError::NotFound(id.to_string())),
        }
    }

    /// Every rule, enabled or not, in priority order.
    pub async fn list_all(&self) -> Result<Vec<Rule>, RuleError> {
        self.list_where("1 = 1").await
    }

    pub async fn list_enabled(&self) -> Result<Vec<Rule>, RuleError> {
        self.list_where("enabled = 1").await
    }

    async fn list_where(&self, filter: &str) -> Result<Vec<Rule>, RuleError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {RULE_COLUMNS} FROM rules WHERE {filter} {RULE_ORDER}"),
                (),
            )
            .await?;

        let mut rules = Vec::new();
        while let Some(row) = rows.next().await? {
            rules.push(row_to_rule(row)?);
        }
        Ok(rules)
    }

    /// Apply a partial patch. The merged rule is validated before it is written.
    pub async fn update(&self, id: &str, patch: RulePatch) -> Result<Rule, RuleError> {
        let conn = self.db.connection().await?;
        let tx = conn.transaction().await?;

        let mut rule = {
            let mut rows = tx
                .query(
                    &format!("SELECT {RULE_COLUMNS} FROM rules WHERE id = ?1"),
                    params![id],
                )
                .await?;
            match rows.next().await? {
                Some(row) => row_to_rule(row)?,
                None => return Err(RuleError::NotFound(id.to_string())),
            }
        };

        if patch.is_empty() {
            return Ok(rule);
        }

        patch.apply_to(&mut rule);
        validate_rule(&rule)?;
        ensure_move_target_exists(&tx, rule.action_type, &rule.action_config).await?;

        let now = now_rfc3339();
        let conditions_json = serde_json::to_string(&rule.conditions)?;
        let action_config_json = serde_json::to_string(&rule.action_config)?;
        let container_ids_json = serde_json::to_string(&rule.container_ids)?;
        let updated = {
            let mut rows = tx
                .query(
                    &format!(
                        "UPDATE rules
                         SET name = ?2,
                             conditions_json = ?3,
                             action_type = ?4,
                             action_config_json = ?5,
                             container_ids_json = ?6,
                             position = ?7,
                             enabled = ?8,
                             updated_at = ?9
                         WHERE id = ?1
                         RETURNING {RULE_COLUMNS}"
                    ),
                    params![
                        id,
                        rule.name,
                        conditions_json,
                        rule.action_type.as_str(),
                        action_config_json,
                        container_ids_json,
                        rule.position,
                        rule.enabled as i64,
                        now
                    ],
                )
                .await?;
            match rows.next().await? {
                Some(row) => row_to_rule(row)?,
                None => return Err(RuleError::NotFound(id.to_string())),
            }
        };

        tx.commit().await?;
        Ok(updated)
    }

    pub async fn delete(&self, id: &str) -> Result<(), RuleError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query("DELETE FROM rules WHERE id = ?1 RETURNING id", params![id])
            .await?;

        match rows.next().await? {
            Some(_) => Ok(()),
            None => Err(RuleError::NotFound(id.to_string())),
        }
    }

    /// Rewrite positions for the listed rules atomically. Positions are stored as
    /// given; gaps and duplicates are allowed. An unknown id aborts the whole batch.
    pub async fn reorder(&self, positions: &[RulePosition]) -> Result<(), RuleError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let tx = conn.transaction().await?;

        for entry in positions {
            let mut rows = tx
                .query(
                    "UPDATE rules SET position = ?2, updated_at = ?3 WHERE id = ?1 RETURNING id",
                    params![entry.id.clone(), entry.position, now.clone()],
                )
                .await?;
            if rows.next().await?.is_none() {
                return Err(RuleError::NotFound(entry.id.clone()));
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

/// A move rule must point at a container that exists when it is written.
async fn ensure_move_target_exists(
    conn: &Connection,
    action_type: ActionType,
    action_config: &Value,
) -> Result<(), RuleError> {
    let Ok(RuleAction::MoveToContainer { container_id }) =
        RuleAction::from_parts(action_type, action_config)
    else {
        return Ok(());
    };

    let mut rows = conn
        .query(
            "SELECT 1 FROM containers WHERE id = ?1",
            params![container_id],
        )
        .await?;
    match rows.next().await? {
        Some(_) => Ok(()),
        None => Err(RuleValidationError::UnknownContainer(container_id).into()),
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn row_to_rule(row: Row) -> Result<Rule, RuleError> {
    let conditions_json: String = row.get(2)?;
    let action_type: String = row.get(3)?;
    let action_config_json: String = row.get(4)?;
    let container_ids_json: String = row.get(5)?;
    let enabled: i64 = row.get(7)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;

    let action_type = ActionType::from_str(&action_type)
        .ok_or_else(|| RuleError::InvalidActionType(action_type.clone()))?;

    Ok(Rule {
        id: row.get(0)?,
        name: row.get(1)?,
        conditions: serde_json::from_str(&conditions_json)?,
        action_type,
        action_config: serde_json::from_str(&action_config_json)?,
        container_ids: serde_json::from_str(&container_ids_json)?,
        position: row.get(6)?,
        enabled: enabled != 0,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
    })
}
