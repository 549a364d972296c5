//! Rules API endpoints.
//!
//! Provides:
//! - GET /api/rules - List rules in priority order
//! - POST /api/rules - Create a rule
//! - GET /api/rules/{id} - Get a rule by ID
//! - PATCH /api/rules/{id} - Partially update a rule
//! - DELETE /api/rules/{id} - Delete a rule
//! - POST /api/rules/reorder - Rewrite rule positions
//! - POST /api/rules/preview - Dry-run a draft condition tree
//! - POST /api/rules/{id}/apply - Start a job applying one rule
//! - POST /api/rules/apply - Start a job applying all enabled rules

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::Value;

use triage_core::rules::{
    ActionType, ConditionGroup, NewRule, RulePatch, RulePosition, parse_condition_group,
};

use super::{ApiError, rule_error_response, service_error_response};
use crate::AppState;

/// Create the rules API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_rules).post(create_rule))
        .route("/reorder", post(reorder_rules))
        .route("/preview", post(preview_rule))
        .route("/apply", post(apply_all_rules))
        .route(
            "/{id}",
            get(get_rule).patch(update_rule).delete(delete_rule),
        )
        .route("/{id}/apply", post(apply_rule))
}

fn parse_conditions(value: &Value) -> Result<ConditionGroup, Response> {
    parse_condition_group(value).map_err(|err| {
        ApiError::bad_request(format!("Invalid conditions: {err}"))
            .into_response_with(StatusCode::BAD_REQUEST)
    })
}

fn parse_action_type(value: &str) -> Result<ActionType, Response> {
    ActionType::from_str(value).ok_or_else(|| {
        ApiError::bad_request(format!("Unknown action type: {value}"))
            .into_response_with(StatusCode::BAD_REQUEST)
    })
}

/// GET /api/rules
///
/// Lower positions first; ties keep creation order.
async fn list_rules(State(state): State<AppState>) -> impl IntoResponse {
    match state.service.rules().list_all().await {
        Ok(rules) => (StatusCode::OK, Json(rules)).into_response(),
        Err(e) => rule_error_response(e, "list rules"),
    }
}

/// GET /api/rules/{id}
async fn get_rule(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.service.rules().get_by_id(&id).await {
        Ok(rule) => (StatusCode::OK, Json(rule)).into_response(),
        Err(e) => rule_error_response(e, "get rule"),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRuleRequest {
    pub name: String,
    pub conditions: Value,
    pub action_type: String,
    pub action_config: Option<Value>,
    pub container_ids: Option<Vec<i64>>,
    /// Defaults to one past the current last rule.
    pub position: Option<i64>,
    pub enabled: Option<bool>,
}

/// POST /api/rules
async fn create_rule(
    State(state): State<AppState>,
    Json(body): Json<CreateRuleRequest>,
) -> impl IntoResponse {
    let conditions = match parse_conditions(&body.conditions) {
        Ok(conditions) => conditions,
        Err(response) => return response,
    };
    let action_type = match parse_action_type(&body.action_type) {
        Ok(action_type) => action_type,
        Err(response) => return response,
    };

    let repo = state.service.rules();
    let position = match body.position {
        Some(position) => position,
        None => match repo.list_all().await {
            Ok(rules) => rules.iter().map(|rule| rule.position).max().map_or(0, |max| max + 1),
            Err(e) => return rule_error_response(e, "create rule"),
        },
    };

    let new_rule = NewRule {
        name: body.name,
        conditions,
        action_type,
        action_config: body
            .action_config
            .unwrap_or(Value::Object(Default::default())),
        container_ids: body.container_ids.unwrap_or_default(),
        position,
        enabled: body.enabled.unwrap_or(true),
    };

    match repo.create(new_rule).await {
        Ok(rule) => (StatusCode::CREATED, Json(rule)).into_response(),
        Err(e) => rule_error_response(e, "create rule"),
    }
}

/// Partial update body. Absent fields keep their stored value.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRuleRequest {
    pub name: Option<String>,
    pub conditions: Option<Value>,
    pub action_type: Option<String>,
    pub action_config: Option<Value>,
    pub container_ids: Option<Vec<i64>>,
    pub position: Option<i64>,
    pub enabled: Option<bool>,
}

/// PATCH /api/rules/{id}
async fn update_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateRuleRequest>,
) -> impl IntoResponse {
    let conditions = match body.conditions.as_ref().map(parse_conditions).transpose() {
        Ok(conditions) => conditions,
        Err(response) => return response,
    };
    let action_type = match body.action_type.as_deref().map(parse_action_type).transpose() {
        Ok(action_type) => action_type,
        Err(response) => return response,
    };

    let patch = RulePatch {
        name: body.name,
        conditions,
        action_type,
        action_config: body.action_config,
        container_ids: body.container_ids,
        position: body.position,
        enabled: body.enabled,
    };

    match state.service.rules().update(&id, patch).await {
        Ok(rule) => (StatusCode::OK, Json(rule)).into_response(),
        Err(e) => rule_error_response(e, "update rule"),
    }
}

/// DELETE /api/rules/{id}
///
/// Jobs already started for the rule keep running against their own snapshot.
async fn delete_rule(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.service.rules().delete(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => rule_error_response(e, "delete rule"),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderRequest {
    pub positions: Vec<RulePosition>,
}

/// POST /api/rules/reorder
///
/// All positions are written in one transaction; an unknown id rejects the whole
/// request. Returns the rules in their new order.
async fn reorder_rules(
    State(state): State<AppState>,
    Json(body): Json<ReorderRequest>,
) -> impl IntoResponse {
    if body.positions.is_empty() {
        return ApiError::bad_request("At least one position is required")
            .into_response_with(StatusCode::BAD_REQUEST);
    }

    let repo = state.service.rules();
    if let Err(e) = repo.reorder(&body.positions).await {
        return rule_error_response(e, "reorder rules");
    }
    match repo.list_all().await {
        Ok(rules) => (StatusCode::OK, Json(rules)).into_response(),
        Err(e) => rule_error_response(e, "list rules"),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewRequest {
    pub conditions: Value,
    #[serde(default)]
    pub container_ids: Vec<i64>,
    pub scan_limit: Option<u32>,
    pub match_limit: Option<u32>,
}

/// POST /api/rules/preview
async fn preview_rule(
    State(state): State<AppState>,
    Json(body): Json<PreviewRequest>,
) -> impl IntoResponse {
    let conditions = match parse_conditions(&body.conditions) {
        Ok(conditions) => conditions,
        Err(response) => return response,
    };

    match state
        .service
        .preview(
            &conditions,
            body.container_ids,
            body.scan_limit,
            body.match_limit,
        )
        .await
    {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e) => service_error_response(e, "preview rule"),
    }
}

/// POST /api/rules/{id}/apply
///
/// Returns 202 with the new job; poll `/api/rule-jobs/{id}` for progress.
async fn apply_rule(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.service.apply_rule(&id).await {
        Ok(started) => (StatusCode::ACCEPTED, Json(started.job)).into_response(),
        Err(e) => service_error_response(e, "start rule application"),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyAllRequest {
    /// Empty or absent covers every container.
    #[serde(default)]
    pub container_ids: Vec<i64>,
}

/// POST /api/rules/apply
async fn apply_all_rules(
    State(state): State<AppState>,
    Json(body): Json<ApplyAllRequest>,
) -> impl IntoResponse {
    match state.service.apply_all(body.container_ids).await {
        Ok(started) => (StatusCode::ACCEPTED, Json(started.job)).into_response(),
        Err(e) => service_error_response(e, "start rule application"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::setup_state;
    use axum::body::to_bytes;
    use serde_json::json;
    use triage_core::rules::Rule;
    use triage_core::{ContainerRepository, JobStatus, MessageRepository, NewMessage, RuleApplicationJob};

    async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let body_bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        serde_json::from_slice(&body_bytes).expect("json body")
    }

    fn create_request(name: &str, position: Option<i64>) -> CreateRuleRequest {
        CreateRuleRequest {
            name: name.into(),
            conditions: json!({
                "operator": "AND",
                "conditions": [{"field": "subject", "matchType": "contains", "value": "invoice"}]
            }),
            action_type: "markRead".into(),
            action_config: None,
            container_ids: None,
            position,
            enabled: None,
        }
    }

    async fn create(state: &AppState, request: CreateRuleRequest) -> Rule {
        let response = create_rule(State(state.clone()), Json(request))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        body_json(response).await
    }

    #[tokio::test]
    async fn list_rules_returns_empty_list() {
        let (state, _dir) = setup_state().await;

        let response = list_rules(State(state)).await.into_response();

        assert_eq!(response.status(), StatusCode::OK);
        let body: Vec<Rule> = body_json(response).await;
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn create_rule_defaults_position_to_end() {
        let (state, _dir) = setup_state().await;

        let first = create(&state, create_request("First", Some(10))).await;
        let second = create(&state, create_request("Second", None)).await;

        assert_eq!(first.position, 10);
        assert_eq!(second.position, 11);
        assert!(second.enabled);
        assert_eq!(second.action_type, ActionType::MarkRead);
    }

    #[tokio::test]
    async fn create_rule_rejects_invalid_regex() {
        let (state, _dir) = setup_state().await;
        let mut request = create_request("Broken", None);
        request.conditions = json!({
            "operator": "AND",
            "conditions": [{"field": "subject", "matchType": "regex", "value": "(unclosed"}]
        });

        let response = create_rule(State(state.clone()), Json(request))
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ApiError = body_json(response).await;
        assert_eq!(body.error, "bad_request");

        let listed: Vec<Rule> = body_json(list_rules(State(state)).await.into_response()).await;
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn create_rule_rejects_missing_container_config() {
        let (state, _dir) = setup_state().await;
        let mut request = create_request("Move", None);
        request.action_type = "moveToContainer".into();
        request.action_config = Some(json!({}));

        let response = create_rule(State(state), Json(request)).await.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_rule_rejects_move_to_missing_container() {
        let (state, _dir) = setup_state().await;
        let mut request = create_request("Move", None);
        request.action_type = "moveToContainer".into();
        request.action_config = Some(json!({"container": 999}));

        let response = create_rule(State(state.clone()), Json(request))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ApiError = body_json(response).await;
        assert!(body.message.contains("999"));

        let listed: Vec<Rule> = body_json(list_rules(State(state)).await.into_response()).await;
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn create_rule_rejects_unknown_action_type() {
        let (state, _dir) = setup_state().await;
        let mut request = create_request("Odd", None);
        request.action_type = "explode".into();

        let response = create_rule(State(state), Json(request)).await.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_rule_not_found() {
        let (state, _dir) = setup_state().await;

        let response = get_rule(State(state), Path("missing".into()))
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: ApiError = body_json(response).await;
        assert_eq!(body.error, "not_found");
    }

    #[tokio::test]
    async fn update_rule_merges_partial_fields() {
        let (state, _dir) = setup_state().await;
        let rule = create(&state, create_request("Invoices", Some(3))).await;

        let response = update_rule(
            State(state.clone()),
            Path(rule.id.clone()),
            Json(UpdateRuleRequest {
                enabled: Some(false),
                ..Default::default()
            }),
        )
        .await
        .into_response();

        assert_eq!(response.status(), StatusCode::OK);
        let updated: Rule = body_json(response).await;
        assert!(!updated.enabled);
        assert_eq!(updated.name, "Invoices");
        assert_eq!(updated.position, 3);
        assert_eq!(updated.conditions, rule.conditions);
    }

    #[tokio::test]
    async fn update_rule_rejects_malformed_membership_list() {
        let (state, _dir) = setup_state().await;
        let rule = create(&state, create_request("Invoices", None)).await;

        let response = update_rule(
            State(state),
            Path(rule.id),
            Json(UpdateRuleRequest {
                conditions: Some(json!({
                    "operator": "OR",
                    "conditions": [{"field": "sender_in_contacts", "matchType": "in_list", "value": "not json"}]
                })),
                ..Default::default()
            }),
        )
        .await
        .into_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_rule_then_missing() {
        let (state, _dir) = setup_state().await;
        let rule = create(&state, create_request("Temp", None)).await;

        let response = delete_rule(State(state.clone()), Path(rule.id.clone()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = delete_rule(State(state), Path(rule.id))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn reorder_returns_rules_in_new_order() {
        let (state, _dir) = setup_state().await;
        let a = create(&state, create_request("A", Some(1))).await;
        let b = create(&state, create_request("B", Some(2))).await;

        let response = reorder_rules(
            State(state),
            Json(ReorderRequest {
                positions: vec![
                    RulePosition {
                        id: a.id.clone(),
                        position: 20,
                    },
                    RulePosition {
                        id: b.id.clone(),
                        position: 10,
                    },
                ],
            }),
        )
        .await
        .into_response();

        assert_eq!(response.status(), StatusCode::OK);
        let rules: Vec<Rule> = body_json(response).await;
        let ids: Vec<String> = rules.into_iter().map(|rule| rule.id).collect();
        assert_eq!(ids, vec![b.id, a.id]);
    }

    #[tokio::test]
    async fn reorder_with_unknown_id_is_not_found() {
        let (state, _dir) = setup_state().await;
        let a = create(&state, create_request("A", Some(1))).await;

        let response = reorder_rules(
            State(state.clone()),
            Json(ReorderRequest {
                positions: vec![
                    RulePosition {
                        id: a.id.clone(),
                        position: 5,
                    },
                    RulePosition {
                        id: "missing".into(),
                        position: 6,
                    },
                ],
            }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let unchanged: Rule = body_json(get_rule(State(state), Path(a.id)).await.into_response()).await;
        assert_eq!(unchanged.position, 1);
    }

    #[tokio::test]
    async fn preview_and_apply_flow() {
        let (state, _dir) = setup_state().await;
        let inbox = ContainerRepository::new(state.db.clone())
            .create("Inbox")
            .await
            .expect("inbox")
            .id;
        let messages = MessageRepository::new(state.db.clone());
        let mut invoice = NewMessage::new(inbox);
        invoice.subject = Some("Invoice 12".into());
        let invoice = messages.insert(invoice).await.expect("invoice").id;
        let mut other = NewMessage::new(inbox);
        other.subject = Some("Hello".into());
        messages.insert(other).await.expect("other");

        let preview = preview_rule(
            State(state.clone()),
            Json(PreviewRequest {
                conditions: create_request("x", None).conditions,
                container_ids: vec![],
                scan_limit: None,
                match_limit: None,
            }),
        )
        .await
        .into_response();
        assert_eq!(preview.status(), StatusCode::OK);
        let preview: Value = body_json(preview).await;
        assert_eq!(preview["scannedCount"], 2);
        assert_eq!(preview["matches"][0]["messageId"], invoice);

        let rule = create(&state, create_request("Invoices", None)).await;
        let response = apply_rule(State(state.clone()), Path(rule.id.clone()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let job: RuleApplicationJob = body_json(response).await;
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.total_count, 2);
        assert_eq!(job.rule_id.as_deref(), Some(rule.id.as_str()));
    }

    #[tokio::test]
    async fn apply_unknown_rule_is_not_found() {
        let (state, _dir) = setup_state().await;

        let response = apply_rule(State(state), Path("missing".into()))
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn apply_all_accepts_and_records_scope() {
        let (state, _dir) = setup_state().await;

        let response = apply_all_rules(
            State(state),
            Json(ApplyAllRequest {
                container_ids: vec![4, 5],
            }),
        )
        .await
        .into_response();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let job: RuleApplicationJob = body_json(response).await;
        assert!(job.rule_id.is_none());
        assert_eq!(job.container_ids, Some(vec![4, 5]));
        assert_eq!(job.total_count, 0);
    }
}
