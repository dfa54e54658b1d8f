use axum::{
    Json, Router,
    extract::{Query, State, rejection::JsonRejection},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post, put},
};
use serde::Serialize;
use serde_json::{Value, json};

use brms_core::{MatchOutcome, NewRule, NewRuleSet, rules::InputRecord};

use super::{ApiError, RuleSetQuery, encode_query_value};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/insertRuleTemplate", post(create_rule_set))
        .route("/insertRuletoRuleSet", patch(append_rules))
        .route("/updateRuleSet", put(update_rule_set))
        .route("/execInput", post(exec_input))
        .route("/fetchRules", get(list_rule_sets))
        .route("/fetchRuleSet", get(fetch_rule_set))
        .route("/deleteRuleSet", delete(delete_rule_set))
}

/// POST /insertRuleTemplate
async fn create_rule_set(
    State(state): State<AppState>,
    payload: Result<Json<NewRuleSet>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(new_rule_set) = payload?;
    let rule_set = state.rule_sets.create(new_rule_set).await?;

    let location = format!(
        "/fetchRuleSet?ruleSetName={}",
        encode_query_value(&rule_set.name)
    );
    let mut response = (
        StatusCode::CREATED,
        Json(json!({
            "message": "new rule set inserted",
            "id": rule_set.id,
        })),
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(header::LOCATION, value);
    }
    Ok(response)
}

/// PATCH /insertRuletoRuleSet?ruleSetName=
///
/// Body is a JSON array of rules. Ids in the body are ignored and the stored
/// ids are echoed back.
async fn append_rules(
    State(state): State<AppState>,
    Query(query): Query<RuleSetQuery>,
    payload: Result<Json<Vec<NewRule>>, JsonRejection>,
) -> Result<Response, ApiError> {
    let name = query.require()?;
    let Json(new_rules) = payload?;

    let appended = state.rule_sets.append_rules(&name, new_rules).await?;
    let rule_ids: Vec<i64> = appended.iter().map(|rule| rule.id).collect();
    Ok(Json(json!({
        "message": format!("{} new rules have been inserted into '{name}'", rule_ids.len()),
        "rule_ids": rule_ids,
    }))
    .into_response())
}

/// PUT /updateRuleSet?ruleSetName=
async fn update_rule_set(
    State(state): State<AppState>,
    Query(query): Query<RuleSetQuery>,
    payload: Result<Json<NewRuleSet>, JsonRejection>,
) -> Result<Response, ApiError> {
    let name = query.require()?;
    let Json(replacement) = payload?;

    let rule_set = state.rule_sets.replace(&name, replacement).await?;
    Ok(Json(json!({
        "message": format!("rule set '{name}' has been updated"),
        "rules": rule_set.rules.len(),
    }))
    .into_response())
}

#[derive(Debug, Serialize)]
struct ExecResponse {
    message: String,
    matched: bool,
    rule_id: Option<i64>,
    action: Option<Value>,
}

/// POST /execInput?ruleSetName=
///
/// A rule that matched with a null action still reports `matched: true`.
async fn exec_input(
    State(state): State<AppState>,
    Query(query): Query<RuleSetQuery>,
    payload: Result<Json<InputRecord>, JsonRejection>,
) -> Result<Response, ApiError> {
    let name = query.require()?;
    let Json(input) = payload?;

    let outcome = state.executor.execute(&name, &input).await?;
    let body = match outcome {
        MatchOutcome::Matched {
            rule_id, action, ..
        } => ExecResponse {
            message: format!("executed rule set '{name}'"),
            matched: true,
            rule_id: Some(rule_id),
            action: Some(action),
        },
        MatchOutcome::NoMatch => ExecResponse {
            message: format!("no rule in '{name}' matched the input"),
            matched: false,
            rule_id: None,
            action: None,
        },
    };
    Ok(Json(body).into_response())
}

/// GET /fetchRules
async fn list_rule_sets(State(state): State<AppState>) -> Result<Response, ApiError> {
    let rule_sets = state.rule_sets.list_all().await?;

    let body = if rule_sets.is_empty() {
        json!({ "message": "rule set list empty" })
    } else {
        json!({
            "message": "listing all rule sets",
            "details": rule_sets,
        })
    };
    Ok(([(header::CACHE_CONTROL, "no-cache")], Json(body)).into_response())
}

/// GET /fetchRuleSet?ruleSetName=
async fn fetch_rule_set(
    State(state): State<AppState>,
    Query(query): Query<RuleSetQuery>,
) -> Result<Response, ApiError> {
    let name = query.require()?;
    let rule_set = state.rule_sets.get_by_name(&name).await?;
    Ok(Json(rule_set).into_response())
}

/// DELETE /deleteRuleSet?ruleSetName=
async fn delete_rule_set(
    State(state): State<AppState>,
    Query(query): Query<RuleSetQuery>,
) -> Result<Response, ApiError> {
    let name = query.require()?;
    state.rule_sets.delete(&name).await?;
    Ok(Json(json!({
        "message": format!("rule set '{name}' has been deleted"),
    }))
    .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use brms_core::{Database, MatchMode, RuleSet, migrations::run_migrations};
    use tempfile::TempDir;

    async fn setup_state() -> (AppState, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let db = Database::new(&dir.path().join("test.sqlite"))
            .await
            .expect("create db");
        run_migrations(&db).await.expect("migrations");
        (AppState::new(db, MatchMode::Compatible), dir)
    }

    fn age_gate() -> NewRuleSet {
        serde_json::from_value(json!({
            "name": "age-gate",
            "endpoint": "/age-gate",
            "description": {"condition": "age checks", "action": "tier"},
            "bodies": [{"name": "age", "type": "int"}],
            "conditions": [{"label": "adult", "attribute": "age", "operator": ">="}],
            "action": {"label": "tier", "attribute": "tier", "type": "string"},
            "rules": [
                {"conditions": {"adult": 18}, "action": "full"},
                {"conditions": {}, "action": "restricted"}
            ]
        }))
        .expect("rule set payload")
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn create_sets_location_and_rejects_duplicates() {
        let (state, _dir) = setup_state().await;

        let response = create_rule_set(State(state.clone()), Ok(Json(age_gate())))
            .await
            .expect("created");
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers()[header::LOCATION],
            "/fetchRuleSet?ruleSetName=age-gate"
        );
        assert_eq!(body_json(response).await["message"], "new rule set inserted");

        let err = create_rule_set(State(state), Ok(Json(age_gate())))
            .await
            .expect_err("duplicate");
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn location_header_encodes_the_rule_set_name() {
        let (state, _dir) = setup_state().await;
        let mut payload = age_gate();
        payload.name = "age gate & tier".into();

        let response = create_rule_set(State(state), Ok(Json(payload)))
            .await
            .expect("created");
        assert_eq!(
            response.headers()[header::LOCATION],
            "/fetchRuleSet?ruleSetName=age+gate+%26+tier"
        );
    }

    #[tokio::test]
    async fn create_without_name_is_bad_request() {
        let (state, _dir) = setup_state().await;
        let mut payload = age_gate();
        payload.name = String::new();

        let err = create_rule_set(State(state), Ok(Json(payload)))
            .await
            .expect_err("validation");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn exec_reports_matched_rule_and_fallback() {
        let (state, _dir) = setup_state().await;
        create_rule_set(State(state.clone()), Ok(Json(age_gate())))
            .await
            .expect("created");

        let input: InputRecord = serde_json::from_value(json!({"age": 30})).unwrap();
        let response = exec_input(
            State(state.clone()),
            Query(RuleSetQuery::named("age-gate")),
            Ok(Json(input)),
        )
        .await
        .expect("executed");
        let body = body_json(response).await;
        assert_eq!(body["matched"], true);
        assert_eq!(body["rule_id"], 1);
        assert_eq!(body["action"], "full");

        let input: InputRecord = serde_json::from_value(json!({"age": 12})).unwrap();
        let response = exec_input(
            State(state),
            Query(RuleSetQuery::named("age-gate")),
            Ok(Json(input)),
        )
        .await
        .expect("executed");
        let body = body_json(response).await;
        assert_eq!(body["rule_id"], 2);
        assert_eq!(body["action"], "restricted");
    }

    #[tokio::test]
    async fn exec_without_any_matching_rule_is_not_a_match() {
        let (state, _dir) = setup_state().await;
        let mut payload = age_gate();
        payload.rules.truncate(1);
        create_rule_set(State(state.clone()), Ok(Json(payload)))
            .await
            .expect("created");

        let input: InputRecord = serde_json::from_value(json!({"age": 3})).unwrap();
        let response = exec_input(
            State(state),
            Query(RuleSetQuery::named("age-gate")),
            Ok(Json(input)),
        )
        .await
        .expect("executed");
        let body = body_json(response).await;
        assert_eq!(body["matched"], false);
        assert!(body["rule_id"].is_null());
        assert!(body["action"].is_null());
    }

    #[tokio::test]
    async fn exec_with_incomparable_input_is_unprocessable() {
        let (state, _dir) = setup_state().await;
        create_rule_set(State(state.clone()), Ok(Json(age_gate())))
            .await
            .expect("created");

        let input: InputRecord = serde_json::from_value(json!({"age": [1, 2]})).unwrap();
        let err = exec_input(
            State(state),
            Query(RuleSetQuery::named("age-gate")),
            Ok(Json(input)),
        )
        .await
        .expect_err("evaluation error");
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn exec_unknown_rule_set_is_not_found() {
        let (state, _dir) = setup_state().await;

        let err = exec_input(
            State(state),
            Query(RuleSetQuery::named("missing")),
            Ok(Json(InputRecord::new())),
        )
        .await
        .expect_err("not found");
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn append_returns_new_ids_and_requires_existing_set() {
        let (state, _dir) = setup_state().await;
        create_rule_set(State(state.clone()), Ok(Json(age_gate())))
            .await
            .expect("created");

        let batch = vec![
            NewRule::new(Default::default(), "a"),
            NewRule::new(Default::default(), "b"),
        ];
        let response = append_rules(
            State(state.clone()),
            Query(RuleSetQuery::named("age-gate")),
            Ok(Json(batch.clone())),
        )
        .await
        .expect("appended");
        let body = body_json(response).await;
        assert_eq!(body["rule_ids"], json!([3, 4]));

        let err = append_rules(
            State(state.clone()),
            Query(RuleSetQuery::named("missing")),
            Ok(Json(batch)),
        )
        .await
        .expect_err("missing rule set");
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let err = append_rules(State(state), Query(RuleSetQuery::default()), Ok(Json(vec![])))
            .await
            .expect_err("missing query");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn update_replaces_rules_and_refuses_rename() {
        let (state, _dir) = setup_state().await;
        create_rule_set(State(state.clone()), Ok(Json(age_gate())))
            .await
            .expect("created");

        let mut replacement = age_gate();
        replacement.rules.truncate(1);
        let response = update_rule_set(
            State(state.clone()),
            Query(RuleSetQuery::named("age-gate")),
            Ok(Json(replacement)),
        )
        .await
        .expect("updated");
        assert_eq!(body_json(response).await["rules"], 1);

        let mut renamed = age_gate();
        renamed.name = "other".into();
        let err = update_rule_set(
            State(state.clone()),
            Query(RuleSetQuery::named("age-gate")),
            Ok(Json(renamed)),
        )
        .await
        .expect_err("rename");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err = update_rule_set(
            State(state),
            Query(RuleSetQuery::named("other")),
            Ok(Json(age_gate())),
        )
        .await
        .expect_err("mismatched name");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn list_fetch_and_delete() {
        let (state, _dir) = setup_state().await;

        let response = list_rule_sets(State(state.clone())).await.expect("listed");
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(body_json(response).await["message"], "rule set list empty");

        create_rule_set(State(state.clone()), Ok(Json(age_gate())))
            .await
            .expect("created");

        let response = list_rule_sets(State(state.clone())).await.expect("listed");
        let body = body_json(response).await;
        assert_eq!(body["details"].as_array().map(Vec::len), Some(1));

        let response = fetch_rule_set(State(state.clone()), Query(RuleSetQuery::named("age-gate")))
            .await
            .expect("fetched");
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        let rule_set: RuleSet = serde_json::from_slice(&bytes).expect("rule set");
        assert_eq!(rule_set.rules.len(), 2);

        delete_rule_set(State(state.clone()), Query(RuleSetQuery::named("age-gate")))
            .await
            .expect("deleted");
        let err = delete_rule_set(State(state), Query(RuleSetQuery::named("age-gate")))
            .await
            .expect_err("already deleted");
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
