//! Axum route handlers for the Experiments API.

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    Json,
};
use axum_extra::{extract::CookieJar, headers::UserAgent, TypedHeader};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::{CronCaller, Operator};
use crate::errors::AppError;
use crate::experiments::assignment::assign;
use crate::experiments::conversion::{record_conversion, ConversionOutcome};
use crate::experiments::lifecycle::{delete_experiment, transition_status};
use crate::experiments::models::{
    AudienceContext, CreateExperimentRequest, ExperimentDetail, StatusUpdateRequest,
};
use crate::experiments::reporting::{build_results_report, ResultsReport};
use crate::experiments::validation::validate_new_experiment;
use crate::models::experiment::{Experiment, ExperimentStatus};
use crate::state::AppState;

// ────────────────────────────────────────────────────────────────────────────
// Request / Response types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<ExperimentStatus>,
}

#[derive(Debug, Serialize)]
pub struct AssignedVariant {
    pub id: Uuid,
    pub key: String,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct AssignResponse {
    pub experiment_key: String,
    /// None: the visitor gets the default experience.
    pub variant: Option<AssignedVariant>,
    /// True only on the request that created the assignment.
    pub newly_assigned: bool,
    pub assigned_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct ConvertResponse {
    pub experiment_key: String,
    pub outcome: ConversionOutcome,
}

#[derive(Debug, Serialize)]
pub struct CronRefreshResponse {
    pub refreshed: bool,
    pub refreshed_at: DateTime<Utc>,
}

fn visitor_id(jar: &CookieJar, cookie_name: &str) -> Result<String, AppError> {
    jar.get(cookie_name)
        .map(|c| c.value().trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::bad_request(format!("Missing visitor cookie '{cookie_name}'")))
}

/// An absent or blank body means no audience context. Anything else must parse.
fn audience_context(body: &[u8]) -> Result<AudienceContext, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(AudienceContext::default());
    }
    serde_json::from_slice(body).map_err(|e| AppError::invalid_field("body", e.to_string()))
}

// ────────────────────────────────────────────────────────────────────────────
// Operator handlers
// ────────────────────────────────────────────────────────────────────────────

/// GET /api/v1/experiments
pub async fn handle_list_experiments(
    State(state): State<AppState>,
    _operator: Operator,
    Query(params): Query<ListQuery>,
) -> Result<Json<Vec<Experiment>>, AppError> {
    Ok(Json(state.store.list_experiments(params.status).await?))
}

/// POST /api/v1/experiments
///
/// Creates a draft experiment. Variants are stored in request order.
pub async fn handle_create_experiment(
    State(state): State<AppState>,
    operator: Operator,
    payload: Result<Json<CreateExperimentRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ExperimentDetail>), AppError> {
    operator.require_admin()?;
    let Json(request) = payload?;

    let new = validate_new_experiment(request)?;
    let detail = state.store.create_experiment(new).await?;

    crate::activity::record_best_effort(
        state.store.clone(),
        Some(detail.experiment.id),
        "created",
        serde_json::json!({ "key": detail.experiment.key }),
    );

    Ok((StatusCode::CREATED, Json(detail)))
}

/// GET /api/v1/experiments/:id
pub async fn handle_get_experiment(
    State(state): State<AppState>,
    _operator: Operator,
    Path(id): Path<Uuid>,
) -> Result<Json<ExperimentDetail>, AppError> {
    let experiment = state
        .store
        .get_experiment(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Experiment {id} not found")))?;
    let variants = state.store.list_variants(id).await?;
    Ok(Json(ExperimentDetail {
        experiment,
        variants,
    }))
}

/// PATCH /api/v1/experiments/:id/status
pub async fn handle_update_status(
    State(state): State<AppState>,
    operator: Operator,
    Path(id): Path<Uuid>,
    payload: Result<Json<StatusUpdateRequest>, JsonRejection>,
) -> Result<Json<Experiment>, AppError> {
    operator.require_admin()?;
    let Json(request) = payload?;
    Ok(Json(transition_status(&state.store, id, request.status).await?))
}

/// DELETE /api/v1/experiments/:id
pub async fn handle_delete_experiment(
    State(state): State<AppState>,
    operator: Operator,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    operator.require_admin()?;
    delete_experiment(&state.store, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/experiments/:id/results
///
/// Reads the last aggregated rollup; may lag behind live traffic.
pub async fn handle_get_results(
    State(state): State<AppState>,
    _operator: Operator,
    Path(id): Path<Uuid>,
) -> Result<Json<ResultsReport>, AppError> {
    let report = build_results_report(state.store.as_ref(), id, false, Utc::now()).await?;
    Ok(Json(report))
}

/// POST /api/v1/experiments/:id/results
///
/// Refreshes the rollup first. A failed refresh still returns the previous rollup.
pub async fn handle_refresh_results(
    State(state): State<AppState>,
    _operator: Operator,
    Path(id): Path<Uuid>,
) -> Result<Json<ResultsReport>, AppError> {
    let report = build_results_report(state.store.as_ref(), id, true, Utc::now()).await?;
    Ok(Json(report))
}

// ────────────────────────────────────────────────────────────────────────────
// Visitor handlers
// ────────────────────────────────────────────────────────────────────────────

/// POST /api/v1/assign/:key
///
/// The visitor id comes from the cookie set by the routing layer. The body is an
/// optional audience context; the User-Agent header fills in when it omits one.
pub async fn handle_assign(
    State(state): State<AppState>,
    Path(key): Path<String>,
    jar: CookieJar,
    user_agent: Option<TypedHeader<UserAgent>>,
    body: Bytes,
) -> Result<Json<AssignResponse>, AppError> {
    let visitor = visitor_id(&jar, &state.config.visitor_cookie_name)?;

    let mut ctx = audience_context(&body)?;
    if ctx.user_agent.is_none() {
        ctx.user_agent = user_agent.map(|TypedHeader(ua)| ua.as_str().to_string());
    }

    let resolved = assign(state.store.as_ref(), &visitor, &key, &ctx).await?;
    let response = match resolved {
        Some(r) => AssignResponse {
            experiment_key: key,
            newly_assigned: r.newly_assigned,
            assigned_at: Some(r.assignment.assigned_at),
            variant: Some(AssignedVariant {
                id: r.variant.id,
                key: r.variant.key,
                name: r.variant.name,
            }),
        },
        None => AssignResponse {
            experiment_key: key,
            variant: None,
            newly_assigned: false,
            assigned_at: None,
        },
    };
    Ok(Json(response))
}

/// POST /api/v1/convert/:key
pub async fn handle_convert(
    State(state): State<AppState>,
    Path(key): Path<String>,
    jar: CookieJar,
) -> Result<Json<ConvertResponse>, AppError> {
    let visitor = visitor_id(&jar, &state.config.visitor_cookie_name)?;
    let outcome = record_conversion(state.store.as_ref(), &visitor, &key).await?;
    Ok(Json(ConvertResponse {
        experiment_key: key,
        outcome,
    }))
}

// ────────────────────────────────────────────────────────────────────────────
// Scheduled jobs
// ────────────────────────────────────────────────────────────────────────────

/// POST /api/v1/cron/refresh-results
///
/// Called by the external timer. Unlike the results endpoint, a failed refresh
/// fails the request so the scheduler sees it.
pub async fn handle_cron_refresh(
    State(state): State<AppState>,
    _caller: CronCaller,
) -> Result<Json<CronRefreshResponse>, AppError> {
    state.store.refresh_results().await?;
    tracing::info!("Scheduled experiment results refresh completed");
    Ok(Json(CronRefreshResponse {
        refreshed: true,
        refreshed_at: Utc::now(),
    }))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{header, Method, Request},
        Router,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::routes::build_router;
    use crate::state::test_support::{test_state, ADMIN_TOKEN, CRON_SECRET, VIEWER_TOKEN};

    async fn send(
        app: &Router,
        method: Method,
        uri: &str,
        token: Option<&str>,
        cookie: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    fn experiment_body(key: &str) -> Value {
        json!({
            "key": key,
            "name": "Job board hero",
            "minimum_sample_size": 1,
            "variants": [
                { "key": "control", "is_control": true },
                { "key": "photo", "weight": 50 }
            ]
        })
    }

    async fn create_running(app: &Router, key: &str) -> String {
        let (status, created) = send(
            app,
            Method::POST,
            "/api/v1/experiments",
            Some(ADMIN_TOKEN),
            None,
            Some(experiment_body(key)),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = created["id"].as_str().unwrap().to_string();

        let (status, _) = send(
            app,
            Method::PATCH,
            &format!("/api/v1/experiments/{id}/status"),
            Some(ADMIN_TOKEN),
            None,
            Some(json!({ "status": "running" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        id
    }

    #[tokio::test]
    async fn test_operator_endpoints_require_token() {
        let app = build_router(test_state());
        let (status, body) = send(&app, Method::GET, "/api/v1/experiments", None, None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "UNAUTHORIZED");

        let (status, _) = send(
            &app,
            Method::GET,
            "/api/v1/experiments",
            Some("wrong"),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_viewer_can_read_but_not_write() {
        let app = build_router(test_state());
        let (status, _) = send(
            &app,
            Method::GET,
            "/api/v1/experiments",
            Some(VIEWER_TOKEN),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/experiments",
            Some(VIEWER_TOKEN),
            None,
            Some(experiment_body("viewer-attempt")),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "FORBIDDEN");
    }

    #[tokio::test]
    async fn test_create_validation_errors_are_field_level() {
        let app = build_router(test_state());
        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/experiments",
            Some(ADMIN_TOKEN),
            None,
            Some(json!({ "key": "Not Valid", "name": "x", "variants": [] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
        let fields: Vec<&str> = body["error"]["details"]
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["field"].as_str().unwrap())
            .collect();
        assert!(fields.contains(&"key"));
        assert!(fields.contains(&"variants"));
    }

    #[tokio::test]
    async fn test_duplicate_key_is_rejected() {
        let app = build_router(test_state());
        create_running(&app, "dup").await;
        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/experiments",
            Some(ADMIN_TOKEN),
            None,
            Some(experiment_body("dup")),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["details"][0]["field"], "key");
    }

    #[tokio::test]
    async fn test_unknown_status_value_is_bad_request() {
        let app = build_router(test_state());
        let id = create_running(&app, "bad-status").await;
        let (status, _) = send(
            &app,
            Method::PATCH,
            &format!("/api/v1/experiments/{id}/status"),
            Some(ADMIN_TOKEN),
            None,
            Some(json!({ "status": "paused" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_running_experiment_delete_is_rejected() {
        let app = build_router(test_state());
        let id = create_running(&app, "delete-me").await;
        let uri = format!("/api/v1/experiments/{id}");

        let (status, body) = send(&app, Method::DELETE, &uri, Some(ADMIN_TOKEN), None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "STATE_CONFLICT");

        let (status, _) = send(
            &app,
            Method::PATCH,
            &format!("{uri}/status"),
            Some(ADMIN_TOKEN),
            None,
            Some(json!({ "status": "completed" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(&app, Method::DELETE, &uri, Some(ADMIN_TOKEN), None, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = send(&app, Method::GET, &uri, Some(ADMIN_TOKEN), None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_assign_requires_visitor_cookie() {
        let app = build_router(test_state());
        create_running(&app, "cookie-check").await;
        let (status, body) =
            send(&app, Method::POST, "/api/v1/assign/cookie-check", None, None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"]["message"].as_str().unwrap().contains("visitor_id"));
    }

    #[tokio::test]
    async fn test_assign_convert_and_results_flow() {
        let app = build_router(test_state());
        let id = create_running(&app, "hero").await;

        let (status, first) = send(
            &app,
            Method::POST,
            "/api/v1/assign/hero",
            None,
            Some("visitor_id=abc-123"),
            Some(json!({ "url": "https://example.com/jobs" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["newly_assigned"], true);
        assert!(first["assigned_at"].is_string());
        let variant_key = first["variant"]["key"].as_str().unwrap().to_string();

        let (_, second) = send(
            &app,
            Method::POST,
            "/api/v1/assign/hero",
            None,
            Some("visitor_id=abc-123"),
            None,
        )
        .await;
        assert_eq!(second["variant"]["key"], variant_key.as_str());
        assert_eq!(second["newly_assigned"], false);
        assert_eq!(second["assigned_at"], first["assigned_at"]);

        let (status, converted) = send(
            &app,
            Method::POST,
            "/api/v1/convert/hero",
            None,
            Some("visitor_id=abc-123"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(converted["outcome"], "recorded");

        let results_uri = format!("/api/v1/experiments/{id}/results");
        let (status, stale) = send(&app, Method::GET, &results_uri, Some(VIEWER_TOKEN), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stale["refreshed"], false);
        assert_eq!(stale["variants"], json!([]));

        let (status, fresh) =
            send(&app, Method::POST, &results_uri, Some(ADMIN_TOKEN), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fresh["refreshed"], true);
        assert_eq!(fresh["is_significant"], false);
        let raw = fresh["raw_results"].as_array().unwrap();
        let total_visitors: i64 = raw.iter().map(|r| r["visitors"].as_i64().unwrap()).sum();
        let total_conversions: i64 = raw.iter().map(|r| r["conversions"].as_i64().unwrap()).sum();
        assert_eq!(total_visitors, 1);
        assert_eq!(total_conversions, 1);
        assert!(fresh.get("daily_visitors").is_some());
        assert!(fresh.get("estimated_days_remaining").is_some());
    }

    #[tokio::test]
    async fn test_malformed_audience_context_is_rejected() {
        let app = build_router(test_state());
        let (status, created) = send(
            &app,
            Method::POST,
            "/api/v1/experiments",
            Some(ADMIN_TOKEN),
            None,
            Some(json!({
                "key": "deckhand-only",
                "name": "Deckhand listing",
                "target_positions": ["Deckhand"],
                "variants": [{ "key": "control" }, { "key": "short-form" }]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = created["id"].as_str().unwrap();
        send(
            &app,
            Method::PATCH,
            &format!("/api/v1/experiments/{id}/status"),
            Some(ADMIN_TOKEN),
            None,
            Some(json!({ "status": "running" })),
        )
        .await;

        for raw in [r#"{"position": "Deckhand","#, r#"{"position": 42}"#] {
            let request = Request::builder()
                .method(Method::POST)
                .uri("/api/v1/assign/deckhand-only")
                .header(header::COOKIE, "visitor_id=sailor-1")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(raw))
                .unwrap();
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{raw}");
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            let body: Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
            assert_eq!(body["error"]["details"][0]["field"], "body");
        }

        let (status, assigned) = send(
            &app,
            Method::POST,
            "/api/v1/assign/deckhand-only",
            None,
            Some("visitor_id=sailor-1"),
            Some(json!({ "position": "Deckhand" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(assigned["variant"]["key"].is_string());
    }

    #[tokio::test]
    async fn test_bot_user_agent_gets_default_experience() {
        let app = build_router(test_state());
        create_running(&app, "bots").await;

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/assign/bots")
            .header(header::COOKIE, "visitor_id=crawler-1")
            .header(header::USER_AGENT, "Mozilla/5.0 (compatible; bingbot/2.0)")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["variant"].is_null());
    }

    #[tokio::test]
    async fn test_cron_refresh_requires_secret() {
        let app = build_router(test_state());
        let uri = "/api/v1/cron/refresh-results";

        let (status, _) = send(&app, Method::POST, uri, None, None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(&app, Method::POST, uri, Some(ADMIN_TOKEN), None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = send(&app, Method::POST, uri, Some(CRON_SECRET), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["refreshed"], true);
    }
}
