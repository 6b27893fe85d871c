//! Tally HTTP REST API
//!
//! Axum-based HTTP server exposing the query pipeline and the evaluation
//! engine. Runs alongside the Unix socket IPC server.
//!
//! Architecture: each endpoint has a thin axum handler that delegates to a
//! pure inner function. The inner functions are directly testable without
//! axum dispatch machinery.
//!
//! Endpoints:
//! - GET  /health                         — health check with DB status
//! - GET  /version                        — server version info
//! - POST /ask                            — answer a question (optionally scored)
//! - POST /evaluate/run                   — start a batch evaluation run
//! - GET  /evaluate/runs                  — list recent runs
//! - GET  /evaluate/runs/{id}             — run detail
//! - GET  /evaluate/runs/{id}/results     — per-query results of a run
//! - POST /evaluate/runs/{id}/cancel      — cancel an in-flight batch run
//! - POST /evaluate/realtime              — score one live question
//! - POST /evaluate/ingestion             — score one ticket vs ground truth
//! - GET  /metrics/summary                — rollup for a metric family
//! - GET  /metrics/trends                 — trend series for a metric family

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use uuid::Uuid;

use tally_core::{GroundTruthRecord, LineItem, MetricFamily, TallyError};
use tally_eval::aggregate;

use crate::{router, AppState};

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/ask", post(ask_handler))
        .route("/evaluate/run", post(evaluate_run_handler))
        .route("/evaluate/runs", get(list_runs_handler))
        .route("/evaluate/runs/:run_id", get(run_detail_handler))
        .route("/evaluate/runs/:run_id/results", get(run_results_handler))
        .route("/evaluate/runs/:run_id/cancel", post(cancel_run_handler))
        .route("/evaluate/realtime", post(realtime_handler))
        .route("/evaluate/ingestion", post(ingestion_handler))
        .route("/metrics/summary", get(metrics_summary_handler))
        .route("/metrics/trends", get(metrics_trends_handler))
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", state.config.http.host, state.config.http.port);

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Tally HTTP API listening on http://{}", addr);

    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    pub question: Option<String>,
    #[serde(default)]
    pub evaluate: bool,
    pub reference_answer: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EvaluateRunRequest {
    pub mode: String,
    pub sample_size: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct RealtimeRequest {
    pub question: Option<String>,
    pub reference_answer: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct IngestionRequest {
    pub ticket_id: i64,
    pub merchant_name: Option<String>,
    pub transaction_date: Option<String>,
    pub total_amount: Option<f64>,
    #[serde(default)]
    pub items: Vec<LineItem>,
}

#[derive(Debug, Deserialize, Default)]
pub struct FamilyQuery {
    pub family: Option<String>,
    pub limit: Option<i64>,
    pub days: Option<i64>,
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

/// Map a pipeline error onto an HTTP status.
pub fn error_status(error: &TallyError) -> StatusCode {
    match error {
        TallyError::PolicyViolation(_) => StatusCode::FORBIDDEN,
        TallyError::Planning { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        TallyError::Other(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_body(error: &TallyError) -> serde_json::Value {
    serde_json::json!({
        "error": error.to_string(),
        "kind": error.kind(),
        "status": "error",
    })
}

fn bad_request(message: &str) -> (StatusCode, serde_json::Value) {
    (
        StatusCode::BAD_REQUEST,
        serde_json::json!({"error": message, "status": "error"}),
    )
}

fn parse_family(raw: Option<&str>) -> Result<MetricFamily, (StatusCode, serde_json::Value)> {
    match raw {
        None => Ok(MetricFamily::Rag),
        Some(s) => MetricFamily::parse(s)
            .ok_or_else(|| bad_request(&format!("unknown metric family '{s}' (expected rag|ingestion)"))),
    }
}

/// Inner health check — queries DB and returns (status_code, json_body).
pub async fn health_inner(state: &Arc<AppState>) -> (StatusCode, serde_json::Value) {
    let pg_ver = match tally_core::db::health_check(&state.pool).await {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({
                    "status": "unhealthy",
                    "error": e.to_string(),
                }),
            );
        }
    };

    let approved_view = match tally_core::db::check_approved_view(&state.pool).await {
        Ok(v) => v,
        Err(e) => format!("unavailable: {}", e),
    };

    (
        StatusCode::OK,
        serde_json::json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "postgresql": pg_ver,
            "approved_view": approved_view,
            "socket": state.config.service.socket_path,
        }),
    )
}

/// Inner version — returns version info (pure, no IO).
pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "tally/1",
    })
}

/// Inner ask — validates the question and runs the pipeline.
pub async fn ask_inner(
    state: &Arc<AppState>,
    req: AskRequest,
) -> (StatusCode, serde_json::Value) {
    let question = match req.question {
        Some(q) if !q.trim().is_empty() => q,
        _ => return bad_request("question field is required"),
    };

    let start = Instant::now();

    let result = router::handle_ask(
        state,
        &question,
        req.evaluate,
        req.reference_answer.as_deref(),
    )
    .await;

    let took_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(mut data) => {
            if let Some(object) = data.as_object_mut() {
                object.insert("took_ms".to_string(), serde_json::json!(took_ms));
            }
            (StatusCode::OK, data)
        }
        Err(e) => (error_status(&e), error_body(&e)),
    }
}

/// Inner evaluate-run — creates the run and spawns execution.
pub async fn evaluate_run_inner(
    state: &Arc<AppState>,
    req: EvaluateRunRequest,
) -> (StatusCode, serde_json::Value) {
    match router::start_batch_run(state, &req.mode, req.sample_size).await {
        Ok(run_id) => (
            StatusCode::ACCEPTED,
            serde_json::json!({"run_id": run_id, "status": "started"}),
        ),
        Err(e) => (error_status(&e), error_body(&e)),
    }
}

/// Inner run listing.
pub async fn list_runs_inner(
    state: &Arc<AppState>,
    query: FamilyQuery,
) -> (StatusCode, serde_json::Value) {
    let family = match query.family.as_deref() {
        None => None,
        Some(s) => match MetricFamily::parse(s) {
            Some(f) => Some(f),
            None => return bad_request(&format!("unknown metric family '{s}'")),
        },
    };
    let limit = query.limit.unwrap_or(50).clamp(1, 100);

    match state.store.list_runs(family, limit).await {
        Ok(runs) => {
            let count = runs.len();
            (
                StatusCode::OK,
                serde_json::json!({"runs": runs, "count": count}),
            )
        }
        Err(e) => (error_status(&e), error_body(&e)),
    }
}

/// Inner run detail.
pub async fn run_detail_inner(
    state: &Arc<AppState>,
    run_id: Uuid,
) -> (StatusCode, serde_json::Value) {
    match state.store.get_run(run_id).await {
        Ok(Some(run)) => (StatusCode::OK, serde_json::json!(run)),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            serde_json::json!({"error": "run not found", "status": "error"}),
        ),
        Err(e) => (error_status(&e), error_body(&e)),
    }
}

/// Inner run results.
pub async fn run_results_inner(
    state: &Arc<AppState>,
    run_id: Uuid,
) -> (StatusCode, serde_json::Value) {
    match state.store.get_run(run_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                serde_json::json!({"error": "run not found", "status": "error"}),
            );
        }
        Err(e) => return (error_status(&e), error_body(&e)),
    }

    match state.store.results_for_run(run_id).await {
        Ok(results) => (
            StatusCode::OK,
            serde_json::json!({"run_id": run_id, "results": results}),
        ),
        Err(e) => (error_status(&e), error_body(&e)),
    }
}

/// Inner cancel.
pub async fn cancel_run_inner(
    state: &Arc<AppState>,
    run_id: Uuid,
) -> (StatusCode, serde_json::Value) {
    match router::cancel_run(state, run_id).await {
        Ok(data) => (StatusCode::OK, data),
        Err(e) => (error_status(&e), error_body(&e)),
    }
}

/// Inner realtime RAG evaluation — asks the pipeline and scores the answer.
pub async fn realtime_inner(
    state: &Arc<AppState>,
    req: RealtimeRequest,
) -> (StatusCode, serde_json::Value) {
    let question = match req.question {
        Some(q) if !q.trim().is_empty() => q,
        _ => return bad_request("question field is required"),
    };

    match state
        .runner
        .run_realtime(&question, req.reference_answer.as_deref())
        .await
    {
        Ok((summary, scores)) => (
            StatusCode::OK,
            serde_json::json!({
                "run_id": summary.run_id,
                "status": summary.status,
                "successful_queries": summary.successful_queries,
                "faithfulness": scores.faithfulness,
                "answer_relevance": scores.answer_relevance,
                "context_precision": scores.context_precision,
                "context_recall": scores.context_recall,
            }),
        ),
        Err(e) => (error_status(&e), error_body(&e)),
    }
}

/// Inner realtime ingestion evaluation.
pub async fn ingestion_inner(
    state: &Arc<AppState>,
    req: IngestionRequest,
) -> (StatusCode, serde_json::Value) {
    let ground_truth = GroundTruthRecord {
        ticket_id: req.ticket_id,
        merchant_name: req.merchant_name,
        transaction_date: req.transaction_date,
        total_amount: req.total_amount,
        items: req.items,
    };

    match state.runner.run_ingestion_realtime(&ground_truth).await {
        Ok((summary, scores)) => (
            StatusCode::OK,
            serde_json::json!({
                "run_id": summary.run_id,
                "ticket_id": ground_truth.ticket_id,
                "status": summary.status,
                "scores": scores,
            }),
        ),
        Err(e) => (error_status(&e), error_body(&e)),
    }
}

/// Inner metrics summary.
pub async fn metrics_summary_inner(
    state: &Arc<AppState>,
    query: FamilyQuery,
) -> (StatusCode, serde_json::Value) {
    let family = match parse_family(query.family.as_deref()) {
        Ok(f) => f,
        Err(resp) => return resp,
    };

    match aggregate::summary(&state.store, family).await {
        Ok(summary) => (StatusCode::OK, serde_json::json!(summary)),
        Err(e) => (error_status(&e), error_body(&e)),
    }
}

/// Inner metrics trends.
pub async fn metrics_trends_inner(
    state: &Arc<AppState>,
    query: FamilyQuery,
) -> (StatusCode, serde_json::Value) {
    let family = match parse_family(query.family.as_deref()) {
        Ok(f) => f,
        Err(resp) => return resp,
    };
    let days = query.days.unwrap_or(30).clamp(1, 365);

    match aggregate::trends(&state.store, family, days).await {
        Ok(trends) => (StatusCode::OK, serde_json::json!(trends)),
        Err(e) => (error_status(&e), error_body(&e)),
    }
}

// ============================================================================
// Axum handler wrappers (thin — delegate to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn ask_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AskRequest>,
) -> impl IntoResponse {
    let (status, body) = ask_inner(&state, req).await;
    (status, Json(body))
}

pub async fn evaluate_run_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EvaluateRunRequest>,
) -> impl IntoResponse {
    let (status, body) = evaluate_run_inner(&state, req).await;
    (status, Json(body))
}

pub async fn list_runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FamilyQuery>,
) -> impl IntoResponse {
    let (status, body) = list_runs_inner(&state, query).await;
    (status, Json(body))
}

pub async fn run_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<Uuid>,
) -> impl IntoResponse {
    let (status, body) = run_detail_inner(&state, run_id).await;
    (status, Json(body))
}

pub async fn run_results_handler(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<Uuid>,
) -> impl IntoResponse {
    let (status, body) = run_results_inner(&state, run_id).await;
    (status, Json(body))
}

pub async fn cancel_run_handler(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<Uuid>,
) -> impl IntoResponse {
    let (status, body) = cancel_run_inner(&state, run_id).await;
    (status, Json(body))
}

pub async fn realtime_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RealtimeRequest>,
) -> impl IntoResponse {
    let (status, body) = realtime_inner(&state, req).await;
    (status, Json(body))
}

pub async fn ingestion_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IngestionRequest>,
) -> impl IntoResponse {
    let (status, body) = ingestion_inner(&state, req).await;
    (status, Json(body))
}

pub async fn metrics_summary_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FamilyQuery>,
) -> impl IntoResponse {
    let (status, body) = metrics_summary_inner(&state, query).await;
    (status, Json(body))
}

pub async fn metrics_trends_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FamilyQuery>,
) -> impl IntoResponse {
    let (status, body) = metrics_trends_inner(&state, query).await;
    (status, Json(body))
}

// ============================================================================
// Unit Tests — call inner functions directly
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_inner_pure() {
        let v = version_inner();
        assert!(v["version"].is_string(), "version must be string");
        assert_eq!(v["protocol"], "tally/1", "protocol must be tally/1");
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            error_status(&TallyError::PolicyViolation("x".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            error_status(&TallyError::Planning {
                reason: "r".into(),
                generated: "g".into()
            }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            error_status(&TallyError::Execution("timeout".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            error_status(&TallyError::Other("bad mode".into())),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_error_body_carries_kind() {
        let body = error_body(&TallyError::PolicyViolation("blocked".into()));
        assert_eq!(body["kind"], "policy_violation");
        assert_eq!(body["status"], "error");
        assert!(body["error"].as_str().unwrap().contains("blocked"));
    }

    #[test]
    fn test_parse_family_defaults_to_rag() {
        assert_eq!(parse_family(None).unwrap(), MetricFamily::Rag);
        assert_eq!(parse_family(Some("ingestion")).unwrap(), MetricFamily::Ingestion);
        assert!(parse_family(Some("bogus")).is_err());
    }
}
