use std::sync::Arc;

use tally_core::ipc::{TallyRequest, TallyResponse};
use tally_core::{RunType, TallyError};

use crate::AppState;

pub async fn handle_request(request: TallyRequest, state: &Arc<AppState>) -> TallyResponse {
    match request {
        TallyRequest::Ping => TallyResponse::pong(),
        TallyRequest::Health => {
            let pg_ver = match tally_core::db::health_check(&state.pool).await {
                Ok(v) => v,
                Err(e) => return TallyResponse::err(format!("DB Health Check failed: {}", e)),
            };
            let view = match tally_core::db::check_approved_view(&state.pool).await {
                Ok(v) => v,
                Err(e) => return TallyResponse::err(format!("Approved view check failed: {}", e)),
            };
            TallyResponse::ok(serde_json::json!({
                "postgresql": pg_ver,
                "approved_view": view,
                "status": "healthy"
            }))
        }
        TallyRequest::Ask {
            question,
            evaluate,
            reference_answer,
        } => match handle_ask(state, &question, evaluate, reference_answer.as_deref()).await {
            Ok(data) => TallyResponse::ok(data),
            Err(e) => error_response(&e),
        },
        TallyRequest::EvaluateRun { mode, sample_size } => {
            match start_batch_run(state, &mode, sample_size).await {
                Ok(run_id) => TallyResponse::ok(serde_json::json!({
                    "run_id": run_id,
                    "status": "started"
                })),
                Err(e) => error_response(&e),
            }
        }
        TallyRequest::RunStatus { run_id } => match state.store.get_run(run_id).await {
            Ok(Some(run)) => match serde_json::to_value(&run) {
                Ok(data) => TallyResponse::ok(data),
                Err(e) => TallyResponse::err(format!("Failed to serialize run: {}", e)),
            },
            Ok(None) => TallyResponse::err(format!("Run {} not found", run_id)),
            Err(e) => error_response(&e),
        },
        TallyRequest::CancelRun { run_id } => match cancel_run(state, run_id).await {
            Ok(data) => TallyResponse::ok(data),
            Err(e) => error_response(&e),
        },
    }
}

fn error_response(error: &TallyError) -> TallyResponse {
    let mut response = TallyResponse::err(error.to_string());
    response.data = Some(serde_json::json!({"kind": error.kind()}));
    response
}

/// Answer one question; optionally score the produced answer in the same
/// request as a realtime evaluation run.
pub async fn handle_ask(
    state: &Arc<AppState>,
    question: &str,
    evaluate: bool,
    reference_answer: Option<&str>,
) -> Result<serde_json::Value, TallyError> {
    let report = state.pipeline.ask(question).await?;

    let mut data = serde_json::json!({
        "answer": report.answer.text,
        "context_used": report.answer.context.fragments,
        "intent": report.query.intent,
        "degraded": report.degraded,
        "latency_ms": report.answer.latency_ms,
        "token_count": report.answer.token_count(),
    });

    if evaluate {
        let (summary, scores) = state
            .runner
            .run_realtime_for_answer(question, &report.answer, reference_answer)
            .await?;

        if let Some(object) = data.as_object_mut() {
            object.insert(
                "metrics".to_string(),
                serde_json::json!({
                    "run_id": summary.run_id,
                    "faithfulness": scores.faithfulness,
                    "answer_relevance": scores.answer_relevance,
                    "context_precision": scores.context_precision,
                    "context_recall": scores.context_recall,
                }),
            );
        }
    }

    Ok(data)
}

/// Create the run row, hand out its id, and execute in the background.
pub async fn start_batch_run(
    state: &Arc<AppState>,
    mode: &str,
    sample_size: Option<u32>,
) -> Result<uuid::Uuid, TallyError> {
    let run_type = match mode {
        "sample" => RunType::Sample,
        "full" => RunType::Full,
        "manual" => RunType::Manual,
        other => {
            return Err(TallyError::Other(format!(
                "unknown evaluation mode '{other}' (expected sample|full|manual)"
            )))
        }
    };

    let run_id = state.runner.create_batch_run(run_type).await?;
    let cancel = state.register_cancellation(run_id);

    let runner = state.runner.clone();
    let state_for_cleanup = state.clone();
    tokio::spawn(async move {
        if let Err(e) = runner
            .execute_batch(run_id, run_type, sample_size, cancel)
            .await
        {
            tracing::error!(%run_id, error = %e, "Batch evaluation failed");
        }
        state_for_cleanup.clear_cancellation(run_id);
    });

    Ok(run_id)
}

/// Cancel an in-flight batch run. Already-written results stay valid.
pub async fn cancel_run(
    state: &Arc<AppState>,
    run_id: uuid::Uuid,
) -> Result<serde_json::Value, TallyError> {
    if let Some(token) = state.take_cancellation(run_id) {
        token.cancel();
        tracing::warn!(%run_id, "Cancellation requested for batch run");
        return Ok(serde_json::json!({"run_id": run_id, "cancelled": true}));
    }

    match state.store.get_run(run_id).await? {
        Some(run) if run.status.is_terminal() => Err(TallyError::Other(format!(
            "run {run_id} already finished with status {}",
            run.status.as_str()
        ))),
        Some(_) => Err(TallyError::Other(format!(
            "run {run_id} has no cancellation handle on this server"
        ))),
        None => Err(TallyError::Other(format!("run {run_id} not found"))),
    }
}
