//! Scheduled evaluation loop — periodic full batch runs
//!
//! Fires a `scheduled` evaluation run on a fixed interval so quality trends
//! accumulate without operator action. One run at a time; a run that fails
//! is logged and the loop keeps ticking.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use tally_core::RunType;
use tally_eval::EvaluationRunner;

pub async fn run_scheduled_evaluation_loop(
    runner: Arc<EvaluationRunner>,
    interval_minutes: u64,
    mut shutdown: broadcast::Receiver<()>,
) {
    let interval = tokio::time::Duration::from_secs(interval_minutes * 60);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // interval() fires immediately; swallow that first tick so the loop
    // waits a full period after startup
    ticker.tick().await;

    tracing::info!(
        "Scheduled evaluation loop started (interval: {}min)",
        interval_minutes
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match runner
                    .run_batch(RunType::Scheduled, None, CancellationToken::new())
                    .await
                {
                    Ok(summary) => tracing::info!(
                        run_id = %summary.run_id,
                        successful = summary.successful_queries,
                        total = summary.total_queries,
                        "Scheduled evaluation run complete"
                    ),
                    Err(e) => tracing::error!("Scheduled evaluation error: {}", e),
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Scheduled evaluation loop shutting down");
                break;
            }
        }
    }
}
