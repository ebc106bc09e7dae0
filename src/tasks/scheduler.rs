use anyhow::Result;
use tokio::sync::watch;
use tokio::time::{interval, sleep, Duration};

use crate::core::state::AppState;
use crate::services::extraction::HttpExtractor;
use crate::services::grading::OpenAiGradingEngine;
use crate::tasks::correction;

const CLAIM_POLL_SECONDS: u64 = 2;
const REAPER_INTERVAL_SECONDS: u64 = 60;

pub(crate) async fn run(state: AppState) -> Result<()> {
    let extractor = HttpExtractor::from_settings(state.settings())?;
    let engine = OpenAiGradingEngine::from_settings(state.settings())?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let concurrency = state.settings().worker().concurrency.max(1);
    let mut handles = Vec::with_capacity(concurrency + 1);

    for _ in 0..concurrency {
        handles.push(tokio::spawn(correction_worker(
            state.clone(),
            extractor.clone(),
            engine.clone(),
            shutdown_rx.clone(),
        )));
    }

    handles.push(tokio::spawn(reaper_loop(state.clone(), shutdown_rx.clone())));

    crate::core::shutdown::shutdown_signal().await;
    if shutdown_tx.send(true).is_err() {
        tracing::warn!("Failed to broadcast shutdown signal to background tasks");
    }

    for handle in handles {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "Background task join failed");
        }
    }

    Ok(())
}

async fn correction_worker(
    state: AppState,
    extractor: HttpExtractor,
    engine: OpenAiGradingEngine,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        match correction::claim_next_job(&state).await {
            Ok(Some(job)) => {
                if let Err(err) =
                    correction::process_job(&state, &extractor, &engine, &job).await
                {
                    tracing::error!(job_id = %job.id, error = %err, "Failed to process job");
                    if let Err(recovery_err) = correction::recover_job_on_unexpected_error(
                        &state,
                        &job.id,
                        &err.to_string(),
                    )
                    .await
                    {
                        tracing::error!(
                            job_id = %job.id,
                            error = %recovery_err,
                            "Failed to recover job after worker error"
                        );
                    }
                }
                continue;
            }
            Ok(None) => {}
            Err(err) => tracing::error!(error = %err, "Failed to claim job"),
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = sleep(Duration::from_secs(CLAIM_POLL_SECONDS)) => {}
        }
    }
}

async fn reaper_loop(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut tick = interval(Duration::from_secs(REAPER_INTERVAL_SECONDS));
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                if let Err(err) = correction::reap_stale_jobs(&state).await {
                    tracing::error!(error = %err, "reap_stale_jobs failed");
                }
            }
        }
    }
}
