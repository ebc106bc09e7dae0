mod worker;

#[cfg(test)]
mod tests;

pub(crate) use worker::{claim_next_job, process_job};

use anyhow::{Context, Result};
use time::Duration;

use crate::core::state::AppState;
use crate::core::time::primitive_now_utc as now_primitive;
use crate::db::types::{JobErrorKind, JobStatus};
use crate::services::jobs::notify_transition;
use crate::store::{CreditLedger, JobStore};

/// Last-resort cleanup when a worker hits an unexpected error mid-job:
/// fail the job and return its reservation instead of leaving it stuck.
pub(crate) async fn recover_job_on_unexpected_error(
    state: &AppState,
    job_id: &str,
    error: &str,
) -> Result<()> {
    let job = state.store().find_job(job_id).await.context("Failed to load job for recovery")?;
    let Some(job) = job else {
        return Ok(());
    };

    let message = format!("internal error during processing: {error}");
    let old = state
        .store()
        .fail_job(job_id, JobErrorKind::GradingFailed, &message, now_primitive())
        .await
        .context("Failed to mark job failed during recovery")?;

    if let Some(reservation_id) = &job.reservation_id {
        if let Err(err) = state.store().release(reservation_id, now_primitive()).await {
            tracing::error!(job_id, error = %err, "Failed to release reservation during recovery");
        }
    }

    if let Some(old) = old {
        notify_transition(state, job_id, old, JobStatus::Failed).await;
        metrics::counter!("correction_jobs_total", "status" => "failed").increment(1);
    }

    Ok(())
}

/// Fail jobs abandoned by a crashed worker: anything claimed or active
/// without progress past the configured deadline.
pub(crate) async fn reap_stale_jobs(state: &AppState) -> Result<()> {
    let stale_after = state.settings().worker().stale_after_seconds as i64;
    let cutoff = now_primitive() - Duration::seconds(stale_after);

    let stale = state
        .store()
        .list_stale_active(cutoff)
        .await
        .context("Failed to list stale jobs")?;

    if stale.is_empty() {
        return Ok(());
    }

    let mut reaped = 0;
    for job in stale {
        let message = format!("no worker progress for more than {stale_after}s");
        let old = state
            .store()
            .fail_job(&job.id, JobErrorKind::Timeout, &message, now_primitive())
            .await
            .context("Failed to fail stale job")?;

        if let Some(reservation_id) = &job.reservation_id {
            if let Err(err) = state.store().release(reservation_id, now_primitive()).await {
                tracing::error!(job_id = %job.id, error = %err, "Failed to release reservation for stale job");
            }
        }

        if let Some(old) = old {
            notify_transition(state, &job.id, old, JobStatus::Failed).await;
            reaped += 1;
        }
    }

    tracing::warn!(reaped, "Reaped stale correction jobs");
    metrics::counter!("stale_jobs_reaped_total").increment(reaped);

    Ok(())
}
