use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::time::timeout;

use crate::core::state::AppState;
use crate::core::time::primitive_now_utc as now_primitive;
use crate::db::models::{BackgroundJob, JobPage};
use crate::db::types::{JobErrorKind, JobStatus};
use crate::services::extraction::TextExtractor;
use crate::services::grading::{GradeRequest, GradingEngine};
use crate::services::jobs::{estimate_reservation, notify_transition};
use crate::store::{ChargeUsage, CreditLedger, ExamStore, JobStore, LedgerError};

/// Exclusively claim the next QUEUED job. The claim stamps the pickup
/// time; the status only moves once the credit reservation holds.
pub(crate) async fn claim_next_job(state: &AppState) -> Result<Option<BackgroundJob>> {
    state.store().claim_next_queued(now_primitive()).await.context("Failed to claim job")
}

/// Drive one claimed job through the correction pipeline:
/// reserve -> extract -> grade -> charge -> route. Cancellation is
/// checked between stages; an in-flight grading call always completes
/// and is charged.
pub(crate) async fn process_job(
    state: &AppState,
    extractor: &dyn TextExtractor,
    engine: &dyn GradingEngine,
    job: &BackgroundJob,
) -> Result<()> {
    let timer = Instant::now();
    let files = state.store().list_job_files(&job.id).await.context("Failed to load job files")?;
    let estimated = estimate_reservation(state, job.model_tier, files.len());

    let reservation_id = match state
        .store()
        .reserve(&job.user_id, &job.id, estimated, now_primitive())
        .await
    {
        Ok(reservation_id) => reservation_id,
        Err(LedgerError::InsufficientCredits { requested, available }) => {
            let message =
                format!("insufficient credits: job needs {requested}, balance is {available}");
            fail(state, &job.id, JobErrorKind::InsufficientCredits, &message, None).await?;
            return Ok(());
        }
        Err(err) => return Err(err).context("Failed to reserve credits"),
    };

    // QUEUED -> EXTRACTING. Loses the race only to a concurrent cancel.
    // The reservation id is not on the job row yet, so a store error
    // here must hand the hold back before propagating.
    let began = match state
        .store()
        .begin_extracting(&job.id, &reservation_id, estimated, now_primitive())
        .await
    {
        Ok(began) => began,
        Err(err) => {
            release_quietly(state, &job.id, &reservation_id).await;
            return Err(err).context("Failed to record extraction start");
        }
    };
    if !began {
        release_quietly(state, &job.id, &reservation_id).await;
        tracing::info!(job_id = %job.id, "Job left QUEUED before extraction, reservation released");
        return Ok(());
    }
    notify_transition(state, &job.id, JobStatus::Queued, JobStatus::Extracting).await;

    if cancel_requested(state, &job.id).await? {
        cancel(state, &job.id, Some(&reservation_id)).await?;
        return Ok(());
    }

    // A failed page contributes no text and does not fail the job;
    // only a stuck extractor does.
    let extraction_timeout = Duration::from_secs(state.settings().extractor().timeout_seconds);
    let mut pages = Vec::with_capacity(files.len());
    for file in &files {
        let extracted =
            match timeout(extraction_timeout, extractor.extract(&file.bytes, &file.mime_type))
                .await
            {
                Ok(extracted) => extracted,
                Err(_) => {
                    let message = format!(
                        "extraction timed out after {}s on file {}",
                        extraction_timeout.as_secs(),
                        file.file_name
                    );
                    fail(
                        state,
                        &job.id,
                        JobErrorKind::Timeout,
                        &message,
                        Some(&reservation_id),
                    )
                    .await?;
                    return Ok(());
                }
            };

        pages.push(JobPage {
            page_number: file.position + 1,
            raw_text: extracted.text,
            extraction_failed: extracted.failed,
        });
    }
    state.store().store_pages(&job.id, &pages, now_primitive()).await?;

    if pages.iter().all(|page| page.extraction_failed) {
        fail(
            state,
            &job.id,
            JobErrorKind::NoExtractableText,
            "no text could be extracted from any page",
            Some(&reservation_id),
        )
        .await?;
        return Ok(());
    }

    if cancel_requested(state, &job.id).await? {
        cancel(state, &job.id, Some(&reservation_id)).await?;
        return Ok(());
    }

    if !state.store().begin_grading(&job.id, now_primitive()).await? {
        release_quietly(state, &job.id, &reservation_id).await;
        return Ok(());
    }
    notify_transition(state, &job.id, JobStatus::Extracting, JobStatus::Grading).await;

    let answer_key = match &job.exam_id {
        Some(exam_id) => {
            let exam = state.store().find_exam(exam_id).await?;
            match exam {
                Some(exam) => Some(exam.answer_key.0),
                None => {
                    fail(
                        state,
                        &job.id,
                        JobErrorKind::GradingFailed,
                        "exam answer key no longer exists",
                        Some(&reservation_id),
                    )
                    .await?;
                    return Ok(());
                }
            }
        }
        None => None,
    };

    let pages_text: Vec<String> = pages
        .iter()
        .filter(|page| !page.extraction_failed)
        .map(|page| page.raw_text.clone())
        .collect();

    let request = GradeRequest {
        job_id: job.id.clone(),
        pages_text,
        answer_key,
        rubric: job.rubric.clone(),
        tier: job.model_tier,
    };

    // The engine enforces a per-request timeout and retries transient
    // failures internally; the watchdog bounds the whole call chain.
    let grading = state.settings().grading();
    let watchdog = Duration::from_secs(
        grading.request_timeout_seconds * grading.max_attempts.max(1) as u64 + 15,
    );

    let outcome = match timeout(watchdog, engine.grade(request)).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(err)) => {
            fail(state, &job.id, err.error_kind(), &err.to_string(), Some(&reservation_id))
                .await?;
            return Ok(());
        }
        Err(_) => {
            let message = format!("grading timed out after {}s", watchdog.as_secs());
            fail(state, &job.id, JobErrorKind::Timeout, &message, Some(&reservation_id)).await?;
            return Ok(());
        }
    };

    let usage = ChargeUsage {
        tokens_in: outcome.tokens_in,
        tokens_out: outcome.tokens_out,
        cost_credits: outcome.cost_credits,
    };
    let charged = state
        .store()
        .charge(&reservation_id, &usage, job.model_tier, now_primitive())
        .await
        .context("Failed to charge reservation")?;
    state
        .store()
        .record_grading_outcome(&job.id, &outcome.result, charged, now_primitive())
        .await?;

    // An in-flight grading call completes and its cost stays charged
    // even when the user cancelled during the call.
    if cancel_requested(state, &job.id).await? {
        if let Some(old) = state.store().cancel_job(&job.id, now_primitive()).await? {
            notify_transition(state, &job.id, old, JobStatus::Cancelled).await;
            metrics::counter!("correction_jobs_total", "status" => "cancelled").increment(1);
            tracing::info!(job_id = %job.id, "Job cancelled after grading, cost charged");
        }
        return Ok(());
    }

    let threshold = state.settings().grading().confidence_threshold;
    let needs_validation = outcome.result.values().any(|grade| grade.confidence < threshold);

    if needs_validation {
        if state.store().await_validation(&job.id, now_primitive()).await? {
            notify_transition(state, &job.id, JobStatus::Grading, JobStatus::AwaitingValidation)
                .await;
        }
        metrics::counter!("correction_jobs_total", "status" => "awaiting_validation").increment(1);
        tracing::info!(job_id = %job.id, charged, "Job paused for human validation");
    } else {
        if state.store().complete_job(&job.id, JobStatus::Grading, now_primitive()).await? {
            notify_transition(state, &job.id, JobStatus::Grading, JobStatus::Completed).await;
        }
        metrics::counter!("correction_jobs_total", "status" => "completed").increment(1);
        tracing::info!(job_id = %job.id, charged, "Job completed");
    }

    metrics::histogram!("correction_duration_seconds").record(timer.elapsed().as_secs_f64());

    Ok(())
}

async fn cancel_requested(state: &AppState, job_id: &str) -> Result<bool> {
    let job = state.store().find_job(job_id).await.context("Failed to reload job")?;
    Ok(job.map(|job| job.cancel_requested).unwrap_or(false))
}

/// Move the job to FAILED and release the reservation in the same
/// logical step, so no reservation outlives its job.
async fn fail(
    state: &AppState,
    job_id: &str,
    kind: JobErrorKind,
    message: &str,
    reservation_id: Option<&str>,
) -> Result<()> {
    let old = state
        .store()
        .fail_job(job_id, kind, message, now_primitive())
        .await
        .context("Failed to mark job failed")?;

    if let Some(reservation_id) = reservation_id {
        release_quietly(state, job_id, reservation_id).await;
    }

    if let Some(old) = old {
        notify_transition(state, job_id, old, JobStatus::Failed).await;
        metrics::counter!("correction_jobs_total", "status" => "failed").increment(1);
        tracing::warn!(job_id, kind = ?kind, message, "Job failed");
    }

    Ok(())
}

async fn cancel(state: &AppState, job_id: &str, reservation_id: Option<&str>) -> Result<()> {
    let old = state
        .store()
        .cancel_job(job_id, now_primitive())
        .await
        .context("Failed to cancel job")?;

    if let Some(reservation_id) = reservation_id {
        release_quietly(state, job_id, reservation_id).await;
    }

    if let Some(old) = old {
        notify_transition(state, job_id, old, JobStatus::Cancelled).await;
        metrics::counter!("correction_jobs_total", "status" => "cancelled").increment(1);
        tracing::info!(job_id, from = old.as_str(), "Job cancelled by user request");
    }

    Ok(())
}

async fn release_quietly(state: &AppState, job_id: &str, reservation_id: &str) {
    if let Err(err) = state.store().release(reservation_id, now_primitive()).await {
        tracing::error!(job_id, reservation_id, error = %err, "Failed to release reservation");
    }
}
