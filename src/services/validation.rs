use thiserror::Error;

use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::db::models::{BackgroundJob, HumanOverride};
use crate::db::types::JobStatus;
use crate::services::jobs::notify_transition;
use crate::store::{JobStore, OverrideOutcome, StoreError};

/// A teacher's verdict on one low-confidence question.
#[derive(Debug, Clone)]
pub(crate) enum ResolveDecision {
    AcceptAiScore,
    Override { score: f64, note: Option<String> },
}

#[derive(Debug, Error)]
pub(crate) enum ResolveError {
    #[error("job not found")]
    NotFound,
    #[error("job belongs to another user")]
    Forbidden,
    #[error("job is not awaiting validation (status: {})", .0.as_str())]
    InvalidState(JobStatus),
    #[error("question {0} is not pending validation")]
    UnknownQuestion(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Questions whose AI confidence fell below the threshold and have no
/// human decision yet.
pub(crate) fn pending_questions(job: &BackgroundJob, threshold: f64) -> Vec<String> {
    job.grading_result
        .0
        .iter()
        .filter(|(_, grade)| grade.confidence < threshold && grade.human_override.is_none())
        .map(|(id, _)| id.clone())
        .collect()
}

/// Fold a human decision into the job's grading result. Replaying the
/// identical decision is accepted as a no-op; once the last pending
/// question resolves the job moves to COMPLETED.
pub(crate) async fn resolve(
    state: &AppState,
    job_id: &str,
    user_id: &str,
    question_id: &str,
    decision: ResolveDecision,
) -> Result<BackgroundJob, ResolveError> {
    let threshold = state.settings().grading().confidence_threshold;

    let job = state.store().find_job(job_id).await?.ok_or(ResolveError::NotFound)?;
    if job.user_id != user_id {
        return Err(ResolveError::Forbidden);
    }
    if job.status != JobStatus::AwaitingValidation {
        return Err(ResolveError::InvalidState(job.status));
    }

    let grade = job
        .grading_result
        .0
        .get(question_id)
        .ok_or_else(|| ResolveError::UnknownQuestion(question_id.to_string()))?;

    // Confident questions never were validation items.
    if grade.confidence >= threshold && grade.human_override.is_none() {
        return Err(ResolveError::UnknownQuestion(question_id.to_string()));
    }

    let now = primitive_now_utc();
    let record = match decision {
        ResolveDecision::AcceptAiScore => HumanOverride {
            accepted_ai_score: true,
            score: grade.score,
            note: None,
            decided_at: now,
        },
        ResolveDecision::Override { score, note } => HumanOverride {
            accepted_ai_score: false,
            score,
            note,
            decided_at: now,
        },
    };

    let updated = match state.store().record_override(job_id, question_id, &record, now).await? {
        OverrideOutcome::Applied(job) => {
            tracing::info!(
                job_id,
                question_id,
                accepted = record.accepted_ai_score,
                "Validation decision recorded"
            );
            metrics::counter!("validation_decisions_total").increment(1);
            job
        }
        OverrideOutcome::Unchanged(job) => job,
        OverrideOutcome::Conflict | OverrideOutcome::UnknownQuestion => {
            return Err(ResolveError::UnknownQuestion(question_id.to_string()))
        }
        OverrideOutcome::InvalidState(status) => return Err(ResolveError::InvalidState(status)),
        OverrideOutcome::NotFound => return Err(ResolveError::NotFound),
    };

    if pending_questions(&updated, threshold).is_empty() {
        let completed =
            state.store().complete_job(job_id, JobStatus::AwaitingValidation, now).await?;
        if completed {
            notify_transition(state, job_id, JobStatus::AwaitingValidation, JobStatus::Completed)
                .await;
            tracing::info!(job_id, "All validation items resolved, job completed");
        }
        return Ok(state.store().find_job(job_id).await?.ok_or(ResolveError::NotFound)?);
    }

    Ok(updated)
}
