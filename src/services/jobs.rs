use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::db::models::{BackgroundJob, JobFile, User};
use crate::db::types::{JobStatus, ModelTier};
use crate::services::grading;
use crate::services::notifier::JobStatusEvent;
use crate::store::{CancelRequestOutcome, CreditLedger, ExamStore, JobStore, StoreError};

#[derive(Debug)]
pub(crate) struct NewJobFile {
    pub(crate) file_name: String,
    pub(crate) mime_type: String,
    pub(crate) bytes: Vec<u8>,
}

#[derive(Debug)]
pub(crate) struct CreateJobRequest {
    pub(crate) exam_id: Option<String>,
    pub(crate) rubric: Option<String>,
    pub(crate) model_tier: ModelTier,
    pub(crate) files: Vec<NewJobFile>,
}

#[derive(Debug, Error)]
pub(crate) enum CreateJobError {
    #[error("at least one file is required")]
    NoFiles,
    #[error("file {0} is empty")]
    EmptyFile(String),
    #[error("too many files: {count} exceeds the limit of {limit}")]
    TooManyFiles { count: usize, limit: u64 },
    #[error("unknown exam: {0}")]
    ExamNotFound(String),
    #[error("an exam id or a freeform rubric is required")]
    MissingRubric,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub(crate) enum JobQueryError {
    #[error("job not found")]
    NotFound,
    #[error("job belongs to another user")]
    Forbidden,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Create a QUEUED job and persist the uploaded files. Processing
/// happens asynchronously in the worker pool.
pub(crate) async fn create_job(
    state: &AppState,
    user: &User,
    request: CreateJobRequest,
) -> Result<BackgroundJob, CreateJobError> {
    if request.files.is_empty() {
        return Err(CreateJobError::NoFiles);
    }

    let limit = state.settings().upload().max_files_per_job;
    if request.files.len() as u64 > limit {
        return Err(CreateJobError::TooManyFiles { count: request.files.len(), limit });
    }

    for file in &request.files {
        if file.bytes.is_empty() {
            return Err(CreateJobError::EmptyFile(file.file_name.clone()));
        }
    }

    if let Some(exam_id) = &request.exam_id {
        let exam = state.store().find_exam(exam_id).await?;
        // Treat another user's exam as nonexistent.
        match exam {
            Some(exam) if exam.owner_id == user.id => {}
            _ => return Err(CreateJobError::ExamNotFound(exam_id.clone())),
        }
    } else if request.rubric.as_deref().map(str::trim).unwrap_or("").is_empty() {
        return Err(CreateJobError::MissingRubric);
    }

    let now = primitive_now_utc();
    let job_id = Uuid::new_v4().to_string();

    let files: Vec<JobFile> = request
        .files
        .iter()
        .enumerate()
        .map(|(index, file)| JobFile {
            job_id: job_id.clone(),
            position: index as i32,
            file_name: file.file_name.clone(),
            mime_type: file.mime_type.clone(),
            sha256: hex::encode(Sha256::digest(&file.bytes)),
            bytes: file.bytes.clone(),
        })
        .collect();

    let job = BackgroundJob {
        id: job_id,
        user_id: user.id.clone(),
        exam_id: request.exam_id,
        status: JobStatus::Queued,
        model_tier: request.model_tier,
        rubric: request.rubric,
        pages: sqlx::types::Json(Vec::new()),
        grading_result: sqlx::types::Json(Default::default()),
        credits_reserved: 0,
        credits_charged: 0,
        reservation_id: None,
        cancel_requested: false,
        picked_up_at: None,
        error_kind: None,
        error_message: None,
        created_at: now,
        updated_at: now,
    };

    state.store().insert_job(&job, &files).await?;

    metrics::counter!("jobs_created_total", "tier" => request.model_tier.as_str()).increment(1);
    tracing::info!(
        job_id = %job.id,
        user_id = %user.id,
        tier = request.model_tier.as_str(),
        files = files.len(),
        "Job queued"
    );

    Ok(job)
}

pub(crate) async fn get_job_for_user(
    state: &AppState,
    job_id: &str,
    user: &User,
) -> Result<BackgroundJob, JobQueryError> {
    let job = state.store().find_job(job_id).await?.ok_or(JobQueryError::NotFound)?;

    if job.user_id != user.id && !user.is_admin {
        return Err(JobQueryError::Forbidden);
    }

    Ok(job)
}

/// Emit a transition event. Delivery is best-effort: failures are
/// logged inside the sink and never bubble up into the transition.
pub(crate) async fn notify_transition(
    state: &AppState,
    job_id: &str,
    old_status: JobStatus,
    new_status: JobStatus,
) {
    metrics::counter!(
        "job_transitions_total",
        "from" => old_status.as_str(),
        "to" => new_status.as_str()
    )
    .increment(1);

    let event = JobStatusEvent::new(job_id, old_status, new_status, primitive_now_utc());
    state.events().publish(&event).await;
}

/// Cooperative cancellation. Idle jobs (QUEUED, AWAITING_VALIDATION)
/// cancel immediately and any held reservation is released; jobs owned
/// by a worker get flagged and the worker finalizes between stages.
pub(crate) async fn request_cancel(
    state: &AppState,
    job_id: &str,
    user: &User,
) -> Result<BackgroundJob, JobQueryError> {
    // Ownership check up front so a foreign job never reveals state.
    get_job_for_user(state, job_id, user).await?;

    let now = primitive_now_utc();
    match state.store().request_cancel(job_id, now).await? {
        CancelRequestOutcome::Cancelled { old_status, reservation_id } => {
            if let Some(reservation_id) = reservation_id {
                if let Err(err) = state.store().release(&reservation_id, now).await {
                    tracing::error!(job_id, error = %err, "Failed to release reservation on cancel");
                }
            }
            notify_transition(state, job_id, old_status, JobStatus::Cancelled).await;
            tracing::info!(job_id, from = old_status.as_str(), "Job cancelled");
        }
        CancelRequestOutcome::Deferred => {
            tracing::info!(job_id, "Cancellation flagged, worker will finalize");
        }
        CancelRequestOutcome::AlreadyTerminal(status) => {
            tracing::debug!(job_id, status = status.as_str(), "Cancel on terminal job ignored");
        }
        CancelRequestOutcome::NotFound => return Err(JobQueryError::NotFound),
    }

    state.store().find_job(job_id).await?.ok_or(JobQueryError::NotFound)
}

/// Pre-flight estimate for the credit reservation, based on tier and
/// upload size.
pub(crate) fn estimate_reservation(state: &AppState, tier: ModelTier, page_count: usize) -> i64 {
    grading::estimated_cost(state.settings(), tier, page_count)
}
