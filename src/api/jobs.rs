use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::api::errors::ApiError;
use crate::api::guards::CurrentUser;
use crate::api::pagination::{PaginatedResponse, PaginationParams};
use crate::core::state::AppState;
use crate::db::types::{JobStatus, ModelTier};
use crate::schemas::{
    CreateJobResponse, JobResponse, PendingItemResponse, ResolvePayload, ValidationViewResponse,
};
use crate::services::jobs::{self, CreateJobRequest, NewJobFile};
use crate::services::validation::{self, ResolveDecision};
use crate::store::JobStore;


pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_job).get(list_jobs))
        .route("/:job_id", get(get_job))
        .route("/:job_id/cancel", post(cancel_job))
        .route("/:job_id/validation", get(validation_view))
        .route("/:job_id/validation/:question_id", post(resolve_question))
}

async fn create_job(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<CreateJobResponse>), ApiError> {
    let rate_key = format!("jobs:create:{}", user.id);
    let allowed = state
        .redis()
        .rate_limit(&rate_key, state.settings().upload().jobs_per_minute, 60)
        .await
        .unwrap_or(true);
    if !allowed {
        return Err(ApiError::TooManyRequests("Too many job submissions, slow down"));
    }

    let mut exam_id = None;
    let mut rubric = None;
    let mut model_tier: Option<ModelTier> = None;
    let mut files = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(format!("invalid multipart body: {err}")))?
    {
        let name = field.name().map(ToString::to_string);
        match name.as_deref() {
            Some("files") => {
                let file_name =
                    field.file_name().map(ToString::to_string).unwrap_or_else(|| "upload".into());
                let mime_type = field
                    .content_type()
                    .map(ToString::to_string)
                    .ok_or_else(|| {
                        ApiError::BadRequest(format!("file {file_name} is missing a content type"))
                    })?;
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| ApiError::BadRequest(format!("failed to read upload: {err}")))?;
                files.push(NewJobFile { file_name, mime_type, bytes: bytes.to_vec() });
            }
            Some("exam_id") => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| ApiError::BadRequest(format!("invalid exam_id: {err}")))?;
                if !value.trim().is_empty() {
                    exam_id = Some(value.trim().to_string());
                }
            }
            Some("rubric") => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| ApiError::BadRequest(format!("invalid rubric: {err}")))?;
                if !value.trim().is_empty() {
                    rubric = Some(value);
                }
            }
            Some("model_tier") => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| ApiError::BadRequest(format!("invalid model_tier: {err}")))?;
                model_tier = Some(value.trim().parse().map_err(ApiError::BadRequest)?);
            }
            _ => {}
        }
    }

    let model_tier =
        model_tier.ok_or_else(|| ApiError::BadRequest("model_tier is required".to_string()))?;

    let request = CreateJobRequest { exam_id, rubric, model_tier, files };
    let job = jobs::create_job(&state, &user, request).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateJobResponse { job_id: job.id, status: job.status }),
    ))
}

async fn list_jobs(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(params): Query<PaginationParams>,
) -> Result<Json<PaginatedResponse<JobResponse>>, ApiError> {
    let (skip, limit) = params.clamped();

    let jobs = state
        .store()
        .list_jobs_for_user(&user.id, limit, skip)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to list jobs"))?;
    let total_count = state
        .store()
        .count_jobs_for_user(&user.id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to count jobs"))?;

    Ok(Json(PaginatedResponse {
        items: jobs.into_iter().map(JobResponse::from).collect(),
        total_count,
        skip,
        limit,
    }))
}

async fn get_job(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = jobs::get_job_for_user(&state, &job_id, &user).await?;
    Ok(Json(job.into()))
}

async fn cancel_job(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = jobs::request_cancel(&state, &job_id, &user).await?;
    Ok(Json(job.into()))
}

async fn validation_view(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(job_id): Path<String>,
) -> Result<Json<ValidationViewResponse>, ApiError> {
    let job = jobs::get_job_for_user(&state, &job_id, &user).await?;

    if job.status != JobStatus::AwaitingValidation {
        return Err(ApiError::Conflict(format!(
            "Job is not awaiting validation (status: {})",
            job.status.as_str()
        )));
    }

    let threshold = state.settings().grading().confidence_threshold;
    let pending_items = validation::pending_questions(&job, threshold)
        .into_iter()
        .filter_map(|question_id| {
            job.grading_result.0.get(&question_id).map(|grade| PendingItemResponse {
                question_id,
                score: grade.score,
                max_score: grade.max_score,
                confidence: grade.confidence,
                ai_rationale: grade.ai_rationale.clone(),
            })
        })
        .collect();

    Ok(Json(ValidationViewResponse { job: job.into(), pending_items }))
}

async fn resolve_question(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path((job_id, question_id)): Path<(String, String)>,
    Json(payload): Json<ResolvePayload>,
) -> Result<Json<JobResponse>, ApiError> {
    let decision = match payload {
        ResolvePayload::Accept => ResolveDecision::AcceptAiScore,
        ResolvePayload::Override { score, note } => {
            if !score.is_finite() || score < 0.0 {
                return Err(ApiError::BadRequest(
                    "override score must be a non-negative number".to_string(),
                ));
            }
            ResolveDecision::Override { score, note }
        }
    };

    let job = validation::resolve(&state, &job_id, &user.id, &question_id, decision).await?;
    Ok(Json(job.into()))
}
