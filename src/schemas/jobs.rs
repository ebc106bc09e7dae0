use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::time::format_primitive;
use crate::db::models::{BackgroundJob, JobPage, QuestionGrade};
use crate::db::types::{JobErrorKind, JobStatus, ModelTier};

#[derive(Debug, Serialize)]
pub(crate) struct CreateJobResponse {
    pub(crate) job_id: String,
    pub(crate) status: JobStatus,
}

#[derive(Debug, Serialize)]
pub(crate) struct JobResponse {
    pub(crate) id: String,
    pub(crate) exam_id: Option<String>,
    pub(crate) status: JobStatus,
    pub(crate) model_tier: ModelTier,
    pub(crate) rubric: Option<String>,
    pub(crate) pages: Vec<JobPage>,
    pub(crate) grading_result: BTreeMap<String, QuestionGrade>,
    pub(crate) total_score: f64,
    pub(crate) max_total_score: f64,
    pub(crate) credits_reserved: i64,
    pub(crate) credits_charged: i64,
    pub(crate) error_kind: Option<JobErrorKind>,
    pub(crate) error_message: Option<String>,
    pub(crate) created_at: String,
    pub(crate) updated_at: String,
}

impl From<BackgroundJob> for JobResponse {
    fn from(job: BackgroundJob) -> Self {
        let total_score = job.grading_result.0.values().map(QuestionGrade::final_score).sum();
        let max_total_score = job.grading_result.0.values().map(|grade| grade.max_score).sum();
        Self {
            id: job.id,
            exam_id: job.exam_id,
            status: job.status,
            model_tier: job.model_tier,
            rubric: job.rubric,
            pages: job.pages.0,
            grading_result: job.grading_result.0,
            total_score,
            max_total_score,
            credits_reserved: job.credits_reserved,
            credits_charged: job.credits_charged,
            error_kind: job.error_kind,
            error_message: job.error_message,
            created_at: format_primitive(job.created_at),
            updated_at: format_primitive(job.updated_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct PendingItemResponse {
    pub(crate) question_id: String,
    pub(crate) score: f64,
    pub(crate) max_score: f64,
    pub(crate) confidence: f64,
    pub(crate) ai_rationale: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct ValidationViewResponse {
    pub(crate) job: JobResponse,
    pub(crate) pending_items: Vec<PendingItemResponse>,
}

/// Decision body for resolving one validation item.
#[derive(Debug, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub(crate) enum ResolvePayload {
    Accept,
    Override { score: f64, note: Option<String> },
}
