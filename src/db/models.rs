use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use time::PrimitiveDateTime;

use crate::db::types::{JobErrorKind, JobStatus, ModelTier};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct User {
    pub(crate) id: String,
    pub(crate) display_name: String,
    pub(crate) credit_balance: i64,
    pub(crate) is_active: bool,
    pub(crate) is_admin: bool,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Exam {
    pub(crate) id: String,
    pub(crate) owner_id: String,
    pub(crate) title: String,
    pub(crate) answer_key: Json<Vec<AnswerKeyQuestion>>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

/// One graded question of an exam's answer key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AnswerKeyQuestion {
    pub(crate) id: String,
    pub(crate) prompt: String,
    pub(crate) expected_answer: String,
    pub(crate) max_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct BackgroundJob {
    pub(crate) id: String,
    pub(crate) user_id: String,
    pub(crate) exam_id: Option<String>,
    pub(crate) status: JobStatus,
    pub(crate) model_tier: ModelTier,
    pub(crate) rubric: Option<String>,
    pub(crate) pages: Json<Vec<JobPage>>,
    pub(crate) grading_result: Json<BTreeMap<String, QuestionGrade>>,
    pub(crate) credits_reserved: i64,
    pub(crate) credits_charged: i64,
    pub(crate) reservation_id: Option<String>,
    pub(crate) cancel_requested: bool,
    pub(crate) picked_up_at: Option<PrimitiveDateTime>,
    pub(crate) error_kind: Option<JobErrorKind>,
    pub(crate) error_message: Option<String>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct JobPage {
    pub(crate) page_number: i32,
    pub(crate) raw_text: String,
    pub(crate) extraction_failed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct QuestionGrade {
    pub(crate) score: f64,
    pub(crate) max_score: f64,
    pub(crate) confidence: f64,
    pub(crate) ai_rationale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) human_override: Option<HumanOverride>,
}

impl QuestionGrade {
    /// The score that counts: a human decision wins over the AI's.
    pub(crate) fn final_score(&self) -> f64 {
        self.human_override.as_ref().map_or(self.score, |decision| decision.score)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct HumanOverride {
    pub(crate) accepted_ai_score: bool,
    pub(crate) score: f64,
    pub(crate) note: Option<String>,
    pub(crate) decided_at: PrimitiveDateTime,
}

impl HumanOverride {
    /// Two override records express the same decision when everything
    /// but the timestamp matches.
    pub(crate) fn same_decision(&self, other: &Self) -> bool {
        self.accepted_ai_score == other.accepted_ai_score
            && self.score == other.score
            && self.note == other.note
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct JobFile {
    pub(crate) job_id: String,
    pub(crate) position: i32,
    pub(crate) file_name: String,
    pub(crate) mime_type: String,
    pub(crate) sha256: String,
    pub(crate) bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub(crate) struct CreditLedgerEntry {
    pub(crate) id: String,
    pub(crate) user_id: String,
    pub(crate) job_id: String,
    pub(crate) tokens_in: i64,
    pub(crate) tokens_out: i64,
    pub(crate) cost_credits: i64,
    pub(crate) model_tier: ModelTier,
    pub(crate) created_at: PrimitiveDateTime,
}
