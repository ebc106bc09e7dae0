use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::time::format_primitive;
use crate::db::models::{AnswerKeyQuestion, Exam};

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct CreateExamPayload {
    #[validate(length(min = 1, max = 200))]
    pub(crate) title: String,
    #[validate(length(min = 1, max = 200), nested)]
    pub(crate) questions: Vec<CreateExamQuestion>,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub(crate) struct CreateExamQuestion {
    #[validate(length(min = 1, max = 64))]
    pub(crate) id: String,
    #[validate(length(min = 1))]
    pub(crate) prompt: String,
    pub(crate) expected_answer: String,
    #[validate(range(min = 0.0))]
    pub(crate) max_score: f64,
}

#[derive(Debug, Serialize)]
pub(crate) struct ExamResponse {
    pub(crate) id: String,
    pub(crate) title: String,
    pub(crate) questions: Vec<AnswerKeyQuestion>,
    pub(crate) created_at: String,
}

impl From<Exam> for ExamResponse {
    fn from(exam: Exam) -> Self {
        Self {
            id: exam.id,
            title: exam.title,
            questions: exam.answer_key.0,
            created_at: format_primitive(exam.created_at),
        }
    }
}
