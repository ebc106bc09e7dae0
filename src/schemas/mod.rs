mod exams;
mod jobs;

pub(crate) use exams::{CreateExamPayload, CreateExamQuestion, ExamResponse};
pub(crate) use jobs::{
    CreateJobResponse, JobResponse, PendingItemResponse, ResolvePayload, ValidationViewResponse,
};

use std::collections::HashMap;

use serde::Serialize;

#[derive(Debug, Serialize)]
pub(crate) struct RootResponse {
    pub(crate) message: String,
    pub(crate) version: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub(crate) service: String,
    pub(crate) status: String,
    pub(crate) components: HashMap<String, String>,
}
