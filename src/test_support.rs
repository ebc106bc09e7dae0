use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request},
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::core::{
    config::Settings, redis::RedisHandle, security, state::AppState, time::primitive_now_utc,
};
use crate::db::models::{AnswerKeyQuestion, Exam, QuestionGrade, User};
use crate::db::types::JobStatus;
use crate::services::extraction::{ExtractedText, TextExtractor};
use crate::services::grading::{GradeOutcome, GradeRequest, GradingEngine, GradingError};
use crate::services::notifier::{JobEventSink, JobStatusEvent};
use crate::store::memory::MemoryStore;
use crate::store::{ExamStore, Store, UserStore};

pub(crate) struct TestContext {
    pub(crate) state: AppState,
    pub(crate) store: Arc<MemoryStore>,
    pub(crate) events: Arc<RecordingSink>,
    _guard: OwnedMutexGuard<()>,
}

pub(crate) async fn env_lock() -> OwnedMutexGuard<()> {
    static LOCK: OnceLock<Arc<AsyncMutex<()>>> = OnceLock::new();
    let lock = LOCK.get_or_init(|| Arc::new(AsyncMutex::new(()))).clone();
    lock.lock_owned().await
}

pub(crate) fn set_test_env() {
    std::env::set_var("RUBRICA_ENV", "test");
    std::env::set_var("RUBRICA_STRICT_CONFIG", "0");
    std::env::set_var("SECRET_KEY", "test-secret");
    std::env::set_var("PROMETHEUS_ENABLED", "0");
    std::env::remove_var("GRADING_CONFIDENCE_THRESHOLD");
    std::env::remove_var("CREDITS_FAST_PER_PAGE");
    std::env::remove_var("CREDITS_QUALITY_PER_PAGE");
}

pub(crate) async fn setup_test_context() -> TestContext {
    let guard = env_lock().await;
    set_test_env();

    let settings = Settings::load().expect("settings");
    let store = Arc::new(MemoryStore::new());
    let events = Arc::new(RecordingSink::default());

    let redis = RedisHandle::new(settings.redis().redis_url());
    let store_dyn: Arc<dyn Store> = store.clone();
    let events_dyn: Arc<dyn JobEventSink> = events.clone();
    let state = AppState::new(settings, store_dyn, redis, events_dyn);

    TestContext { state, store, events, _guard: guard }
}

/// Collects published transition events for assertions.
#[derive(Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<JobStatusEvent>>,
}

impl RecordingSink {
    pub(crate) fn transitions(&self) -> Vec<(JobStatus, JobStatus)> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|event| (event.old_status, event.new_status))
            .collect()
    }
}

#[async_trait]
impl JobEventSink for RecordingSink {
    async fn publish(&self, event: &JobStatusEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event.clone());
    }
}

/// Extractor fake: succeeds with the file bytes as text, or fails every
/// page when constructed failing. The mime marker `application/x-unreadable`
/// fails a single page.
pub(crate) struct FakeExtractor {
    fail_all: bool,
}

impl FakeExtractor {
    pub(crate) fn succeeding() -> Self {
        Self { fail_all: false }
    }

    pub(crate) fn failing() -> Self {
        Self { fail_all: true }
    }
}

#[async_trait]
impl TextExtractor for FakeExtractor {
    async fn extract(&self, bytes: &[u8], mime_type: &str) -> ExtractedText {
        if self.fail_all || mime_type == "application/x-unreadable" {
            return ExtractedText { text: String::new(), failed: true };
        }
        ExtractedText { text: String::from_utf8_lossy(bytes).into_owned(), failed: false }
    }
}

/// Grading engine fake that replays scripted outcomes in order.
#[derive(Default)]
pub(crate) struct ScriptedEngine {
    outcomes: Mutex<VecDeque<Result<GradeOutcome, GradingError>>>,
}

impl ScriptedEngine {
    pub(crate) fn with_outcome(outcome: Result<GradeOutcome, GradingError>) -> Self {
        let engine = Self::default();
        engine.push(outcome);
        engine
    }

    pub(crate) fn push(&self, outcome: Result<GradeOutcome, GradingError>) {
        self.outcomes.lock().unwrap_or_else(PoisonError::into_inner).push_back(outcome);
    }
}

#[async_trait]
impl GradingEngine for ScriptedEngine {
    async fn grade(&self, _request: GradeRequest) -> Result<GradeOutcome, GradingError> {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| Err(GradingError::Unrecoverable("script exhausted".to_string())))
    }
}

pub(crate) fn grade(score: f64, max_score: f64, confidence: f64) -> QuestionGrade {
    QuestionGrade {
        score,
        max_score,
        confidence,
        ai_rationale: "scripted".to_string(),
        human_override: None,
    }
}

pub(crate) fn outcome(questions: &[(&str, QuestionGrade)], cost_credits: i64) -> GradeOutcome {
    let mut result = BTreeMap::new();
    for (id, question) in questions {
        result.insert(id.to_string(), question.clone());
    }
    GradeOutcome { result, tokens_in: 700, tokens_out: 300, cost_credits }
}

pub(crate) async fn insert_user(store: &MemoryStore, id: &str, balance: i64) -> User {
    let now = primitive_now_utc();
    let user = User {
        id: id.to_string(),
        display_name: format!("User {id}"),
        credit_balance: balance,
        is_active: true,
        is_admin: false,
        created_at: now,
        updated_at: now,
    };
    store.insert_user(&user).await.expect("insert user");
    user
}

pub(crate) async fn insert_exam(store: &dyn Store, owner_id: &str, question_ids: &[&str]) -> Exam {
    let now = primitive_now_utc();
    let questions = question_ids
        .iter()
        .map(|id| AnswerKeyQuestion {
            id: id.to_string(),
            prompt: format!("Question {id}"),
            expected_answer: "42".to_string(),
            max_score: 10.0,
        })
        .collect::<Vec<_>>();

    let exam = Exam {
        id: uuid::Uuid::new_v4().to_string(),
        owner_id: owner_id.to_string(),
        title: "Algebra midterm".to_string(),
        answer_key: sqlx::types::Json(questions),
        created_at: now,
        updated_at: now,
    };
    store.insert_exam(&exam).await.expect("insert exam");
    exam
}

pub(crate) fn bearer_token(user_id: &str, settings: &Settings) -> String {
    security::create_access_token(user_id, settings, None).expect("token")
}

pub(crate) fn json_request(
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<serde_json::Value>,
) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);

    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }

    if let Some(body) = body {
        let bytes = serde_json::to_vec(&body).expect("serialize body");
        builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(bytes))
            .expect("request body")
    } else {
        builder.body(Body::empty()).expect("request body")
    }
}

const MULTIPART_BOUNDARY: &str = "rubrica-test-boundary";

/// Build a multipart job-creation request by hand; tower tests have no
/// browser to do it for us.
pub(crate) fn multipart_job_request(
    uri: &str,
    token: &str,
    text_fields: &[(&str, &str)],
    files: &[(&str, &str, &[u8])],
) -> Request<Body> {
    let mut body = Vec::new();

    for (name, value) in text_fields {
        body.extend_from_slice(format!("--{MULTIPART_BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
        );
        body.extend_from_slice(value.as_bytes());
        body.extend_from_slice(b"\r\n");
    }

    for (file_name, mime_type, bytes) in files {
        body.extend_from_slice(format!("--{MULTIPART_BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"files\"; filename=\"{file_name}\"\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(format!("Content-Type: {mime_type}\r\n\r\n").as_bytes());
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }

    body.extend_from_slice(format!("--{MULTIPART_BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={MULTIPART_BOUNDARY}"),
        )
        .body(Body::from(body))
        .expect("multipart request")
}

pub(crate) async fn read_json(response: axum::response::Response<Body>) -> serde_json::Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("response body");
    serde_json::from_slice(&body).unwrap_or_else(|err| {
        let body_text = String::from_utf8_lossy(&body);
        panic!("json parse: {err}; body: {body_text}");
    })
}
