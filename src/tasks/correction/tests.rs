use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::core::time::primitive_now_utc;
use crate::db::models::{BackgroundJob, User};
use crate::db::types::{JobErrorKind, JobStatus, ModelTier};
use crate::services::grading::{GradeOutcome, GradeRequest, GradingEngine, GradingError};
use crate::services::jobs::{self, CreateJobRequest, NewJobFile};
use crate::services::validation::{self, ResolveDecision, ResolveError};
use crate::store::memory::MemoryStore;
use crate::store::{CreditLedger, JobStore};
use crate::tasks::correction;
use crate::test_support::{
    self, grade, insert_user, outcome, FakeExtractor, ScriptedEngine, TestContext,
};

async fn queued_job(
    ctx: &TestContext,
    user: &User,
    tier: ModelTier,
    files: &[(&str, &str, &[u8])],
) -> BackgroundJob {
    let request = CreateJobRequest {
        exam_id: None,
        rubric: Some("Award one point per correct arithmetic step.".to_string()),
        model_tier: tier,
        files: files
            .iter()
            .map(|(name, mime, bytes)| NewJobFile {
                file_name: name.to_string(),
                mime_type: mime.to_string(),
                bytes: bytes.to_vec(),
            })
            .collect(),
    };
    jobs::create_job(&ctx.state, user, request).await.expect("create job")
}

async fn claim(ctx: &TestContext) -> BackgroundJob {
    correction::claim_next_job(&ctx.state).await.expect("claim").expect("job available")
}

#[tokio::test]
async fn successful_pdf_job_completes_with_one_ledger_entry() {
    let ctx = test_support::setup_test_context().await;
    let user = insert_user(&ctx.store, "teacher-1", 100).await;

    let job = queued_job(
        &ctx,
        &user,
        ModelTier::Fast,
        &[("exam.pdf", "application/pdf", b"2 + 2 = 4")],
    )
    .await;

    let claimed = claim(&ctx).await;
    assert_eq!(claimed.id, job.id);
    assert_eq!(claimed.status, JobStatus::Queued);

    let engine = ScriptedEngine::with_outcome(Ok(outcome(
        &[("q1", grade(5.0, 5.0, 0.95)), ("q2", grade(3.0, 4.0, 0.95))],
        1,
    )));
    correction::process_job(&ctx.state, &FakeExtractor::succeeding(), &engine, &claimed)
        .await
        .expect("process");

    let done = ctx.store.find_job(&job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.credits_reserved, 2);
    assert_eq!(done.credits_charged, 1);
    assert!(done.credits_charged <= done.credits_reserved);
    assert_eq!(done.pages.0.len(), 1);
    assert!(!done.pages.0[0].extraction_failed);

    // 100 - 2 reserved + 1 refund
    assert_eq!(ctx.store.balance(&user.id).await.unwrap(), 99);
    let entries = ctx.store.ledger_entries_for_job(&job.id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].cost_credits, 1);

    let threshold = ctx.state.settings().grading().confidence_threshold;
    assert!(validation::pending_questions(&done, threshold).is_empty());

    assert_eq!(
        ctx.events.transitions(),
        vec![
            (JobStatus::Queued, JobStatus::Extracting),
            (JobStatus::Extracting, JobStatus::Grading),
            (JobStatus::Grading, JobStatus::Completed),
        ]
    );
}

#[tokio::test]
async fn job_with_no_extractable_text_fails_and_releases_reservation() {
    let ctx = test_support::setup_test_context().await;
    let user = insert_user(&ctx.store, "teacher-1", 50).await;

    let job = queued_job(
        &ctx,
        &user,
        ModelTier::Quality,
        &[
            ("page1.pdf", "application/pdf", b"scan"),
            ("page2.pdf", "application/pdf", b"scan"),
        ],
    )
    .await;

    let claimed = claim(&ctx).await;
    let engine = ScriptedEngine::default();
    correction::process_job(&ctx.state, &FakeExtractor::failing(), &engine, &claimed)
        .await
        .expect("process");

    let failed = ctx.store.find_job(&job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error_kind, Some(JobErrorKind::NoExtractableText));
    assert!(failed.error_message.is_some());
    assert_eq!(failed.pages.0.len(), 2);
    assert!(failed.pages.0.iter().all(|page| page.extraction_failed));

    // Reservation fully released, nothing charged.
    assert_eq!(ctx.store.balance(&user.id).await.unwrap(), 50);
    assert!(ctx.store.ledger_entries_for_job(&job.id).await.unwrap().is_empty());

    assert_eq!(
        ctx.events.transitions(),
        vec![
            (JobStatus::Queued, JobStatus::Extracting),
            (JobStatus::Extracting, JobStatus::Failed),
        ]
    );
}

#[tokio::test]
async fn mixed_extraction_grades_with_surviving_pages() {
    let ctx = test_support::setup_test_context().await;
    let user = insert_user(&ctx.store, "teacher-1", 50).await;

    let job = queued_job(
        &ctx,
        &user,
        ModelTier::Fast,
        &[
            ("page1.pdf", "application/pdf", b"legible answer"),
            ("page2.pdf", "application/x-unreadable", b"smudged"),
        ],
    )
    .await;

    let claimed = claim(&ctx).await;
    let engine = ScriptedEngine::with_outcome(Ok(outcome(&[("q1", grade(2.0, 2.0, 0.9))], 1)));
    correction::process_job(&ctx.state, &FakeExtractor::succeeding(), &engine, &claimed)
        .await
        .expect("process");

    let done = ctx.store.find_job(&job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.pages.0[1].extraction_failed);
    assert!(!done.pages.0[0].extraction_failed);
}

#[tokio::test]
async fn low_confidence_pauses_then_resolve_completes() {
    let ctx = test_support::setup_test_context().await;
    let user = insert_user(&ctx.store, "teacher-1", 100).await;

    let job = queued_job(
        &ctx,
        &user,
        ModelTier::Fast,
        &[("exam.pdf", "application/pdf", b"an answer")],
    )
    .await;

    let claimed = claim(&ctx).await;
    let engine = ScriptedEngine::with_outcome(Ok(outcome(
        &[("q1", grade(4.0, 5.0, 0.95)), ("q2", grade(1.0, 5.0, 0.4))],
        2,
    )));
    correction::process_job(&ctx.state, &FakeExtractor::succeeding(), &engine, &claimed)
        .await
        .expect("process");

    let paused = ctx.store.find_job(&job.id).await.unwrap().unwrap();
    assert_eq!(paused.status, JobStatus::AwaitingValidation);
    let threshold = ctx.state.settings().grading().confidence_threshold;
    assert_eq!(validation::pending_questions(&paused, threshold), vec!["q2".to_string()]);

    // The cost was already charged when the pause happened.
    assert_eq!(ctx.store.ledger_entries_for_job(&job.id).await.unwrap().len(), 1);

    // A confident question is not a validation item.
    let err = validation::resolve(&ctx.state, &job.id, &user.id, "q1", ResolveDecision::AcceptAiScore)
        .await
        .unwrap_err();
    assert!(matches!(err, ResolveError::UnknownQuestion(_)));

    let resolved = validation::resolve(
        &ctx.state,
        &job.id,
        &user.id,
        "q2",
        ResolveDecision::Override { score: 3.0, note: Some("partial method credit".to_string()) },
    )
    .await
    .expect("resolve");

    assert_eq!(resolved.status, JobStatus::Completed);
    let q2 = &resolved.grading_result.0["q2"];
    let human = q2.human_override.as_ref().expect("override recorded");
    assert!(!human.accepted_ai_score);
    assert_eq!(human.score, 3.0);
    assert_eq!(q2.final_score(), 3.0);

    assert_eq!(
        ctx.events.transitions().last(),
        Some(&(JobStatus::AwaitingValidation, JobStatus::Completed))
    );
}

#[tokio::test]
async fn exam_linked_job_grades_against_the_answer_key() {
    let ctx = test_support::setup_test_context().await;
    let user = insert_user(&ctx.store, "teacher-1", 100).await;
    let exam = test_support::insert_exam(ctx.store.as_ref(), &user.id, &["q1", "q2"]).await;

    let request = CreateJobRequest {
        exam_id: Some(exam.id.clone()),
        rubric: None,
        model_tier: ModelTier::Quality,
        files: vec![NewJobFile {
            file_name: "scan.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            bytes: b"handwritten answers".to_vec(),
        }],
    };
    let job = jobs::create_job(&ctx.state, &user, request).await.expect("create job");
    assert_eq!(job.exam_id.as_deref(), Some(exam.id.as_str()));

    let claimed = claim(&ctx).await;
    let engine = ScriptedEngine::with_outcome(Ok(outcome(
        &[("q1", grade(8.0, 10.0, 0.9)), ("q2", grade(10.0, 10.0, 0.85))],
        3,
    )));
    correction::process_job(&ctx.state, &FakeExtractor::succeeding(), &engine, &claimed)
        .await
        .expect("process");

    let done = ctx.store.find_job(&job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.grading_result.0.len(), 2);
}

#[tokio::test]
async fn job_creation_rejects_foreign_exams() {
    let ctx = test_support::setup_test_context().await;
    let owner = insert_user(&ctx.store, "owner", 100).await;
    let other = insert_user(&ctx.store, "other", 100).await;
    let exam = test_support::insert_exam(ctx.store.as_ref(), &owner.id, &["q1"]).await;

    let request = CreateJobRequest {
        exam_id: Some(exam.id.clone()),
        rubric: None,
        model_tier: ModelTier::Fast,
        files: vec![NewJobFile {
            file_name: "scan.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            bytes: b"answers".to_vec(),
        }],
    };

    let err = jobs::create_job(&ctx.state, &other, request).await.unwrap_err();
    assert!(matches!(err, jobs::CreateJobError::ExamNotFound(_)));
}

#[tokio::test]
async fn resolve_is_idempotent_for_the_same_decision() {
    let ctx = test_support::setup_test_context().await;
    let user = insert_user(&ctx.store, "teacher-1", 100).await;

    let job = queued_job(&ctx, &user, ModelTier::Fast, &[("a.pdf", "application/pdf", b"x")])
        .await;
    let claimed = claim(&ctx).await;
    let engine = ScriptedEngine::with_outcome(Ok(outcome(
        &[("q1", grade(1.0, 5.0, 0.3)), ("q2", grade(2.0, 5.0, 0.2))],
        1,
    )));
    correction::process_job(&ctx.state, &FakeExtractor::succeeding(), &engine, &claimed)
        .await
        .expect("process");

    let decision = ResolveDecision::Override { score: 4.0, note: None };
    let first = validation::resolve(&ctx.state, &job.id, &user.id, "q1", decision.clone())
        .await
        .expect("first resolve");
    assert_eq!(first.status, JobStatus::AwaitingValidation);

    let second = validation::resolve(&ctx.state, &job.id, &user.id, "q1", decision)
        .await
        .expect("replayed resolve");
    assert_eq!(
        first.grading_result.0["q1"].human_override.as_ref().map(|h| h.score),
        second.grading_result.0["q1"].human_override.as_ref().map(|h| h.score)
    );

    // A different decision for an already-resolved question is rejected.
    let err = validation::resolve(
        &ctx.state,
        &job.id,
        &user.id,
        "q1",
        ResolveDecision::AcceptAiScore,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ResolveError::UnknownQuestion(_)));
}

#[tokio::test]
async fn insufficient_balance_fails_before_extracting() {
    let ctx = test_support::setup_test_context().await;
    // Fast tier reserves 2 credits per page; 1 credit is not enough.
    let user = insert_user(&ctx.store, "teacher-1", 1).await;

    let job = queued_job(&ctx, &user, ModelTier::Fast, &[("a.pdf", "application/pdf", b"x")])
        .await;

    let claimed = claim(&ctx).await;
    let engine = ScriptedEngine::default();
    correction::process_job(&ctx.state, &FakeExtractor::succeeding(), &engine, &claimed)
        .await
        .expect("process");

    let failed = ctx.store.find_job(&job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error_kind, Some(JobErrorKind::InsufficientCredits));

    // The job never reached EXTRACTING and no money moved.
    assert_eq!(ctx.events.transitions(), vec![(JobStatus::Queued, JobStatus::Failed)]);
    assert_eq!(ctx.store.balance(&user.id).await.unwrap(), 1);
    assert!(ctx.store.ledger_entries_for_job(&job.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn grading_failure_releases_reservation() {
    let ctx = test_support::setup_test_context().await;
    let user = insert_user(&ctx.store, "teacher-1", 30).await;

    let job = queued_job(&ctx, &user, ModelTier::Fast, &[("a.pdf", "application/pdf", b"x")])
        .await;
    let claimed = claim(&ctx).await;

    let engine = ScriptedEngine::with_outcome(Err(GradingError::RetriesExhausted(
        "model API returned 503".to_string(),
    )));
    correction::process_job(&ctx.state, &FakeExtractor::succeeding(), &engine, &claimed)
        .await
        .expect("process");

    let failed = ctx.store.find_job(&job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error_kind, Some(JobErrorKind::GradingFailed));
    assert_eq!(ctx.store.balance(&user.id).await.unwrap(), 30);
    assert!(ctx.store.ledger_entries_for_job(&job.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn grading_timeout_surfaces_as_timeout_kind() {
    let ctx = test_support::setup_test_context().await;
    let user = insert_user(&ctx.store, "teacher-1", 30).await;

    let job = queued_job(&ctx, &user, ModelTier::Quality, &[("a.pdf", "application/pdf", b"x")])
        .await;
    let claimed = claim(&ctx).await;

    let engine = ScriptedEngine::with_outcome(Err(GradingError::Timeout));
    correction::process_job(&ctx.state, &FakeExtractor::succeeding(), &engine, &claimed)
        .await
        .expect("process");

    let failed = ctx.store.find_job(&job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error_kind, Some(JobErrorKind::Timeout));
    assert_eq!(ctx.store.balance(&user.id).await.unwrap(), 30);
}

#[tokio::test]
async fn duplicate_claim_is_a_noop() {
    let ctx = test_support::setup_test_context().await;
    let user = insert_user(&ctx.store, "teacher-1", 100).await;
    queued_job(&ctx, &user, ModelTier::Fast, &[("a.pdf", "application/pdf", b"x")]).await;

    let first = correction::claim_next_job(&ctx.state).await.unwrap();
    assert!(first.is_some());
    let second = correction::claim_next_job(&ctx.state).await.unwrap();
    assert!(second.is_none());
}

#[tokio::test]
async fn repeated_pickup_transition_is_a_noop() {
    let ctx = test_support::setup_test_context().await;
    let user = insert_user(&ctx.store, "teacher-1", 100).await;
    let job = queued_job(&ctx, &user, ModelTier::Fast, &[("a.pdf", "application/pdf", b"x")])
        .await;

    let claimed = claim(&ctx).await;
    let engine = ScriptedEngine::with_outcome(Ok(outcome(&[("q1", grade(1.0, 1.0, 0.9))], 1)));
    correction::process_job(&ctx.state, &FakeExtractor::succeeding(), &engine, &claimed)
        .await
        .expect("process");

    // A redelivered pickup against the finished job changes nothing.
    let moved = ctx
        .store
        .begin_extracting(&job.id, "stray-reservation", 2, primitive_now_utc())
        .await
        .unwrap();
    assert!(!moved);
    let done = ctx.store.find_job(&job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
}

#[tokio::test]
async fn cancel_before_pickup_is_immediate_and_skips_claim() {
    let ctx = test_support::setup_test_context().await;
    let user = insert_user(&ctx.store, "teacher-1", 100).await;
    let job = queued_job(&ctx, &user, ModelTier::Fast, &[("a.pdf", "application/pdf", b"x")])
        .await;

    let cancelled = jobs::request_cancel(&ctx.state, &job.id, &user).await.expect("cancel");
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(ctx.events.transitions(), vec![(JobStatus::Queued, JobStatus::Cancelled)]);

    assert!(correction::claim_next_job(&ctx.state).await.unwrap().is_none());
    assert_eq!(ctx.store.balance(&user.id).await.unwrap(), 100);
}

/// Engine that files a cancellation request while the grading call is
/// in flight, mimicking a user hitting cancel mid-call.
struct CancellingEngine {
    store: Arc<MemoryStore>,
    job_id: String,
    outcome: Mutex<Option<GradeOutcome>>,
}

#[async_trait]
impl GradingEngine for CancellingEngine {
    async fn grade(&self, _request: GradeRequest) -> Result<GradeOutcome, GradingError> {
        self.store
            .request_cancel(&self.job_id, primitive_now_utc())
            .await
            .expect("request cancel");
        Ok(self
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .expect("outcome"))
    }
}

#[tokio::test]
async fn cancel_during_grading_call_still_charges_the_cost() {
    let ctx = test_support::setup_test_context().await;
    let user = insert_user(&ctx.store, "teacher-1", 100).await;
    let job = queued_job(&ctx, &user, ModelTier::Fast, &[("a.pdf", "application/pdf", b"x")])
        .await;

    let claimed = claim(&ctx).await;
    let engine = CancellingEngine {
        store: ctx.store.clone(),
        job_id: job.id.clone(),
        outcome: Mutex::new(Some(outcome(&[("q1", grade(1.0, 1.0, 0.9))], 2))),
    };
    correction::process_job(&ctx.state, &FakeExtractor::succeeding(), &engine, &claimed)
        .await
        .expect("process");

    let done = ctx.store.find_job(&job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Cancelled);
    assert_eq!(done.credits_charged, 2);

    // The upstream cost was incurred, so the ledger keeps the charge.
    let entries = ctx.store.ledger_entries_for_job(&job.id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(ctx.store.balance(&user.id).await.unwrap(), 98);
    assert_eq!(
        ctx.events.transitions().last(),
        Some(&(JobStatus::Grading, JobStatus::Cancelled))
    );
}

#[tokio::test]
async fn reaper_fails_abandoned_jobs_and_releases_reservations() {
    let ctx = test_support::setup_test_context().await;
    let user = insert_user(&ctx.store, "teacher-1", 100).await;

    let stale_at = primitive_now_utc() - time::Duration::hours(2);
    let reservation_id =
        ctx.store.reserve(&user.id, "stale-job", 5, stale_at).await.expect("reserve");

    let job = BackgroundJob {
        id: "stale-job".to_string(),
        user_id: user.id.clone(),
        exam_id: None,
        status: JobStatus::Extracting,
        model_tier: ModelTier::Fast,
        rubric: Some("rubric".to_string()),
        pages: sqlx::types::Json(Vec::new()),
        grading_result: sqlx::types::Json(Default::default()),
        credits_reserved: 5,
        credits_charged: 0,
        reservation_id: Some(reservation_id),
        cancel_requested: false,
        picked_up_at: Some(stale_at),
        error_kind: None,
        error_message: None,
        created_at: stale_at,
        updated_at: stale_at,
    };
    ctx.store.insert_job(&job, &[]).await.expect("insert stale job");

    correction::reap_stale_jobs(&ctx.state).await.expect("reap");

    let reaped = ctx.store.find_job("stale-job").await.unwrap().unwrap();
    assert_eq!(reaped.status, JobStatus::Failed);
    assert_eq!(reaped.error_kind, Some(JobErrorKind::Timeout));
    assert_eq!(ctx.store.balance(&user.id).await.unwrap(), 100);
}
