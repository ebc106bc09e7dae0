pub(crate) mod memory;
pub(crate) mod postgres;

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;
use time::PrimitiveDateTime;

use crate::db::models::{
    BackgroundJob, CreditLedgerEntry, Exam, HumanOverride, JobFile, JobPage, QuestionGrade, User,
};
use crate::db::types::{JobErrorKind, JobStatus, ModelTier};

#[derive(Debug, Error)]
pub(crate) enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub(crate) enum LedgerError {
    #[error("insufficient credits: requested {requested}, available {available}")]
    InsufficientCredits { requested: i64, available: i64 },
    #[error("unknown user: {0}")]
    UnknownUser(String),
    #[error("unknown reservation: {0}")]
    UnknownReservation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store(StoreError::Database(err))
    }
}

/// Token usage reported by the grading engine for one charged job.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChargeUsage {
    pub(crate) tokens_in: i64,
    pub(crate) tokens_out: i64,
    pub(crate) cost_credits: i64,
}

/// What a cancellation request did to the job.
#[derive(Debug)]
pub(crate) enum CancelRequestOutcome {
    /// The job had no active worker and was cancelled on the spot.
    Cancelled { old_status: JobStatus, reservation_id: Option<String> },
    /// A worker owns the job; the flag is set and the worker finalizes
    /// the cancellation between stages.
    Deferred,
    AlreadyTerminal(JobStatus),
    NotFound,
}

#[derive(Debug)]
pub(crate) enum OverrideOutcome {
    Applied(BackgroundJob),
    /// The identical decision was already recorded; only `updated_at`
    /// moved.
    Unchanged(BackgroundJob),
    /// A different decision exists for this question.
    Conflict,
    UnknownQuestion,
    InvalidState(JobStatus),
    NotFound,
}

#[async_trait]
pub(crate) trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &BackgroundJob, files: &[JobFile]) -> Result<(), StoreError>;

    async fn find_job(&self, job_id: &str) -> Result<Option<BackgroundJob>, StoreError>;

    async fn list_jobs_for_user(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<BackgroundJob>, StoreError>;

    async fn count_jobs_for_user(&self, user_id: &str) -> Result<i64, StoreError>;

    async fn list_job_files(&self, job_id: &str) -> Result<Vec<JobFile>, StoreError>;

    /// Exclusively claim the oldest unclaimed QUEUED job. The claim
    /// stamps `picked_up_at` without changing `status`: the reservation
    /// still has to succeed before the job enters EXTRACTING.
    async fn claim_next_queued(
        &self,
        now: PrimitiveDateTime,
    ) -> Result<Option<BackgroundJob>, StoreError>;

    /// QUEUED -> EXTRACTING, recording the credit reservation. Returns
    /// false when the job is no longer QUEUED (e.g. cancelled between
    /// claim and reserve).
    async fn begin_extracting(
        &self,
        job_id: &str,
        reservation_id: &str,
        credits_reserved: i64,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError>;

    async fn store_pages(
        &self,
        job_id: &str,
        pages: &[JobPage],
        now: PrimitiveDateTime,
    ) -> Result<(), StoreError>;

    /// EXTRACTING -> GRADING.
    async fn begin_grading(&self, job_id: &str, now: PrimitiveDateTime)
        -> Result<bool, StoreError>;

    /// Persist the grading result and the charged amount while the job
    /// is still GRADING; routing to a terminal/pause status follows as
    /// a separate conditional transition.
    async fn record_grading_outcome(
        &self,
        job_id: &str,
        result: &BTreeMap<String, QuestionGrade>,
        credits_charged: i64,
        now: PrimitiveDateTime,
    ) -> Result<(), StoreError>;

    /// `from` -> COMPLETED.
    async fn complete_job(
        &self,
        job_id: &str,
        from: JobStatus,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError>;

    /// GRADING -> AWAITING_VALIDATION.
    async fn await_validation(
        &self,
        job_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError>;

    /// Any of QUEUED/EXTRACTING/GRADING -> FAILED. Returns the previous
    /// status, or None when the job was not in a failable state (a
    /// duplicate delivery hitting a terminal job is a no-op).
    async fn fail_job(
        &self,
        job_id: &str,
        kind: JobErrorKind,
        message: &str,
        now: PrimitiveDateTime,
    ) -> Result<Option<JobStatus>, StoreError>;

    /// Any non-terminal status -> CANCELLED. Returns the previous
    /// status, or None for a job already terminal.
    async fn cancel_job(
        &self,
        job_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<Option<JobStatus>, StoreError>;

    async fn request_cancel(
        &self,
        job_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<CancelRequestOutcome, StoreError>;

    async fn record_override(
        &self,
        job_id: &str,
        question_id: &str,
        decision: &HumanOverride,
        now: PrimitiveDateTime,
    ) -> Result<OverrideOutcome, StoreError>;

    /// Jobs that look abandoned by their worker: EXTRACTING/GRADING
    /// without progress since `cutoff`, or claimed-but-QUEUED jobs whose
    /// claim is older than `cutoff`.
    async fn list_stale_active(
        &self,
        cutoff: PrimitiveDateTime,
    ) -> Result<Vec<BackgroundJob>, StoreError>;
}

#[async_trait]
pub(crate) trait CreditLedger: Send + Sync {
    async fn balance(&self, user_id: &str) -> Result<i64, LedgerError>;

    /// Atomically hold `amount` credits against the user's balance.
    /// Two concurrent reservations never both succeed when their
    /// combined amount exceeds the balance.
    async fn reserve(
        &self,
        user_id: &str,
        job_id: &str,
        amount: i64,
        now: PrimitiveDateTime,
    ) -> Result<String, LedgerError>;

    /// Settle a held reservation: charge the actual cost (capped at the
    /// reserved amount), refund the difference, and append one ledger
    /// entry. A reservation that is no longer held is left untouched
    /// and 0 is returned.
    async fn charge(
        &self,
        reservation_id: &str,
        usage: &ChargeUsage,
        model_tier: ModelTier,
        now: PrimitiveDateTime,
    ) -> Result<i64, LedgerError>;

    /// Return the full held amount to the balance. Idempotent: calling
    /// it on an already-charged or already-released reservation is a
    /// no-op returning 0.
    async fn release(&self, reservation_id: &str, now: PrimitiveDateTime)
        -> Result<i64, LedgerError>;

    async fn ledger_entries_for_job(
        &self,
        job_id: &str,
    ) -> Result<Vec<CreditLedgerEntry>, LedgerError>;
}

#[async_trait]
pub(crate) trait UserStore: Send + Sync {
    async fn find_user(&self, user_id: &str) -> Result<Option<User>, StoreError>;

    async fn insert_user(&self, user: &User) -> Result<(), StoreError>;
}

#[async_trait]
pub(crate) trait ExamStore: Send + Sync {
    async fn insert_exam(&self, exam: &Exam) -> Result<(), StoreError>;

    async fn find_exam(&self, exam_id: &str) -> Result<Option<Exam>, StoreError>;

    async fn list_exams_for_user(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Exam>, StoreError>;

    async fn count_exams_for_user(&self, user_id: &str) -> Result<i64, StoreError>;
}

#[async_trait]
pub(crate) trait Store: JobStore + CreditLedger + UserStore + ExamStore {
    async fn health(&self) -> Result<(), StoreError>;
}
