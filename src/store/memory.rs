use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use time::PrimitiveDateTime;
use uuid::Uuid;

use crate::db::models::{
    BackgroundJob, CreditLedgerEntry, Exam, HumanOverride, JobFile, JobPage, QuestionGrade, User,
};
use crate::db::types::{JobErrorKind, JobStatus, ModelTier, ReservationState};
use crate::store::{
    CancelRequestOutcome, ChargeUsage, CreditLedger, ExamStore, JobStore, LedgerError,
    OverrideOutcome, Store, StoreError, UserStore,
};

/// In-memory store with the same conditional-transition semantics as
/// the Postgres implementation. Used by tests and local development;
/// a single mutex stands in for row locks.
#[derive(Default)]
pub(crate) struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<String, User>,
    exams: HashMap<String, Exam>,
    jobs: HashMap<String, BackgroundJob>,
    files: HashMap<String, Vec<JobFile>>,
    reservations: HashMap<String, Reservation>,
    ledger: Vec<CreditLedgerEntry>,
}

struct Reservation {
    user_id: String,
    job_id: String,
    amount: i64,
    state: ReservationState,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, job: &BackgroundJob, files: &[JobFile]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.jobs.insert(job.id.clone(), job.clone());
        inner.files.insert(job.id.clone(), files.to_vec());
        Ok(())
    }

    async fn find_job(&self, job_id: &str) -> Result<Option<BackgroundJob>, StoreError> {
        Ok(self.lock().jobs.get(job_id).cloned())
    }

    async fn list_jobs_for_user(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<BackgroundJob>, StoreError> {
        let inner = self.lock();
        let mut jobs: Vec<_> =
            inner.jobs.values().filter(|job| job.user_id == user_id).cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs.into_iter().skip(offset.max(0) as usize).take(limit.max(0) as usize).collect())
    }

    async fn count_jobs_for_user(&self, user_id: &str) -> Result<i64, StoreError> {
        Ok(self.lock().jobs.values().filter(|job| job.user_id == user_id).count() as i64)
    }

    async fn list_job_files(&self, job_id: &str) -> Result<Vec<JobFile>, StoreError> {
        Ok(self.lock().files.get(job_id).cloned().unwrap_or_default())
    }

    async fn claim_next_queued(
        &self,
        now: PrimitiveDateTime,
    ) -> Result<Option<BackgroundJob>, StoreError> {
        let mut inner = self.lock();
        let candidate = inner
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Queued
                    && job.picked_up_at.is_none()
                    && !job.cancel_requested
            })
            .min_by_key(|job| job.created_at)
            .map(|job| job.id.clone());

        let Some(job_id) = candidate else {
            return Ok(None);
        };

        if let Some(job) = inner.jobs.get_mut(&job_id) {
            job.picked_up_at = Some(now);
            job.updated_at = now;
            return Ok(Some(job.clone()));
        }
        Ok(None)
    }

    async fn begin_extracting(
        &self,
        job_id: &str,
        reservation_id: &str,
        credits_reserved: i64,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(job_id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Queued {
            return Ok(false);
        }
        job.status = JobStatus::Extracting;
        job.reservation_id = Some(reservation_id.to_string());
        job.credits_reserved = credits_reserved;
        job.updated_at = now;
        Ok(true)
    }

    async fn store_pages(
        &self,
        job_id: &str,
        pages: &[JobPage],
        now: PrimitiveDateTime,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(job) = inner.jobs.get_mut(job_id) {
            job.pages.0 = pages.to_vec();
            job.updated_at = now;
        }
        Ok(())
    }

    async fn begin_grading(
        &self,
        job_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(job_id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Extracting {
            return Ok(false);
        }
        job.status = JobStatus::Grading;
        job.updated_at = now;
        Ok(true)
    }

    async fn record_grading_outcome(
        &self,
        job_id: &str,
        result: &BTreeMap<String, QuestionGrade>,
        credits_charged: i64,
        now: PrimitiveDateTime,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(job) = inner.jobs.get_mut(job_id) {
            if job.status == JobStatus::Grading {
                job.grading_result.0 = result.clone();
                job.credits_charged = credits_charged;
                job.updated_at = now;
            }
        }
        Ok(())
    }

    async fn complete_job(
        &self,
        job_id: &str,
        from: JobStatus,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(job_id) else {
            return Ok(false);
        };
        if job.status != from {
            return Ok(false);
        }
        job.status = JobStatus::Completed;
        job.updated_at = now;
        Ok(true)
    }

    async fn await_validation(
        &self,
        job_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(job_id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Grading {
            return Ok(false);
        }
        job.status = JobStatus::AwaitingValidation;
        job.updated_at = now;
        Ok(true)
    }

    async fn fail_job(
        &self,
        job_id: &str,
        kind: JobErrorKind,
        message: &str,
        now: PrimitiveDateTime,
    ) -> Result<Option<JobStatus>, StoreError> {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(job_id) else {
            return Ok(None);
        };
        if !matches!(job.status, JobStatus::Queued | JobStatus::Extracting | JobStatus::Grading) {
            return Ok(None);
        }
        let old = job.status;
        job.status = JobStatus::Failed;
        job.error_kind = Some(kind);
        job.error_message = Some(message.to_string());
        job.updated_at = now;
        Ok(Some(old))
    }

    async fn cancel_job(
        &self,
        job_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<Option<JobStatus>, StoreError> {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(job_id) else {
            return Ok(None);
        };
        if job.status.is_terminal() {
            return Ok(None);
        }
        let old = job.status;
        job.status = JobStatus::Cancelled;
        job.cancel_requested = true;
        job.updated_at = now;
        Ok(Some(old))
    }

    async fn request_cancel(
        &self,
        job_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<CancelRequestOutcome, StoreError> {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(job_id) else {
            return Ok(CancelRequestOutcome::NotFound);
        };

        if job.status.is_terminal() {
            return Ok(CancelRequestOutcome::AlreadyTerminal(job.status));
        }

        match job.status {
            JobStatus::Queued | JobStatus::AwaitingValidation => {
                let old_status = job.status;
                job.status = JobStatus::Cancelled;
                job.cancel_requested = true;
                job.updated_at = now;
                Ok(CancelRequestOutcome::Cancelled {
                    old_status,
                    reservation_id: job.reservation_id.clone(),
                })
            }
            _ => {
                job.cancel_requested = true;
                job.updated_at = now;
                Ok(CancelRequestOutcome::Deferred)
            }
        }
    }

    async fn record_override(
        &self,
        job_id: &str,
        question_id: &str,
        decision: &HumanOverride,
        now: PrimitiveDateTime,
    ) -> Result<OverrideOutcome, StoreError> {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(job_id) else {
            return Ok(OverrideOutcome::NotFound);
        };

        if job.status != JobStatus::AwaitingValidation {
            return Ok(OverrideOutcome::InvalidState(job.status));
        }

        let Some(grade) = job.grading_result.0.get_mut(question_id) else {
            return Ok(OverrideOutcome::UnknownQuestion);
        };

        match &grade.human_override {
            Some(existing) if existing.same_decision(decision) => {
                job.updated_at = now;
                Ok(OverrideOutcome::Unchanged(job.clone()))
            }
            Some(_) => Ok(OverrideOutcome::Conflict),
            None => {
                grade.human_override = Some(decision.clone());
                job.updated_at = now;
                Ok(OverrideOutcome::Applied(job.clone()))
            }
        }
    }

    async fn list_stale_active(
        &self,
        cutoff: PrimitiveDateTime,
    ) -> Result<Vec<BackgroundJob>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .jobs
            .values()
            .filter(|job| match job.status {
                JobStatus::Extracting | JobStatus::Grading => job.updated_at < cutoff,
                JobStatus::Queued => {
                    job.picked_up_at.map(|picked| picked < cutoff).unwrap_or(false)
                }
                _ => false,
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CreditLedger for MemoryStore {
    async fn balance(&self, user_id: &str) -> Result<i64, LedgerError> {
        self.lock()
            .users
            .get(user_id)
            .map(|user| user.credit_balance)
            .ok_or_else(|| LedgerError::UnknownUser(user_id.to_string()))
    }

    async fn reserve(
        &self,
        user_id: &str,
        job_id: &str,
        amount: i64,
        now: PrimitiveDateTime,
    ) -> Result<String, LedgerError> {
        let mut inner = self.lock();
        let user = inner
            .users
            .get_mut(user_id)
            .ok_or_else(|| LedgerError::UnknownUser(user_id.to_string()))?;

        if user.credit_balance < amount {
            return Err(LedgerError::InsufficientCredits {
                requested: amount,
                available: user.credit_balance,
            });
        }

        user.credit_balance -= amount;
        user.updated_at = now;

        let reservation_id = Uuid::new_v4().to_string();
        inner.reservations.insert(
            reservation_id.clone(),
            Reservation {
                user_id: user_id.to_string(),
                job_id: job_id.to_string(),
                amount,
                state: ReservationState::Held,
            },
        );
        Ok(reservation_id)
    }

    async fn charge(
        &self,
        reservation_id: &str,
        usage: &ChargeUsage,
        model_tier: ModelTier,
        now: PrimitiveDateTime,
    ) -> Result<i64, LedgerError> {
        let mut inner = self.lock();
        let Some(reservation) = inner.reservations.get_mut(reservation_id) else {
            return Err(LedgerError::UnknownReservation(reservation_id.to_string()));
        };

        if reservation.state != ReservationState::Held {
            return Ok(0);
        }

        reservation.state = ReservationState::Charged;
        let user_id = reservation.user_id.clone();
        let job_id = reservation.job_id.clone();
        let reserved = reservation.amount;

        let charged = usage.cost_credits.clamp(0, reserved);
        let refund = reserved - charged;

        if refund > 0 {
            if let Some(user) = inner.users.get_mut(&user_id) {
                user.credit_balance += refund;
                user.updated_at = now;
            }
        }

        inner.ledger.push(CreditLedgerEntry {
            id: Uuid::new_v4().to_string(),
            user_id,
            job_id,
            tokens_in: usage.tokens_in,
            tokens_out: usage.tokens_out,
            cost_credits: charged,
            model_tier,
            created_at: now,
        });

        Ok(charged)
    }

    async fn release(
        &self,
        reservation_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<i64, LedgerError> {
        let mut inner = self.lock();
        let Some(reservation) = inner.reservations.get_mut(reservation_id) else {
            return Err(LedgerError::UnknownReservation(reservation_id.to_string()));
        };

        if reservation.state != ReservationState::Held {
            return Ok(0);
        }

        reservation.state = ReservationState::Released;
        let user_id = reservation.user_id.clone();
        let amount = reservation.amount;

        if let Some(user) = inner.users.get_mut(&user_id) {
            user.credit_balance += amount;
            user.updated_at = now;
        }

        Ok(amount)
    }

    async fn ledger_entries_for_job(
        &self,
        job_id: &str,
    ) -> Result<Vec<CreditLedgerEntry>, LedgerError> {
        Ok(self.lock().ledger.iter().filter(|entry| entry.job_id == job_id).cloned().collect())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.lock().users.get(user_id).cloned())
    }

    async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.users.entry(user.id.clone()).or_insert_with(|| user.clone());
        Ok(())
    }
}

#[async_trait]
impl ExamStore for MemoryStore {
    async fn insert_exam(&self, exam: &Exam) -> Result<(), StoreError> {
        self.lock().exams.insert(exam.id.clone(), exam.clone());
        Ok(())
    }

    async fn find_exam(&self, exam_id: &str) -> Result<Option<Exam>, StoreError> {
        Ok(self.lock().exams.get(exam_id).cloned())
    }

    async fn list_exams_for_user(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Exam>, StoreError> {
        let inner = self.lock();
        let mut exams: Vec<_> =
            inner.exams.values().filter(|exam| exam.owner_id == user_id).cloned().collect();
        exams.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(exams.into_iter().skip(offset.max(0) as usize).take(limit.max(0) as usize).collect())
    }

    async fn count_exams_for_user(&self, user_id: &str) -> Result<i64, StoreError> {
        Ok(self.lock().exams.values().filter(|exam| exam.owner_id == user_id).count() as i64)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn health(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
