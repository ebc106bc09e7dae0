use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
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

/// Production store backed by Postgres. Claiming and all status
/// transitions are conditional updates so that concurrent workers and
/// duplicate deliveries cannot double-apply effects.
#[derive(Clone)]
pub(crate) struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn insert_job(&self, job: &BackgroundJob, files: &[JobFile]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO background_jobs (
                 id, user_id, exam_id, status, model_tier, rubric, pages, grading_result,
                 credits_reserved, credits_charged, reservation_id, cancel_requested,
                 picked_up_at, error_kind, error_message, created_at, updated_at
             )
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)",
        )
        .bind(&job.id)
        .bind(&job.user_id)
        .bind(&job.exam_id)
        .bind(job.status)
        .bind(job.model_tier)
        .bind(&job.rubric)
        .bind(&job.pages)
        .bind(&job.grading_result)
        .bind(job.credits_reserved)
        .bind(job.credits_charged)
        .bind(&job.reservation_id)
        .bind(job.cancel_requested)
        .bind(job.picked_up_at)
        .bind(job.error_kind)
        .bind(&job.error_message)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await?;

        for file in files {
            sqlx::query(
                "INSERT INTO job_files (job_id, position, file_name, mime_type, sha256, bytes)
                 VALUES ($1,$2,$3,$4,$5,$6)",
            )
            .bind(&file.job_id)
            .bind(file.position)
            .bind(&file.file_name)
            .bind(&file.mime_type)
            .bind(&file.sha256)
            .bind(&file.bytes)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn find_job(&self, job_id: &str) -> Result<Option<BackgroundJob>, StoreError> {
        let job = sqlx::query_as::<_, BackgroundJob>(
            "SELECT * FROM background_jobs WHERE id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn list_jobs_for_user(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<BackgroundJob>, StoreError> {
        let jobs = sqlx::query_as::<_, BackgroundJob>(
            "SELECT * FROM background_jobs
             WHERE user_id = $1
             ORDER BY created_at DESC
             LIMIT $2 OFFSET $3",
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn count_jobs_for_user(&self, user_id: &str) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM background_jobs WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn list_job_files(&self, job_id: &str) -> Result<Vec<JobFile>, StoreError> {
        let files = sqlx::query_as::<_, JobFile>(
            "SELECT * FROM job_files WHERE job_id = $1 ORDER BY position",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(files)
    }

    async fn claim_next_queued(
        &self,
        now: PrimitiveDateTime,
    ) -> Result<Option<BackgroundJob>, StoreError> {
        let job = sqlx::query_as::<_, BackgroundJob>(
            "WITH candidate AS (
                SELECT id FROM background_jobs
                WHERE status = $1
                  AND picked_up_at IS NULL
                  AND cancel_requested = FALSE
                ORDER BY created_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            UPDATE background_jobs j
            SET picked_up_at = $2, updated_at = $2
            FROM candidate
            WHERE j.id = candidate.id
            RETURNING j.*",
        )
        .bind(JobStatus::Queued)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn begin_extracting(
        &self,
        job_id: &str,
        reservation_id: &str,
        credits_reserved: i64,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            "UPDATE background_jobs
             SET status = $1, reservation_id = $2, credits_reserved = $3, updated_at = $4
             WHERE id = $5 AND status = $6",
        )
        .bind(JobStatus::Extracting)
        .bind(reservation_id)
        .bind(credits_reserved)
        .bind(now)
        .bind(job_id)
        .bind(JobStatus::Queued)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() > 0)
    }

    async fn store_pages(
        &self,
        job_id: &str,
        pages: &[JobPage],
        now: PrimitiveDateTime,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE background_jobs SET pages = $1, updated_at = $2 WHERE id = $3",
        )
        .bind(Json(pages))
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn begin_grading(
        &self,
        job_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            "UPDATE background_jobs SET status = $1, updated_at = $2
             WHERE id = $3 AND status = $4",
        )
        .bind(JobStatus::Grading)
        .bind(now)
        .bind(job_id)
        .bind(JobStatus::Extracting)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() > 0)
    }

    async fn record_grading_outcome(
        &self,
        job_id: &str,
        result: &BTreeMap<String, QuestionGrade>,
        credits_charged: i64,
        now: PrimitiveDateTime,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE background_jobs
             SET grading_result = $1, credits_charged = $2, updated_at = $3
             WHERE id = $4 AND status = $5",
        )
        .bind(Json(result))
        .bind(credits_charged)
        .bind(now)
        .bind(job_id)
        .bind(JobStatus::Grading)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_job(
        &self,
        job_id: &str,
        from: JobStatus,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            "UPDATE background_jobs SET status = $1, updated_at = $2
             WHERE id = $3 AND status = $4",
        )
        .bind(JobStatus::Completed)
        .bind(now)
        .bind(job_id)
        .bind(from)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() > 0)
    }

    async fn await_validation(
        &self,
        job_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            "UPDATE background_jobs SET status = $1, updated_at = $2
             WHERE id = $3 AND status = $4",
        )
        .bind(JobStatus::AwaitingValidation)
        .bind(now)
        .bind(job_id)
        .bind(JobStatus::Grading)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() > 0)
    }

    async fn fail_job(
        &self,
        job_id: &str,
        kind: JobErrorKind,
        message: &str,
        now: PrimitiveDateTime,
    ) -> Result<Option<JobStatus>, StoreError> {
        let old = sqlx::query_scalar::<_, JobStatus>(
            "WITH prev AS (
                SELECT id, status FROM background_jobs WHERE id = $1
            )
            UPDATE background_jobs j
            SET status = $2, error_kind = $3, error_message = $4, updated_at = $5
            FROM prev
            WHERE j.id = prev.id AND j.status IN ($6, $7, $8)
            RETURNING prev.status",
        )
        .bind(job_id)
        .bind(JobStatus::Failed)
        .bind(kind)
        .bind(message)
        .bind(now)
        .bind(JobStatus::Queued)
        .bind(JobStatus::Extracting)
        .bind(JobStatus::Grading)
        .fetch_optional(&self.pool)
        .await?;
        Ok(old)
    }

    async fn cancel_job(
        &self,
        job_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<Option<JobStatus>, StoreError> {
        let old = sqlx::query_scalar::<_, JobStatus>(
            "WITH prev AS (
                SELECT id, status FROM background_jobs WHERE id = $1
            )
            UPDATE background_jobs j
            SET status = $2, cancel_requested = TRUE, updated_at = $3
            FROM prev
            WHERE j.id = prev.id AND j.status IN ($4, $5, $6, $7)
            RETURNING prev.status",
        )
        .bind(job_id)
        .bind(JobStatus::Cancelled)
        .bind(now)
        .bind(JobStatus::Queued)
        .bind(JobStatus::Extracting)
        .bind(JobStatus::Grading)
        .bind(JobStatus::AwaitingValidation)
        .fetch_optional(&self.pool)
        .await?;
        Ok(old)
    }

    async fn request_cancel(
        &self,
        job_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<CancelRequestOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, (JobStatus, Option<String>)>(
            "SELECT status, reservation_id FROM background_jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((status, reservation_id)) = row else {
            return Ok(CancelRequestOutcome::NotFound);
        };

        let outcome = match status {
            _ if status.is_terminal() => CancelRequestOutcome::AlreadyTerminal(status),
            JobStatus::Queued | JobStatus::AwaitingValidation => {
                sqlx::query(
                    "UPDATE background_jobs
                     SET status = $1, cancel_requested = TRUE, updated_at = $2
                     WHERE id = $3",
                )
                .bind(JobStatus::Cancelled)
                .bind(now)
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
                CancelRequestOutcome::Cancelled { old_status: status, reservation_id }
            }
            _ => {
                sqlx::query(
                    "UPDATE background_jobs SET cancel_requested = TRUE, updated_at = $1
                     WHERE id = $2",
                )
                .bind(now)
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
                CancelRequestOutcome::Deferred
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn record_override(
        &self,
        job_id: &str,
        question_id: &str,
        decision: &HumanOverride,
        now: PrimitiveDateTime,
    ) -> Result<OverrideOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, BackgroundJob>(
            "SELECT * FROM background_jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(mut job) = job else {
            return Ok(OverrideOutcome::NotFound);
        };

        if job.status != JobStatus::AwaitingValidation {
            return Ok(OverrideOutcome::InvalidState(job.status));
        }

        let Some(grade) = job.grading_result.0.get_mut(question_id) else {
            return Ok(OverrideOutcome::UnknownQuestion);
        };

        let unchanged = match &grade.human_override {
            Some(existing) if existing.same_decision(decision) => true,
            Some(_) => return Ok(OverrideOutcome::Conflict),
            None => {
                grade.human_override = Some(decision.clone());
                false
            }
        };

        sqlx::query(
            "UPDATE background_jobs SET grading_result = $1, updated_at = $2 WHERE id = $3",
        )
        .bind(&job.grading_result)
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        job.updated_at = now;

        if unchanged {
            Ok(OverrideOutcome::Unchanged(job))
        } else {
            Ok(OverrideOutcome::Applied(job))
        }
    }

    async fn list_stale_active(
        &self,
        cutoff: PrimitiveDateTime,
    ) -> Result<Vec<BackgroundJob>, StoreError> {
        let jobs = sqlx::query_as::<_, BackgroundJob>(
            "SELECT * FROM background_jobs
             WHERE (status IN ($1, $2) AND updated_at < $3)
                OR (status = $4 AND picked_up_at IS NOT NULL AND picked_up_at < $3)",
        )
        .bind(JobStatus::Extracting)
        .bind(JobStatus::Grading)
        .bind(cutoff)
        .bind(JobStatus::Queued)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }
}

#[async_trait]
impl CreditLedger for PgStore {
    async fn balance(&self, user_id: &str) -> Result<i64, LedgerError> {
        let balance = sqlx::query_scalar::<_, i64>(
            "SELECT credit_balance FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        balance.ok_or_else(|| LedgerError::UnknownUser(user_id.to_string()))
    }

    async fn reserve(
        &self,
        user_id: &str,
        job_id: &str,
        amount: i64,
        now: PrimitiveDateTime,
    ) -> Result<String, LedgerError> {
        let mut tx = self.pool.begin().await?;

        let debited = sqlx::query(
            "UPDATE users
             SET credit_balance = credit_balance - $1, updated_at = $2
             WHERE id = $3 AND credit_balance >= $1",
        )
        .bind(amount)
        .bind(now)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        if debited.rows_affected() == 0 {
            let available = sqlx::query_scalar::<_, i64>(
                "SELECT credit_balance FROM users WHERE id = $1",
            )
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;

            return match available {
                Some(available) => {
                    Err(LedgerError::InsufficientCredits { requested: amount, available })
                }
                None => Err(LedgerError::UnknownUser(user_id.to_string())),
            };
        }

        let reservation_id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO credit_reservations (id, user_id, job_id, amount, state, created_at, updated_at)
             VALUES ($1,$2,$3,$4,$5,$6,$6)",
        )
        .bind(&reservation_id)
        .bind(user_id)
        .bind(job_id)
        .bind(amount)
        .bind(ReservationState::Held)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(reservation_id)
    }

    async fn charge(
        &self,
        reservation_id: &str,
        usage: &ChargeUsage,
        model_tier: ModelTier,
        now: PrimitiveDateTime,
    ) -> Result<i64, LedgerError> {
        let mut tx = self.pool.begin().await?;

        let settled = sqlx::query_as::<_, (String, String, i64)>(
            "UPDATE credit_reservations SET state = $1, updated_at = $2
             WHERE id = $3 AND state = $4
             RETURNING user_id, job_id, amount",
        )
        .bind(ReservationState::Charged)
        .bind(now)
        .bind(reservation_id)
        .bind(ReservationState::Held)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((user_id, job_id, reserved)) = settled else {
            let exists = sqlx::query_scalar::<_, i64>(
                "SELECT 1 FROM credit_reservations WHERE id = $1",
            )
            .bind(reservation_id)
            .fetch_optional(&mut *tx)
            .await?;

            return match exists {
                Some(_) => Ok(0),
                None => Err(LedgerError::UnknownReservation(reservation_id.to_string())),
            };
        };

        let charged = usage.cost_credits.clamp(0, reserved);
        let refund = reserved - charged;

        if refund > 0 {
            sqlx::query(
                "UPDATE users SET credit_balance = credit_balance + $1, updated_at = $2
                 WHERE id = $3",
            )
            .bind(refund)
            .bind(now)
            .bind(&user_id)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO credit_ledger_entries
                 (id, user_id, job_id, tokens_in, tokens_out, cost_credits, model_tier, created_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&user_id)
        .bind(&job_id)
        .bind(usage.tokens_in)
        .bind(usage.tokens_out)
        .bind(charged)
        .bind(model_tier)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(charged)
    }

    async fn release(
        &self,
        reservation_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<i64, LedgerError> {
        let mut tx = self.pool.begin().await?;

        let released = sqlx::query_as::<_, (String, i64)>(
            "UPDATE credit_reservations SET state = $1, updated_at = $2
             WHERE id = $3 AND state = $4
             RETURNING user_id, amount",
        )
        .bind(ReservationState::Released)
        .bind(now)
        .bind(reservation_id)
        .bind(ReservationState::Held)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((user_id, amount)) = released else {
            let exists = sqlx::query_scalar::<_, i64>(
                "SELECT 1 FROM credit_reservations WHERE id = $1",
            )
            .bind(reservation_id)
            .fetch_optional(&mut *tx)
            .await?;

            return match exists {
                Some(_) => Ok(0),
                None => Err(LedgerError::UnknownReservation(reservation_id.to_string())),
            };
        };

        sqlx::query(
            "UPDATE users SET credit_balance = credit_balance + $1, updated_at = $2 WHERE id = $3",
        )
        .bind(amount)
        .bind(now)
        .bind(&user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(amount)
    }

    async fn ledger_entries_for_job(
        &self,
        job_id: &str,
    ) -> Result<Vec<CreditLedgerEntry>, LedgerError> {
        let entries = sqlx::query_as::<_, CreditLedgerEntry>(
            "SELECT * FROM credit_ledger_entries WHERE job_id = $1 ORDER BY created_at",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn find_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO users (id, display_name, credit_balance, is_active, is_admin, created_at, updated_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&user.id)
        .bind(&user.display_name)
        .bind(user.credit_balance)
        .bind(user.is_active)
        .bind(user.is_admin)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ExamStore for PgStore {
    async fn insert_exam(&self, exam: &Exam) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO exams (id, owner_id, title, answer_key, created_at, updated_at)
             VALUES ($1,$2,$3,$4,$5,$6)",
        )
        .bind(&exam.id)
        .bind(&exam.owner_id)
        .bind(&exam.title)
        .bind(&exam.answer_key)
        .bind(exam.created_at)
        .bind(exam.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_exam(&self, exam_id: &str) -> Result<Option<Exam>, StoreError> {
        let exam = sqlx::query_as::<_, Exam>("SELECT * FROM exams WHERE id = $1")
            .bind(exam_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(exam)
    }

    async fn list_exams_for_user(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Exam>, StoreError> {
        let exams = sqlx::query_as::<_, Exam>(
            "SELECT * FROM exams WHERE owner_id = $1
             ORDER BY created_at DESC
             LIMIT $2 OFFSET $3",
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(exams)
    }

    async fn count_exams_for_user(&self, user_id: &str) -> Result<i64, StoreError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM exams WHERE owner_id = $1")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

#[async_trait]
impl Store for PgStore {
    async fn health(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
