use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use std::collections::HashSet;
use uuid::Uuid;
use validator::Validate;

use crate::api::errors::ApiError;
use crate::api::guards::CurrentUser;
use crate::api::pagination::{PaginatedResponse, PaginationParams};
use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::db::models::{AnswerKeyQuestion, Exam};
use crate::schemas::{CreateExamPayload, ExamResponse};
use crate::store::ExamStore;

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_exams).post(create_exam))
        .route("/:exam_id", get(get_exam))
}

async fn create_exam(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(payload): Json<CreateExamPayload>,
) -> Result<(StatusCode, Json<ExamResponse>), ApiError> {
    payload.validate().map_err(|err| ApiError::BadRequest(err.to_string()))?;

    let mut seen = HashSet::new();
    for question in &payload.questions {
        if !seen.insert(question.id.as_str()) {
            return Err(ApiError::BadRequest(format!(
                "duplicate question id: {}",
                question.id
            )));
        }
    }

    let now = primitive_now_utc();
    let questions = payload
        .questions
        .into_iter()
        .map(|question| AnswerKeyQuestion {
            id: question.id,
            prompt: question.prompt,
            expected_answer: question.expected_answer,
            max_score: question.max_score,
        })
        .collect::<Vec<_>>();

    let exam = Exam {
        id: Uuid::new_v4().to_string(),
        owner_id: user.id.clone(),
        title: payload.title,
        answer_key: sqlx::types::Json(questions),
        created_at: now,
        updated_at: now,
    };

    state
        .store()
        .insert_exam(&exam)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to create exam"))?;

    tracing::info!(exam_id = %exam.id, user_id = %user.id, "Exam created");

    Ok((StatusCode::CREATED, Json(exam.into())))
}

async fn list_exams(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(params): Query<PaginationParams>,
) -> Result<Json<PaginatedResponse<ExamResponse>>, ApiError> {
    let (skip, limit) = params.clamped();

    let exams = state
        .store()
        .list_exams_for_user(&user.id, limit, skip)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to list exams"))?;
    let total_count = state
        .store()
        .count_exams_for_user(&user.id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to count exams"))?;

    Ok(Json(PaginatedResponse {
        items: exams.into_iter().map(ExamResponse::from).collect(),
        total_count,
        skip,
        limit,
    }))
}

async fn get_exam(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(exam_id): Path<String>,
) -> Result<Json<ExamResponse>, ApiError> {
    let exam = state
        .store()
        .find_exam(&exam_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to load exam"))?;

    match exam {
        Some(exam) if exam.owner_id == user.id || user.is_admin => Ok(Json(exam.into())),
        _ => Err(ApiError::NotFound("Exam not found".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;
    use tower::ServiceExt;

    use crate::test_support;

    fn exam_payload() -> serde_json::Value {
        json!({
            "title": "Algebra midterm",
            "questions": [
                {"id": "q1", "prompt": "Solve x + 2 = 5", "expected_answer": "x = 3", "max_score": 5.0},
                {"id": "q2", "prompt": "Factor x^2 - 1", "expected_answer": "(x-1)(x+1)", "max_score": 5.0}
            ]
        })
    }

    #[tokio::test]
    async fn create_and_fetch_exam() {
        let ctx = test_support::setup_test_context().await;
        let user = test_support::insert_user(&ctx.store, "teacher-1", 0).await;
        let token = test_support::bearer_token(&user.id, ctx.state.settings());
        let app = crate::api::router::router(ctx.state.clone());

        let response = app
            .clone()
            .oneshot(test_support::json_request(
                Method::POST,
                "/api/v1/exams",
                Some(&token),
                Some(exam_payload()),
            ))
            .await
            .expect("create exam");
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = test_support::read_json(response).await;
        let exam_id = created["id"].as_str().expect("exam id");
        assert_eq!(created["questions"].as_array().unwrap().len(), 2);

        let response = app
            .clone()
            .oneshot(test_support::json_request(
                Method::GET,
                &format!("/api/v1/exams/{exam_id}"),
                Some(&token),
                None,
            ))
            .await
            .expect("get exam");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn duplicate_question_ids_are_rejected() {
        let ctx = test_support::setup_test_context().await;
        let user = test_support::insert_user(&ctx.store, "teacher-1", 0).await;
        let token = test_support::bearer_token(&user.id, ctx.state.settings());
        let app = crate::api::router::router(ctx.state.clone());

        let payload = json!({
            "title": "Broken exam",
            "questions": [
                {"id": "q1", "prompt": "a", "expected_answer": "b", "max_score": 1.0},
                {"id": "q1", "prompt": "c", "expected_answer": "d", "max_score": 1.0}
            ]
        });

        let response = app
            .oneshot(test_support::json_request(
                Method::POST,
                "/api/v1/exams",
                Some(&token),
                Some(payload),
            ))
            .await
            .expect("create exam");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn foreign_exam_reads_as_not_found() {
        let ctx = test_support::setup_test_context().await;
        let owner = test_support::insert_user(&ctx.store, "owner", 0).await;
        let other = test_support::insert_user(&ctx.store, "other", 0).await;
        let exam = test_support::insert_exam(ctx.store.as_ref(), &owner.id, &["q1"]).await;

        let token = test_support::bearer_token(&other.id, ctx.state.settings());
        let app = crate::api::router::router(ctx.state.clone());

        let response = app
            .oneshot(test_support::json_request(
                Method::GET,
                &format!("/api/v1/exams/{}", exam.id),
                Some(&token),
                None,
            ))
            .await
            .expect("get exam");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
