use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use serde_json::{json, Value};
use thiserror::Error;

use crate::core::config::Settings;
use crate::db::models::{AnswerKeyQuestion, QuestionGrade};
use crate::db::types::{JobErrorKind, ModelTier};

const GRADING_SYSTEM_PROMPT: &str = r#"You are an experienced exam corrector.
You receive the text extracted from a student's exam submission together with
the answer key (or a freeform rubric) and award a score per question.

Rules:
1. Grade strictly against the provided answer key or rubric.
2. Award partial credit when the method is correct but the result is not.
3. Report a confidence between 0 and 1 for every question: how certain you
   are that the awarded score is the one a careful human grader would give.
   Use low confidence when the extracted text is garbled or ambiguous.
4. Keep each rationale short and concrete.

Answer with strict JSON only:
{
  "questions": [
    {
      "id": "<question id>",
      "score": <number>,
      "max_score": <number>,
      "confidence": <number between 0 and 1>,
      "rationale": "<short explanation>"
    }
  ]
}
"#;

#[derive(Debug, Clone)]
pub(crate) struct GradeRequest {
    pub(crate) job_id: String,
    pub(crate) pages_text: Vec<String>,
    pub(crate) answer_key: Option<Vec<AnswerKeyQuestion>>,
    pub(crate) rubric: Option<String>,
    pub(crate) tier: ModelTier,
}

#[derive(Debug, Clone)]
pub(crate) struct GradeOutcome {
    pub(crate) result: BTreeMap<String, QuestionGrade>,
    pub(crate) tokens_in: i64,
    pub(crate) tokens_out: i64,
    pub(crate) cost_credits: i64,
}

#[derive(Debug, Error)]
pub(crate) enum GradingError {
    #[error("grading request timed out")]
    Timeout,
    #[error("transient upstream failures exhausted retries: {0}")]
    RetriesExhausted(String),
    #[error("unrecoverable grading failure: {0}")]
    Unrecoverable(String),
}

impl GradingError {
    pub(crate) fn error_kind(&self) -> JobErrorKind {
        match self {
            Self::Timeout => JobErrorKind::Timeout,
            Self::RetriesExhausted(_) | Self::Unrecoverable(_) => JobErrorKind::GradingFailed,
        }
    }
}

#[async_trait]
pub(crate) trait GradingEngine: Send + Sync {
    async fn grade(&self, request: GradeRequest) -> Result<GradeOutcome, GradingError>;
}

/// Grading engine backed by an OpenAI-compatible chat completions API.
/// The tier picks the model; transient upstream failures are retried
/// with exponential backoff, everything else surfaces immediately.
#[derive(Debug, Clone)]
pub(crate) struct OpenAiGradingEngine {
    client: Client,
    api_key: String,
    base_url: String,
    fast_model: String,
    quality_model: String,
    max_tokens: u32,
    temperature: f64,
    max_attempts: u32,
    fast_per_1k_tokens: i64,
    quality_per_1k_tokens: i64,
}

impl OpenAiGradingEngine {
    pub(crate) fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(settings.grading().request_timeout_seconds);
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .context("Failed to build grading HTTP client")?;

        Ok(Self {
            client,
            api_key: settings.grading().api_key.clone(),
            base_url: settings.grading().base_url.trim_end_matches('/').to_string(),
            fast_model: settings.grading().fast_model.clone(),
            quality_model: settings.grading().quality_model.clone(),
            max_tokens: settings.grading().max_tokens,
            temperature: settings.grading().temperature,
            max_attempts: settings.grading().max_attempts.max(1),
            fast_per_1k_tokens: settings.credits().fast_per_1k_tokens,
            quality_per_1k_tokens: settings.credits().quality_per_1k_tokens,
        })
    }

    fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Fast => &self.fast_model,
            ModelTier::Quality => &self.quality_model,
        }
    }

    fn cost_for_usage(&self, tier: ModelTier, tokens_in: i64, tokens_out: i64) -> i64 {
        let per_1k = match tier {
            ModelTier::Fast => self.fast_per_1k_tokens,
            ModelTier::Quality => self.quality_per_1k_tokens,
        };
        let total_tokens = (tokens_in + tokens_out).max(0);
        let thousands = (total_tokens + 999) / 1000;
        (thousands * per_1k).max(1)
    }

    async fn send_request(&self, payload: &Value) -> Result<Value, GradingError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut last_error = String::new();

        for attempt in 0..self.max_attempts {
            let response =
                self.client.post(&url).bearer_auth(&self.api_key).json(payload).send().await;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let body: Value = resp.json().await.unwrap_or(Value::Null);

                    if status.is_success() {
                        return Ok(body);
                    }

                    // Rate limits and upstream hiccups are worth another
                    // attempt; anything else is a hard failure.
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_error = format!("model API returned {status}: {body}");
                    } else {
                        return Err(GradingError::Unrecoverable(format!(
                            "model API returned {status}: {body}"
                        )));
                    }
                }
                Err(err) if err.is_timeout() => return Err(GradingError::Timeout),
                Err(err) => {
                    last_error = format!("failed to call model API: {err}");
                }
            }

            if attempt + 1 < self.max_attempts {
                let jitter = rand::thread_rng().gen_range(0..250);
                let backoff =
                    Duration::from_secs(2_u64.pow(attempt)) + Duration::from_millis(jitter);
                tokio::time::sleep(backoff).await;
            }
        }

        Err(GradingError::RetriesExhausted(last_error))
    }
}

#[async_trait]
impl GradingEngine for OpenAiGradingEngine {
    async fn grade(&self, request: GradeRequest) -> Result<GradeOutcome, GradingError> {
        let user_prompt = build_user_prompt(&request);
        let payload = json!({
            "model": self.model_for(request.tier),
            "messages": [
                {"role": "system", "content": GRADING_SYSTEM_PROMPT},
                {"role": "user", "content": user_prompt}
            ],
            "max_completion_tokens": self.max_tokens,
            "temperature": self.temperature,
            "response_format": {"type": "json_object"}
        });

        tracing::info!(job_id = %request.job_id, tier = request.tier.as_str(), "Sending grading request");

        let body = self.send_request(&payload).await?;

        let content = body
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                GradingError::Unrecoverable("model response missing content".to_string())
            })?;

        let result = parse_grading_payload(content)?;

        let tokens_in = body
            .get("usage")
            .and_then(|usage| usage.get("prompt_tokens"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let tokens_out = body
            .get("usage")
            .and_then(|usage| usage.get("completion_tokens"))
            .and_then(Value::as_i64)
            .unwrap_or(0);

        let cost_credits = self.cost_for_usage(request.tier, tokens_in, tokens_out);

        tracing::info!(
            job_id = %request.job_id,
            questions = result.len(),
            tokens_in,
            tokens_out,
            cost_credits,
            "Grading completed"
        );

        Ok(GradeOutcome { result, tokens_in, tokens_out, cost_credits })
    }
}

fn build_user_prompt(request: &GradeRequest) -> String {
    let mut sections = Vec::new();

    match &request.answer_key {
        Some(answer_key) => {
            let rendered = serde_json::to_string_pretty(answer_key).unwrap_or_default();
            sections.push(format!("Answer key:\n{rendered}"));
        }
        None => {
            let rubric = request.rubric.as_deref().unwrap_or("Grade on overall correctness.");
            sections.push(format!("Rubric:\n{rubric}"));
        }
    }

    let mut pages = String::new();
    for (index, text) in request.pages_text.iter().enumerate() {
        pages.push_str(&format!("--- Page {} ---\n{}\n", index + 1, text));
    }
    sections.push(format!("Student submission:\n{pages}"));
    sections.push(
        "Grade every question of the answer key. Respond with the JSON format from the system prompt."
            .to_string(),
    );

    sections.join("\n\n")
}

fn parse_grading_payload(content: &str) -> Result<BTreeMap<String, QuestionGrade>, GradingError> {
    let parsed: Value = serde_json::from_str(content).map_err(|err| {
        GradingError::Unrecoverable(format!("model returned malformed JSON: {err}"))
    })?;

    let questions = parsed
        .get("questions")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            GradingError::Unrecoverable("model response missing questions array".to_string())
        })?;

    let mut result = BTreeMap::new();
    for question in questions {
        let id = question
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                GradingError::Unrecoverable("graded question missing id".to_string())
            })?
            .to_string();
        let score = question.get("score").and_then(Value::as_f64).unwrap_or(0.0);
        let max_score = question.get("max_score").and_then(Value::as_f64).unwrap_or(0.0);
        let confidence =
            question.get("confidence").and_then(Value::as_f64).unwrap_or(0.0).clamp(0.0, 1.0);
        let rationale = question
            .get("rationale")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        result.insert(
            id,
            QuestionGrade {
                score,
                max_score,
                confidence,
                ai_rationale: rationale,
                human_override: None,
            },
        );
    }

    if result.is_empty() {
        return Err(GradingError::Unrecoverable(
            "model graded zero questions".to_string(),
        ));
    }

    Ok(result)
}

/// Pre-flight cost estimate used for the credit reservation.
pub(crate) fn estimated_cost(settings: &Settings, tier: ModelTier, page_count: usize) -> i64 {
    let per_page = match tier {
        ModelTier::Fast => settings.credits().fast_per_page,
        ModelTier::Quality => settings.credits().quality_per_page,
    };
    per_page * page_count.max(1) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_grading_payload_reads_questions() {
        let content = r#"{
            "questions": [
                {"id": "q1", "score": 3.5, "max_score": 5.0, "confidence": 0.92, "rationale": "mostly right"},
                {"id": "q2", "score": 0.0, "max_score": 2.0, "confidence": 0.4, "rationale": "answer missing"}
            ]
        }"#;

        let result = parse_grading_payload(content).expect("payload");
        assert_eq!(result.len(), 2);
        assert_eq!(result["q1"].score, 3.5);
        assert_eq!(result["q2"].confidence, 0.4);
        assert!(result["q1"].human_override.is_none());
    }

    #[test]
    fn parse_grading_payload_clamps_confidence() {
        let content = r#"{"questions": [{"id": "q1", "score": 1, "max_score": 1, "confidence": 1.7, "rationale": ""}]}"#;
        let result = parse_grading_payload(content).expect("payload");
        assert_eq!(result["q1"].confidence, 1.0);
    }

    #[test]
    fn parse_grading_payload_rejects_malformed_json() {
        let err = parse_grading_payload("not json").unwrap_err();
        assert!(matches!(err, GradingError::Unrecoverable(_)));
    }

    #[test]
    fn parse_grading_payload_rejects_empty_question_list() {
        let err = parse_grading_payload(r#"{"questions": []}"#).unwrap_err();
        assert!(matches!(err, GradingError::Unrecoverable(_)));
    }

    fn engine_with_rates(fast: i64, quality: i64) -> OpenAiGradingEngine {
        OpenAiGradingEngine {
            client: Client::new(),
            api_key: String::new(),
            base_url: String::new(),
            fast_model: "fast-model".to_string(),
            quality_model: "quality-model".to_string(),
            max_tokens: 1000,
            temperature: 0.0,
            max_attempts: 1,
            fast_per_1k_tokens: fast,
            quality_per_1k_tokens: quality,
        }
    }

    #[test]
    fn cost_for_usage_rounds_tokens_up_per_thousand() {
        let engine = engine_with_rates(1, 3);
        assert_eq!(engine.cost_for_usage(ModelTier::Fast, 900, 99), 1);
        assert_eq!(engine.cost_for_usage(ModelTier::Fast, 900, 101), 2);
        assert_eq!(engine.cost_for_usage(ModelTier::Quality, 1500, 600), 9);
    }

    #[test]
    fn cost_for_usage_charges_at_least_one_credit() {
        let engine = engine_with_rates(1, 3);
        assert_eq!(engine.cost_for_usage(ModelTier::Fast, 0, 0), 1);
    }

    #[test]
    fn grading_error_kinds_map_to_job_error_kinds() {
        assert_eq!(GradingError::Timeout.error_kind(), JobErrorKind::Timeout);
        assert_eq!(
            GradingError::RetriesExhausted(String::new()).error_kind(),
            JobErrorKind::GradingFailed
        );
        assert_eq!(
            GradingError::Unrecoverable(String::new()).error_kind(),
            JobErrorKind::GradingFailed
        );
    }
}
