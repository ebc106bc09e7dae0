use serde::{Deserialize, Serialize};
use sqlx::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "jobstatus", rename_all = "snake_case")]
pub(crate) enum JobStatus {
    Queued,
    Extracting,
    Grading,
    AwaitingValidation,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Extracting => "extracting",
            Self::Grading => "grading",
            Self::AwaitingValidation => "awaiting_validation",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "modeltier", rename_all = "lowercase")]
pub(crate) enum ModelTier {
    Fast,
    Quality,
}

impl ModelTier {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Quality => "quality",
        }
    }
}

impl std::str::FromStr for ModelTier {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "fast" => Ok(Self::Fast),
            "quality" => Ok(Self::Quality),
            other => Err(format!("unknown model tier: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "joberrorkind", rename_all = "snake_case")]
pub(crate) enum JobErrorKind {
    InsufficientCredits,
    NoExtractableText,
    GradingFailed,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "reservationstate", rename_all = "lowercase")]
pub(crate) enum ReservationState {
    Held,
    Charged,
    Released,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        for status in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            assert!(status.is_terminal());
        }
        for status in [
            JobStatus::Queued,
            JobStatus::Extracting,
            JobStatus::Grading,
            JobStatus::AwaitingValidation,
        ] {
            assert!(!status.is_terminal());
        }
    }

    #[test]
    fn model_tier_round_trips_from_str() {
        assert_eq!("fast".parse::<ModelTier>().unwrap(), ModelTier::Fast);
        assert_eq!("quality".parse::<ModelTier>().unwrap(), ModelTier::Quality);
        assert!("turbo".parse::<ModelTier>().is_err());
    }
}
