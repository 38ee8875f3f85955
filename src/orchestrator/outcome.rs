use crate::model::{RangeSummary, ResultCode};
use serde::Serialize;

/// How a finished run ended, as reported to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    NotEnoughData,
    Failure {
        error: String,
    },
    Complete {
        code: ResultCode,
        summary: Option<RangeSummary>,
    },
}

impl Outcome {
    pub fn from_finished(
        code: ResultCode,
        error: Option<String>,
        summary: Option<RangeSummary>,
    ) -> Self {
        match code {
            ResultCode::NoData => Outcome::NotEnoughData,
            ResultCode::Exception => Outcome::Failure {
                error: error.unwrap_or_else(|| "unknown error".to_string()),
            },
            code => Outcome::Complete { code, summary },
        }
    }

    pub fn message(&self) -> String {
        match self {
            Outcome::NotEnoughData => "Unable to find enough data to bisect.".to_string(),
            Outcome::Failure { error } => format!("Error: {error}"),
            Outcome::Complete { .. } => "The bisection is done.".to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Complete { .. })
    }

    pub fn summary(&self) -> Option<&RangeSummary> {
        match self {
            Outcome::Complete { summary, .. } => summary.as_ref(),
            _ => None,
        }
    }
}
