//! HTTP mapping of engine errors
//!
//! Every error body has the same shape:
//!
//! ```json
//! {"error": "participant … already answered question 3", "code": "already-answered", "status": 409}
//! ```

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::error;

use crate::{engine, ledger, participant};

/// Errors returned by HTTP handlers
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// An engine operation was refused or failed
    #[error(transparent)]
    Engine(#[from] engine::Error),
    /// A driver operation without the right PIN
    #[error("driver pin missing or wrong")]
    Unauthorized,
    /// The requested resource does not exist
    #[error("not found: {0}")]
    NotFound(String),
}

impl AppError {
    /// Stable kebab-case identifier of the error
    pub fn code(&self) -> &'static str {
        match self {
            Self::Engine(e) => e.code(),
            Self::Unauthorized => "unauthorized",
            Self::NotFound(_) => "not-found",
        }
    }

    /// HTTP status the error is reported with
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Engine(e) => match e {
                engine::Error::Transition(_)
                | engine::Error::JoinClosed(_)
                | engine::Error::QuestionsLocked(_) => StatusCode::CONFLICT,
                engine::Error::Answer(e) => match e {
                    ledger::Error::AlreadyAnswered { .. }
                    | ledger::Error::NotStarted { .. }
                    | ledger::Error::QuestionClosed { .. } => StatusCode::CONFLICT,
                    ledger::Error::InvalidAnswer { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                    ledger::Error::UnknownParticipant(_) => StatusCode::NOT_FOUND,
                    ledger::Error::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
                },
                engine::Error::Join(participant::Error::MaximumParticipants) => {
                    StatusCode::CONFLICT
                }
                engine::Error::Join(_) | engine::Error::InvalidQuestions(_) => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                engine::Error::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }

        let body = Json(json!({
            "error": self.to_string(),
            "code": self.code(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

/// Result type alias for handlers
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::{participant::Id, step};

    #[test]
    fn duplicate_answer_is_conflict() {
        let err = AppError::from(engine::Error::from(ledger::Error::AlreadyAnswered {
            question_index: 3,
            participant_id: Id::new(),
        }));
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.code(), "already-answered");
    }

    #[test]
    fn rejected_transition_is_conflict() {
        let err = AppError::from(engine::Error::from(step::Error::Rejected {
            from: step::Step::Lobby,
            to: step::Step::Result,
        }));
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.code(), "rejected-transition");
        assert_eq!(err.to_string(), "cannot move from lobby to result");
    }

    #[test]
    fn missing_pin_is_unauthorized() {
        assert_eq!(AppError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
    }
}
