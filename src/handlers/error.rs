use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use log::error;
use serde::Serialize;

use crate::error::PollError;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl PollError {
    pub fn status(&self) -> StatusCode {
        match self {
            PollError::Validation(_)
            | PollError::PollEnded
            | PollError::DuplicateVote
            | PollError::InvalidOption(_) => StatusCode::BAD_REQUEST,
            PollError::NotFound(_) => StatusCode::NOT_FOUND,
            PollError::StoreConflict(_) | PollError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for PollError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Server-side failures are logged, never echoed back
        let message = if self.is_client_error() {
            self.to_string()
        } else {
            error!("Request failed: {}", self);
            "Internal server error".to_string()
        };

        (status, Json(ErrorBody { error: message })).into_response()
    }
}
