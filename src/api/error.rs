use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::error::CoordinationError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Coordination(err) => match err {
                CoordinationError::UnknownWorkflow(_) | CoordinationError::UnknownAgent(_) => {
                    StatusCode::NOT_FOUND
                }
                CoordinationError::NoSuitableAgents { .. } => StatusCode::CONFLICT,
                CoordinationError::InvalidTaskType(_) | CoordinationError::InvalidConfig(_) => {
                    StatusCode::BAD_REQUEST
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("request failed: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
