//! Mapping of service errors onto the JSON shapes the frontend expects.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::db::DbError;
use crate::devices::{ManageError, ValidationError};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("bad token")]
    BadToken,
    #[error("blocked")]
    Blocked,
    #[error("{0}")]
    Alert(ValidationError),
    #[error("event not found")]
    NotFound,
    #[error("{0}")]
    BadRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ManageError> for ApiError {
    fn from(e: ManageError) -> Self {
        match e {
            ManageError::BadToken => Self::BadToken,
            ManageError::Blocked => Self::Blocked,
            ManageError::Invalid(v) => Self::Alert(v),
            ManageError::UnknownEvent => Self::NotFound,
            ManageError::TokenSpace => Self::Internal("token space exhausted".to_string()),
            ManageError::Db(e) => Self::from(e),
        }
    }
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // The frontend reads these from successful responses.
        let (status, body) = match &self {
            Self::BadToken => (StatusCode::OK, json!({ "error": "bad token" })),
            Self::Blocked => (StatusCode::OK, json!({ "blocked": true })),
            Self::Alert(v) => (StatusCode::OK, json!({ "alert": v.to_string() })),
            Self::NotFound => (StatusCode::NOT_FOUND, json!({ "error": self.to_string() })),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            Self::Internal(msg) => {
                tracing::error!("Request failed: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "internal error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}
