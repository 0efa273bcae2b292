//! API error types mapped to HTTP status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Application-level error type that implements `IntoResponse`.
///
/// - `BadRequest` → 400 with `{"error": "message"}`
/// - `NotLeader` → 500 with the literal body `not leader` (the wire contract
///   clients retry against)
/// - `Internal` → 500 with `{"error": "message"}`
#[derive(Debug)]
pub enum ApiError {
    /// Invalid request parameters (400).
    BadRequest(String),
    /// Write received by a non-leader (500, body `not leader`).
    NotLeader,
    /// Unexpected server error (500).
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotLeader => {
                (StatusCode::INTERNAL_SERVER_ERROR, "not leader").into_response()
            }
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, axum::Json(json!({ "error": msg }))).into_response()
            }
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(json!({ "error": msg })),
            )
                .into_response(),
        }
    }
}
