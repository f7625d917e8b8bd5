//! Error types for the Rollcall server.
//!
//! Every handler returns `Result<_, ApiError>`; [`ApiError`] is the single
//! place where failures become HTTP responses. Component errors
//! ([`TokenError`], [`UserError`], [`EventError`]) convert
//! into it with `From`, so handlers propagate them with `?`.
//!
//! # Error Types
//!
//! | Variant | Status |
//! |---------|--------|
//! | [`ApiError::Validation`] | 400 |
//! | [`ApiError::Unauthorized`] | 401 |
//! | [`ApiError::InvalidToken`] | 401 |
//! | [`ApiError::TokenMismatch`] | 401 |
//! | [`ApiError::Forbidden`] | 403 |
//! | [`ApiError::NotFound`] | 404 |
//! | [`ApiError::Conflict`] | 409 |
//! | [`ApiError::PayloadTooLarge`] | 413 |
//! | [`ApiError::Internal`] | 500 |
//!
//! # Example
//!
//! ```rust
//! use axum::http::StatusCode;
//! use rollcall_server::error::ApiError;
//!
//! let err = ApiError::validation("name", "name is required");
//! assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error};

use crate::events::EventError;
use crate::tokens::TokenError;
use crate::users::UserError;

/// Message returned to clients for any server-side failure.
const INTERNAL_ERROR_MESSAGE: &str = "internal server error";

/// Top-level error type for the HTTP boundary.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Request data failed validation.
    ///
    /// `field` names the offending input when a single field is at fault.
    #[error("{message}")]
    Validation {
        field: Option<String>,
        message: String,
    },

    /// No credential was presented.
    #[error("{0}")]
    Unauthorized(String),

    /// A credential was presented but is malformed, expired, revoked, or
    /// refers to a user that no longer exists.
    #[error("{0}")]
    InvalidToken(String),

    /// The presented refresh token is not the one currently stored for its
    /// session (rotated out, revoked, or replayed).
    #[error("refresh token is expired or used")]
    TokenMismatch,

    /// The caller is authenticated but does not own the resource.
    #[error("{0}")]
    Forbidden(String),

    /// The requested resource does not exist.
    #[error("{0}")]
    NotFound(String),

    /// A unique field is already taken.
    #[error("{0}")]
    Conflict(String),

    /// The request body exceeds the configured limit.
    #[error("{0}")]
    PayloadTooLarge(String),

    /// Unexpected failure. The detail is logged, never returned.
    #[error("internal server error: {0}")]
    Internal(String),
}

/// JSON body of every error response: `{status, data, message}`.
#[derive(Debug, Serialize)]
struct ErrorBody {
    status: u16,
    data: Value,
    message: String,
}

impl ApiError {
    /// Creates a validation error tied to a single field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: Some(field.into()),
            message: message.into(),
        }
    }

    /// Creates a validation error about the request as a whole.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::Validation {
            field: None,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn invalid_token(message: impl Into<String>) -> Self {
        Self::InvalidToken(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Creates a new internal error.
    ///
    /// # Example
    ///
    /// ```rust
    /// use rollcall_server::error::ApiError;
    ///
    /// let err = ApiError::internal("password hashing task panicked");
    /// assert!(err.is_server_error());
    /// ```
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) | Self::InvalidToken(_) | Self::TokenMismatch => {
                StatusCode::UNAUTHORIZED
            }
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns `true` if this error indicates a server-side problem.
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Internal(_))
    }

    /// Message safe to return to the client.
    fn public_message(&self) -> String {
        if self.is_server_error() {
            INTERNAL_ERROR_MESSAGE.to_string()
        } else {
            self.to_string()
        }
    }

    fn data(&self) -> Value {
        match self {
            Self::Validation {
                field: Some(field), ..
            } => json!({ "field": field }),
            _ => json!({}),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if self.is_server_error() {
            error!(error = %self, status = status.as_u16(), "Request failed");
        } else {
            debug!(error = %self, status = status.as_u16(), "Request rejected");
        }

        let body = ErrorBody {
            status: status.as_u16(),
            data: self.data(),
            message: self.public_message(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Missing => Self::unauthorized("unauthorized request"),
            TokenError::Invalid(reason) => Self::InvalidToken(reason),
            TokenError::Mismatch => Self::TokenMismatch,
            TokenError::Signing(reason) => Self::Internal(reason),
        }
    }
}

impl From<UserError> for ApiError {
    fn from(err: UserError) -> Self {
        match err {
            UserError::Conflict => Self::conflict(err.to_string()),
            UserError::NotFound => Self::not_found(err.to_string()),
        }
    }
}

impl From<EventError> for ApiError {
    fn from(err: EventError) -> Self {
        match err {
            EventError::NotFound => Self::not_found("event not found"),
            EventError::Forbidden => {
                Self::forbidden("you are not authorized to modify this event")
            }
            EventError::Invalid { field, message } => Self::validation(field, message),
        }
    }
}

/// A specialized Result type for handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(err: ApiError) -> (StatusCode, Value) {
        let response = err.into_response();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(
            ApiError::validation("name", "required").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::unauthorized("missing").status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::invalid_token("bad").status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ApiError::TokenMismatch.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::forbidden("no").status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::not_found("gone").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::conflict("dup").status_code(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::PayloadTooLarge("big".into()).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ApiError::internal("boom").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn only_internal_is_server_error() {
        assert!(!ApiError::forbidden("no").is_server_error());
        assert!(!ApiError::TokenMismatch.is_server_error());
        assert!(ApiError::internal("boom").is_server_error());
    }

    #[tokio::test]
    async fn validation_error_carries_field() {
        let (status, body) = body_json(ApiError::validation("date", "date is required")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], 400);
        assert_eq!(body["data"]["field"], "date");
        assert_eq!(body["message"], "date is required");
    }

    #[tokio::test]
    async fn non_validation_errors_have_empty_data() {
        let (status, body) = body_json(ApiError::not_found("event not found")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["data"], json!({}));
        assert_eq!(body["message"], "event not found");
    }

    #[tokio::test]
    async fn internal_error_hides_detail() {
        let (status, body) = body_json(ApiError::internal("disk full at /var/lib")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["message"], INTERNAL_ERROR_MESSAGE);
        assert!(!body.to_string().contains("/var/lib"));
    }

    #[test]
    fn token_errors_convert() {
        assert!(matches!(
            ApiError::from(TokenError::Missing),
            ApiError::Unauthorized(_)
        ));
        assert!(matches!(
            ApiError::from(TokenError::Invalid("expired".into())),
            ApiError::InvalidToken(_)
        ));
        assert!(matches!(
            ApiError::from(TokenError::Mismatch),
            ApiError::TokenMismatch
        ));
        assert!(ApiError::from(TokenError::Signing("key".into())).is_server_error());
    }

    #[test]
    fn event_errors_convert() {
        assert!(matches!(
            ApiError::from(EventError::NotFound),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            ApiError::from(EventError::Forbidden),
            ApiError::Forbidden(_)
        ));
        let err = ApiError::from(EventError::Invalid {
            field: "name",
            message: "name is required".into(),
        });
        assert!(matches!(err, ApiError::Validation { field: Some(ref f), .. } if f == "name"));
    }

    #[test]
    fn user_conflict_converts() {
        assert!(matches!(
            ApiError::from(UserError::Conflict),
            ApiError::Conflict(_)
        ));
    }
}
