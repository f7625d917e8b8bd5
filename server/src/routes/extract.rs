//! Request extractors that reject with [`ApiError`] instead of axum's
//! plain-text rejections.

use axum::{
    extract::{
        multipart::MultipartError,
        rejection::JsonRejection,
        FromRequest, Request,
    },
    http::StatusCode,
    Json,
};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::error::ApiError;

/// JSON body extractor. Malformed bodies become `400` validation errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonBody<T>(pub T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        Json::<T>::from_request(req, state)
            .await
            .map(|Json(value)| Self(value))
            .map_err(from_json_rejection)
    }
}

pub(crate) fn from_json_rejection(rejection: JsonRejection) -> ApiError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge("request body is too large".to_string())
    } else {
        ApiError::bad_request(rejection.body_text())
    }
}

pub(crate) fn from_multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge("request body is too large".to_string())
    } else {
        ApiError::bad_request(err.body_text())
    }
}

/// Parses a path id. Anything that is not a UUID cannot name a stored
/// record, so it is reported as not found.
pub fn parse_id(raw: &str, what: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw.trim()).map_err(|_| ApiError::not_found(format!("{what} not found")))
}
