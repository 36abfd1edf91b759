//! Caller identity for upload and attachment endpoints.
//!
//! Session handling lives in the surrounding web app; by the time a request
//! reaches this service the caller id travels in `X-User-Id`.

use crate::errors::AppError;
use axum::{
    extract::FromRequestParts,
    http::{StatusCode, request::Parts},
};

pub const USER_ID_HEADER: &str = "x-user-id";

/// The authenticated user's id, taken from `X-User-Id`.
#[derive(Debug, Clone)]
pub struct UploaderId(pub String);

impl<S> FromRequestParts<S> for UploaderId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| UploaderId(v.to_string()))
            .ok_or_else(|| AppError::new(StatusCode::UNAUTHORIZED, "missing X-User-Id header"))
    }
}
