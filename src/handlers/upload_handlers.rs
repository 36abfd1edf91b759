//! HTTP handlers for the multipart upload protocol.
//! The server only brokers sessions and URLs; part bytes go straight from
//! the client to the object store.

use super::identity::UploaderId;
use crate::{
    errors::AppError,
    models::upload::{
        AbortUploadQuery, AttachmentResponse, CompleteUploadRequest, InitiateUploadRequest,
        InitiateUploadResponse,
    },
    services::upload_service::{UploadError, UploadService},
};
use axum::{
    Json,
    extract::{
        Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
};

/// `POST /upload` opens a session and returns one presigned URL per part.
pub async fn initiate_upload(
    State(service): State<UploadService>,
    UploaderId(user): UploaderId,
    payload: Result<Json<InitiateUploadRequest>, JsonRejection>,
) -> Result<Json<InitiateUploadResponse>, AppError> {
    let Json(req) = payload?;
    tracing::debug!(%user, file_name = %req.file_name, "initiate upload");
    let response = service.initiate(req).await?;
    Ok(Json(response))
}

/// `POST /upload/complete` closes the session and records the attachment.
pub async fn complete_upload(
    State(service): State<UploadService>,
    UploaderId(user): UploaderId,
    payload: Result<Json<CompleteUploadRequest>, JsonRejection>,
) -> Result<Json<AttachmentResponse>, AppError> {
    let Json(req) = payload?;
    let attachment = service.complete(req, &user).await?;
    Ok(Json(AttachmentResponse { attachment }))
}

/// `DELETE /upload/abort?uploadId=&fileKey=`
///
/// Answers 204 whenever the feature is on, even for a malformed query; a
/// session that cannot be aborted is left to the store's own expiry.
pub async fn abort_upload(
    State(service): State<UploadService>,
    query: Result<Query<AbortUploadQuery>, QueryRejection>,
) -> Result<StatusCode, AppError> {
    if !service.policy().attachments_enabled {
        return Err(UploadError::Disabled.into());
    }
    let query = query.map(|Query(q)| q).unwrap_or_default();
    service.abort(&query.upload_id, &query.file_key).await;
    Ok(StatusCode::NO_CONTENT)
}
