//! HTTP handlers for finalized attachments: read URL, link, list and the
//! two-phase delete.

use super::identity::UploaderId;
use crate::{
    errors::AppError,
    models::upload::{
        AttachmentListResponse, AttachmentResponse, AttachmentUrlResponse, ConfirmDeleteResponse,
        DeleteQuery, DeleteStep, LinkAttachmentRequest, ListAttachmentsQuery,
        PrepareDeleteResponse,
    },
    services::upload_service::UploadService,
};
use axum::{
    Json,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    response::{IntoResponse, Response},
};
use uuid::Uuid;

/// `GET /attachments/{id}`
pub async fn get_attachment(
    State(service): State<UploadService>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<AttachmentUrlResponse>, AppError> {
    let Path(id) = id?;
    Ok(Json(service.read_url(id).await?))
}

/// `PATCH /attachments/{id}` links the attachment to its entity.
pub async fn link_attachment(
    State(service): State<UploadService>,
    UploaderId(user): UploaderId,
    id: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<LinkAttachmentRequest>, JsonRejection>,
) -> Result<Json<AttachmentResponse>, AppError> {
    let Path(id) = id?;
    let Json(req) = payload?;
    tracing::debug!(%user, attachment_id = %id, "link attachment");
    let attachment = service.link(id, req.entity_type, &req.entity_id).await?;
    Ok(Json(AttachmentResponse { attachment }))
}

/// `GET /attachments?entityType=&entityId=`
pub async fn list_attachments(
    State(service): State<UploadService>,
    query: Result<Query<ListAttachmentsQuery>, QueryRejection>,
) -> Result<Json<AttachmentListResponse>, AppError> {
    let Query(query) = query?;
    let attachments = service.list(query.entity_type, &query.entity_id).await?;
    Ok(Json(AttachmentListResponse { attachments }))
}

/// `DELETE /attachments/{id}?step=prepare|confirm`
///
/// `prepare` returns the URL the client deletes the object with (`null`
/// when there is nothing to delete client-side); `confirm` drops the
/// record and succeeds for records that are already gone.
pub async fn delete_attachment(
    State(service): State<UploadService>,
    id: Result<Path<Uuid>, PathRejection>,
    query: Result<Query<DeleteQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let Path(id) = id?;
    let Query(query) = query?;
    match query.step {
        DeleteStep::Prepare => {
            let delete_url = service.prepare_delete(id).await?;
            Ok(Json(PrepareDeleteResponse { delete_url }).into_response())
        }
        DeleteStep::Confirm => {
            service.confirm_delete(id).await?;
            Ok(Json(ConfirmDeleteResponse { success: true }).into_response())
        }
    }
}
