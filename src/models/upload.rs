//! Wire types for the multipart upload protocol and attachment endpoints.
//!
//! These are shared by the HTTP handlers and the client uploader, so the
//! JSON shape is defined in exactly one place.

use super::attachment::{Attachment, EntityType};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Number of parts needed for `file_size` bytes split into `chunk_size` chunks.
pub fn part_count(file_size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    file_size.div_ceil(chunk_size)
}

/// Byte range `[start, end)` covered by a 1-based `part_number`.
///
/// Returns `None` for part numbers outside `1..=part_count`.
pub fn part_range(part_number: u32, file_size: u64, chunk_size: u64) -> Option<Range<u64>> {
    if part_number == 0 || u64::from(part_number) > part_count(file_size, chunk_size) {
        return None;
    }
    let start = u64::from(part_number - 1) * chunk_size;
    let end = (start + chunk_size).min(file_size);
    Some(start..end)
}

/// `POST /upload` body.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct InitiateUploadRequest {
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub field_name: String,
    pub entity_type: EntityType,
    #[serde(default)]
    pub entity_id: Option<String>,
    pub project_id: String,
}

/// One presigned PUT target.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresignedPart {
    pub part_number: u32,
    pub url: String,
}

/// `POST /upload` response: an open multipart session.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct InitiateUploadResponse {
    pub upload_id: String,
    pub storage_key: String,
    pub total_parts: u32,
    pub chunk_size: u64,
    pub presigned_urls: Vec<PresignedPart>,
}

/// A part the object store accepted, identified by its ETag.
///
/// Field names follow the S3 `CompleteMultipartUpload` spelling.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    #[serde(rename = "PartNumber")]
    pub part_number: u32,
    #[serde(rename = "ETag")]
    pub etag: String,
}

/// `POST /upload/complete` body.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadRequest {
    pub upload_id: String,
    pub storage_key: String,
    pub parts: Vec<CompletedPart>,
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub field_name: String,
    pub entity_type: EntityType,
    #[serde(default)]
    pub entity_id: Option<String>,
    pub project_id: String,
}

/// Response carrying a single attachment.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AttachmentResponse {
    pub attachment: Attachment,
}

/// `GET /attachments` response.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AttachmentListResponse {
    pub attachments: Vec<Attachment>,
}

/// `DELETE /upload/abort` query. Missing fields deserialize as empty so the
/// endpoint can stay best-effort.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AbortUploadQuery {
    pub upload_id: String,
    pub file_key: String,
}

/// Phase of a two-phase delete.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeleteStep {
    Prepare,
    Confirm,
}

/// `DELETE /attachments/{id}` query.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DeleteQuery {
    pub step: DeleteStep,
}

/// `prepare` response. `None` means there is nothing to delete client-side.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrepareDeleteResponse {
    pub delete_url: Option<String>,
}

/// `confirm` response.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ConfirmDeleteResponse {
    pub success: bool,
}

/// `GET /attachments/{id}` response: a short-lived read URL plus metadata.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentUrlResponse {
    pub url: String,
    pub filename: String,
    pub original_name: String,
    pub mime_type: String,
    pub size: i64,
}

/// `PATCH /attachments/{id}` body.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LinkAttachmentRequest {
    pub entity_type: EntityType,
    pub entity_id: String,
}

/// `GET /attachments` query.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ListAttachmentsQuery {
    pub entity_type: EntityType,
    pub entity_id: String,
}
