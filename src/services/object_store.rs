//! Object-store abstraction used by the upload protocol.
//!
//! The application never moves payload bytes itself when a real object store
//! is configured: it only opens/completes/aborts multipart sessions and hands
//! out presigned URLs. The local-disk fallback implements the same trait with
//! app-served URLs.

use crate::models::upload::CompletedPart;
use async_trait::async_trait;
use std::{io, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object store request failed: {0}")]
    Backend(String),
    #[error("upload `{0}` does not exist")]
    NoSuchUpload(String),
    #[error("invalid part {part_number}: {reason}")]
    InvalidPart { part_number: u32, reason: String },
    #[error("invalid upload id")]
    InvalidUploadId,
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("stored object is {actual} bytes but {expected} were declared")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("object `{0}` still exists in storage")]
    ObjectStillPresent(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Operations the upload protocol needs from an object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short backend name for logs and readiness output.
    fn kind(&self) -> &'static str;

    /// Open a multipart session for `key`, returning the store's upload id.
    async fn create_multipart_upload(&self, key: &str, content_type: &str) -> StoreResult<String>;

    /// URL the client PUTs part `part_number` to.
    async fn presign_upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        expires_in: Duration,
    ) -> StoreResult<String>;

    /// Stitch the parts together. `parts` is sorted and contiguous.
    ///
    /// Fails with [`StoreError::SizeMismatch`] when the finished object is
    /// not exactly `expected_size` bytes; no object is left behind then.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
        expected_size: u64,
    ) -> StoreResult<()>;

    /// Abandon a session and free its uploaded parts.
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StoreResult<()>;

    /// Presigned DELETE URL, or `None` when the client has nothing to delete
    /// (the server removes the object itself at confirm time).
    async fn presign_delete(&self, key: &str, expires_in: Duration) -> StoreResult<Option<String>>;

    /// Read URL for `key`, served with `download_name` as the file name.
    async fn presign_get(
        &self,
        key: &str,
        download_name: &str,
        expires_in: Duration,
    ) -> StoreResult<String>;

    /// Called by delete confirmation before the metadata row goes away.
    ///
    /// Presigned-delete backends check that the client really removed the
    /// object; backends without presigned deletes remove it here.
    async fn finish_delete(&self, key: &str, verify: bool) -> StoreResult<()>;

    /// Cheap round trip used by `/readyz`.
    async fn probe(&self) -> StoreResult<()>;
}
