//! Client side of the upload protocol.
//!
//! [`UploadClient`] asks the service for an upload plan, PUTs every part
//! straight to the object store with bounded parallelism and per-part
//! retries, then hands the sorted part list back for finalization. Any
//! failure after the session is open aborts it before the error is
//! returned.

pub mod registry;
pub mod retry;

use crate::{
    handlers::identity::USER_ID_HEADER,
    models::{
        attachment::{Attachment, EntityType},
        upload::{
            AttachmentListResponse, AttachmentResponse, AttachmentUrlResponse, CompleteUploadRequest,
            CompletedPart, ConfirmDeleteResponse, InitiateUploadRequest, InitiateUploadResponse,
            LinkAttachmentRequest, PrepareDeleteResponse, PresignedPart, part_range,
        },
    },
};
use bytes::Bytes;
use futures::{StreamExt, stream};
use registry::UploadRegistry;
use reqwest::{Method, RequestBuilder, Response, StatusCode, header};
use retry::{Backoff, Exhausted, retry};
use serde::de::DeserializeOwned;
use std::{
    fmt,
    io::{self, SeekFrom},
    ops::Range,
    path::PathBuf,
};
use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("part {part} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        part: u32,
        attempts: u32,
        message: String,
    },
    #[error(
        "part {part} was stored but its ETag header was not readable; \
         the storage CORS policy must expose ETag"
    )]
    MissingEtag { part: u32 },
    #[error("upload cancelled")]
    Cancelled,
    #[error("storage rejected the request with status {status}")]
    Storage { status: u16 },
    #[error("unusable upload plan: {0}")]
    Protocol(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Attempts per part, including the first.
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Parts in flight at once.
    pub concurrency: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
            concurrency: 3,
        }
    }
}

/// Where the bytes of an upload come from.
#[derive(Debug, Clone)]
pub enum UploadSource {
    Memory(Bytes),
    File(PathBuf),
}

impl UploadSource {
    pub async fn len(&self) -> io::Result<u64> {
        match self {
            UploadSource::Memory(bytes) => Ok(bytes.len() as u64),
            UploadSource::File(path) => Ok(tokio::fs::metadata(path).await?.len()),
        }
    }

    /// Read `range` without loading the rest of the source.
    pub async fn read_range(&self, range: Range<u64>) -> io::Result<Bytes> {
        match self {
            UploadSource::Memory(bytes) => {
                if range.end > bytes.len() as u64 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "range exceeds buffer",
                    ));
                }
                Ok(bytes.slice(range.start as usize..range.end as usize))
            }
            UploadSource::File(path) => {
                let mut file = File::open(path).await?;
                file.seek(SeekFrom::Start(range.start)).await?;
                let mut buf = vec![0u8; (range.end - range.start) as usize];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

/// Everything about a file except its bytes.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub file_name: String,
    pub file_type: String,
    pub field_name: String,
    pub entity_type: EntityType,
    pub entity_id: Option<String>,
    pub project_id: String,
}

/// Why a single part PUT attempt failed.
#[derive(Debug)]
enum PartFailure {
    Transport(reqwest::Error),
    Status(StatusCode),
    MissingEtag,
}

impl fmt::Display for PartFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartFailure::Transport(err) => write!(f, "transport error: {}", err),
            PartFailure::Status(status) => write!(f, "storage answered {}", status),
            PartFailure::MissingEtag => write!(f, "response carried no ETag"),
        }
    }
}

#[derive(Clone)]
pub struct UploadClient {
    http: reqwest::Client,
    base_url: String,
    user_id: String,
    config: ClientConfig,
}

impl UploadClient {
    pub fn new(base_url: impl Into<String>, user_id: impl Into<String>, config: ClientConfig) -> Self {
        Self::with_http(reqwest::Client::new(), base_url, user_id, config)
    }

    pub fn with_http(
        http: reqwest::Client,
        base_url: impl Into<String>,
        user_id: impl Into<String>,
        config: ClientConfig,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user_id: user_id.into(),
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn api(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .header(USER_ID_HEADER, &self.user_id)
    }

    /// Upload `source` and return the recorded attachment.
    ///
    /// `local_id` must already be registered in `registry`; its state tracks
    /// the upload through to `Completed` or `Error`.
    #[tracing::instrument(skip_all, fields(file_name = %descriptor.file_name, %local_id))]
    pub async fn upload(
        &self,
        source: &UploadSource,
        descriptor: &FileDescriptor,
        registry: &UploadRegistry,
        local_id: Uuid,
        cancel: &CancellationToken,
    ) -> ClientResult<Attachment> {
        let result = self.run_upload(source, descriptor, registry, local_id, cancel).await;
        match &result {
            Ok(attachment) => registry.complete(local_id, attachment.clone()),
            Err(err) => registry.fail(local_id, err.to_string()),
        }
        result
    }

    async fn run_upload(
        &self,
        source: &UploadSource,
        descriptor: &FileDescriptor,
        registry: &UploadRegistry,
        local_id: Uuid,
        cancel: &CancellationToken,
    ) -> ClientResult<Attachment> {
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        let file_size = source.len().await?;
        let plan = self.initiate(descriptor, file_size).await?;
        if plan.presigned_urls.len() != plan.total_parts as usize {
            self.abort(&plan.upload_id, &plan.storage_key).await;
            return Err(ClientError::Protocol(format!(
                "{} part URLs for {} parts",
                plan.presigned_urls.len(),
                plan.total_parts
            )));
        }
        info!(
            upload_id = %plan.upload_id,
            total_parts = plan.total_parts,
            "upload session opened"
        );
        registry.set_progress(local_id, 0);

        let parts = match self
            .upload_parts(source, file_size, &plan, registry, local_id, cancel)
            .await
        {
            Ok(parts) => parts,
            Err(err) => {
                self.abort(&plan.upload_id, &plan.storage_key).await;
                return Err(err);
            }
        };

        if cancel.is_cancelled() {
            self.abort(&plan.upload_id, &plan.storage_key).await;
            return Err(ClientError::Cancelled);
        }

        let request = CompleteUploadRequest {
            upload_id: plan.upload_id.clone(),
            storage_key: plan.storage_key.clone(),
            parts,
            file_name: descriptor.file_name.clone(),
            file_size,
            file_type: descriptor.file_type.clone(),
            field_name: descriptor.field_name.clone(),
            entity_type: descriptor.entity_type,
            entity_id: descriptor.entity_id.clone(),
            project_id: descriptor.project_id.clone(),
        };
        match self.complete(&request).await {
            Ok(attachment) => {
                info!(attachment_id = %attachment.id, "upload finalized");
                Ok(attachment)
            }
            Err(err) => {
                self.abort(&plan.upload_id, &plan.storage_key).await;
                Err(err)
            }
        }
    }

    /// `POST /upload`
    pub async fn initiate(
        &self,
        descriptor: &FileDescriptor,
        file_size: u64,
    ) -> ClientResult<InitiateUploadResponse> {
        let body = InitiateUploadRequest {
            file_name: descriptor.file_name.clone(),
            file_size,
            file_type: descriptor.file_type.clone(),
            field_name: descriptor.field_name.clone(),
            entity_type: descriptor.entity_type,
            entity_id: descriptor.entity_id.clone(),
            project_id: descriptor.project_id.clone(),
        };
        let resp = self.api(Method::POST, "/upload").json(&body).send().await?;
        read_json(resp).await
    }

    /// `POST /upload/complete`
    pub async fn complete(&self, request: &CompleteUploadRequest) -> ClientResult<Attachment> {
        let resp = self
            .api(Method::POST, "/upload/complete")
            .json(request)
            .send()
            .await?;
        let body: AttachmentResponse = read_json(resp).await?;
        Ok(body.attachment)
    }

    /// `DELETE /upload/abort`. Best-effort: failures are logged only.
    pub async fn abort(&self, upload_id: &str, storage_key: &str) {
        let result = self
            .api(Method::DELETE, "/upload/abort")
            .query(&[("uploadId", upload_id), ("fileKey", storage_key)])
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                info!(%upload_id, "upload session aborted");
            }
            Ok(resp) => warn!(%upload_id, "abort answered {}", resp.status()),
            Err(err) => warn!(%upload_id, "abort request failed: {}", err),
        }
    }

    /// PUT all parts, at most `concurrency` at a time. The returned list is
    /// sorted by part number.
    async fn upload_parts(
        &self,
        source: &UploadSource,
        file_size: u64,
        plan: &InitiateUploadResponse,
        registry: &UploadRegistry,
        local_id: Uuid,
        cancel: &CancellationToken,
    ) -> ClientResult<Vec<CompletedPart>> {
        let total = plan.total_parts;
        let mut in_flight = stream::iter(plan.presigned_urls.iter())
            .map(|part| async move {
                tokio::select! {
                    _ = cancel.cancelled() => Err(ClientError::Cancelled),
                    res = self.upload_part(source, file_size, plan.chunk_size, part) => res,
                }
            })
            .buffer_unordered(self.config.concurrency.max(1));

        let mut completed = Vec::with_capacity(total as usize);
        while let Some(result) = in_flight.next().await {
            completed.push(result?);
            let progress = completed.len() as u64 * 100 / u64::from(total.max(1));
            registry.set_progress(local_id, progress as u8);
        }

        completed.sort_by_key(|p| p.part_number);
        Ok(completed)
    }

    async fn upload_part(
        &self,
        source: &UploadSource,
        file_size: u64,
        chunk_size: u64,
        part: &PresignedPart,
    ) -> ClientResult<CompletedPart> {
        let part_number = part.part_number;
        let range = part_range(part_number, file_size, chunk_size).ok_or_else(|| {
            ClientError::Protocol(format!("part {} is outside the file", part_number))
        })?;
        let body = source.read_range(range).await?;

        let url = part.url.as_str();
        let outcome = retry(self.config.max_attempts, &self.config.backoff, move |attempt| {
            debug!(part_number, attempt, "uploading part");
            self.put_part(url, body.clone())
        })
        .await;

        match outcome {
            Ok(etag) => Ok(CompletedPart { part_number, etag }),
            Err(Exhausted {
                last: PartFailure::MissingEtag,
                ..
            }) => Err(ClientError::MissingEtag { part: part_number }),
            Err(Exhausted { attempts, last }) => Err(ClientError::RetriesExhausted {
                part: part_number,
                attempts,
                message: last.to_string(),
            }),
        }
    }

    /// One raw PUT of a part body; no application headers are added so the
    /// presigned signature stays valid.
    async fn put_part(&self, url: &str, body: Bytes) -> Result<String, PartFailure> {
        let resp = self
            .http
            .put(url)
            .body(body)
            .send()
            .await
            .map_err(PartFailure::Transport)?;
        if !resp.status().is_success() {
            return Err(PartFailure::Status(resp.status()));
        }
        resp.headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.trim().trim_matches('"').is_empty())
            .map(str::to_string)
            .ok_or(PartFailure::MissingEtag)
    }

    /// Two-phase delete: `prepare`, the storage DELETE when the server
    /// hands out a URL, then `confirm`.
    #[tracing::instrument(skip(self))]
    pub async fn delete_attachment(&self, id: Uuid) -> ClientResult<()> {
        let resp = self
            .api(Method::DELETE, &format!("/attachments/{}", id))
            .query(&[("step", "prepare")])
            .send()
            .await?;
        let prepared: PrepareDeleteResponse = read_json(resp).await?;

        if let Some(url) = prepared.delete_url {
            let resp = self.http.delete(&url).send().await?;
            let status = resp.status();
            if !status.is_success() && status != StatusCode::NOT_FOUND {
                return Err(ClientError::Storage {
                    status: status.as_u16(),
                });
            }
            debug!("storage object deleted");
        }

        let resp = self
            .api(Method::DELETE, &format!("/attachments/{}", id))
            .query(&[("step", "confirm")])
            .send()
            .await?;
        let _: ConfirmDeleteResponse = read_json(resp).await?;
        info!("attachment deleted");
        Ok(())
    }

    /// `PATCH /attachments/{id}`
    pub async fn link_attachment(
        &self,
        id: Uuid,
        entity_type: EntityType,
        entity_id: &str,
    ) -> ClientResult<Attachment> {
        let body = LinkAttachmentRequest {
            entity_type,
            entity_id: entity_id.to_string(),
        };
        let resp = self
            .api(Method::PATCH, &format!("/attachments/{}", id))
            .json(&body)
            .send()
            .await?;
        let body: AttachmentResponse = read_json(resp).await?;
        Ok(body.attachment)
    }

    /// `GET /attachments/{id}`
    pub async fn read_url(&self, id: Uuid) -> ClientResult<AttachmentUrlResponse> {
        let resp = self
            .api(Method::GET, &format!("/attachments/{}", id))
            .send()
            .await?;
        read_json(resp).await
    }

    /// `GET /attachments?entityType=&entityId=`
    pub async fn list(&self, entity_type: EntityType, entity_id: &str) -> ClientResult<Vec<Attachment>> {
        let resp = self
            .api(Method::GET, "/attachments")
            .query(&[("entityType", entity_type.as_str()), ("entityId", entity_id)])
            .send()
            .await?;
        let body: AttachmentListResponse = read_json(resp).await?;
        Ok(body.attachments)
    }
}

/// Decode a success body, or turn the service's `{error, status}` body into
/// [`ClientError::Rejected`].
async fn read_json<T: DeserializeOwned>(resp: Response) -> ClientResult<T> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }
    let text = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&text)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or(text);
    Err(ClientError::Rejected {
        status: status.as_u16(),
        message,
    })
}
