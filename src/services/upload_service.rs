//! src/services/upload_service.rs
//!
//! UploadService — the server half of the direct-to-storage upload protocol:
//! initiate (open a multipart session and presign one URL per part),
//! complete (close the session, then persist exactly one attachment row),
//! abort (best-effort session cleanup) and the two-phase delete. Payload
//! bytes never pass through here; per-upload state is O(1).

use super::{
    attachment_repo::AttachmentRepo,
    object_store::{ObjectStore, StoreError},
};
use crate::{
    config::AppConfig,
    models::{
        attachment::{Attachment, EntityType},
        upload::{
            AttachmentUrlResponse, CompleteUploadRequest, CompletedPart, InitiateUploadRequest,
            InitiateUploadResponse, PresignedPart, part_count,
        },
    },
};
use chrono::Utc;
use futures::future::try_join_all;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

/// S3 refuses more parts than this in one upload.
pub const MAX_PARTS: u64 = 10_000;
const MAX_FILE_NAME_LEN: usize = 128;
const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("attachments are disabled")]
    Disabled,
    #[error("{0}")]
    Validation(String),
    #[error("incomplete upload: {0}")]
    IncompleteUpload(String),
    #[error("attachment `{0}` not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

/// Limits and timings applied to every upload.
#[derive(Clone, Debug)]
pub struct UploadPolicy {
    pub attachments_enabled: bool,
    pub max_file_size: u64,
    pub chunk_size: u64,
    /// Lifetime of part PUT URLs; generous relative to upload duration.
    pub part_url_ttl: Duration,
    /// Lifetime of read and delete URLs.
    pub short_url_ttl: Duration,
    /// HEAD the object before dropping its row on delete confirmation.
    pub verify_delete: bool,
}

impl From<&AppConfig> for UploadPolicy {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            attachments_enabled: cfg.attachments_enabled,
            max_file_size: cfg.max_file_size,
            chunk_size: cfg.chunk_size,
            part_url_ttl: Duration::from_secs(cfg.part_url_ttl_secs),
            short_url_ttl: Duration::from_secs(cfg.short_url_ttl_secs),
            verify_delete: cfg.verify_delete,
        }
    }
}

#[derive(Clone)]
pub struct UploadService {
    store: Arc<dyn ObjectStore>,
    repo: AttachmentRepo,
    policy: UploadPolicy,
}

impl UploadService {
    pub fn new(store: Arc<dyn ObjectStore>, repo: AttachmentRepo, policy: UploadPolicy) -> Self {
        Self {
            store,
            repo,
            policy,
        }
    }

    pub fn store(&self) -> &dyn ObjectStore {
        self.store.as_ref()
    }

    pub fn repo(&self) -> &AttachmentRepo {
        &self.repo
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    fn ensure_enabled(&self) -> UploadResult<()> {
        if self.policy.attachments_enabled {
            Ok(())
        } else {
            Err(UploadError::Disabled)
        }
    }

    /// Checks shared by initiate and complete. Returns the normalized MIME type.
    fn validate_descriptor(
        &self,
        file_name: &str,
        file_size: u64,
        file_type: &str,
        field_name: &str,
        project_id: &str,
    ) -> UploadResult<String> {
        if file_name.trim().is_empty() {
            return Err(UploadError::Validation("fileName is required".into()));
        }
        if field_name.trim().is_empty() {
            return Err(UploadError::Validation("fieldName is required".into()));
        }
        if project_id.trim().is_empty() {
            return Err(UploadError::Validation("projectId is required".into()));
        }
        if sanitize_segment(project_id) != project_id {
            return Err(UploadError::Validation(
                "projectId may only contain letters, digits, '.', '-' and '_'".into(),
            ));
        }
        if file_size == 0 {
            return Err(UploadError::Validation("file is empty".into()));
        }
        if file_size > self.policy.max_file_size {
            return Err(UploadError::Validation(format!(
                "file size {} exceeds the limit of {} bytes",
                file_size, self.policy.max_file_size
            )));
        }

        let mime = normalize_mime(file_type);
        if mime.starts_with("video/") {
            return Err(UploadError::Validation(format!(
                "video uploads are not allowed ({})",
                mime
            )));
        }

        let total_parts = part_count(file_size, self.policy.chunk_size);
        if total_parts > MAX_PARTS {
            return Err(UploadError::Validation(format!(
                "file needs {} parts; at most {} are allowed",
                total_parts, MAX_PARTS
            )));
        }
        Ok(mime)
    }

    /// Open a multipart session and presign one PUT URL per part.
    #[tracing::instrument(
        skip(self, req),
        fields(file_size = req.file_size, project_id = %req.project_id),
        err
    )]
    pub async fn initiate(&self, req: InitiateUploadRequest) -> UploadResult<InitiateUploadResponse> {
        self.ensure_enabled()?;
        let mime = self.validate_descriptor(
            &req.file_name,
            req.file_size,
            &req.file_type,
            &req.field_name,
            &req.project_id,
        )?;

        let chunk_size = self.policy.chunk_size;
        let total_parts = part_count(req.file_size, chunk_size) as u32;
        let storage_key = storage_key(&req.project_id, req.entity_type, &req.file_name);

        let upload_id = self
            .store
            .create_multipart_upload(&storage_key, &mime)
            .await?;

        let presign = (1..=total_parts).map(|part_number| {
            let key = storage_key.as_str();
            let upload_id = upload_id.as_str();
            async move {
                let url = self
                    .store
                    .presign_upload_part(key, upload_id, part_number, self.policy.part_url_ttl)
                    .await?;
                Ok::<_, StoreError>(PresignedPart { part_number, url })
            }
        });
        let presigned_urls = match try_join_all(presign).await {
            Ok(urls) => urls,
            Err(err) => {
                self.abort(&upload_id, &storage_key).await;
                return Err(err.into());
            }
        };

        info!(%storage_key, %upload_id, total_parts, "opened upload session");

        Ok(InitiateUploadResponse {
            upload_id,
            storage_key,
            total_parts,
            chunk_size,
            presigned_urls,
        })
    }

    /// Complete the multipart session, then record the attachment.
    ///
    /// Nothing is written to the database unless the store accepted the part
    /// list, and the store is never contacted with an invalid list.
    #[tracing::instrument(
        skip(self, req),
        fields(storage_key = %req.storage_key, upload_id = %req.upload_id),
        err
    )]
    pub async fn complete(
        &self,
        req: CompleteUploadRequest,
        uploaded_by: &str,
    ) -> UploadResult<Attachment> {
        self.ensure_enabled()?;
        let mime = self.validate_descriptor(
            &req.file_name,
            req.file_size,
            &req.file_type,
            &req.field_name,
            &req.project_id,
        )?;

        let expected_prefix = format!("attachments/{}/{}/", req.project_id, req.entity_type);
        if !req.storage_key.starts_with(&expected_prefix) {
            return Err(UploadError::Validation(
                "storageKey does not belong to this project and entity type".into(),
            ));
        }
        if req.upload_id.trim().is_empty() {
            return Err(UploadError::Validation("uploadId is required".into()));
        }

        let expected_parts = part_count(req.file_size, self.policy.chunk_size);
        validate_parts(&req.parts, expected_parts)?;

        self.store
            .complete_multipart_upload(&req.storage_key, &req.upload_id, &req.parts, req.file_size)
            .await?;

        let attachment = Attachment {
            id: Uuid::new_v4(),
            storage_key: req.storage_key,
            original_name: req.file_name,
            mime_type: mime,
            size_bytes: req.file_size as i64,
            field_name: req.field_name,
            entity_type: req.entity_type,
            entity_id: req.entity_id.filter(|id| !id.trim().is_empty()),
            project_id: req.project_id,
            uploaded_by_id: uploaded_by.to_string(),
            uploaded_at: Utc::now(),
        };

        match self.repo.insert(&attachment).await {
            Ok(row) => {
                info!(attachment_id = %row.id, "attachment recorded");
                Ok(row)
            }
            Err(err) => {
                error!(
                    storage_key = %attachment.storage_key,
                    "object completed but attachment row was not written: {}", err
                );
                Err(err.into())
            }
        }
    }

    /// Abandon a multipart session. Failures are logged, never returned: the
    /// store's own incomplete-upload expiry is the backstop.
    pub async fn abort(&self, upload_id: &str, storage_key: &str) {
        if upload_id.is_empty() || storage_key.is_empty() {
            warn!("abort requested without uploadId or fileKey");
            return;
        }
        match self
            .store
            .abort_multipart_upload(storage_key, upload_id)
            .await
        {
            Ok(()) => info!(%storage_key, %upload_id, "aborted upload session"),
            Err(err) => warn!(%storage_key, %upload_id, "abort failed: {}", err),
        }
    }

    async fn find(&self, id: Uuid) -> UploadResult<Attachment> {
        self.repo.find(id).await?.ok_or(UploadError::NotFound(id))
    }

    /// First delete phase: a URL the client deletes the object with, or
    /// `None` when there is no client-side storage step.
    #[tracing::instrument(skip(self), err)]
    pub async fn prepare_delete(&self, id: Uuid) -> UploadResult<Option<String>> {
        self.ensure_enabled()?;
        let attachment = self.find(id).await?;
        let url = self
            .store
            .presign_delete(&attachment.storage_key, self.policy.short_url_ttl)
            .await?;
        Ok(url)
    }

    /// Second delete phase: drop the metadata row. Idempotent.
    #[tracing::instrument(skip(self), err)]
    pub async fn confirm_delete(&self, id: Uuid) -> UploadResult<()> {
        self.ensure_enabled()?;
        let Some(attachment) = self.repo.find(id).await? else {
            info!("attachment already deleted");
            return Ok(());
        };

        self.store
            .finish_delete(&attachment.storage_key, self.policy.verify_delete)
            .await?;

        if self.repo.delete(id).await? {
            info!(storage_key = %attachment.storage_key, "attachment deleted");
        }
        Ok(())
    }

    /// Short-lived read URL plus display metadata.
    pub async fn read_url(&self, id: Uuid) -> UploadResult<AttachmentUrlResponse> {
        self.ensure_enabled()?;
        let attachment = self.find(id).await?;
        let url = self
            .store
            .presign_get(
                &attachment.storage_key,
                &attachment.original_name,
                self.policy.short_url_ttl,
            )
            .await?;
        Ok(AttachmentUrlResponse {
            url,
            filename: attachment.filename().to_string(),
            original_name: attachment.original_name,
            mime_type: attachment.mime_type,
            size: attachment.size_bytes,
        })
    }

    /// Associate an attachment with its entity after the fact.
    pub async fn link(
        &self,
        id: Uuid,
        entity_type: EntityType,
        entity_id: &str,
    ) -> UploadResult<Attachment> {
        self.ensure_enabled()?;
        if entity_id.trim().is_empty() {
            return Err(UploadError::Validation("entityId is required".into()));
        }
        let linked = self
            .repo
            .link(id, entity_type, entity_id.trim())
            .await?
            .ok_or(UploadError::NotFound(id))?;
        info!(attachment_id = %id, %entity_type, entity_id, "attachment linked");
        Ok(linked)
    }

    pub async fn list(&self, entity_type: EntityType, entity_id: &str) -> UploadResult<Vec<Attachment>> {
        self.ensure_enabled()?;
        Ok(self.repo.list_for_entity(entity_type, entity_id).await?)
    }
}

/// The finalizer's part list must be exactly `1..=expected`, in order, each
/// with a non-empty ETag.
pub fn validate_parts(parts: &[CompletedPart], expected: u64) -> UploadResult<()> {
    if parts.len() as u64 != expected {
        return Err(UploadError::IncompleteUpload(format!(
            "expected {} parts, got {}",
            expected,
            parts.len()
        )));
    }
    for (index, part) in parts.iter().enumerate() {
        let want = index as u32 + 1;
        if part.part_number != want {
            return Err(UploadError::IncompleteUpload(format!(
                "part list must be sorted and contiguous; found part {} at position {}",
                part.part_number, want
            )));
        }
        if part.etag.trim().trim_matches('"').is_empty() {
            return Err(UploadError::IncompleteUpload(format!(
                "part {} is missing its ETag",
                part.part_number
            )));
        }
    }
    Ok(())
}

fn normalize_mime(file_type: &str) -> String {
    let mime = file_type.trim().to_ascii_lowercase();
    if mime.is_empty() {
        DEFAULT_MIME_TYPE.to_string()
    } else {
        mime
    }
}

/// Keep `[A-Za-z0-9._-]`, replace anything else with `_`, never yield `..`.
fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .take(MAX_FILE_NAME_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    cleaned.replace("..", "_")
}

/// `attachments/{project}/{entityType}/{uuid}-{name}`
pub fn storage_key(project_id: &str, entity_type: EntityType, file_name: &str) -> String {
    let name = sanitize_segment(file_name);
    let name = if name.is_empty() { "file".to_string() } else { name };
    format!(
        "attachments/{}/{}/{}-{}",
        sanitize_segment(project_id),
        entity_type,
        Uuid::new_v4(),
        name
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, services::local_store::LocalStore};
    use async_trait::async_trait;
    use std::{
        collections::HashSet,
        path::Path,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    const MIB: u64 = 1024 * 1024;

    fn policy(chunk_size: u64) -> UploadPolicy {
        UploadPolicy {
            attachments_enabled: true,
            max_file_size: 500 * MIB,
            chunk_size,
            part_url_ttl: Duration::from_secs(3600),
            short_url_ttl: Duration::from_secs(300),
            verify_delete: true,
        }
    }

    /// In-memory store that hands out presigned deletes, like S3 does.
    #[derive(Default)]
    struct PresigningStore {
        objects: Mutex<HashSet<String>>,
        sessions_opened: AtomicUsize,
        completions: AtomicUsize,
    }

    #[async_trait]
    impl ObjectStore for PresigningStore {
        fn kind(&self) -> &'static str {
            "memory"
        }
        async fn create_multipart_upload(&self, _key: &str, _ct: &str) -> Result<String, StoreError> {
            self.sessions_opened.fetch_add(1, Ordering::SeqCst);
            Ok("session-1".into())
        }
        async fn presign_upload_part(
            &self,
            key: &str,
            upload_id: &str,
            part_number: u32,
            _expires_in: Duration,
        ) -> Result<String, StoreError> {
            Ok(format!("https://bucket/{key}?uploadId={upload_id}&partNumber={part_number}"))
        }
        async fn complete_multipart_upload(
            &self,
            key: &str,
            _upload_id: &str,
            _parts: &[CompletedPart],
            _expected_size: u64,
        ) -> Result<(), StoreError> {
            self.completions.fetch_add(1, Ordering::SeqCst);
            self.objects.lock().unwrap().insert(key.to_string());
            Ok(())
        }
        async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> Result<(), StoreError> {
            Err(StoreError::NoSuchUpload(upload_id.to_string()))
        }
        async fn presign_delete(&self, key: &str, _e: Duration) -> Result<Option<String>, StoreError> {
            Ok(Some(format!("https://bucket/{key}?sig=delete")))
        }
        async fn presign_get(&self, key: &str, _n: &str, _e: Duration) -> Result<String, StoreError> {
            Ok(format!("https://bucket/{key}?sig=get"))
        }
        async fn finish_delete(&self, key: &str, verify: bool) -> Result<(), StoreError> {
            if verify && self.objects.lock().unwrap().contains(key) {
                return Err(StoreError::ObjectStillPresent(key.to_string()));
            }
            Ok(())
        }
        async fn probe(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    async fn service_with(store: Arc<dyn ObjectStore>, dir: &Path, chunk: u64) -> UploadService {
        let repo = AttachmentRepo::new(db::test_pool(dir).await);
        UploadService::new(store, repo, policy(chunk))
    }

    fn initiate_req(size: u64, mime: &str) -> InitiateUploadRequest {
        InitiateUploadRequest {
            file_name: "crash report.txt".into(),
            file_size: size,
            file_type: mime.into(),
            field_name: "description".into(),
            entity_type: EntityType::Defect,
            entity_id: None,
            project_id: "proj-1".into(),
        }
    }

    fn complete_req(init: &InitiateUploadResponse, size: u64, parts: Vec<CompletedPart>) -> CompleteUploadRequest {
        CompleteUploadRequest {
            upload_id: init.upload_id.clone(),
            storage_key: init.storage_key.clone(),
            parts,
            file_name: "crash report.txt".into(),
            file_size: size,
            file_type: "text/plain".into(),
            field_name: "description".into(),
            entity_type: EntityType::Defect,
            entity_id: None,
            project_id: "proj-1".into(),
        }
    }

    fn etags(n: u32) -> Vec<CompletedPart> {
        (1..=n)
            .map(|part_number| CompletedPart {
                part_number,
                etag: format!("\"etag-{part_number}\""),
            })
            .collect()
    }

    #[tokio::test]
    async fn initiate_plans_three_parts_for_25_mib() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(PresigningStore::default());
        let svc = service_with(store.clone(), dir.path(), 10 * MIB).await;

        let resp = svc.initiate(initiate_req(25 * MIB, "text/plain")).await.unwrap();
        assert_eq!(resp.total_parts, 3);
        assert_eq!(resp.chunk_size, 10 * MIB);
        let numbers: Vec<u32> = resp.presigned_urls.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(resp.presigned_urls[2].url.contains("partNumber=3"));
        assert!(resp.storage_key.starts_with("attachments/proj-1/defect/"));
        assert!(resp.storage_key.ends_with("-crash_report.txt"));
    }

    #[tokio::test]
    async fn video_is_rejected_before_any_session_opens() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(PresigningStore::default());
        let svc = service_with(store.clone(), dir.path(), 10 * MIB).await;

        let err = svc.initiate(initiate_req(MIB, "video/mp4")).await.unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));
        assert_eq!(store.sessions_opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn size_limits_are_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service_with(Arc::new(PresigningStore::default()), dir.path(), 10 * MIB).await;

        assert!(matches!(
            svc.initiate(initiate_req(0, "text/plain")).await,
            Err(UploadError::Validation(_))
        ));
        assert!(matches!(
            svc.initiate(initiate_req(500 * MIB + 1, "text/plain")).await,
            Err(UploadError::Validation(_))
        ));
        assert!(svc.initiate(initiate_req(500 * MIB, "text/plain")).await.is_ok());
    }

    #[tokio::test]
    async fn too_many_parts_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service_with(Arc::new(PresigningStore::default()), dir.path(), 1).await;
        let err = svc.initiate(initiate_req(MAX_PARTS + 1, "text/plain")).await.unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));
    }

    #[tokio::test]
    async fn incomplete_part_lists_never_reach_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(PresigningStore::default());
        let svc = service_with(store.clone(), dir.path(), 10).await;
        let init = svc.initiate(initiate_req(25, "text/plain")).await.unwrap();

        let mut gap = etags(3);
        gap.remove(1);
        let mut unsorted = etags(3);
        unsorted.swap(0, 1);
        let mut duplicate = etags(3);
        duplicate[2].part_number = 2;
        let mut blank = etags(3);
        blank[1].etag = "\"\"".into();

        for parts in [gap, unsorted, duplicate, blank] {
            let err = svc.complete(complete_req(&init, 25, parts), "u1").await.unwrap_err();
            assert!(matches!(err, UploadError::IncompleteUpload(_)), "{err}");
        }
        assert_eq!(store.completions.load(Ordering::SeqCst), 0);
        assert!(svc.repo().list_for_entity(EntityType::Defect, "x").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn foreign_storage_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service_with(Arc::new(PresigningStore::default()), dir.path(), 10).await;
        let mut init = svc.initiate(initiate_req(5, "text/plain")).await.unwrap();
        let key = init.storage_key.clone();
        init.storage_key = "attachments/other-project/defect/x".into();
        let err = svc.complete(complete_req(&init, 5, etags(1)), "u1").await.unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));

        init.storage_key = key;
        let mut wrong_entity = complete_req(&init, 5, etags(1));
        wrong_entity.entity_type = EntityType::Comment;
        let err = svc.complete(wrong_entity, "u1").await.unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));
    }

    #[tokio::test]
    async fn project_ids_must_already_be_key_safe() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(PresigningStore::default());
        let svc = service_with(store.clone(), dir.path(), 10).await;

        for project in ["p 1", "p/1", " proj-1", "a..b"] {
            let mut req = initiate_req(5, "text/plain");
            req.project_id = project.into();
            let err = svc.initiate(req).await.unwrap_err();
            assert!(matches!(err, UploadError::Validation(_)), "{project}");
        }
        assert_eq!(store.sessions_opened.load(Ordering::SeqCst), 0);

        // "p_1" would otherwise own keys minted for "p 1".
        let mut req = initiate_req(5, "text/plain");
        req.project_id = "p_1".into();
        let init = svc.initiate(req).await.unwrap();
        let mut complete = complete_req(&init, 5, etags(1));
        complete.project_id = "p 1".into();
        let err = svc.complete(complete, "u1").await.unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));
        assert_eq!(store.completions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unlinked_attachment_can_be_linked_later() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service_with(Arc::new(PresigningStore::default()), dir.path(), 10).await;
        let init = svc.initiate(initiate_req(15, "text/plain")).await.unwrap();
        let attachment = svc.complete(complete_req(&init, 15, etags(2)), "u1").await.unwrap();
        assert_eq!(attachment.entity_id, None);
        assert_eq!(attachment.uploaded_by_id, "u1");

        svc.link(attachment.id, EntityType::Comment, "comment-7").await.unwrap();
        let listed = svc.list(EntityType::Comment, "comment-7").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, attachment.id);
        assert_eq!(listed[0].entity_id.as_deref(), Some("comment-7"));

        assert!(matches!(
            svc.link(Uuid::new_v4(), EntityType::Comment, "c").await,
            Err(UploadError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn confirm_verifies_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(PresigningStore::default());
        let svc = service_with(store.clone(), dir.path(), 10).await;
        let init = svc.initiate(initiate_req(5, "text/plain")).await.unwrap();
        let attachment = svc.complete(complete_req(&init, 5, etags(1)), "u1").await.unwrap();

        let url = svc.prepare_delete(attachment.id).await.unwrap();
        assert!(url.unwrap().contains("sig=delete"));

        // Client has not deleted the object yet.
        let err = svc.confirm_delete(attachment.id).await.unwrap_err();
        assert!(matches!(err, UploadError::Storage(StoreError::ObjectStillPresent(_))));
        assert!(svc.repo().find(attachment.id).await.unwrap().is_some());

        store.objects.lock().unwrap().clear();
        svc.confirm_delete(attachment.id).await.unwrap();
        svc.confirm_delete(attachment.id).await.unwrap();
        assert!(svc.repo().find(attachment.id).await.unwrap().is_none());

        assert!(matches!(
            svc.prepare_delete(attachment.id).await,
            Err(UploadError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn local_mode_prepare_returns_no_url_and_confirm_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalStore::new(dir.path().join("objects"), "http://localhost:3000");
        let svc = service_with(Arc::new(local.clone()), dir.path(), 4).await;

        let init = svc.initiate(initiate_req(6, "text/plain")).await.unwrap();
        let stream = |data: &'static [u8]| {
            futures::stream::iter(vec![Ok::<_, std::io::Error>(bytes::Bytes::from_static(data))])
        };
        let e1 = local.write_part(&init.upload_id, 1, stream(b"abcd")).await.unwrap();
        let e2 = local.write_part(&init.upload_id, 2, stream(b"ef")).await.unwrap();
        let parts = vec![
            CompletedPart { part_number: 1, etag: e1 },
            CompletedPart { part_number: 2, etag: e2 },
        ];
        let attachment = svc.complete(complete_req(&init, 6, parts), "u1").await.unwrap();
        assert!(local.object_path(&attachment.storage_key).exists());

        let read = svc.read_url(attachment.id).await.unwrap();
        assert!(read.url.starts_with("http://localhost:3000/local/objects/attachments/"));
        assert_eq!(read.original_name, "crash report.txt");
        assert_eq!(read.size, 6);

        assert_eq!(svc.prepare_delete(attachment.id).await.unwrap(), None);
        svc.confirm_delete(attachment.id).await.unwrap();
        assert!(!local.object_path(&attachment.storage_key).exists());
    }

    #[tokio::test]
    async fn undeclared_bytes_are_never_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalStore::new(dir.path().join("objects"), "http://localhost:3000");
        let svc = service_with(Arc::new(local.clone()), dir.path(), 4).await;

        let init = svc.initiate(initiate_req(6, "text/plain")).await.unwrap();
        let big = bytes::Bytes::from(vec![b'x'; 1000]);
        let e1 = local
            .write_part(&init.upload_id, 1, futures::stream::iter(vec![Ok::<_, std::io::Error>(big)]))
            .await
            .unwrap();
        let e2 = local
            .write_part(
                &init.upload_id,
                2,
                futures::stream::iter(vec![Ok::<_, std::io::Error>(bytes::Bytes::from_static(b"ef"))]),
            )
            .await
            .unwrap();
        let parts = vec![
            CompletedPart { part_number: 1, etag: e1 },
            CompletedPart { part_number: 2, etag: e2 },
        ];

        let err = svc.complete(complete_req(&init, 6, parts), "u1").await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::Storage(StoreError::SizeMismatch { expected: 6, actual: 1002 })
        ));
        assert!(!local.object_path(&init.storage_key).exists());
        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM attachments")
            .fetch_one(&*svc.repo().db)
            .await
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[tokio::test]
    async fn disabled_feature_rejects_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(PresigningStore::default());
        let repo = AttachmentRepo::new(db::test_pool(dir.path()).await);
        let mut disabled = policy(10);
        disabled.attachments_enabled = false;
        let svc = UploadService::new(store.clone(), repo, disabled);

        assert!(matches!(
            svc.initiate(initiate_req(5, "text/plain")).await,
            Err(UploadError::Disabled)
        ));
        assert!(matches!(svc.confirm_delete(Uuid::new_v4()).await, Err(UploadError::Disabled)));
        assert_eq!(store.sessions_opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn abort_swallows_store_errors() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service_with(Arc::new(PresigningStore::default()), dir.path(), 10).await;
        svc.abort("missing", "attachments/p/k").await;
        svc.abort("", "").await;
    }

    #[test]
    fn sanitize_never_produces_traversal() {
        assert_eq!(sanitize_segment("../../etc/passwd"), "____etc_passwd");
        assert_eq!(sanitize_segment(" résumé v2.pdf "), "r_sum__v2.pdf");
        let key = storage_key("p 1", EntityType::TestStep, "");
        assert!(key.starts_with("attachments/p_1/teststep/"));
        assert!(key.ends_with("-file"));
    }
}
