//! src/services/local_store.rs
//!
//! LocalStore — the fallback object store used when no S3 bucket is
//! configured. Multipart sessions are staging directories beneath
//! `base_path/.uploads/{upload_id}`; finished objects are sharded beneath
//! `base_path/objects/{shard}/{shard}/{key}`. Part and read URLs point back
//! at this application (`/local/parts/...`, `/local/objects/...`).

use super::object_store::{ObjectStore, StoreError, StoreResult};
use crate::models::upload::CompletedPart;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const MAX_PART_NUMBER: u32 = 10_000;
const STAGING_DIR: &str = ".uploads";
const OBJECTS_DIR: &str = "objects";
const SESSION_KEY_FILE: &str = "key";
const READ_BUF_LEN: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct LocalStore {
    /// Root directory for staging sessions and finished objects.
    pub base_path: PathBuf,

    /// Externally reachable base URL of this service, without trailing slash.
    pub public_url: String,

    /// Largest part body `write_part` accepts.
    pub max_part_size: u64,
}

impl LocalStore {
    pub fn new(base_path: impl Into<PathBuf>, public_url: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            public_url: public_url.into().trim_end_matches('/').to_string(),
            max_part_size: u64::MAX,
        }
    }

    /// Refuse part bodies longer than `max_part_size` (the upload chunk size).
    pub fn with_max_part_size(mut self, max_part_size: u64) -> Self {
        self.max_part_size = max_part_size;
        self
    }

    /// Rejects keys that could escape `base_path`.
    fn ensure_key_safe(key: &str) -> StoreResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StoreError::InvalidObjectKey);
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(StoreError::InvalidObjectKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StoreError::InvalidObjectKey);
        }
        Ok(())
    }

    /// Upload ids are UUIDs we minted; anything else is refused before it
    /// reaches the filesystem.
    fn session_dir(&self, upload_id: &str) -> StoreResult<PathBuf> {
        let id = Uuid::parse_str(upload_id).map_err(|_| StoreError::InvalidUploadId)?;
        Ok(self.base_path.join(STAGING_DIR).join(id.to_string()))
    }

    fn part_path(session: &Path, part_number: u32) -> PathBuf {
        session.join(format!("{}.part", part_number))
    }

    /// Two-level shard identifiers from MD5(key), as lowercase hex.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// `base_path/objects/{shard}/{shard}/{key}`. Parents may not exist yet.
    pub fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.objects_root();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn objects_root(&self) -> PathBuf {
        self.base_path.join(OBJECTS_DIR)
    }

    async fn ensure_session(&self, upload_id: &str) -> StoreResult<PathBuf> {
        let session = self.session_dir(upload_id)?;
        match fs::metadata(&session).await {
            Ok(meta) if meta.is_dir() => Ok(session),
            Ok(_) => Err(StoreError::NoSuchUpload(upload_id.to_string())),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StoreError::NoSuchUpload(upload_id.to_string()))
            }
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    /// Stream one part body into the session directory.
    ///
    /// Writes to a temp file, fsyncs, then renames over `{part}.part` so a
    /// retried PUT replaces the previous attempt. Returns the quoted MD5 ETag.
    pub async fn write_part<S>(&self, upload_id: &str, part_number: u32, stream: S) -> StoreResult<String>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        if part_number == 0 || part_number > MAX_PART_NUMBER {
            return Err(StoreError::InvalidPart {
                part_number,
                reason: format!("part number must be between 1 and {}", MAX_PART_NUMBER),
            });
        }
        let session = self.ensure_session(upload_id).await?;
        let tmp_path = session.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: u64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StoreError::Io(err));
                }
            };
            size_bytes += chunk.len() as u64;
            if size_bytes > self.max_part_size {
                drop(file);
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::InvalidPart {
                    part_number,
                    reason: format!("part exceeds {} bytes", self.max_part_size),
                });
            }
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        drop(file);

        let part_path = Self::part_path(&session, part_number);
        if let Err(err) = fs::rename(&tmp_path, &part_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }

        let etag = format!("\"{:x}\"", digest.compute());
        debug!(upload_id, part_number, size_bytes, %etag, "stored local part");
        Ok(etag)
    }

    /// Open a finished object for streaming out, with its length.
    pub async fn open_object(&self, key: &str) -> StoreResult<(File, u64)> {
        Self::ensure_key_safe(key)?;
        let path = self.object_path(key);
        let file = File::open(&path).await?;
        let len = file.metadata().await?.len();
        Ok((file, len))
    }

    /// Append one staged part to `out`, checking it against the client's ETag.
    /// Returns the number of bytes appended.
    async fn append_part(
        session: &Path,
        part: &CompletedPart,
        out: &mut File,
    ) -> StoreResult<u64> {
        let path = Self::part_path(session, part.part_number);
        let mut input = File::open(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::InvalidPart {
                    part_number: part.part_number,
                    reason: "part was never uploaded".into(),
                }
            } else {
                StoreError::Io(err)
            }
        })?;

        let mut digest = Context::new();
        let mut appended: u64 = 0;
        let mut buf = vec![0u8; READ_BUF_LEN];
        loop {
            let n = input.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            appended += n as u64;
            digest.consume(&buf[..n]);
            out.write_all(&buf[..n]).await?;
        }

        let actual = format!("{:x}", digest.compute());
        if actual != part.etag.trim_matches('"') {
            return Err(StoreError::InvalidPart {
                part_number: part.part_number,
                reason: "ETag does not match uploaded data".into(),
            });
        }
        Ok(appended)
    }

    /// Remove empty directories from `start` up to (not including) `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn create_multipart_upload(&self, key: &str, _content_type: &str) -> StoreResult<String> {
        Self::ensure_key_safe(key)?;
        let upload_id = Uuid::new_v4().to_string();
        let session = self.session_dir(&upload_id)?;
        fs::create_dir_all(&session).await?;
        fs::write(session.join(SESSION_KEY_FILE), key.as_bytes()).await?;
        debug!(key, %upload_id, "opened local upload session");
        Ok(upload_id)
    }

    async fn presign_upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        _expires_in: Duration,
    ) -> StoreResult<String> {
        self.session_dir(upload_id)?;
        Ok(format!(
            "{}/local/parts/{}/{}",
            self.public_url, upload_id, part_number
        ))
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
        expected_size: u64,
    ) -> StoreResult<()> {
        Self::ensure_key_safe(key)?;
        let session = self.ensure_session(upload_id).await?;
        let session_key = fs::read_to_string(session.join(SESSION_KEY_FILE)).await?;
        if session_key != key {
            return Err(StoreError::NoSuchUpload(upload_id.to_string()));
        }

        let file_path = self.object_path(key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StoreError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut out = File::create(&tmp_path).await?;

        let mut total: u64 = 0;
        for part in parts {
            match Self::append_part(&session, part, &mut out).await {
                Ok(appended) => total += appended,
                Err(err) => {
                    drop(out);
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(err);
                }
            }
        }
        if total != expected_size {
            drop(out);
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::SizeMismatch {
                expected: expected_size,
                actual: total,
            });
        }
        if let Err(err) = out.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        drop(out);

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }

        if let Err(err) = fs::remove_dir_all(&session).await {
            debug!("failed to remove session {}: {}", session.display(), err);
        }
        Ok(())
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> StoreResult<()> {
        let session = self.session_dir(upload_id)?;
        match fs::remove_dir_all(&session).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StoreError::NoSuchUpload(upload_id.to_string()))
            }
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    async fn presign_delete(&self, _key: &str, _expires_in: Duration) -> StoreResult<Option<String>> {
        Ok(None)
    }

    async fn presign_get(
        &self,
        key: &str,
        _download_name: &str,
        _expires_in: Duration,
    ) -> StoreResult<String> {
        Self::ensure_key_safe(key)?;
        Ok(format!("{}/local/objects/{}", self.public_url, key))
    }

    async fn finish_delete(&self, key: &str, _verify: bool) -> StoreResult<()> {
        Self::ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StoreError::Io(err)),
        }
        if let Some(parent) = file_path.parent() {
            let root = self.objects_root();
            self.prune_empty_dirs(parent, &root).await;
        }
        Ok(())
    }

    async fn probe(&self) -> StoreResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        let tmp_path = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;
        let bytes = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        if bytes? != b"readyz" {
            return Err(StoreError::Io(io::Error::new(
                ErrorKind::Other,
                "file content mismatch",
            )));
        }
        Ok(())
    }
}
