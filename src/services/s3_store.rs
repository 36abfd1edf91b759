//! S3-compatible object store backend.
//!
//! All payload bytes travel between the client and the bucket through
//! presigned URLs; this backend only drives session lifecycle calls
//! (create/complete/abort), signs URLs, and checks object existence.
//!
//! Credentials are resolved via the standard AWS credential chain unless
//! static keys are configured.

use super::object_store::{ObjectStore, StoreError, StoreResult};
use crate::{config::S3Settings, models::upload::CompletedPart};
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    error::DisplayErrorContext,
    presigning::PresigningConfig,
    types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart},
};
use std::time::Duration;
use tracing::{debug, info};

pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    /// Build a client for `settings.bucket`, honouring a custom endpoint
    /// (MinIO, R2, ...) and path-style addressing when configured.
    pub async fn new(settings: &S3Settings) -> Self {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(settings.region.clone()));

        if let Some(endpoint) = &settings.endpoint {
            config_loader = config_loader.endpoint_url(endpoint);
        }

        if let (Some(ak), Some(sk)) = (&settings.access_key_id, &settings.secret_access_key) {
            let creds = aws_sdk_s3::config::Credentials::new(ak, sk, None, None, "eztest-config");
            config_loader = config_loader.credentials_provider(creds);
        }

        let sdk_config = config_loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(settings.force_path_style)
            .build();

        info!(
            bucket = %settings.bucket,
            region = %settings.region,
            "S3 object store initialized"
        );

        Self {
            client: Client::from_conf(s3_config),
            bucket: settings.bucket.clone(),
        }
    }

    fn presigning(expires_in: Duration) -> StoreResult<PresigningConfig> {
        PresigningConfig::expires_in(expires_in)
            .map_err(|e| StoreError::Backend(format!("invalid presigning config: {e}")))
    }

    fn sdk_error<E>(context: &str, err: E) -> StoreError
    where
        E: std::error::Error,
    {
        StoreError::Backend(format!("{context}: {}", DisplayErrorContext(err)))
    }
}

/// Convert our part list into the SDK's completion payload.
fn completed_upload(parts: &[CompletedPart]) -> CompletedMultipartUpload {
    let parts = parts
        .iter()
        .map(|p| {
            S3CompletedPart::builder()
                .part_number(p.part_number as i32)
                .e_tag(&p.etag)
                .build()
        })
        .collect();
    CompletedMultipartUpload::builder().set_parts(Some(parts)).build()
}

#[async_trait]
impl ObjectStore for S3Store {
    fn kind(&self) -> &'static str {
        "s3"
    }

    async fn create_multipart_upload(&self, key: &str, content_type: &str) -> StoreResult<String> {
        let resp = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| Self::sdk_error("create_multipart_upload", e))?;

        resp.upload_id()
            .map(str::to_string)
            .ok_or_else(|| StoreError::Backend("store did not return an upload id".into()))
    }

    async fn presign_upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        expires_in: Duration,
    ) -> StoreResult<String> {
        let presigned = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .presigned(Self::presigning(expires_in)?)
            .await
            .map_err(|e| Self::sdk_error("presign upload_part", e))?;
        Ok(presigned.uri().to_string())
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
        expected_size: u64,
    ) -> StoreResult<()> {
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload(parts))
            .send()
            .await
            .map_err(|e| Self::sdk_error("complete_multipart_upload", e))?;

        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::sdk_error("head_object", e))?;
        let actual = head.content_length().unwrap_or_default().max(0) as u64;
        if actual != expected_size {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| Self::sdk_error("delete_object", e))?;
            return Err(StoreError::SizeMismatch {
                expected: expected_size,
                actual,
            });
        }
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StoreResult<()> {
        match self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e)
                if e
                    .as_service_error()
                    .map(|se| se.is_no_such_upload())
                    .unwrap_or(false) =>
            {
                Err(StoreError::NoSuchUpload(upload_id.to_string()))
            }
            Err(e) => Err(Self::sdk_error("abort_multipart_upload", e)),
        }
    }

    async fn presign_delete(&self, key: &str, expires_in: Duration) -> StoreResult<Option<String>> {
        let presigned = self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(Self::presigning(expires_in)?)
            .await
            .map_err(|e| Self::sdk_error("presign delete_object", e))?;
        Ok(Some(presigned.uri().to_string()))
    }

    async fn presign_get(
        &self,
        key: &str,
        download_name: &str,
        expires_in: Duration,
    ) -> StoreResult<String> {
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .response_content_disposition(content_disposition(download_name))
            .presigned(Self::presigning(expires_in)?)
            .await
            .map_err(|e| Self::sdk_error("presign get_object", e))?;
        Ok(presigned.uri().to_string())
    }

    async fn finish_delete(&self, key: &str, verify: bool) -> StoreResult<()> {
        if !verify {
            return Ok(());
        }
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Err(StoreError::ObjectStillPresent(key.to_string())),
            Err(e)
                if e
                    .as_service_error()
                    .map(|se| se.is_not_found())
                    .unwrap_or(false) =>
            {
                debug!(key, "object confirmed absent");
                Ok(())
            }
            Err(e) => Err(Self::sdk_error("head_object", e)),
        }
    }

    async fn probe(&self) -> StoreResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| Self::sdk_error("head_bucket", e))?;
        Ok(())
    }
}

/// `inline` disposition carrying the original name, with quotes stripped.
fn content_disposition(download_name: &str) -> String {
    let safe: String = download_name
        .chars()
        .filter(|c| *c != '"' && !c.is_control())
        .collect();
    format!("inline; filename=\"{}\"", safe)
}
