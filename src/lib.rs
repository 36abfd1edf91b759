//! EZTest attachment uploads: a direct-to-storage multipart upload service
//! and the client that drives it.

pub mod client;
pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

use axum::Router;
use config::AppConfig;
use services::{
    attachment_repo::AttachmentRepo,
    local_store::LocalStore,
    object_store::ObjectStore,
    s3_store::S3Store,
    upload_service::{UploadPolicy, UploadService},
};
use sqlx::SqlitePool;
use std::sync::Arc;

/// Wire the object store selected by `cfg` and the metadata pool into the
/// application router.
pub async fn build_app(cfg: &AppConfig, db: Arc<SqlitePool>) -> Router {
    let repo = AttachmentRepo::new(db);
    let policy = UploadPolicy::from(cfg);

    match &cfg.s3 {
        Some(settings) => {
            let store: Arc<dyn ObjectStore> = Arc::new(S3Store::new(settings).await);
            routes::routes::routes(UploadService::new(store, repo, policy), None)
        }
        None => {
            let local = Arc::new(
                LocalStore::new(&cfg.storage_dir, &cfg.public_url).with_max_part_size(cfg.chunk_size),
            );
            tracing::info!("No S3 bucket configured; storing attachments under {}", cfg.storage_dir);
            routes::routes::routes(UploadService::new(local.clone(), repo, policy), Some(local))
        }
    }
}
