//! Defines the HTTP surface of the attachment service.
//!
//! ## Structure
//! - **Upload protocol**
//!   - `POST   /upload`           — open a multipart session, presign parts
//!   - `POST   /upload/complete`  — finalize and record the attachment
//!   - `DELETE /upload/abort`     — abandon a session (best-effort)
//!
//! - **Attachments**
//!   - `GET    /attachments`       — list by entity
//!   - `GET    /attachments/{id}`  — short-lived read URL
//!   - `PATCH  /attachments/{id}`  — link to an entity
//!   - `DELETE /attachments/{id}`  — two-phase delete (`?step=prepare|confirm`)
//!
//! - **Local backend** (only when no bucket is configured)
//!   - `PUT    /local/parts/{upload_id}/{part_number}`
//!   - `GET    /local/objects/{*key}`

use crate::{
    handlers::{
        attachment_handlers::{
            delete_attachment, get_attachment, link_attachment, list_attachments,
        },
        health_handlers::{healthz, readyz},
        local_storage_handlers::{get_object, put_part},
        upload_handlers::{abort_upload, complete_upload, initiate_upload},
    },
    services::{local_store::LocalStore, upload_service::UploadService},
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
};
use std::sync::Arc;

/// Build the application router.
///
/// `local` carries the disk backend when it is in use; its part endpoint
/// takes bodies of any size since parts are streamed to disk.
pub fn routes(uploads: UploadService, local: Option<Arc<LocalStore>>) -> Router {
    let api = Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Upload protocol
        .route("/upload", post(initiate_upload))
        .route("/upload/complete", post(complete_upload))
        .route("/upload/abort", delete(abort_upload))
        // Attachments
        .route("/attachments", get(list_attachments))
        .route(
            "/attachments/{id}",
            get(get_attachment)
                .patch(link_attachment)
                .delete(delete_attachment),
        )
        .with_state(uploads);

    match local {
        Some(store) => api.merge(local_routes(store)),
        None => api,
    }
}

fn local_routes(store: Arc<LocalStore>) -> Router {
    Router::new()
        .route("/local/parts/{upload_id}/{part_number}", put(put_part))
        .route("/local/objects/{*key}", get(get_object))
        .layer(DefaultBodyLimit::disable())
        .with_state(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db,
        services::{attachment_repo::AttachmentRepo, upload_service::UploadPolicy},
    };
    use axum::{
        body::Body,
        http::{Request, StatusCode, header},
    };
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use std::{path::Path, time::Duration};
    use tower::ServiceExt;

    const PUBLIC_URL: &str = "http://localhost:3000";

    async fn app(dir: &Path, enabled: bool) -> Router {
        let local = Arc::new(LocalStore::new(dir.join("files"), PUBLIC_URL).with_max_part_size(4));
        let repo = AttachmentRepo::new(db::test_pool(dir).await);
        let policy = UploadPolicy {
            attachments_enabled: enabled,
            max_file_size: 1024,
            chunk_size: 4,
            part_url_ttl: Duration::from_secs(3600),
            short_url_ttl: Duration::from_secs(300),
            verify_delete: true,
        };
        routes(UploadService::new(local.clone(), repo, policy), Some(local))
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-user-id", "user-1")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, headers, body)
    }

    async fn send_json(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let (status, _, body) = send(app, req).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn descriptor(size: u64, mime: &str) -> Value {
        json!({
            "fileName": "steps.txt",
            "fileSize": size,
            "fileType": mime,
            "fieldName": "description",
            "entityType": "teststep",
            "projectId": "proj-1"
        })
    }

    #[tokio::test]
    async fn healthz_and_readyz_report_ok() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), true).await;

        let (status, body) = send_json(&app, empty_request("GET", "/healthz")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = send_json(&app, empty_request("GET", "/readyz")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["checks"]["sqlite"]["ok"], true);
        assert_eq!(body["checks"]["local"]["ok"], true);
    }

    #[tokio::test]
    async fn initiate_requires_caller_identity() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), true).await;
        let req = Request::builder()
            .method("POST")
            .uri("/upload")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(descriptor(6, "text/plain").to_string()))
            .unwrap();
        let (status, body) = send_json(&app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["status"], 401);
    }

    #[tokio::test]
    async fn video_and_malformed_bodies_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), true).await;

        let (status, body) =
            send_json(&app, json_request("POST", "/upload", descriptor(6, "video/mp4"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("video"));

        let (status, body) =
            send_json(&app, json_request("POST", "/upload", json!({"fileName": 3}))).await;
        assert!(status.is_client_error());
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn disabled_feature_answers_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), false).await;

        let (status, body) =
            send_json(&app, json_request("POST", "/upload", descriptor(6, "text/plain"))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "attachments are disabled");

        let (status, _) =
            send_json(&app, empty_request("DELETE", "/upload/abort?uploadId=x&fileKey=y")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn abort_is_best_effort() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), true).await;
        for uri in [
            "/upload/abort",
            "/upload/abort?uploadId=not-a-uuid&fileKey=attachments/p/x",
        ] {
            let (status, _, _) = send(&app, empty_request("DELETE", uri)).await;
            assert_eq!(status, StatusCode::NO_CONTENT);
        }
    }

    #[tokio::test]
    async fn unknown_and_malformed_ids() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), true).await;

        let (status, _) = send_json(&app, empty_request("GET", "/attachments/not-a-uuid")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let missing = format!("/attachments/{}", uuid::Uuid::new_v4());
        let (status, _) = send_json(&app, empty_request("GET", &missing)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) =
            send_json(&app, empty_request("DELETE", &format!("{missing}?step=prepare"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) =
            send_json(&app, empty_request("DELETE", &format!("{missing}?step=confirm"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
    }

    #[tokio::test]
    async fn oversized_local_part_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), true).await;

        let (status, init) =
            send_json(&app, json_request("POST", "/upload", descriptor(6, "text/plain"))).await;
        assert_eq!(status, StatusCode::OK);
        let url = init["presignedUrls"][0]["url"].as_str().unwrap();
        let req = Request::builder()
            .method("PUT")
            .uri(url.strip_prefix(PUBLIC_URL).unwrap())
            .body(Body::from(vec![b'x'; 1000]))
            .unwrap();
        let (status, headers, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(headers.get(header::ETAG).is_none());
    }

    #[tokio::test]
    async fn local_upload_lifecycle_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), true).await;

        let (status, init) =
            send_json(&app, json_request("POST", "/upload", descriptor(6, "text/plain"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(init["totalParts"], 2);
        assert_eq!(init["chunkSize"], 4);

        let mut parts = Vec::new();
        for (presigned, data) in init["presignedUrls"]
            .as_array()
            .unwrap()
            .iter()
            .zip([&b"abcd"[..], &b"ef"[..]])
        {
            let path = presigned["url"].as_str().unwrap().strip_prefix(PUBLIC_URL).unwrap();
            let req = Request::builder()
                .method("PUT")
                .uri(path)
                .body(Body::from(data.to_vec()))
                .unwrap();
            let (status, headers, _) = send(&app, req).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(headers[header::ACCESS_CONTROL_EXPOSE_HEADERS], "ETag");
            let etag = headers[header::ETAG].to_str().unwrap().to_string();
            assert_eq!(etag, format!("\"{:x}\"", md5::compute(data)));
            parts.push(json!({"PartNumber": presigned["partNumber"], "ETag": etag}));
        }

        let mut finalize = descriptor(6, "text/plain");
        finalize["uploadId"] = init["uploadId"].clone();
        finalize["storageKey"] = init["storageKey"].clone();
        finalize["parts"] = Value::Array(parts);
        let (status, done) =
            send_json(&app, json_request("POST", "/upload/complete", finalize)).await;
        assert_eq!(status, StatusCode::OK);
        let attachment = &done["attachment"];
        assert_eq!(attachment["size"], 6);
        assert_eq!(attachment["uploadedById"], "user-1");
        assert_eq!(attachment["entityId"], Value::Null);
        let id = attachment["id"].as_str().unwrap().to_string();

        let (status, linked) = send_json(
            &app,
            json_request(
                "PATCH",
                &format!("/attachments/{id}"),
                json!({"entityType": "teststep", "entityId": "step-9"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(linked["attachment"]["entityId"], "step-9");

        let (status, listed) = send_json(
            &app,
            empty_request("GET", "/attachments?entityType=teststep&entityId=step-9"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["attachments"].as_array().unwrap().len(), 1);

        let (status, read) = send_json(&app, empty_request("GET", &format!("/attachments/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(read["originalName"], "steps.txt");
        let object_path = read["url"].as_str().unwrap().strip_prefix(PUBLIC_URL).unwrap();
        let (status, headers, bytes) = send(&app, empty_request("GET", object_path)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_LENGTH], "6");
        assert_eq!(bytes, b"abcdef");

        let (status, prepared) = send_json(
            &app,
            empty_request("DELETE", &format!("/attachments/{id}?step=prepare")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(prepared["deleteUrl"], Value::Null);

        for _ in 0..2 {
            let (status, confirmed) = send_json(
                &app,
                empty_request("DELETE", &format!("/attachments/{id}?step=confirm")),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(confirmed["success"], true);
        }

        let (status, _, _) = send(&app, empty_request("GET", object_path)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
