//! Endpoints standing in for presigned URLs when attachments live on local
//! disk. Bodies are streamed in both directions.

use crate::{
    errors::AppError,
    services::{local_store::LocalStore, object_store::StoreError},
};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use std::{io, sync::Arc};
use tokio_util::io::ReaderStream;

/// `PUT /local/parts/{upload_id}/{part_number}`
///
/// Stores one part and answers with its ETag, exposed for browser clients.
pub async fn put_part(
    State(store): State<Arc<LocalStore>>,
    Path((upload_id, part_number)): Path<(String, u32)>,
    body: Body,
) -> Result<Response, AppError> {
    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));

    let etag = store.write_part(&upload_id, part_number, stream).await?;

    let mut response = StatusCode::OK.into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&etag) {
        headers.insert(header::ETAG, value);
    }
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("ETag"),
    );
    Ok(response)
}

/// `GET /local/objects/{*key}` streams a finished object.
pub async fn get_object(
    State(store): State<Arc<LocalStore>>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    let (file, len) = match store.open_object(&key).await {
        Ok(found) => found,
        Err(StoreError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
            return Err(AppError::not_found(format!("object `{}` not found", key)));
        }
        Err(err) => return Err(err.into()),
    };

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    Ok(response)
}
