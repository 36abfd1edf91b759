//! Storage backends, metadata persistence and the upload protocol service.

pub mod attachment_repo;
pub mod local_store;
pub mod object_store;
pub mod s3_store;
pub mod upload_service;
