pub mod attachment_handlers;
pub mod identity;
pub mod health_handlers;
pub mod local_storage_handlers;
pub mod upload_handlers;
