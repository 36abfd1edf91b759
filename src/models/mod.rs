//! Core data models for the attachment upload service.
//!
//! `attachment` maps to the `attachments` table via `sqlx::FromRow`;
//! `upload` holds the JSON wire types shared by server and client.

pub mod attachment;
pub mod upload;
