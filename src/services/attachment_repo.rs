//! SQLite persistence for attachment metadata rows.

use crate::models::attachment::{Attachment, EntityType};
use sqlx::SqlitePool;
use std::sync::Arc;

const ATTACHMENT_COLUMNS: &str = "id, storage_key, original_name, mime_type, size_bytes, \
     field_name, entity_type, entity_id, project_id, uploaded_by_id, uploaded_at";

#[derive(Clone)]
pub struct AttachmentRepo {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl AttachmentRepo {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Insert a fully populated row and return it as stored.
    pub async fn insert(&self, attachment: &Attachment) -> sqlx::Result<Attachment> {
        sqlx::query_as::<_, Attachment>(&format!(
            "INSERT INTO attachments ({ATTACHMENT_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING {ATTACHMENT_COLUMNS}"
        ))
        .bind(attachment.id)
        .bind(&attachment.storage_key)
        .bind(&attachment.original_name)
        .bind(&attachment.mime_type)
        .bind(attachment.size_bytes)
        .bind(&attachment.field_name)
        .bind(attachment.entity_type)
        .bind(&attachment.entity_id)
        .bind(&attachment.project_id)
        .bind(&attachment.uploaded_by_id)
        .bind(attachment.uploaded_at)
        .fetch_one(&*self.db)
        .await
    }

    pub async fn find(&self, id: uuid::Uuid) -> sqlx::Result<Option<Attachment>> {
        sqlx::query_as::<_, Attachment>(&format!(
            "SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await
    }

    /// Point an attachment at its owning entity.
    ///
    /// Returns `None` if no row has this id.
    pub async fn link(
        &self,
        id: uuid::Uuid,
        entity_type: EntityType,
        entity_id: &str,
    ) -> sqlx::Result<Option<Attachment>> {
        sqlx::query_as::<_, Attachment>(&format!(
            "UPDATE attachments SET entity_type = ?, entity_id = ?
             WHERE id = ?
             RETURNING {ATTACHMENT_COLUMNS}"
        ))
        .bind(entity_type)
        .bind(entity_id)
        .bind(id)
        .fetch_optional(&*self.db)
        .await
    }

    /// All attachments of one entity, newest first.
    pub async fn list_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> sqlx::Result<Vec<Attachment>> {
        sqlx::query_as::<_, Attachment>(&format!(
            "SELECT {ATTACHMENT_COLUMNS} FROM attachments
             WHERE entity_type = ? AND entity_id = ?
             ORDER BY uploaded_at DESC"
        ))
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(&*self.db)
        .await
    }

    /// Delete a row. Returns whether a row was removed.
    pub async fn delete(&self, id: uuid::Uuid) -> sqlx::Result<bool> {
        let result = sqlx::query("DELETE FROM attachments WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
