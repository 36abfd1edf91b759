//! Represents a finalized attachment (file) owned by an EZTest entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// The kind of record an attachment belongs to.
#[derive(Serialize, Deserialize, sqlx::Type, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum EntityType {
    TestCase,
    TestStep,
    Defect,
    Comment,
    TestResult,
    Unassigned,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::TestCase => "testcase",
            EntityType::TestStep => "teststep",
            EntityType::Defect => "defect",
            EntityType::Comment => "comment",
            EntityType::TestResult => "testresult",
            EntityType::Unassigned => "unassigned",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "testcase" => Ok(EntityType::TestCase),
            "teststep" => Ok(EntityType::TestStep),
            "defect" => Ok(EntityType::Defect),
            "comment" => Ok(EntityType::Comment),
            "testresult" => Ok(EntityType::TestResult),
            "unassigned" => Ok(EntityType::Unassigned),
            other => Err(format!("unknown entity type `{}`", other)),
        }
    }
}

/// Metadata for one stored attachment.
///
/// A row only exists once the object store has confirmed completion of the
/// multipart upload. The payload itself lives under `storage_key` in the
/// object store and is never held by this struct.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Internal UUID, assigned at finalize time.
    pub id: Uuid,

    /// Object-store key (unique).
    pub storage_key: String,

    /// File name as chosen by the uploader.
    pub original_name: String,

    /// Declared MIME type.
    pub mime_type: String,

    /// Size in bytes.
    #[serde(rename = "size")]
    pub size_bytes: i64,

    /// Form field the file was attached through (e.g. "description").
    pub field_name: String,

    /// Kind of the owning entity.
    pub entity_type: EntityType,

    /// Owning entity, `None` until linked.
    pub entity_id: Option<String>,

    /// Project the attachment belongs to.
    pub project_id: String,

    /// User that finalized the upload.
    pub uploaded_by_id: String,

    /// When the upload was finalized.
    pub uploaded_at: DateTime<Utc>,
}

impl Attachment {
    /// Last path segment of the storage key.
    pub fn filename(&self) -> &str {
        self.storage_key
            .rsplit('/')
            .next()
            .unwrap_or(&self.storage_key)
    }
}
