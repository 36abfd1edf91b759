//! Client-side bookkeeping of uploads in progress.
//!
//! A registry is owned by whoever drives uploads (a UI, the CLI) and handed
//! to [`UploadClient::upload`](super::UploadClient::upload) explicitly.
//! Cloning shares the same underlying map.

use crate::models::attachment::Attachment;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};
use uuid::Uuid;

/// Lifecycle of one local upload.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadState {
    Pending,
    Uploading { progress: u8 },
    Completed { attachment: Box<Attachment> },
    /// `progress` is frozen at the value reached before the failure.
    Error { message: String, progress: u8 },
}

impl UploadState {
    pub fn progress(&self) -> u8 {
        match self {
            UploadState::Pending => 0,
            UploadState::Uploading { progress } | UploadState::Error { progress, .. } => *progress,
            UploadState::Completed { .. } => 100,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, UploadState::Completed { .. } | UploadState::Error { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct UploadRegistry {
    uploads: Arc<Mutex<HashMap<Uuid, UploadState>>>,
}

impl UploadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, UploadState>> {
        // A panic while holding the lock leaves the map itself consistent.
        self.uploads.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Track a new upload in the `Pending` state and return its local id.
    pub fn register(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().insert(id, UploadState::Pending);
        id
    }

    pub fn get(&self, id: Uuid) -> Option<UploadState> {
        self.lock().get(&id).cloned()
    }

    pub fn snapshot(&self) -> HashMap<Uuid, UploadState> {
        self.lock().clone()
    }

    pub fn remove(&self, id: Uuid) -> Option<UploadState> {
        self.lock().remove(&id)
    }

    /// Move to `Uploading`. Progress never goes backwards and finished
    /// uploads are left untouched.
    pub fn set_progress(&self, id: Uuid, progress: u8) {
        let mut uploads = self.lock();
        let state = uploads.entry(id).or_insert(UploadState::Pending);
        if state.is_finished() {
            return;
        }
        let progress = progress.min(100).max(state.progress());
        *state = UploadState::Uploading { progress };
    }

    pub fn complete(&self, id: Uuid, attachment: Attachment) {
        self.lock().insert(
            id,
            UploadState::Completed {
                attachment: Box::new(attachment),
            },
        );
    }

    pub fn fail(&self, id: Uuid, message: impl Into<String>) {
        let mut uploads = self.lock();
        let progress = uploads.get(&id).map(UploadState::progress).unwrap_or(0);
        uploads.insert(
            id,
            UploadState::Error {
                message: message.into(),
                progress,
            },
        );
    }
}
