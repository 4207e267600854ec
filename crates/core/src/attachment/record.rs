//! Persistence port of the record that owns an attachment.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::Instant;
use vellum_shared::types::RecordId;

/// Pause between attempts in [`ensure_is_created`].
pub const ENSURE_CREATED_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Errors raised by a record implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    /// The row is not visible, usually because its insert has not committed yet.
    #[error("record not found: {id}")]
    NotFound {
        /// Id of the missing record.
        id: RecordId,
    },

    /// Any other persistence failure.
    #[error("record persistence failed: {0}")]
    Database(String),
}

impl RecordError {
    /// Whether [`ensure_is_created`] retries this error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Processing columns written back to the record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessingUpdate {
    /// Whether any style is in flight.
    pub processing: bool,
    /// Styles processed so far.
    pub processed_styles: Vec<String>,
}

/// File columns of the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// Uploaded file name.
    pub file_name: String,
    /// MIME type.
    pub content_type: Option<String>,
    /// Size in bytes.
    pub file_size: i64,
    /// When the file was assigned.
    pub updated_at: DateTime<Utc>,
}

/// The record an attachment belongs to.
///
/// In-memory setters only change the loaded instance; the host persists
/// them with its own save. The two async methods write to storage
/// immediately and return [`RecordError::NotFound`] when the row is absent.
#[async_trait]
pub trait AttachmentRecord: Send + Sync {
    /// Primary key, once assigned.
    fn id(&self) -> Option<RecordId>;

    /// Whether the record has never been saved.
    fn is_new_record(&self) -> bool;

    /// Whether the record exists in storage.
    fn is_persisted(&self) -> bool {
        !self.is_new_record()
    }

    /// File columns, if a file is assigned.
    fn file(&self) -> Option<FileMetadata>;

    /// Set the file columns in memory.
    fn assign_file(&self, file: Option<FileMetadata>);

    /// Styles stored as processed.
    fn processed_styles(&self) -> Vec<String>;

    /// Set the processing columns in memory.
    fn assign_processing(&self, update: &ProcessingUpdate);

    /// Write the processing columns without validation or callbacks.
    async fn update_columns(&self, update: &ProcessingUpdate) -> Result<(), RecordError>;

    /// Lock the row, write the processing columns and commit.
    async fn update_with_row_lock(&self, update: &ProcessingUpdate) -> Result<(), RecordError>;
}

/// Retry `operation` while it reports [`RecordError::NotFound`].
///
/// Covers the window where a worker finishes before the record's own insert
/// has committed. Gives up once `timeout` has elapsed and returns the last
/// error.
///
/// # Errors
///
/// Returns the first error that is not `NotFound`, or the last `NotFound`
/// once the budget is exhausted.
pub async fn ensure_is_created<F, Fut, T>(timeout: Duration, mut operation: F) -> Result<T, RecordError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RecordError>>,
{
    let deadline = Instant::now() + timeout;
    let mut attempts = 1_u32;
    loop {
        match operation().await {
            Err(e) if e.is_not_found() && Instant::now() < deadline => {
                tracing::debug!(attempts, error = %e, "record not visible yet, retrying");
                tokio::time::sleep(ENSURE_CREATED_RETRY_INTERVAL).await;
                attempts += 1;
            }
            Err(e) if e.is_not_found() => {
                tracing::warn!(attempts, error = %e, "record still missing after retry budget");
                return Err(e);
            }
            result => return result,
        }
    }
}
