//! Attachment error types.

use thiserror::Error;

use super::lock::LockError;
use super::record::RecordError;
use super::types::Style;
use crate::processing::ProcessorError;
use crate::storage::StorageError;

/// Attachment operation errors.
#[derive(Debug, Error)]
pub enum AttachmentError {
    /// A lock was re-entered from the context that holds it.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Storage operation failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Record persistence failed.
    #[error("record error: {0}")]
    Record(#[from] RecordError),

    /// A processor failed.
    #[error("processing error: {0}")]
    Processor(#[from] ProcessorError),

    /// Nothing to process from.
    #[error("no original content assigned")]
    MissingOriginal,

    /// The style is not defined on the attachment.
    #[error("style '{0}' is not defined")]
    UnknownStyle(Style),
}

impl AttachmentError {
    /// Create an unknown style error.
    #[must_use]
    pub fn unknown_style(style: &Style) -> Self {
        Self::UnknownStyle(style.clone())
    }
}
