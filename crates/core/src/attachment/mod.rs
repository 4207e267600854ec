//! Attachment state engine.
//!
//! This module tracks one attachment of one record:
//! - Pending writes (by style) and deletes (by path)
//! - Which styles are being processed and which are done
//! - Whether the owning record is being saved
//! - The lock discipline that lets processing workers and saves interleave

mod error;
mod lock;
mod record;
mod service;
mod tracker;
mod types;

#[cfg(test)]
mod tracker_props;

pub use error::AttachmentError;
pub use lock::{ContextLock, ContextLockGuard, ContextMutex, ExecutionContext, LockError, ReentrantGate};
pub use record::{
    AttachmentRecord, ENSURE_CREATED_RETRY_INTERVAL, FileMetadata, ProcessingUpdate, RecordError,
    ensure_is_created,
};
pub use service::Attachment;
pub use tracker::{ProcessorTracker, Removal, StyleState};
pub use types::{
    AttachmentDefinition, Blob, LifecycleStatus, PendingQueues, SaveTrigger, Style, StyleDefinition,
    WriteQueue,
};
