//! Storage proxies and replicated fan-out, on top of Apache OpenDAL.
//!
//! # Architecture
//!
//! ```text
//! Attachment ──► AttachmentStore
//!                  ├── StorageProxy ─────────────► StorageBackend (OpenDAL)
//!                  └── ReplicationCoordinator
//!                        ├── main        (inline)
//!                        ├── additional  (spawned, best effort)
//!                        └── backups     (original only, critical)
//! ```
//!
//! Supported kinds: `fs`, `s3`, `glacier` (S3 with a cold storage class,
//! write-only), `azblob`, `memory`.

mod backend;
mod config;
mod error;
mod path;
mod proxy;
mod registry;
mod replication;


pub use backend::{OpendalBackend, StorageBackend};
pub use config::{DEFAULT_ARCHIVE_STORAGE_CLASS, S3Location, StorageProvider};
pub use error::StorageError;
pub use path::{AttachmentLocator, PathResolver, PathTemplate, PathValues};
pub use proxy::{AttachmentStore, StorageProxy};
pub use registry::StoreRegistry;
pub use replication::{BackupMode, Operation, ReplicationCoordinator, ReplicationEvent, build_store};
