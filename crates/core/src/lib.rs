//! Core attachment logic for Vellum.
//!
//! This crate holds the attachment state engine and the storage fan-out
//! with ZERO database or web dependencies. Hosts plug their records in
//! through [`attachment::AttachmentRecord`].
//!
//! # Modules
//!
//! - `attachment` - Locks, processing state and the save lifecycle
//! - `processing` - Processor chains and per-style workers
//! - `storage` - Backends, path templates and replicated stores

pub mod attachment;
pub mod processing;
pub mod storage;

#[cfg(test)]
mod test_support;
