//! Per-store proxies.
//!
//! A proxy pairs a backend client with the attachment it serves. Paths are
//! always resolved through the attachment, never from store options.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use vellum_shared::StoreSettings;

use super::backend::StorageBackend;
use super::config::StorageProvider;
use super::error::StorageError;
use super::path::PathResolver;
use super::registry::StoreRegistry;
use crate::attachment::{Style, WriteQueue};

/// The operations an attachment needs from its storage.
///
/// Implemented by single proxies and by the replication coordinator, so an
/// attachment does not know whether its bytes are replicated.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Label used in logs and events.
    fn name(&self) -> &str;

    /// Backend kind of the store that serves reads.
    fn provider_name(&self) -> &'static str;

    /// Storage path of `style`, or `None` when no file is assigned.
    fn path(&self, style: &Style) -> Option<String>;

    /// Write every queued style.
    async fn flush_writes(&self, queue: WriteQueue) -> Result<(), StorageError>;

    /// Remove previously stored paths. Empty paths are skipped.
    async fn flush_deletes(&self, paths: Vec<String>) -> Result<(), StorageError>;

    /// Whether `style` is stored.
    async fn exists(&self, style: &Style) -> Result<bool, StorageError>;

    /// Copy `style` into `dest`. Returns `false` when the object is absent.
    async fn copy_to_local_file(&self, style: &Style, dest: &Path) -> Result<bool, StorageError>;
}

/// One configured store of an attachment.
pub struct StorageProxy {
    name: String,
    backend: Arc<dyn StorageBackend>,
    parent: Arc<dyn PathResolver>,
}

impl StorageProxy {
    /// Wrap an existing backend.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        backend: Arc<dyn StorageBackend>,
        parent: Arc<dyn PathResolver>,
    ) -> Self {
        Self {
            name: name.into(),
            backend,
            parent,
        }
    }

    /// Build a proxy from a store definition.
    ///
    /// `general` holds the attachment-wide options; the store's own options
    /// override them.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownBackendKind`] or a configuration error
    /// if the store cannot be built.
    pub fn from_settings(
        name: impl Into<String>,
        settings: &StoreSettings,
        general: &BTreeMap<String, String>,
        registry: &StoreRegistry,
        parent: Arc<dyn PathResolver>,
    ) -> Result<Self, StorageError> {
        let provider = StorageProvider::from_settings(&settings.merged_over(general))?;
        let backend = registry.backend_for(&provider)?;
        Ok(Self::new(name, backend, parent))
    }

    fn resolve(&self, style: &Style) -> Result<String, StorageError> {
        self.parent.path(style).ok_or_else(|| {
            StorageError::operation(format!("no file assigned, cannot resolve path of '{style}'"))
        })
    }
}

#[async_trait]
impl AttachmentStore for StorageProxy {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider_name(&self) -> &'static str {
        self.backend.kind()
    }

    fn path(&self, style: &Style) -> Option<String> {
        self.parent.path(style)
    }

    async fn flush_writes(&self, queue: WriteQueue) -> Result<(), StorageError> {
        for (style, blob) in queue {
            let path = self.resolve(&style)?;
            tracing::debug!(store = %self.name, %style, %path, bytes = blob.len(), "writing");
            self.backend.write(&path, &blob).await?;
        }
        Ok(())
    }

    async fn flush_deletes(&self, paths: Vec<String>) -> Result<(), StorageError> {
        for path in paths.iter().filter(|p| !p.is_empty()) {
            tracing::debug!(store = %self.name, %path, "deleting");
            self.backend.delete(path).await?;
        }
        Ok(())
    }

    async fn exists(&self, style: &Style) -> Result<bool, StorageError> {
        match self.parent.path(style) {
            Some(path) => self.backend.exists(&path).await,
            None => Ok(false),
        }
    }

    async fn copy_to_local_file(&self, style: &Style, dest: &Path) -> Result<bool, StorageError> {
        let Some(path) = self.parent.path(style) else {
            return Ok(false);
        };
        let data = match self.backend.read(&path).await {
            Ok(data) => data,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };
        tokio::fs::write(dest, &data).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::Blob;
    use crate::storage::OpendalBackend;

    struct FixedPaths;

    impl PathResolver for FixedPaths {
        fn path(&self, style: &Style) -> Option<String> {
            Some(format!("records/1/{style}/photo.png"))
        }
    }

    struct NoFile;

    impl PathResolver for NoFile {
        fn path(&self, _style: &Style) -> Option<String> {
            None
        }
    }

    fn memory_proxy(parent: Arc<dyn PathResolver>) -> StorageProxy {
        let backend = OpendalBackend::new(StorageProvider::memory("/")).expect("memory backend");
        StorageProxy::new("main", Arc::new(backend), parent)
    }

    #[tokio::test]
    async fn test_writes_every_style_and_copies_back() {
        let proxy = memory_proxy(Arc::new(FixedPaths));
        let queue: WriteQueue = [
            (Style::original(), Blob::new("full")),
            (Style::new("thumb"), Blob::new("small")),
        ]
        .into_iter()
        .collect();

        proxy.flush_writes(queue).await.expect("flushed");
        assert!(proxy.exists(&Style::new("thumb")).await.expect("stat"));

        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("thumb.png");
        assert!(proxy.copy_to_local_file(&Style::new("thumb"), &dest).await.expect("copied"));
        assert_eq!(std::fs::read(&dest).expect("file written"), b"small");
    }

    #[tokio::test]
    async fn test_copy_of_absent_style_is_false() {
        let proxy = memory_proxy(Arc::new(FixedPaths));
        let dir = tempfile::tempdir().expect("tempdir");
        let copied = proxy
            .copy_to_local_file(&Style::new("large"), &dir.path().join("x"))
            .await
            .expect("absent is not an error");
        assert!(!copied);
    }

    #[tokio::test]
    async fn test_deletes_skip_empty_paths() {
        let proxy = memory_proxy(Arc::new(FixedPaths));
        let queue: WriteQueue = [(Style::original(), Blob::new("full"))].into_iter().collect();
        proxy.flush_writes(queue).await.expect("flushed");

        proxy
            .flush_deletes(vec![String::new(), "records/1/original/photo.png".into()])
            .await
            .expect("deleted");
        assert!(!proxy.exists(&Style::original()).await.expect("stat"));
    }

    #[tokio::test]
    async fn test_write_without_file_fails() {
        let proxy = memory_proxy(Arc::new(NoFile));
        let queue: WriteQueue = [(Style::original(), Blob::new("full"))].into_iter().collect();
        let err = proxy.flush_writes(queue).await.unwrap_err();
        assert!(matches!(err, StorageError::Operation(_)));
        assert!(!proxy.exists(&Style::original()).await.expect("stat"));
    }

    #[test]
    fn test_store_options_inherit_general_options() {
        let registry = StoreRegistry::new();
        let general = BTreeMap::from([("root".to_string(), "/shared".to_string())]);
        let proxy = StorageProxy::from_settings(
            "main",
            &StoreSettings::new("memory"),
            &general,
            &registry,
            Arc::new(FixedPaths),
        )
        .expect("built");

        assert_eq!(proxy.provider_name(), "memory");
        assert!(registry.get("memory|/shared").is_some());
    }

    #[test]
    fn test_unknown_kind_fails_construction() {
        let err = StorageProxy::from_settings(
            "main",
            &StoreSettings::new("tape"),
            &BTreeMap::new(),
            &StoreRegistry::new(),
            Arc::new(FixedPaths),
        )
        .err()
        .expect("unknown kind");
        assert!(matches!(err, StorageError::UnknownBackendKind { .. }));
    }
}
