//! Shared backend clients.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::backend::{OpendalBackend, StorageBackend};
use super::config::StorageProvider;
use super::error::StorageError;

/// Backend clients keyed by [`StorageProvider::registry_key`].
///
/// Built once at startup and handed to every attachment. Entries are never
/// evicted, so a client stays valid for every proxy that holds it.
#[derive(Default)]
pub struct StoreRegistry {
    backends: DashMap<String, Arc<dyn StorageBackend>>,
}

impl StoreRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The client for `provider`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if a new client cannot be built.
    pub fn backend_for(
        &self,
        provider: &StorageProvider,
    ) -> Result<Arc<dyn StorageBackend>, StorageError> {
        match self.backends.entry(provider.registry_key()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let backend: Arc<dyn StorageBackend> =
                    Arc::new(OpendalBackend::new(provider.clone())?);
                tracing::debug!(kind = provider.name(), bucket = provider.bucket(), "storage client created");
                Ok(Arc::clone(entry.insert(backend).value()))
            }
        }
    }

    /// Install a client under an explicit key.
    pub fn register(&self, key: impl Into<String>, backend: Arc<dyn StorageBackend>) {
        self.backends.insert(key.into(), backend);
    }

    /// Look up a client without creating one.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<dyn StorageBackend>> {
        self.backends.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Whether no client has been created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_credentials_share_client() {
        let registry = StoreRegistry::new();
        let first = registry
            .backend_for(&StorageProvider::memory("/a"))
            .expect("created");
        let second = registry
            .backend_for(&StorageProvider::memory("/a"))
            .expect("reused");
        let other = registry
            .backend_for(&StorageProvider::memory("/b"))
            .expect("created");

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_registered_client_is_returned() {
        let registry = StoreRegistry::new();
        let provider = StorageProvider::memory("/fixed");
        let backend: Arc<dyn StorageBackend> =
            Arc::new(OpendalBackend::new(provider.clone()).expect("memory backend"));
        registry.register(provider.registry_key(), Arc::clone(&backend));

        let found = registry.backend_for(&provider).expect("registered");
        assert!(Arc::ptr_eq(&found, &backend));
        assert!(registry.get("memory|/missing").is_none());
    }

    #[test]
    fn test_different_secrets_get_separate_clients() {
        let registry = StoreRegistry::new();
        let s3 = |secret: &str| {
            let settings = vellum_shared::StoreSettings::new("s3")
                .with_option("bucket", "media")
                .with_option("access_key_id", "id")
                .with_option("secret_access_key", secret);
            StorageProvider::from_settings(&settings).expect("valid store")
        };

        let first = registry.backend_for(&s3("first")).expect("created");
        let second = registry.backend_for(&s3("second")).expect("created");

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 2);
    }
}
