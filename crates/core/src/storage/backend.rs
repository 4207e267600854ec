//! Concrete stores behind Apache OpenDAL.

use async_trait::async_trait;
use bytes::Bytes;
use opendal::{ErrorKind, Operator, services};

use super::config::{S3Location, StorageProvider};
use super::error::StorageError;
use crate::attachment::Blob;

/// A single concrete store addressed by path.
///
/// Implementations must not keep the blob past the `write` call.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Backend kind, for logs.
    fn kind(&self) -> &'static str;

    /// Store `blob` at `path`, replacing any existing object.
    async fn write(&self, path: &str, blob: &Blob) -> Result<(), StorageError>;

    /// Remove the object at `path`. Removing a missing object succeeds.
    async fn delete(&self, path: &str) -> Result<(), StorageError>;

    /// Whether an object exists at `path`.
    async fn exists(&self, path: &str) -> Result<bool, StorageError>;

    /// Read the object at `path`.
    async fn read(&self, path: &str) -> Result<Bytes, StorageError>;
}

/// Store backed by an OpenDAL operator.
#[derive(Debug, Clone)]
pub struct OpendalBackend {
    operator: Operator,
    provider: StorageProvider,
}

impl OpendalBackend {
    /// Build a backend for `provider`.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage provider cannot be initialized.
    pub fn new(provider: StorageProvider) -> Result<Self, StorageError> {
        let operator = Self::create_operator(&provider)?;
        Ok(Self { operator, provider })
    }

    /// Get the provider configuration.
    #[must_use]
    pub fn provider(&self) -> &StorageProvider {
        &self.provider
    }

    /// Create OpenDAL operator from provider config.
    fn create_operator(provider: &StorageProvider) -> Result<Operator, StorageError> {
        match provider {
            StorageProvider::S3(location) | StorageProvider::Glacier(location) => {
                Operator::new(s3_builder(location))
                    .map_err(|e| StorageError::configuration(e.to_string()))?
                    .finish()
                    .pipe(Ok)
            }
            StorageProvider::AzureBlob {
                account,
                access_key,
                container,
            } => {
                let builder = services::Azblob::default()
                    .account_name(account)
                    .account_key(access_key)
                    .container(container);

                Operator::new(builder)
                    .map_err(|e| StorageError::configuration(e.to_string()))?
                    .finish()
                    .pipe(Ok)
            }
            StorageProvider::LocalFs { root } => {
                let builder = services::Fs::default().root(
                    root.to_str()
                        .ok_or_else(|| StorageError::configuration("invalid path"))?,
                );

                Operator::new(builder)
                    .map_err(|e| StorageError::configuration(e.to_string()))?
                    .finish()
                    .pipe(Ok)
            }
            StorageProvider::Memory { root } => {
                let builder = services::Memory::default().root(root);

                Operator::new(builder)
                    .map_err(|e| StorageError::configuration(e.to_string()))?
                    .finish()
                    .pipe(Ok)
            }
        }
    }
}

fn s3_builder(location: &S3Location) -> services::S3 {
    let mut builder = services::S3::default()
        .bucket(&location.bucket)
        .region(&location.region);
    if let Some(endpoint) = &location.endpoint {
        builder = builder.endpoint(endpoint);
    }
    if let Some(key) = &location.access_key_id {
        builder = builder.access_key_id(key);
    }
    if let Some(secret) = &location.secret_access_key {
        builder = builder.secret_access_key(secret);
    }
    if let Some(class) = &location.storage_class {
        builder = builder.default_storage_class(class);
    }
    builder
}

#[async_trait]
impl StorageBackend for OpendalBackend {
    fn kind(&self) -> &'static str {
        self.provider.name()
    }

    async fn write(&self, path: &str, blob: &Blob) -> Result<(), StorageError> {
        let mut write = self.operator.write_with(path, blob.data.clone());
        let capability = self.operator.info().full_capability();
        if let Some(content_type) = blob
            .content_type
            .as_deref()
            .filter(|_| capability.write_with_content_type)
        {
            write = write.content_type(content_type);
        }
        write.await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        self.operator.delete(path).await.map_err(StorageError::from)
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        match self.operator.stat(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, path: &str) -> Result<Bytes, StorageError> {
        if self.provider.is_archive() {
            return Err(StorageError::Unsupported {
                backend: self.provider.name(),
                operation: "read",
            });
        }
        let buffer = self.operator.read(path).await?;
        Ok(buffer.to_bytes())
    }
}

/// Extension trait for pipe operator.
trait Pipe: Sized {
    fn pipe<F, R>(self, f: F) -> R
    where
        F: FnOnce(Self) -> R,
    {
        f(self)
    }
}

impl<T> Pipe for T {}
