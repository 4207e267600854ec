//! Storage provider selection.
//!
//! A store is configured as a kind plus a string map of options. The kind
//! is checked here, when a proxy is built, not when settings are loaded.

use std::collections::BTreeMap;
use std::path::PathBuf;

use sha2::{Digest, Sha256};
use vellum_shared::StoreSettings;

use super::error::StorageError;

/// Storage class used for the `glacier` kind unless overridden.
pub const DEFAULT_ARCHIVE_STORAGE_CLASS: &str = "GLACIER";

const DEFAULT_REGION: &str = "us-east-1";

/// Location and credentials of an S3-compatible bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Location {
    /// Custom endpoint (R2, MinIO...); AWS when absent.
    pub endpoint: Option<String>,
    /// Bucket name.
    pub bucket: String,
    /// Region.
    pub region: String,
    /// Access key id; falls back to the environment when absent.
    pub access_key_id: Option<String>,
    /// Secret access key.
    pub secret_access_key: Option<String>,
    /// Storage class applied to every write.
    pub storage_class: Option<String>,
}

/// A validated backend configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageProvider {
    /// S3-compatible storage: AWS S3, Cloudflare R2, MinIO.
    S3(S3Location),
    /// Write-only cold archive on S3.
    Glacier(S3Location),
    /// Azure Blob Storage.
    AzureBlob {
        /// Azure storage account name.
        account: String,
        /// Azure storage access key.
        access_key: String,
        /// Azure container name.
        container: String,
    },
    /// Local filesystem.
    LocalFs {
        /// Root directory path.
        root: PathBuf,
    },
    /// Process memory, for tests and development.
    Memory {
        /// Name that separates independent memory stores.
        root: String,
    },
}

impl StorageProvider {
    /// Create a local filesystem provider.
    #[must_use]
    pub fn local_fs(root: impl Into<PathBuf>) -> Self {
        Self::LocalFs { root: root.into() }
    }

    /// Create an in-memory provider.
    #[must_use]
    pub fn memory(root: impl Into<String>) -> Self {
        Self::Memory { root: root.into() }
    }

    /// Validate a store definition.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownBackendKind`] for an unrecognised kind
    /// and [`StorageError::Configuration`] when a required option is missing.
    pub fn from_settings(settings: &StoreSettings) -> Result<Self, StorageError> {
        let options = &settings.options;
        match settings.storage.as_str() {
            "fs" | "filesystem" => Ok(Self::LocalFs {
                root: PathBuf::from(required(options, "fs", "root")?),
            }),
            "s3" => Ok(Self::S3(s3_location(options, "s3", None)?)),
            "glacier" => Ok(Self::Glacier(s3_location(
                options,
                "glacier",
                Some(DEFAULT_ARCHIVE_STORAGE_CLASS),
            )?)),
            "azblob" | "azure_blob" => Ok(Self::AzureBlob {
                account: required(options, "azblob", "account")?,
                access_key: required(options, "azblob", "access_key")?,
                container: required(options, "azblob", "container")?,
            }),
            "memory" => Ok(Self::Memory {
                root: options.get("root").cloned().unwrap_or_else(|| "/".to_string()),
            }),
            other => Err(StorageError::unknown_kind(other)),
        }
    }

    /// Get the provider name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::S3(_) => "s3",
            Self::Glacier(_) => "glacier",
            Self::AzureBlob { .. } => "azblob",
            Self::LocalFs { .. } => "fs",
            Self::Memory { .. } => "memory",
        }
    }

    /// Get the bucket/container name.
    #[must_use]
    pub fn bucket(&self) -> &str {
        match self {
            Self::S3(location) | Self::Glacier(location) => &location.bucket,
            Self::AzureBlob { container, .. } => container,
            Self::LocalFs { root } => root.to_str().unwrap_or("local"),
            Self::Memory { root } => root,
        }
    }

    /// Whether reads are unavailable.
    #[must_use]
    pub fn is_archive(&self) -> bool {
        matches!(self, Self::Glacier(_))
    }

    /// Key under which a backend client is shared.
    ///
    /// Two stores with the same kind, location and credentials share one
    /// client. Secrets enter the key only as a digest, so keys can be logged.
    #[must_use]
    pub fn registry_key(&self) -> String {
        match self {
            Self::S3(l) | Self::Glacier(l) => format!(
                "{}|{}|{}|{}|{}|{}|{}",
                self.name(),
                l.endpoint.as_deref().unwrap_or_default(),
                l.region,
                l.bucket,
                l.access_key_id.as_deref().unwrap_or_default(),
                l.secret_access_key.as_deref().map(secret_digest).unwrap_or_default(),
                l.storage_class.as_deref().unwrap_or_default(),
            ),
            Self::AzureBlob {
                account,
                access_key,
                container,
            } => format!("azblob|{account}|{container}|{}", secret_digest(access_key)),
            Self::LocalFs { root } => format!("fs|{}", root.display()),
            Self::Memory { root } => format!("memory|{root}"),
        }
    }
}

fn secret_digest(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

fn required(
    options: &BTreeMap<String, String>,
    kind: &str,
    key: &str,
) -> Result<String, StorageError> {
    options
        .get(key)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| StorageError::configuration(format!("{kind} store requires option '{key}'")))
}

fn s3_location(
    options: &BTreeMap<String, String>,
    kind: &str,
    default_class: Option<&str>,
) -> Result<S3Location, StorageError> {
    Ok(S3Location {
        endpoint: options.get("endpoint").cloned(),
        bucket: required(options, kind, "bucket")?,
        region: options
            .get("region")
            .cloned()
            .unwrap_or_else(|| DEFAULT_REGION.to_string()),
        access_key_id: options.get("access_key_id").cloned(),
        secret_access_key: options.get("secret_access_key").cloned(),
        storage_class: options
            .get("storage_class")
            .cloned()
            .or_else(|| default_class.map(str::to_string)),
    })
}
