//! Application configuration management.
//!
//! Attachments are described statically: a path template, the styles to
//! generate, and where the bytes go. Store definitions stay as plain
//! `{storage: kind, options...}` maps here; the core crate validates the
//! kind when it builds a proxy for it.

use std::collections::{BTreeMap, HashSet};

use serde::Deserialize;

use crate::error::{SettingsError, SettingsResult};

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Database configuration.
    pub database: DatabaseConfig,
    /// Attachment definitions.
    #[serde(default)]
    pub attachments: Vec<AttachmentSettings>,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL.
    pub url: String,
    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

/// One attachment definition.
#[derive(Debug, Clone, Deserialize)]
pub struct AttachmentSettings {
    /// Attachment name, e.g. `avatar`.
    pub name: String,
    /// Record class the attachment belongs to, used by `:class`.
    #[serde(default = "default_class")]
    pub class: String,
    /// Path template shared by every store.
    #[serde(default = "default_path")]
    pub path: String,
    /// Styles to generate from the original.
    #[serde(default)]
    pub styles: BTreeMap<String, StyleSettings>,
    /// Where the bytes are stored.
    pub storage: StorageSettings,
    /// Collect unsupported-input errors on the attachment.
    #[serde(default = "default_whiny")]
    pub whiny: bool,
    /// Budget for retrying durable updates while the row is not yet visible.
    #[serde(default = "default_ensure_created_timeout")]
    pub ensure_created_timeout_secs: u64,
    /// How a processing worker triggers the storage save.
    #[serde(default)]
    pub save_trigger: SaveTriggerSetting,
    /// General options inherited by every store.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

fn default_class() -> String {
    "records".to_string()
}

fn default_path() -> String {
    ":class/:attachment/:id/:style/:filename".to_string()
}

fn default_whiny() -> bool {
    true
}

fn default_ensure_created_timeout() -> u64 {
    5
}

/// Processor chain for one style.
#[derive(Debug, Clone, Deserialize)]
pub struct StyleSettings {
    /// Processor names, applied in order.
    pub processors: Vec<String>,
    /// Options handed to every processor of the chain.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// Whether processing workers save inline or from a detached task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveTriggerSetting {
    /// The worker awaits the save before finishing the style.
    #[default]
    Inline,
    /// The save and the style completion run on a spawned task.
    Deferred,
}

/// Storage layout of an attachment.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StorageSettings {
    /// A single store.
    Single {
        /// The store.
        store: StoreSettings,
    },
    /// One main store replicated to mirrors and backups.
    Multiple {
        /// Record of truth, written synchronously.
        main: StoreSettings,
        /// Best-effort mirrors, written asynchronously.
        #[serde(default)]
        additional: Vec<StoreSettings>,
        /// Disaster-recovery copies of the original.
        #[serde(default)]
        backups: Vec<StoreSettings>,
        /// Whether backups are written inline or on workers.
        #[serde(default)]
        backup_form: BackupForm,
    },
}

/// Backup write mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupForm {
    /// Backups are written on the caller before the main store.
    Sync,
    /// Backups are written on workers and awaited before returning.
    #[default]
    Async,
}

/// A single store: backend kind plus free-form options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct StoreSettings {
    /// Backend kind (`fs`, `s3`, `azblob`, `glacier`, `memory`).
    pub storage: String,
    /// Backend options (root, bucket, credentials...).
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl StoreSettings {
    /// Create store settings for a kind with no options.
    #[must_use]
    pub fn new(storage: impl Into<String>) -> Self {
        Self {
            storage: storage.into(),
            options: BTreeMap::new(),
        }
    }

    /// Add an option.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Options of `self` layered over `general`; store-specific keys win.
    #[must_use]
    pub fn merged_over(&self, general: &BTreeMap<String, String>) -> Self {
        let mut options = general.clone();
        options.extend(self.options.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self {
            storage: self.storage.clone(),
            options,
        }
    }
}

impl StorageSettings {
    /// Every store of the layout, main first.
    #[must_use]
    pub fn stores(&self) -> Vec<&StoreSettings> {
        match self {
            Self::Single { store } => vec![store],
            Self::Multiple {
                main,
                additional,
                backups,
                ..
            } => std::iter::once(main)
                .chain(additional.iter())
                .chain(backups.iter())
                .collect(),
        }
    }
}

impl AttachmentSettings {
    /// Check the definition for mistakes that would only surface at runtime.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first problem found.
    pub fn validate(&self) -> SettingsResult<()> {
        if self.name.trim().is_empty() {
            return Err(SettingsError::invalid_attachment(
                &self.name,
                "name must not be empty",
            ));
        }
        if self.ensure_created_timeout_secs == 0 {
            return Err(SettingsError::invalid_attachment(
                &self.name,
                "ensure_created_timeout_secs must be positive",
            ));
        }
        if !self.path.contains(":style") {
            return Err(SettingsError::invalid_attachment(
                &self.name,
                "path must contain :style so variants do not collide",
            ));
        }
        if let Some((style, _)) = self.styles.iter().find(|(_, s)| s.processors.is_empty()) {
            return Err(SettingsError::invalid_attachment(
                &self.name,
                format!("style '{style}' has no processors"),
            ));
        }
        if self.styles.contains_key("original") {
            return Err(SettingsError::invalid_attachment(
                &self.name,
                "'original' is reserved",
            ));
        }
        if let Some(store) = self.storage.stores().iter().find(|s| s.storage.is_empty()) {
            return Err(SettingsError::invalid_attachment(
                &self.name,
                format!("store with options {:?} has no storage kind", store.options),
            ));
        }
        Ok(())
    }
}

impl AppConfig {
    /// Loads configuration from environment and config files.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be loaded or is invalid.
    pub fn load() -> SettingsResult<Self> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{run_mode}")).required(false))
            .add_source(config::Environment::with_prefix("VELLUM").separator("__"))
            .build()?;

        let app: Self = config.try_deserialize()?;
        app.validate()?;
        Ok(app)
    }

    /// Validate every attachment and reject duplicate names.
    ///
    /// # Errors
    ///
    /// Returns the first validation failure.
    pub fn validate(&self) -> SettingsResult<()> {
        let mut seen = HashSet::new();
        for attachment in &self.attachments {
            attachment.validate()?;
            if !seen.insert(attachment.name.as_str()) {
                return Err(SettingsError::DuplicateAttachment(attachment.name.clone()));
            }
        }
        Ok(())
    }

    /// Look up an attachment definition by name.
    #[must_use]
    pub fn attachment(&self, name: &str) -> Option<&AttachmentSettings> {
        self.attachments.iter().find(|a| a.name == name)
    }
}
