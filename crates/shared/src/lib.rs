//! Shared configuration, settings errors and typed ids for Vellum.
//!
//! This crate provides common pieces used across all other crates:
//! - Typed IDs for record references
//! - Settings errors raised while loading configuration
//! - Configuration management (attachments, stores, database)
//! - Tracing subscriber initialisation

pub mod config;
pub mod error;
pub mod telemetry;
pub mod types;

pub use config::{
    AppConfig, AttachmentSettings, BackupForm, DatabaseConfig, SaveTriggerSetting,
    StorageSettings, StoreSettings, StyleSettings,
};
pub use error::{SettingsError, SettingsResult};
