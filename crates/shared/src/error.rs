//! Settings error types.

use thiserror::Error;

/// Result type alias using `SettingsError`.
pub type SettingsResult<T> = Result<T, SettingsError>;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Configuration sources could not be read or deserialized.
    #[error("Configuration could not be loaded: {0}")]
    Load(#[from] config::ConfigError),

    /// An attachment definition is invalid.
    #[error("Invalid attachment '{attachment}': {reason}")]
    InvalidAttachment {
        /// Name of the offending attachment.
        attachment: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Two attachments share a name.
    #[error("Duplicate attachment name: {0}")]
    DuplicateAttachment(String),
}

impl SettingsError {
    /// Create an invalid attachment error.
    #[must_use]
    pub fn invalid_attachment(attachment: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAttachment {
            attachment: attachment.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            SettingsError::invalid_attachment("avatar", "no stores").to_string(),
            "Invalid attachment 'avatar': no stores"
        );
        assert_eq!(
            SettingsError::DuplicateAttachment("avatar".into()).to_string(),
            "Duplicate attachment name: avatar"
        );
    }
}
