//! Why a settings file could not become a [`HelmSettings`](crate::HelmSettings).

use std::path::PathBuf;

use thiserror::Error;

/// Settings loading and validation failures.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The file exists but could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Read {
        /// Settings file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The file is not JSON.
    #[error("{} is not valid JSON: {source}", path.display())]
    Parse {
        /// Settings file.
        path: PathBuf,
        /// Parser error, with line and column.
        source: serde_json::Error,
    },

    /// The merged document has a field of the wrong type.
    #[error("settings do not match the expected shape: {0}")]
    Shape(#[from] serde_json::Error),

    /// A value is well-typed but not acceptable, e.g. a zero rate limit.
    #[error("invalid setting {field}: {reason}")]
    Invalid {
        /// camelCase path of the offending field, e.g. `rateLimits.post.max`.
        field: String,
        /// What is wrong with it.
        reason: String,
    },
}

impl SettingsError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;
