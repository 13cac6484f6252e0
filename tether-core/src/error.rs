//! Error types for tether-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::xml::XmlError;

/// All errors that can arise from profile store operations.
#[derive(Debug, Error)]
pub enum ProfileError {
    /// Underlying I/O failure (file not found, permission denied, etc.).
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Document rendering or parse error.
    #[error("XML error: {0}")]
    Xml(#[from] XmlError),

    /// The profile is structurally unusable (missing name, wrong type, ...).
    #[error("invalid profile: {0}")]
    InvalidProfile(String),

    /// No profile file was found for the given name and type.
    #[error("profile not found: {name}")]
    NotFound { name: String },

    /// Removal was refused because the profile is protected.
    #[error("profile is protected: {name}")]
    Protected { name: String },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ProfileError {
    ProfileError::Io {
        path: path.into(),
        source,
    }
}
