// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for barman-relay

use thiserror::Error;

use crate::fragment::FragmentKind;

/// Result type alias for barman-relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that can occur while publishing, collecting or realizing fragments
#[derive(Error, Debug)]
pub enum RelayError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Invalid configuration format
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// A collaborator or capability the run depends on is absent
    #[error("Missing prerequisite: {what}")]
    MissingPrerequisite { what: String },

    /// Key material present but not a `type blob` pair
    #[error("Malformed key material for node '{node}': {message}")]
    MalformedKeyMaterial { node: String, message: String },

    /// Two origins published the same (kind, title)
    #[error("{kind} '{title}' already published by '{existing}', rejected from '{incoming}'")]
    DuplicateTitleConflict {
        kind: FragmentKind,
        title: String,
        existing: String,
        incoming: String,
    },

    /// A fragment was built without any tag
    #[error("{kind} '{title}' has no tags")]
    UntaggedFragment { kind: FragmentKind, title: String },

    /// Predicate text could not be parsed
    #[error("Invalid predicate '{input}': {message}")]
    InvalidPredicate { input: String, message: String },

    /// A collected fragment could not be turned into local state
    #[error("Failed to realize {kind} '{title}': {message}")]
    RealizationFailed {
        kind: FragmentKind,
        title: String,
        message: String,
    },

    /// Catalog file exists but cannot be decoded
    #[error("Corrupt catalog '{path}': {message}")]
    CorruptCatalog { path: String, message: String },

    /// IO error wrapper
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl RelayError {
    /// Whether the error should abort the whole run rather than one fragment
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::MissingPrerequisite { .. }
                | RelayError::ConfigNotFound { .. }
                | RelayError::InvalidConfig { .. }
                | RelayError::CorruptCatalog { .. }
        )
    }
}
