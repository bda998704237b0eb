//! Errors and warnings produced while loading configuration.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// A configuration the gateway refuses to start with.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no configuration file found (looked in {searched:?})")]
    NotFound { searched: Vec<PathBuf> },

    #[error("configuration file is empty")]
    Empty,

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_saphyr::Error),

    /// `${VAR}` without a default, and `VAR` is unset.
    #[error("environment variable '{var}' is not set (needed by {field})")]
    MissingEnvVar { var: String, field: String },

    /// A route or the memory section names a downstream that is not defined.
    #[error("{field} references unknown downstream '{name}'")]
    UnknownDownstream { name: String, field: String },

    #[error("route {method} {path} is defined twice")]
    DuplicateRoute { method: String, path: String },

    #[error("'{url}' is not a usable URL: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("{field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("JWT verifier: {message}")]
    InvalidJwtKey { message: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Something suspicious that does not stop startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationWarning {
    /// Every request would be rejected as unauthenticated.
    #[error("no API keys, JWT or introspection configured and anonymous access is off")]
    NoCredentialSources,

    #[error("downstream '{name}' is not used by any route")]
    UnusedDownstream { name: String },

    #[error("memory downstream '{name}' is not defined; enrichment is disabled")]
    MemoryDisabled { name: String },
}

/// Warnings collected by a successful validation.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}
