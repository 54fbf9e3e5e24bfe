//! Error types for nestfs
//!
//! All modules use `NestResult<T>` as their return type. Errors are `Clone`
//! so that a failed package load can be cached and replayed verbatim.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for nestfs operations
pub type NestResult<T> = Result<T, NestError>;

/// All errors that can occur in nestfs
#[derive(Error, Debug, Clone)]
pub enum NestError {
    // Configuration errors
    #[error("No package loaders configured")]
    NoLoaders,

    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Invalid options: {0}")]
    OptionsInvalid(String),

    // Package errors
    #[error("No suitable load capability for {path}: {reason}")]
    NoSuitableLoadCapability { path: String, reason: String },

    #[error("Failed to load package {path}: {reason}")]
    Load { path: String, reason: String },

    #[error("Use of disposed object: {0}")]
    Disposed(String),

    #[error("Gave up opening {path} after {attempts} attempts (entry kept being evicted)")]
    Contended { path: String, attempts: u32 },

    #[error("{} error(s) while disposing: {}", .0.len(), join_errors(.0))]
    Dispose(Vec<NestError>),

    // IO errors
    #[error("IO error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("File not found: {0}")]
    NotFound(String),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(String),

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(String),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

fn join_errors(errors: &[NestError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl NestError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    /// Create a load error for a malformed package
    pub fn load(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Load {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a "no suitable load capability" error
    pub fn no_capability(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NoSuitableLoadCapability {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Fold a list of errors from a multi-resource dispose into one result.
    ///
    /// A single error is returned as-is; several are wrapped in `Dispose`.
    pub fn aggregate(mut errors: Vec<NestError>) -> NestResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Dispose(errors)),
        }
    }

    /// Check if error is a configuration problem
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::NoLoaders | Self::ConfigInvalid { .. } | Self::OptionsInvalid(_)
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::NoLoaders => Some("Enable at least one loader: nestfs config show, [loaders] enabled"),
            Self::ConfigInvalid { .. } => Some("Regenerate defaults with: nestfs config init --force"),
            Self::NoSuitableLoadCapability { .. } => {
                Some("Raise cache.max_memory_snapshot_bytes or enable [temp] snapshots")
            }
            Self::Contended { .. } => Some("Raise cache.open_retry_limit or lengthen eviction_secs"),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for NestError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e.to_string())
    }
}

impl From<toml::de::Error> for NestError {
    fn from(e: toml::de::Error) -> Self {
        Self::TomlParse(e.to_string())
    }
}

impl From<toml::ser::Error> for NestError {
    fn from(e: toml::ser::Error) -> Self {
        Self::TomlSerialize(e.to_string())
    }
}
