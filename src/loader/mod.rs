//! Package loader adapters
//!
//! A loader turns the bytes of one package file into a [`FileProvider`].
//! Loaders advertise which of the five load capabilities they implement;
//! the resolution engine picks a strategy from those.
//!
//! Ownership differs per capability and must be honored:
//!
//! - `open_file`: the returned provider opens the path itself and keeps
//!   using it.
//! - `load_file`: the file is read fully during the call.
//! - `use_stream`: the provider takes the stream and closes it.
//! - `load_from_stream`: the caller keeps the stream; it is read during
//!   the call.
//! - `use_bytes`: the provider keeps the shared buffer.

mod archive;
mod bzip2_loader;
mod gzip_loader;
mod source;
mod tar_loader;
mod zip_loader;

pub use archive::{ArchiveEntry, ArchiveProvider, EntryData};
pub use bzip2_loader::Bzip2Loader;
pub use gzip_loader::GzipLoader;
pub use source::ByteSource;
pub use tar_loader::TarLoader;
pub use zip_loader::ZipLoader;

use crate::error::NestError;
use crate::provider::{ContentStream, FileProvider};
use chrono::{DateTime, Utc};
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Errors a loader reports. The engine tells these apart when deciding
/// whether a failure means "not a package".
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("malformed package: {0}")]
    Format(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("operation not supported by this loader")]
    Unsupported,
}

impl LoaderError {
    /// Convert into the crate error for the package at `path`
    pub fn into_nest_error(self, path: &str) -> NestError {
        match self {
            Self::Format(reason) => NestError::load(path, reason),
            Self::Io(e) => NestError::io(format!("loading {path}"), e),
            Self::Unsupported => NestError::no_capability(path, "loader refused the operation"),
        }
    }
}

/// Result type for loader calls
pub type LoadResult = Result<Arc<dyn FileProvider>, LoaderError>;

/// Capabilities a loader implements
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderCapabilities {
    pub open_file: bool,
    pub load_file: bool,
    pub use_stream: bool,
    pub load_from_stream: bool,
    pub use_bytes: bool,
}

/// What the engine knows about the package being loaded
#[derive(Debug, Clone)]
pub struct PackageLoadInfo {
    /// Canonical path of the package
    pub path: String,
    pub length: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// A per-format package decoder
pub trait PackageLoader: Send + Sync {
    /// Short name used in configuration, e.g. `zip`
    fn name(&self) -> &str;

    /// Regex matched case-insensitively against the end of a file name,
    /// including the dot, e.g. `\.zip`
    fn extension_pattern(&self) -> &str;

    fn capabilities(&self) -> LoaderCapabilities;

    fn open_file(&self, _path: &Path, _info: &PackageLoadInfo) -> LoadResult {
        Err(LoaderError::Unsupported)
    }

    fn load_file(&self, _path: &Path, _info: &PackageLoadInfo) -> LoadResult {
        Err(LoaderError::Unsupported)
    }

    fn use_stream(&self, _stream: ContentStream, _info: &PackageLoadInfo) -> LoadResult {
        Err(LoaderError::Unsupported)
    }

    fn load_from_stream(&self, _stream: &mut dyn Read, _info: &PackageLoadInfo) -> LoadResult {
        Err(LoaderError::Unsupported)
    }

    fn use_bytes(&self, _bytes: Arc<[u8]>, _info: &PackageLoadInfo) -> LoadResult {
        Err(LoaderError::Unsupported)
    }
}

/// Names accepted by [`by_name`]
pub const STANDARD_LOADERS: [&str; 4] = ["zip", "tar", "gzip", "bzip2"];

/// Construct a loader by its configuration name
pub fn by_name(name: &str) -> Option<Arc<dyn PackageLoader>> {
    match name {
        "zip" => Some(Arc::new(ZipLoader)),
        "tar" => Some(Arc::new(TarLoader)),
        "gzip" => Some(Arc::new(GzipLoader)),
        "bzip2" => Some(Arc::new(Bzip2Loader)),
        _ => None,
    }
}

/// All built-in loaders
pub fn standard_loaders() -> Vec<Arc<dyn PackageLoader>> {
    STANDARD_LOADERS.iter().filter_map(|n| by_name(n)).collect()
}
