//! Command-line interface

pub mod args;
pub mod commands;

pub use args::{Cli, Commands, OutputFormat};

use crate::cache::{CacheOptions, PackageFileProvider};
use crate::config::Config;
use crate::error::{NestError, NestResult};
use crate::provider::{FileProvider, PhysicalFileProvider};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Build a package cache over the directory `root`
pub fn open_cache(root: &Path, config: &Config) -> NestResult<Arc<PackageFileProvider>> {
    if !root.is_dir() {
        return Err(NestError::NotFound(root.display().to_string()));
    }
    let options = CacheOptions::from_config(config)?;
    debug!("Opening cache over {} with {:?}", root.display(), options);
    let provider: Arc<dyn FileProvider> = Arc::new(PhysicalFileProvider::new(root));
    PackageFileProvider::new(provider, options)
}

/// Run blocking cache work off the async runtime
pub async fn blocking<T, F>(work: F) -> NestResult<T>
where
    F: FnOnce() -> NestResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| NestError::Internal(format!("cache task failed: {e}")))?
}
