//! Temp-file snapshots
//!
//! Packages that are too big to snapshot in memory can be copied to a
//! temp file first. Files are removed when their handle goes away; a
//! delete that fails (the file may still be open on some platforms) is
//! retried when the provider itself is disposed.

use crate::dispose::Resource;
use crate::error::{NestError, NestResult};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::TempPath;
use tracing::{debug, warn};

/// Source of scratch files
pub trait TempFileProvider: Send + Sync {
    fn create_temp_file(&self) -> NestResult<TempFileHandle>;

    /// Retry pending deletes
    fn dispose(&self) -> NestResult<()> {
        Ok(())
    }
}

type Pending = Arc<Mutex<Vec<PathBuf>>>;

/// Creates temp files in one directory
pub struct TempDirProvider {
    dir: PathBuf,
    pending: Pending,
}

impl TempDirProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            pending: Arc::default(),
        }
    }

    /// Provider over the system temp directory
    pub fn system() -> Self {
        Self::new(std::env::temp_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Paths whose delete failed and will be retried
    pub fn pending(&self) -> Vec<PathBuf> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn retry_pending(&self) -> NestResult<()> {
        let paths = std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));
        let mut errors = Vec::new();
        for path in paths {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Removed leftover temp file {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => errors.push(NestError::io(
                    format!("removing temp file {}", path.display()),
                    e,
                )),
            }
        }
        NestError::aggregate(errors)
    }
}

impl TempFileProvider for TempDirProvider {
    fn create_temp_file(&self) -> NestResult<TempFileHandle> {
        let file = tempfile::Builder::new()
            .prefix("nestfs-")
            .suffix(".tmp")
            .tempfile_in(&self.dir)
            .map_err(|e| NestError::io(format!("creating temp file in {}", self.dir.display()), e))?;
        let path = file.into_temp_path();
        debug!("Created temp file {}", path.display());
        Ok(TempFileHandle {
            path: Some(path),
            pending: self.pending.clone(),
        })
    }

    fn dispose(&self) -> NestResult<()> {
        self.retry_pending()
    }
}

impl Drop for TempDirProvider {
    fn drop(&mut self) {
        if let Err(e) = self.retry_pending() {
            warn!("Temp files left behind: {}", e);
        }
    }
}

impl fmt::Debug for TempDirProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TempDirProvider")
            .field("dir", &self.dir)
            .finish()
    }
}

/// A temp file, deleted when the handle is disposed or dropped
pub struct TempFileHandle {
    path: Option<TempPath>,
    pending: Pending,
}

impl TempFileHandle {
    /// Location of the file. Empty once disposed.
    pub fn filename(&self) -> &Path {
        self.path.as_deref().unwrap_or_else(|| Path::new(""))
    }

    /// Delete the file now. Later calls do nothing.
    pub fn dispose(&mut self) -> NestResult<()> {
        let Some(path) = self.path.take() else {
            return Ok(());
        };
        let location = path.to_path_buf();
        path.close().map_err(|e| {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(location.clone());
            NestError::io(format!("removing temp file {}", location.display()), e)
        })
    }
}

impl Drop for TempFileHandle {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            warn!("{}; will retry", e);
        }
    }
}

impl fmt::Debug for TempFileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TempFileHandle")
            .field(&self.filename())
            .finish()
    }
}

impl From<TempFileHandle> for Resource {
    fn from(mut handle: TempFileHandle) -> Self {
        Resource::new(move || handle.dispose())
    }
}
