//! Content provider contract
//!
//! A `FileProvider` is a read-only file tree: the physical backing store,
//! an opened archive, or the package cache itself, which re-exposes nested
//! archives through flat paths.

mod physical;
mod stream;

pub use physical::{PhysicalFileProvider, PollingChangeToken};
pub use stream::{ContentStream, ReadSeek};

use crate::dispose::BelatedDispose;
use crate::error::NestResult;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

/// Read-only file tree
pub trait FileProvider: Send + Sync {
    /// Describe the file or directory at `path` (`""` is the root directory)
    fn file_info(&self, path: &str) -> NestResult<FileInfo>;

    /// List the directory at `path`
    fn directory_contents(&self, path: &str) -> NestResult<DirectoryContents>;

    /// Open the file at `path` for reading
    fn open(&self, path: &str) -> NestResult<ContentStream>;

    /// Change notification for files matching a glob `filter`
    fn watch(&self, filter: &str) -> Arc<dyn ChangeToken>;

    /// Deferred-disposal barrier, for providers whose streams must pin
    /// their backing resource
    fn belated_dispose(&self) -> Option<&BelatedDispose> {
        None
    }

    /// Release the provider's resources. Streams already handed out stay
    /// readable when the provider has a belated-dispose barrier.
    fn dispose(&self) -> NestResult<()> {
        Ok(())
    }
}

/// Description of one file or directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    /// Last path component
    pub name: String,

    /// Path relative to the provider root
    pub path: String,

    pub exists: bool,
    pub is_directory: bool,

    /// Name matches a package extension
    pub is_package: bool,

    /// Content length in bytes, when known
    pub length: Option<u64>,

    pub last_modified: Option<DateTime<Utc>>,

    /// Location on disk, for files the loader may open directly
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physical_path: Option<PathBuf>,
}

impl FileInfo {
    /// Describe a regular file
    pub fn file(path: &str, length: u64, last_modified: Option<DateTime<Utc>>) -> Self {
        Self {
            name: file_name(path).to_string(),
            path: path.to_string(),
            exists: true,
            is_directory: false,
            is_package: false,
            length: Some(length),
            last_modified,
            physical_path: None,
        }
    }

    /// Describe a directory
    pub fn directory(path: &str, last_modified: Option<DateTime<Utc>>) -> Self {
        Self {
            name: file_name(path).to_string(),
            path: path.to_string(),
            exists: true,
            is_directory: true,
            is_package: false,
            length: None,
            last_modified,
            physical_path: None,
        }
    }

    /// Describe a path that does not exist
    pub fn missing(path: &str) -> Self {
        Self {
            name: file_name(path).to_string(),
            path: path.to_string(),
            exists: false,
            is_directory: false,
            is_package: false,
            length: None,
            last_modified: None,
            physical_path: None,
        }
    }

    /// Mark as a package: listed and navigated like a directory
    pub fn into_package(mut self) -> Self {
        self.is_package = true;
        self.is_directory = true;
        self
    }

    /// Re-root the path, e.g. when the package cache exposes an entry
    /// of a nested archive under its flat path
    pub fn with_path(mut self, path: String) -> Self {
        self.path = path;
        self
    }

    pub fn with_physical_path(mut self, path: PathBuf) -> Self {
        self.physical_path = Some(path);
        self
    }
}

/// Directory listing
#[derive(Debug, Clone, Default, Serialize)]
pub struct DirectoryContents {
    pub exists: bool,
    pub entries: Vec<FileInfo>,
}

impl DirectoryContents {
    pub fn new(entries: Vec<FileInfo>) -> Self {
        Self {
            exists: true,
            entries,
        }
    }

    pub fn missing() -> Self {
        Self::default()
    }
}

/// Change notification handle
pub trait ChangeToken: Send + Sync {
    fn has_changed(&self) -> bool;
}

/// Token for content that never changes
#[derive(Debug, Default, Clone, Copy)]
pub struct NullChangeToken;

impl ChangeToken for NullChangeToken {
    fn has_changed(&self) -> bool {
        false
    }
}

/// Last component of a `/`-separated path
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Trim leading and trailing separators from a provider path
pub fn normalize_path(path: &str) -> &str {
    path.trim_matches('/')
}

/// Join a directory and a name into a provider path
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_helpers() {
        assert_eq!(file_name("a/b/c.txt"), "c.txt");
        assert_eq!(file_name("c.txt"), "c.txt");
        assert_eq!(normalize_path("/a/b/"), "a/b");
        assert_eq!(join_path("", "x"), "x");
        assert_eq!(join_path("a", "x"), "a/x");
    }

    #[test]
    fn package_info_is_navigable() {
        let info = FileInfo::file("dir/a.zip", 10, None).into_package();
        assert!(info.is_directory);
        assert!(info.is_package);
        assert_eq!(info.length, Some(10));
        assert_eq!(info.name, "a.zip");
    }

    #[test]
    fn missing_info() {
        let info = FileInfo::missing("nope.txt");
        assert!(!info.exists);
        assert!(!DirectoryContents::missing().exists);
        assert!(!NullChangeToken.has_changed());
    }
}
