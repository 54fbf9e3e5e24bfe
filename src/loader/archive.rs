//! Read-only provider over an indexed archive
//!
//! Every loader produces the same provider: an immutable index of entries
//! pointing into a [`ByteSource`]. Streams handed out carry a hold on the
//! provider's [`BelatedDispose`] barrier, so disposing the provider never
//! pulls the source out from under an open stream.

use super::ByteSource;
use crate::dispose::{BelatedDispose, Resource};
use crate::error::{NestError, NestResult};
use crate::provider::{
    file_name, normalize_path, ChangeToken, ContentStream, DirectoryContents, FileInfo,
    FileProvider, NullChangeToken,
};
use bzip2::read::MultiBzDecoder;
use chrono::{DateTime, Utc};
use flate2::read::{DeflateDecoder, MultiGzDecoder};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

/// How an entry's content is stored in the source
#[derive(Debug, Clone)]
pub enum EntryData {
    /// Raw bytes at `offset`, `size` long
    Stored { offset: u64 },
    /// Raw deflate stream at `offset`
    Deflate { offset: u64, compressed: u64 },
    /// The whole source is one gzip stream
    Gzip,
    /// The whole source is one bzip2 stream
    Bzip2,
    /// Decoded up front
    Inline(Arc<[u8]>),
}

/// One file in an archive index
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub path: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub data: EntryData,
}

/// Provider for an opened package
pub struct ArchiveProvider {
    label: String,
    source: ByteSource,
    files: BTreeMap<String, ArchiveEntry>,
    dirs: BTreeSet<String>,
    barrier: BelatedDispose,
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(parent, _)| parent)
}

impl ArchiveProvider {
    /// Build the index. Directories are inferred from file paths;
    /// `explicit_dirs` adds empty ones.
    pub fn new(
        label: impl Into<String>,
        source: ByteSource,
        entries: Vec<ArchiveEntry>,
        explicit_dirs: Vec<String>,
    ) -> Self {
        let label = label.into();
        let mut files = BTreeMap::new();
        let mut dirs = BTreeSet::new();

        for dir in explicit_dirs {
            let dir = normalize_path(&dir);
            if !dir.is_empty() {
                dirs.insert(dir.to_string());
            }
        }
        for mut entry in entries {
            let path = normalize_path(&entry.path).to_string();
            if path.is_empty() {
                continue;
            }
            entry.path = path.clone();
            files.insert(path, entry);
        }

        let mut implied = Vec::new();
        for path in files.keys().chain(dirs.iter()) {
            let mut parent = parent_of(path);
            while !parent.is_empty() {
                implied.push(parent.to_string());
                parent = parent_of(parent);
            }
        }
        dirs.extend(implied);

        let barrier = BelatedDispose::new(label.clone());
        Self {
            label,
            source,
            files,
            dirs,
            barrier,
        }
    }

    /// Number of files in the archive
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn entry(&self, path: &str) -> Option<&ArchiveEntry> {
        self.files.get(normalize_path(path))
    }

    pub fn source(&self) -> &ByteSource {
        &self.source
    }

    fn ensure_live(&self) -> NestResult<()> {
        if self.barrier.is_disposing() {
            return Err(NestError::Disposed(self.label.clone()));
        }
        Ok(())
    }

    fn info(&self, entry: &ArchiveEntry) -> FileInfo {
        FileInfo::file(&entry.path, entry.size, entry.modified)
    }

    fn io_error(&self, path: &str, e: std::io::Error) -> NestError {
        NestError::io(format!("opening {path} in {}", self.label), e)
    }
}

impl FileProvider for ArchiveProvider {
    fn file_info(&self, path: &str) -> NestResult<FileInfo> {
        self.ensure_live()?;
        let path = normalize_path(path);
        if let Some(entry) = self.files.get(path) {
            return Ok(self.info(entry));
        }
        if path.is_empty() || self.dirs.contains(path) {
            return Ok(FileInfo::directory(path, None));
        }
        Ok(FileInfo::missing(path))
    }

    fn directory_contents(&self, path: &str) -> NestResult<DirectoryContents> {
        self.ensure_live()?;
        let path = normalize_path(path);
        if !path.is_empty() && !self.dirs.contains(path) {
            return Ok(DirectoryContents::missing());
        }

        let mut entries: Vec<FileInfo> = self
            .dirs
            .iter()
            .filter(|d| parent_of(d) == path)
            .map(|d| FileInfo::directory(d, None))
            .chain(
                self.files
                    .values()
                    .filter(|e| parent_of(&e.path) == path)
                    .map(|e| self.info(e)),
            )
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(DirectoryContents::new(entries))
    }

    fn open(&self, path: &str) -> NestResult<ContentStream> {
        self.ensure_live()?;
        let path = normalize_path(path);
        let entry = self
            .files
            .get(path)
            .ok_or_else(|| NestError::NotFound(format!("{}/{}", self.label, path)))?;
        let token = self.barrier.defer()?;

        let stream = match &entry.data {
            EntryData::Stored { offset } => {
                let slice = self
                    .source
                    .slice(*offset, entry.size)
                    .map_err(|e| self.io_error(path, e))?;
                ContentStream::seekable(slice)
            }
            EntryData::Deflate { offset, compressed } => {
                let slice = self
                    .source
                    .slice(*offset, *compressed)
                    .map_err(|e| self.io_error(path, e))?;
                ContentStream::sequential(DeflateDecoder::new(slice))
            }
            EntryData::Gzip => {
                let whole = self
                    .source
                    .slice(0, u64::MAX)
                    .map_err(|e| self.io_error(path, e))?;
                ContentStream::sequential(MultiGzDecoder::new(whole))
            }
            EntryData::Bzip2 => {
                let whole = self
                    .source
                    .slice(0, u64::MAX)
                    .map_err(|e| self.io_error(path, e))?;
                ContentStream::sequential(MultiBzDecoder::new(whole))
            }
            EntryData::Inline(bytes) => ContentStream::seekable(Cursor::new(bytes.clone())),
        };
        Ok(stream
            .with_length(entry.size)
            .with_hold(Resource::from(token)))
    }

    fn watch(&self, _filter: &str) -> Arc<dyn ChangeToken> {
        Arc::new(NullChangeToken)
    }

    fn belated_dispose(&self) -> Option<&BelatedDispose> {
        Some(&self.barrier)
    }

    fn dispose(&self) -> NestResult<()> {
        self.barrier.dispose()
    }
}

impl fmt::Debug for ArchiveProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveProvider")
            .field("label", &self.label)
            .field("source", &self.source)
            .field("files", &self.files.len())
            .field("barrier", &self.barrier)
            .finish()
    }
}

/// File name inside an archive, for error messages and single-entry
/// formats
pub fn entry_name(path: &str) -> &str {
    file_name(normalize_path(path))
}
