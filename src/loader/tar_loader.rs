//! Tar packages

use super::{
    ArchiveEntry, ArchiveProvider, ByteSource, EntryData, LoadResult, LoaderCapabilities,
    LoaderError, PackageLoadInfo, PackageLoader,
};
use crate::provider::{ContentStream, ReadSeek};
use chrono::DateTime;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use tar::{Archive, EntryType};
use tracing::debug;

/// Loader for `.tar` files. Tar entries are uncompressed, so every file is
/// served as a seekable slice of the source.
#[derive(Debug, Default, Clone, Copy)]
pub struct TarLoader;

fn tar_error(e: io::Error) -> LoaderError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::InvalidData
        | io::ErrorKind::InvalidInput
        | io::ErrorKind::Other => LoaderError::Format(e.to_string()),
        _ => LoaderError::Io(e),
    }
}

fn index(reader: &mut dyn ReadSeek) -> Result<(Vec<ArchiveEntry>, Vec<String>), LoaderError> {
    let mut archive = Archive::new(reader);
    let mut entries = Vec::new();
    let mut dirs = Vec::new();

    for entry in archive.entries_with_seek().map_err(tar_error)? {
        let entry = entry.map_err(tar_error)?;
        let path = entry
            .path()
            .map_err(tar_error)?
            .to_string_lossy()
            .into_owned();
        let header = entry.header();
        let kind = header.entry_type();

        if kind == EntryType::Directory {
            dirs.push(path);
        } else if kind.is_file() {
            let modified = header
                .mtime()
                .ok()
                .and_then(|secs| i64::try_from(secs).ok())
                .and_then(|secs| DateTime::from_timestamp(secs, 0));
            entries.push(ArchiveEntry {
                path,
                size: entry.size(),
                modified,
                data: EntryData::Stored {
                    offset: entry.raw_file_position(),
                },
            });
        } else {
            debug!("Skipping tar entry {} of type {:?}", path, kind);
        }
    }
    Ok((entries, dirs))
}

fn build(source: ByteSource, info: &PackageLoadInfo) -> LoadResult {
    let (entries, dirs) = source.with_reader(index)??;
    debug!("Indexed {} tar entries in {}", entries.len(), info.path);
    Ok(Arc::new(ArchiveProvider::new(
        info.path.clone(),
        source,
        entries,
        dirs,
    )))
}

impl PackageLoader for TarLoader {
    fn name(&self) -> &str {
        "tar"
    }

    fn extension_pattern(&self) -> &str {
        r"\.tar"
    }

    fn capabilities(&self) -> LoaderCapabilities {
        LoaderCapabilities {
            open_file: true,
            load_file: true,
            use_stream: true,
            load_from_stream: true,
            use_bytes: true,
        }
    }

    fn open_file(&self, path: &Path, info: &PackageLoadInfo) -> LoadResult {
        build(ByteSource::file(path), info)
    }

    fn load_file(&self, path: &Path, info: &PackageLoadInfo) -> LoadResult {
        let bytes = std::fs::read(path)?;
        build(ByteSource::bytes(bytes.into()), info)
    }

    fn use_stream(&self, stream: ContentStream, info: &PackageLoadInfo) -> LoadResult {
        if !stream.is_seekable() {
            return Err(LoaderError::Unsupported);
        }
        build(ByteSource::shared(stream), info)
    }

    fn load_from_stream(&self, stream: &mut dyn Read, info: &PackageLoadInfo) -> LoadResult {
        let mut bytes = Vec::with_capacity(
            info.length
                .and_then(|n| usize::try_from(n).ok())
                .unwrap_or(0),
        );
        stream.read_to_end(&mut bytes)?;
        build(ByteSource::bytes(bytes.into()), info)
    }

    fn use_bytes(&self, bytes: Arc<[u8]>, info: &PackageLoadInfo) -> LoadResult {
        build(ByteSource::bytes(bytes), info)
    }
}
