//! Gzip packages
//!
//! A gzip file is exposed as a package holding a single entry named after
//! the file without its `.gz` suffix; `.tgz` maps to `.tar`, so
//! `logs.tgz/logs.tar/app.log` reaches into the embedded tarball.

use super::archive::entry_name;
use super::{
    ArchiveEntry, ArchiveProvider, ByteSource, EntryData, LoadResult, LoaderCapabilities,
    LoaderError, PackageLoadInfo, PackageLoader,
};
use crate::provider::{ContentStream, ReadSeek};
use flate2::read::MultiGzDecoder;
use std::io::{self, Read, SeekFrom};
use std::path::Path;
use std::sync::Arc;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
// header (10) + trailer (8)
const MIN_GZIP_LEN: u64 = 18;

/// Loader for `.gz` and `.tgz` files
#[derive(Debug, Default, Clone, Copy)]
pub struct GzipLoader;

/// Name of the single entry inside a gzip package
pub fn inner_name(package_path: &str) -> String {
    strip_suffix(package_path, &[(".tgz", ".tar"), (".gz", "")])
}

/// File name of `package_path` with the first matching suffix replaced,
/// compared case-insensitively
pub(super) fn strip_suffix(package_path: &str, renames: &[(&str, &str)]) -> String {
    let name = entry_name(package_path);
    let lower = name.to_ascii_lowercase();
    let inner = renames
        .iter()
        .find(|(suffix, _)| lower.ends_with(*suffix))
        .map_or_else(
            || name.to_string(),
            |(suffix, replacement)| format!("{}{replacement}", &name[..name.len() - suffix.len()]),
        );
    if inner.is_empty() {
        "content".to_string()
    } else {
        inner
    }
}

pub(super) fn format_error(e: io::Error) -> LoaderError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => {
            LoaderError::Format(e.to_string())
        }
        _ => LoaderError::Io(e),
    }
}

/// Check the magic bytes and count the inflated size across all members.
/// The ISIZE trailer only covers the last member, modulo 2^32.
fn measure(reader: &mut dyn ReadSeek) -> Result<u64, LoaderError> {
    let total = reader.seek(SeekFrom::End(0))?;
    if total < MIN_GZIP_LEN {
        return Err(LoaderError::Format("truncated gzip stream".into()));
    }
    reader.seek(SeekFrom::Start(0))?;
    let mut magic = [0u8; 2];
    reader.read_exact(&mut magic).map_err(format_error)?;
    if magic != GZIP_MAGIC {
        return Err(LoaderError::Format("not a gzip stream".into()));
    }
    reader.seek(SeekFrom::Start(0))?;
    io::copy(&mut MultiGzDecoder::new(reader), &mut io::sink()).map_err(format_error)
}

fn build(source: ByteSource, info: &PackageLoadInfo) -> LoadResult {
    let size = source.with_reader(measure)??;
    let entry = ArchiveEntry {
        path: inner_name(&info.path),
        size,
        modified: info.last_modified,
        data: EntryData::Gzip,
    };
    Ok(Arc::new(ArchiveProvider::new(
        info.path.clone(),
        source,
        vec![entry],
        Vec::new(),
    )))
}

impl PackageLoader for GzipLoader {
    fn name(&self) -> &str {
        "gzip"
    }

    fn extension_pattern(&self) -> &str {
        r"\.gz|\.tgz"
    }

    fn capabilities(&self) -> LoaderCapabilities {
        LoaderCapabilities {
            open_file: true,
            load_file: false,
            use_stream: true,
            load_from_stream: true,
            use_bytes: true,
        }
    }

    fn open_file(&self, path: &Path, info: &PackageLoadInfo) -> LoadResult {
        build(ByteSource::file(path), info)
    }

    fn use_stream(&self, stream: ContentStream, info: &PackageLoadInfo) -> LoadResult {
        if !stream.is_seekable() {
            return Err(LoaderError::Unsupported);
        }
        build(ByteSource::shared(stream), info)
    }

    /// Inflate the whole stream into memory
    fn load_from_stream(&self, stream: &mut dyn Read, info: &PackageLoadInfo) -> LoadResult {
        let mut decoded = Vec::new();
        MultiGzDecoder::new(stream)
            .read_to_end(&mut decoded)
            .map_err(format_error)?;
        let entry = ArchiveEntry {
            path: inner_name(&info.path),
            size: decoded.len() as u64,
            modified: info.last_modified,
            data: EntryData::Stored { offset: 0 },
        };
        Ok(Arc::new(ArchiveProvider::new(
            info.path.clone(),
            ByteSource::bytes(decoded.into()),
            vec![entry],
            Vec::new(),
        )))
    }

    fn use_bytes(&self, bytes: Arc<[u8]>, info: &PackageLoadInfo) -> LoadResult {
        build(ByteSource::bytes(bytes), info)
    }
}
