//! Bzip2 packages
//!
//! Same shape as a gzip package: one entry named after the file without
//! its `.bz2` suffix, with `.tbz2` and `.tbz` mapping to `.tar`.

use super::gzip_loader::{format_error, strip_suffix};
use super::{
    ArchiveEntry, ArchiveProvider, ByteSource, EntryData, LoadResult, LoaderCapabilities,
    LoaderError, PackageLoadInfo, PackageLoader,
};
use crate::provider::{ContentStream, ReadSeek};
use bzip2::read::MultiBzDecoder;
use std::io::{self, Read, SeekFrom};
use std::path::Path;
use std::sync::Arc;

const BZIP2_MAGIC: [u8; 3] = *b"BZh";

/// Loader for `.bz2`, `.bzip2`, `.tbz2` and `.tbz` files
#[derive(Debug, Default, Clone, Copy)]
pub struct Bzip2Loader;

/// Name of the single entry inside a bzip2 package
pub fn inner_name(package_path: &str) -> String {
    strip_suffix(
        package_path,
        &[
            (".tbz2", ".tar"),
            (".tbz", ".tar"),
            (".bzip2", ""),
            (".bz2", ""),
        ],
    )
}

/// Check the magic bytes and count the decompressed size
fn measure(reader: &mut dyn ReadSeek) -> Result<u64, LoaderError> {
    let mut magic = [0u8; 3];
    reader.read_exact(&mut magic).map_err(format_error)?;
    if magic != BZIP2_MAGIC {
        return Err(LoaderError::Format("not a bzip2 stream".into()));
    }
    reader.seek(SeekFrom::Start(0))?;
    io::copy(&mut MultiBzDecoder::new(reader), &mut io::sink()).map_err(format_error)
}

fn build(source: ByteSource, info: &PackageLoadInfo) -> LoadResult {
    let size = source.with_reader(measure)??;
    let entry = ArchiveEntry {
        path: inner_name(&info.path),
        size,
        modified: info.last_modified,
        data: EntryData::Bzip2,
    };
    Ok(Arc::new(ArchiveProvider::new(
        info.path.clone(),
        source,
        vec![entry],
        Vec::new(),
    )))
}

impl PackageLoader for Bzip2Loader {
    fn name(&self) -> &str {
        "bzip2"
    }

    fn extension_pattern(&self) -> &str {
        r"\.bz2|\.bzip2|\.tbz2|\.tbz"
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

    fn load_from_stream(&self, stream: &mut dyn Read, info: &PackageLoadInfo) -> LoadResult {
        let mut decoded = Vec::new();
        MultiBzDecoder::new(stream)
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
