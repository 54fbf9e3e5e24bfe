//! Zip packages

use super::{
    ArchiveEntry, ArchiveProvider, ByteSource, EntryData, LoadResult, LoaderCapabilities,
    LoaderError, PackageLoadInfo, PackageLoader,
};
use crate::provider::{ContentStream, ReadSeek};
use chrono::{DateTime, TimeZone, Utc};
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use zip::result::ZipError;
use zip::{CompressionMethod, ZipArchive};

/// Loader for `.zip` files.
///
/// Stored entries are served as seekable slices of the source and deflated
/// entries are inflated on the fly. Entries using any other method are
/// decompressed while the index is built.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZipLoader;

type Index = (Vec<ArchiveEntry>, Vec<String>);

fn zip_error(e: ZipError) -> LoaderError {
    match e {
        ZipError::Io(e) if is_truncation(&e) => LoaderError::Format(e.to_string()),
        ZipError::Io(e) => LoaderError::Io(e),
        other => LoaderError::Format(other.to_string()),
    }
}

fn is_truncation(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData
    )
}

fn zip_time(t: zip::DateTime) -> Option<DateTime<Utc>> {
    let naive = chrono::NaiveDate::from_ymd_opt(
        i32::from(t.year()),
        u32::from(t.month()),
        u32::from(t.day()),
    )?
    .and_hms_opt(
        u32::from(t.hour()),
        u32::from(t.minute()),
        u32::from(t.second()),
    )?;
    Some(Utc.from_utc_datetime(&naive))
}

fn index(reader: &mut dyn ReadSeek) -> Result<Index, LoaderError> {
    let mut archive = ZipArchive::new(reader).map_err(zip_error)?;
    let mut entries = Vec::with_capacity(archive.len());
    let mut dirs = Vec::new();

    for i in 0..archive.len() {
        let (name, is_dir, encrypted, method, size, compressed, offset, modified) = {
            let file = archive.by_index_raw(i).map_err(zip_error)?;
            (
                file.name().to_string(),
                file.is_dir(),
                file.encrypted(),
                file.compression(),
                file.size(),
                file.compressed_size(),
                file.data_start(),
                file.last_modified().and_then(zip_time),
            )
        };

        if is_dir {
            dirs.push(name);
            continue;
        }
        if encrypted {
            debug!("Skipping encrypted zip entry {}", name);
            continue;
        }

        let data = match method {
            CompressionMethod::Stored => EntryData::Stored { offset },
            CompressionMethod::Deflated => EntryData::Deflate { offset, compressed },
            other => {
                debug!("Decompressing {} ({:?}) while indexing", name, other);
                let mut file = archive.by_index(i).map_err(zip_error)?;
                let mut buf = Vec::with_capacity(usize::try_from(size).unwrap_or(0));
                file.read_to_end(&mut buf).map_err(|e| {
                    if is_truncation(&e) {
                        LoaderError::Format(e.to_string())
                    } else {
                        LoaderError::Io(e)
                    }
                })?;
                EntryData::Inline(buf.into())
            }
        };
        entries.push(ArchiveEntry {
            path: name,
            size,
            modified,
            data,
        });
    }
    Ok((entries, dirs))
}

fn build(source: ByteSource, info: &PackageLoadInfo) -> LoadResult {
    let (entries, dirs) = source.with_reader(index)??;
    debug!("Indexed {} zip entries in {}", entries.len(), info.path);
    Ok(Arc::new(ArchiveProvider::new(
        info.path.clone(),
        source,
        entries,
        dirs,
    )))
}

impl PackageLoader for ZipLoader {
    fn name(&self) -> &str {
        "zip"
    }

    /// NuGet packages are zip containers
    fn extension_pattern(&self) -> &str {
        r"\.zip|\.nupkg"
    }

    fn capabilities(&self) -> LoaderCapabilities {
        LoaderCapabilities {
            open_file: true,
            load_file: true,
            use_stream: true,
            load_from_stream: false,
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

    fn use_bytes(&self, bytes: Arc<[u8]>, info: &PackageLoadInfo) -> LoadResult {
        build(ByteSource::bytes(bytes), info)
    }
}
