//! Backing bytes of an opened archive

use crate::provider::{ContentStream, ReadSeek};
use std::fmt;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Where an archive's bytes come from.
///
/// `File` and `Bytes` hand each reader its own cursor. `Shared` wraps a
/// single parent stream, so every read takes the mutex and re-seeks.
#[derive(Clone)]
pub enum ByteSource {
    File(Arc<PathBuf>),
    Bytes(Arc<[u8]>),
    Shared(Arc<Mutex<ContentStream>>),
}

impl ByteSource {
    pub fn file(path: &Path) -> Self {
        Self::File(Arc::new(path.to_path_buf()))
    }

    pub fn bytes(bytes: Arc<[u8]>) -> Self {
        Self::Bytes(bytes)
    }

    pub fn shared(stream: ContentStream) -> Self {
        Self::Shared(Arc::new(Mutex::new(stream)))
    }

    /// Whether readers are serialized on one cursor
    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Shared(_))
    }

    /// Run `f` with a reader positioned at the start of the source
    pub fn with_reader<T>(&self, f: impl FnOnce(&mut dyn ReadSeek) -> T) -> io::Result<T> {
        match self {
            Self::File(path) => {
                let mut file = File::open(path.as_path())?;
                Ok(f(&mut file))
            }
            Self::Bytes(bytes) => {
                let mut cursor = Cursor::new(bytes.clone());
                Ok(f(&mut cursor))
            }
            Self::Shared(stream) => {
                let mut guard = stream.lock().map_err(|_| poisoned())?;
                guard.seek(SeekFrom::Start(0))?;
                Ok(f(&mut *guard))
            }
        }
    }

    /// Total length in bytes
    pub fn len(&self) -> io::Result<u64> {
        match self {
            Self::File(path) => Ok(std::fs::metadata(path.as_path())?.len()),
            Self::Bytes(bytes) => Ok(bytes.len() as u64),
            Self::Shared(stream) => {
                let mut guard = stream.lock().map_err(|_| poisoned())?;
                guard.seek(SeekFrom::End(0))
            }
        }
    }

    /// A seekable reader over `len` bytes starting at `offset`
    pub fn slice(&self, offset: u64, len: u64) -> io::Result<Box<dyn ReadSeek>> {
        Ok(match self {
            Self::File(path) => Box::new(Window::new(File::open(path.as_path())?, offset, len)?),
            Self::Bytes(bytes) => Box::new(Window::new(Cursor::new(bytes.clone()), offset, len)?),
            Self::Shared(stream) => Box::new(SharedWindow {
                stream: stream.clone(),
                start: offset,
                len,
                pos: 0,
            }),
        })
    }
}

impl fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::Shared(_) => f.write_str("Shared"),
        }
    }
}

fn poisoned() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "shared package stream lock poisoned")
}

fn seek_target(pos: SeekFrom, current: u64, len: u64) -> io::Result<u64> {
    let target = match pos {
        SeekFrom::Start(n) => i128::from(n),
        SeekFrom::End(d) => i128::from(len) + i128::from(d),
        SeekFrom::Current(d) => i128::from(current) + i128::from(d),
    };
    u64::try_from(target).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "seek before start of entry")
    })
}

/// Bounded view over an owned reader
struct Window<R> {
    inner: R,
    start: u64,
    len: u64,
    pos: u64,
}

impl<R: Read + Seek> Window<R> {
    fn new(mut inner: R, start: u64, len: u64) -> io::Result<Self> {
        inner.seek(SeekFrom::Start(start))?;
        Ok(Self {
            inner,
            start,
            len,
            pos: 0,
        })
    }
}

impl<R: Read + Seek> Read for Window<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len.saturating_sub(self.pos);
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = remaining.min(buf.len() as u64) as usize;
        let n = self.inner.read(&mut buf[..max])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for Window<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = seek_target(pos, self.pos, self.len)?;
        self.inner.seek(SeekFrom::Start(self.start + target))?;
        self.pos = target;
        Ok(target)
    }
}

/// Bounded view over a shared, mutex-guarded stream
struct SharedWindow {
    stream: Arc<Mutex<ContentStream>>,
    start: u64,
    len: u64,
    pos: u64,
}

impl Read for SharedWindow {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len.saturating_sub(self.pos);
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = remaining.min(buf.len() as u64) as usize;
        let mut stream = self.stream.lock().map_err(|_| poisoned())?;
        stream.seek(SeekFrom::Start(self.start + self.pos))?;
        let n = stream.read(&mut buf[..max])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for SharedWindow {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = seek_target(pos, self.pos, self.len)?;
        Ok(self.pos)
    }
}
