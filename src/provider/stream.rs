//! Readable content handed out by providers

use crate::dispose::{DisposeList, Resource};
use crate::error::NestResult;
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};

/// Object-safe `Read + Seek`
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

enum Reader {
    Seekable(Box<dyn ReadSeek>),
    Sequential(Box<dyn Read + Send>),
}

/// A readable stream plus the holds that keep its source alive.
///
/// Holds are released after the reader is gone, either when the stream is
/// dropped or through [`ContentStream::close`].
pub struct ContentStream {
    // fields drop in declaration order; the reader must go first
    reader: Option<Reader>,
    holds: DisposeList,
    length: Option<u64>,
}

impl ContentStream {
    pub fn seekable(reader: impl Read + Seek + Send + 'static) -> Self {
        Self::from_reader(Reader::Seekable(Box::new(reader)))
    }

    pub fn sequential(reader: impl Read + Send + 'static) -> Self {
        Self::from_reader(Reader::Sequential(Box::new(reader)))
    }

    fn from_reader(reader: Reader) -> Self {
        Self {
            reader: Some(reader),
            holds: DisposeList::new(),
            length: None,
        }
    }

    pub fn with_length(mut self, length: u64) -> Self {
        self.length = Some(length);
        self
    }

    /// Attach a resource released after the reader
    pub fn with_hold(mut self, hold: Resource) -> Self {
        self.holds.push(hold);
        self
    }

    /// Content length, when the source knows it
    pub fn length(&self) -> Option<u64> {
        self.length
    }

    pub fn is_seekable(&self) -> bool {
        matches!(self.reader, Some(Reader::Seekable(_)))
    }

    /// Read the remaining content into memory
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let capacity = self.length.map_or(0, |n| n.min(64 * 1024 * 1024) as usize);
        let mut buf = Vec::with_capacity(capacity);
        self.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Drop the reader, then release every hold, reporting all failures
    pub fn close(mut self) -> NestResult<()> {
        self.reader = None;
        self.holds.dispose_all()
    }
}

impl Read for ContentStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.reader {
            Some(Reader::Seekable(r)) => r.read(buf),
            Some(Reader::Sequential(r)) => r.read(buf),
            None => Ok(0),
        }
    }
}

impl Seek for ContentStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match &mut self.reader {
            Some(Reader::Seekable(r)) => r.seek(pos),
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "stream is not seekable",
            )),
        }
    }
}

impl fmt::Debug for ContentStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentStream")
            .field("seekable", &self.is_seekable())
            .field("length", &self.length)
            .field("holds", &self.holds.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NestError;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn seekable_stream_reads_and_seeks() {
        let mut s = ContentStream::seekable(Cursor::new(b"hello world".to_vec())).with_length(11);
        assert!(s.is_seekable());
        s.seek(SeekFrom::Start(6)).unwrap();
        assert_eq!(s.read_all().unwrap(), b"world");
    }

    #[test]
    fn sequential_stream_refuses_seek() {
        let mut s = ContentStream::sequential(&b"abc"[..]);
        assert!(!s.is_seekable());
        let err = s.seek(SeekFrom::Start(1)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn holds_release_on_drop_and_close() {
        let released = Arc::new(AtomicUsize::new(0));
        let hold = |released: &Arc<AtomicUsize>| {
            let released = released.clone();
            Resource::new(move || {
                released.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };

        let s = ContentStream::sequential(&b""[..]).with_hold(hold(&released));
        s.close().unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);

        let s = ContentStream::sequential(&b""[..]).with_hold(Resource::hold(Arc::new(())));
        drop(s);

        let s = ContentStream::sequential(&b""[..])
            .with_hold(Resource::new(|| Err(NestError::Internal("a".into()))))
            .with_hold(hold(&released))
            .with_hold(Resource::new(|| Err(NestError::Internal("b".into()))));
        assert!(matches!(s.close(), Err(NestError::Dispose(errs)) if errs.len() == 2));
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }
}
