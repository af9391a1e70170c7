//! Composable read-only byte ranges.
//!
//! A section is exposed as a tree of [`Storage`] nodes built once at open
//! time, for example
//!
//! ```text
//! Verified ─ data ─> Cache ─> Decrypt(Ctr) ─> Slice ─> Stream(file)
//!          └ hashes ─> Verified ─> ...
//! ```
//!
//! Children are shared through [`Arc`], so a slice never owns its parent's
//! bytes and the same decrypted section can feed several views. Every node
//! reports its length; a read ending exactly at the length succeeds, a read
//! running past it fails with [`Error::OutOfRange`].
//!
//! | Node | Module |
//! |------|--------|
//! | `Memory`, `Stream`, `Slice` | here |
//! | `Cache` | [`cache`] |
//! | `Concat` | [`concat`] |
//! | `Decrypt` | [`transform`] |
//! | `Indirect` | [`indirect`] |
//! | `Verified` | [`crate::integrity`] |

pub mod cache;
pub mod concat;
pub mod indirect;
pub mod transform;

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex, PoisonError};

use crate::integrity::IntegrityStorage;
use crate::{Error, Result};

pub use cache::CacheStorage;
pub use concat::ConcatStorage;
pub use indirect::IndirectStorage;
pub use transform::{DecryptStorage, Transform};

/// Any seekable byte source that can move between threads.
pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

/// A reader-backed leaf. Reads seek and read under the mutex.
pub struct StreamStorage {
    inner: Mutex<Box<dyn ReadSeek>>,
    len: u64,
}

/// A window onto a parent storage.
#[derive(Debug)]
pub struct SliceStorage {
    parent: Arc<Storage>,
    offset: u64,
    len: u64,
}

/// A node in a storage tree.
pub enum Storage {
    Memory(Arc<[u8]>),
    Stream(StreamStorage),
    Slice(SliceStorage),
    Cache(CacheStorage),
    Decrypt(DecryptStorage),
    Concat(ConcatStorage),
    Indirect(IndirectStorage),
    Verified(IntegrityStorage),
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:#x})", self.kind(), self.len())
    }
}

impl std::fmt::Debug for StreamStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamStorage").field("len", &self.len).finish()
    }
}

impl Storage {
    /// Owned bytes.
    pub fn memory(data: impl Into<Arc<[u8]>>) -> Arc<Self> {
        Arc::new(Storage::Memory(data.into()))
    }

    /// Wrap a reader. Its length is taken by seeking to the end.
    pub fn from_reader<R: Read + Seek + Send + 'static>(mut reader: R) -> Result<Arc<Self>> {
        let len = reader.seek(SeekFrom::End(0))?;
        Ok(Arc::new(Storage::Stream(StreamStorage {
            inner: Mutex::new(Box::new(reader)),
            len,
        })))
    }

    /// Window `[offset, offset + len)` of `parent`.
    pub fn slice(parent: &Arc<Storage>, offset: u64, len: u64) -> Result<Arc<Self>> {
        check_range(offset, len, parent.len())?;
        // Collapse slices of slices.
        if let Storage::Slice(s) = parent.as_ref() {
            return Ok(Arc::new(Storage::Slice(SliceStorage {
                parent: Arc::clone(&s.parent),
                offset: s.offset + offset,
                len,
            })));
        }
        Ok(Arc::new(Storage::Slice(SliceStorage {
            parent: Arc::clone(parent),
            offset,
            len,
        })))
    }

    /// LRU block cache in front of `inner`.
    pub fn cached(inner: Arc<Storage>, block_size: u64, capacity: usize) -> Arc<Self> {
        Arc::new(Storage::Cache(CacheStorage::new(inner, block_size, capacity)))
    }

    /// Per-read decryption of `inner`.
    pub fn decrypt(inner: Arc<Storage>, transform: Transform) -> Arc<Self> {
        Arc::new(Storage::Decrypt(DecryptStorage::new(inner, transform)))
    }

    /// Several storages read back to back.
    pub fn concat(segments: Vec<Arc<Storage>>) -> Arc<Self> {
        Arc::new(Storage::Concat(ConcatStorage::new(segments)))
    }

    /// Total addressable length in bytes.
    pub fn len(&self) -> u64 {
        match self {
            Storage::Memory(m) => m.len() as u64,
            Storage::Stream(s) => s.len,
            Storage::Slice(s) => s.len,
            Storage::Cache(c) => c.len(),
            Storage::Decrypt(d) => d.len(),
            Storage::Concat(c) => c.len(),
            Storage::Indirect(i) => i.len(),
            Storage::Verified(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill `buf` with the bytes at `offset`.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len() as u64, self.len())?;
        if buf.is_empty() {
            return Ok(());
        }
        match self {
            Storage::Memory(m) => {
                let start = offset as usize;
                buf.copy_from_slice(&m[start..start + buf.len()]);
                Ok(())
            }
            Storage::Stream(s) => {
                let mut inner = s.inner.lock().unwrap_or_else(PoisonError::into_inner);
                inner.seek(SeekFrom::Start(offset))?;
                inner.read_exact(buf)?;
                Ok(())
            }
            Storage::Slice(s) => s.parent.read(s.offset + offset, buf),
            Storage::Cache(c) => c.read(offset, buf),
            Storage::Decrypt(d) => d.read(offset, buf),
            Storage::Concat(c) => c.read(offset, buf),
            Storage::Indirect(i) => i.read(offset, buf),
            Storage::Verified(v) => v.read(offset, buf),
        }
    }

    /// Read `len` bytes at `offset` into a new buffer.
    pub fn read_vec(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        check_range(offset, len as u64, self.len())?;
        let mut buf = vec![0u8; len];
        self.read(offset, &mut buf)?;
        Ok(buf)
    }

    /// Read the whole storage.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let len = usize::try_from(self.len()).map_err(|_| Error::format("storage too large to buffer"))?;
        self.read_vec(0, len)
    }

    /// Name of this node's variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Storage::Memory(_) => "Memory",
            Storage::Stream(_) => "Stream",
            Storage::Slice(_) => "Slice",
            Storage::Cache(_) => "Cache",
            Storage::Decrypt(_) => "Decrypt",
            Storage::Concat(_) => "Concat",
            Storage::Indirect(_) => "Indirect",
            Storage::Verified(_) => "Verified",
        }
    }

    /// Node kinds from this node down its primary child chain (data side of
    /// verified nodes, patch side of indirect nodes, first concat segment).
    pub fn layers(&self) -> Vec<&'static str> {
        let mut out = vec![self.kind()];
        let mut node = self.primary_child();
        while let Some(n) = node {
            out.push(n.kind());
            node = n.primary_child();
        }
        out
    }

    fn primary_child(&self) -> Option<&Storage> {
        match self {
            Storage::Memory(_) | Storage::Stream(_) => None,
            Storage::Slice(s) => Some(s.parent.as_ref()),
            Storage::Cache(c) => Some(c.inner()),
            Storage::Decrypt(d) => Some(d.inner()),
            Storage::Concat(c) => c.segments().first().map(|s| s.as_ref()),
            Storage::Indirect(i) => Some(i.patch()),
            Storage::Verified(v) => Some(v.data()),
        }
    }
}

pub(crate) fn check_range(offset: u64, len: u64, size: u64) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(Error::OutOfRange { offset, len, size }),
    }
}

/// `Read + Seek` over a storage, for parsers written against readers.
#[derive(Debug, Clone)]
pub struct StorageReader {
    storage: Arc<Storage>,
    pos: u64,
}

impl StorageReader {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage, pos: 0 }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn into_inner(self) -> Arc<Storage> {
        self.storage
    }
}

impl Read for StorageReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = self.storage.len();
        if self.pos >= len {
            return Ok(0);
        }
        let n = buf.len().min((len - self.pos) as usize);
        self.storage
            .read(self.pos, &mut buf[..n])
            .map_err(|e| match e {
                Error::Io(io) => io,
                other => io::Error::other(other),
            })?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for StorageReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.storage.len() as i128;
        let target = match pos {
            SeekFrom::Start(p) => p as i128,
            SeekFrom::End(d) => len + d as i128,
            SeekFrom::Current(d) => self.pos as i128 + d as i128,
        };
        if target < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "seek before start"));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}
