//! Block-aligned LRU read-through cache.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use super::Storage;
use crate::Result;

/// Default cache block size.
pub const DEFAULT_BLOCK_SIZE: u64 = 0x4000;
/// Default number of cached blocks.
pub const DEFAULT_CAPACITY: usize = 4;

/// Caches whole blocks of `inner`. The most recently used block sits at the
/// front of the table.
pub struct CacheStorage {
    inner: Arc<Storage>,
    block_size: u64,
    capacity: usize,
    blocks: Mutex<VecDeque<(u64, Arc<[u8]>)>>,
}

impl std::fmt::Debug for CacheStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStorage")
            .field("block_size", &self.block_size)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl CacheStorage {
    pub fn new(inner: Arc<Storage>, block_size: u64, capacity: usize) -> Self {
        Self {
            inner,
            block_size: block_size.max(1),
            capacity: capacity.max(1),
            blocks: Mutex::new(VecDeque::new()),
        }
    }

    pub fn len(&self) -> u64 {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn inner(&self) -> &Storage {
        &self.inner
    }

    pub(super) fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut pos = offset;
        let mut done = 0;
        while done < buf.len() {
            let index = pos / self.block_size;
            let block = self.block(index)?;
            let within = (pos - index * self.block_size) as usize;
            let n = (block.len() - within).min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&block[within..within + n]);
            done += n;
            pos += n as u64;
        }
        Ok(())
    }

    fn block(&self, index: u64) -> Result<Arc<[u8]>> {
        {
            let mut blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(pos) = blocks.iter().position(|(i, _)| *i == index) {
                if let Some(entry) = blocks.remove(pos) {
                    let data = Arc::clone(&entry.1);
                    blocks.push_front(entry);
                    return Ok(data);
                }
            }
        }

        // Filled without holding the lock; a racing fill of the same block
        // just replaces an identical copy.
        let start = index * self.block_size;
        let len = self.block_size.min(self.len() - start) as usize;
        let data: Arc<[u8]> = self.inner.read_vec(start, len)?.into();
        tracing::trace!(index, len, "cache fill");

        let mut blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);
        blocks.retain(|(i, _)| *i != index);
        blocks.push_front((index, Arc::clone(&data)));
        blocks.truncate(self.capacity);
        Ok(data)
    }

    /// Indices of cached blocks, most recently used first.
    pub fn cached_blocks(&self) -> Vec<u64> {
        let blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);
        blocks.iter().map(|(i, _)| *i).collect()
    }
}
