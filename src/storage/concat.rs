//! Several storages read as one.

use std::sync::Arc;

use super::Storage;
use crate::Result;

#[derive(Debug)]
pub struct ConcatStorage {
    segments: Vec<Arc<Storage>>,
    /// Start offset of each segment; `starts[i + 1] - starts[i]` is its length.
    starts: Vec<u64>,
    len: u64,
}

impl ConcatStorage {
    pub fn new(segments: Vec<Arc<Storage>>) -> Self {
        let mut starts = Vec::with_capacity(segments.len());
        let mut len = 0u64;
        for s in &segments {
            starts.push(len);
            len += s.len();
        }
        Self { segments, starts, len }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn segments(&self) -> &[Arc<Storage>] {
        &self.segments
    }

    pub(super) fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        // Last segment starting at or before `offset`; empty segments are
        // skipped by the loop below.
        let mut index = self.starts.partition_point(|&s| s <= offset).saturating_sub(1);
        let mut pos = offset;
        let mut done = 0;
        while done < buf.len() {
            let seg = &self.segments[index];
            let within = pos - self.starts[index];
            let available = seg.len().saturating_sub(within);
            if available == 0 {
                index += 1;
                continue;
            }
            let n = (available as usize).min(buf.len() - done);
            seg.read(within, &mut buf[done..done + n])?;
            done += n;
            pos += n as u64;
            index += 1;
        }
        Ok(())
    }
}
