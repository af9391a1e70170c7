//! Bucket trees and the patch (indirect) storage.
//!
//! ## On-disk bucket tree (`BKTR`)
//! ```text
//! 0x0000  L1 node    index i32 | count i32 | end_offset i64 | count × start_offset i64
//! 0x4000  bucket 0   index i32 | count i32 | end_offset i64 | count × entry
//! 0x8000  bucket 1   ...
//! ```
//! Every node is 0x4000 bytes. When the bucket start offsets do not fit in a
//! single L1 node the tree has an extra L2 level, which is not supported.
//!
//! A relocation tree maps the patched logical storage onto `base` (index 0)
//! and `patch` (index 1). A subsection tree assigns each range of the patch
//! data a counter generation for AES-CTR-Ex.

use std::sync::Arc;

use super::Storage;
use crate::utils::{le_u32_at, le_u64_at};
use crate::{Error, Result};

/// Size of every bucket tree node.
pub const NODE_SIZE: usize = 0x4000;
const NODE_HEADER_SIZE: usize = 0x10;

/// A fixed-size bucket tree entry keyed by its virtual offset.
pub trait BucketEntry: Sized {
    /// Encoded size in bytes.
    const SIZE: usize;
    fn parse(buf: &[u8]) -> Result<Self>;
    fn virtual_offset(&self) -> u64;
}

/// `{virtual offset, physical offset, storage index}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocationEntry {
    pub virtual_offset: u64,
    pub physical_offset: u64,
    pub storage_index: u32,
}

impl BucketEntry for RelocationEntry {
    const SIZE: usize = 0x14;

    fn parse(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            virtual_offset: le_u64_at(buf, 0x0)?,
            physical_offset: le_u64_at(buf, 0x8)?,
            storage_index: le_u32_at(buf, 0x10)?,
        })
    }

    fn virtual_offset(&self) -> u64 {
        self.virtual_offset
    }
}

/// `{offset, reserved, generation}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubsectionEntry {
    pub offset: u64,
    pub generation: u32,
}

impl BucketEntry for SubsectionEntry {
    const SIZE: usize = 0x10;

    fn parse(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            offset: le_u64_at(buf, 0x0)?,
            generation: le_u32_at(buf, 0xC)?,
        })
    }

    fn virtual_offset(&self) -> u64 {
        self.offset
    }
}

#[derive(Debug, Clone)]
struct Bucket<E> {
    start: u64,
    end: u64,
    entries: Vec<E>,
}

/// A parsed two-level bucket tree.
#[derive(Debug, Clone)]
pub struct BucketTree<E> {
    buckets: Vec<Bucket<E>>,
    end_offset: u64,
}

struct NodeHeader {
    count: usize,
    end_offset: u64,
}

fn node_header(buf: &[u8], at: usize) -> Result<NodeHeader> {
    let count = le_u32_at(buf, at + 4)? as i32;
    let end_offset = le_u64_at(buf, at + 8)? as i64;
    if count < 0 || end_offset < 0 {
        return Err(Error::format("negative bucket tree node field"));
    }
    Ok(NodeHeader {
        count: count as usize,
        end_offset: end_offset as u64,
    })
}

impl<E: BucketEntry> BucketTree<E> {
    /// Parse the tree stored in `table`, which must hold `entry_count`
    /// entries (taken from the `BKTR` header).
    pub fn parse(table: &[u8], entry_count: u32) -> Result<Self> {
        let entry_count = entry_count as usize;
        let per_bucket = (NODE_SIZE - NODE_HEADER_SIZE) / E::SIZE;
        let per_l1 = (NODE_SIZE - NODE_HEADER_SIZE) / 8;
        let bucket_count = entry_count.div_ceil(per_bucket);
        if bucket_count > per_l1 {
            return Err(Error::UnsupportedLayout(format!(
                "bucket tree with {entry_count} entries needs an L2 level"
            )));
        }
        if entry_count == 0 {
            return Ok(Self {
                buckets: Vec::new(),
                end_offset: 0,
            });
        }

        let l1 = node_header(table, 0)?;
        if l1.count != bucket_count {
            return Err(Error::format(format!(
                "bucket tree L1 node lists {} buckets, expected {bucket_count}",
                l1.count
            )));
        }

        let mut buckets = Vec::with_capacity(bucket_count);
        let mut total = 0;
        for i in 0..bucket_count {
            let start = le_u64_at(table, NODE_HEADER_SIZE + i * 8)?;
            let base = NODE_SIZE * (i + 1);
            let header = node_header(table, base)?;
            if header.count > per_bucket {
                return Err(Error::format("bucket holds more entries than fit in a node"));
            }
            let entries = (0..header.count)
                .map(|j| {
                    let at = base + NODE_HEADER_SIZE + j * E::SIZE;
                    let raw = table.get(at..at + E::SIZE).ok_or(Error::UnexpectedEof)?;
                    E::parse(raw)
                })
                .collect::<Result<Vec<_>>>()?;
            total += entries.len();
            buckets.push(Bucket {
                start,
                end: header.end_offset,
                entries,
            });
        }
        if total != entry_count {
            return Err(Error::format(format!(
                "bucket tree holds {total} entries, header says {entry_count}"
            )));
        }

        let tree = Self {
            buckets,
            end_offset: l1.end_offset,
        };
        tree.check_layout()?;
        Ok(tree)
    }

    /// Build a single-bucket tree from sorted entries.
    pub fn from_entries(entries: Vec<E>, end_offset: u64) -> Result<Self> {
        let buckets = match entries.first() {
            Some(first) => vec![Bucket {
                start: first.virtual_offset(),
                end: end_offset,
                entries,
            }],
            None => Vec::new(),
        };
        let tree = Self { buckets, end_offset };
        tree.check_layout()?;
        Ok(tree)
    }

    // Buckets cover disjoint, increasing ranges ending at or before the next
    // bucket's start (the tree end for the last one), and every entry lies
    // inside its bucket.
    fn check_layout(&self) -> Result<()> {
        let mut prev: Option<u64> = None;
        for (i, bucket) in self.buckets.iter().enumerate() {
            let limit = self.buckets.get(i + 1).map_or(self.end_offset, |next| next.start);
            if bucket.start >= bucket.end || bucket.end > limit {
                return Err(Error::format(format!(
                    "bucket {i} range {:#x}..{:#x} does not fit before {limit:#x}",
                    bucket.start, bucket.end
                )));
            }
            for e in &bucket.entries {
                let off = e.virtual_offset();
                if off < bucket.start || off >= bucket.end {
                    return Err(Error::format(format!(
                        "bucket tree entry at {off:#x} lies outside bucket {i}"
                    )));
                }
                if prev.is_some_and(|p| p >= off) {
                    return Err(Error::format("bucket tree entries are not strictly increasing"));
                }
                prev = Some(off);
            }
        }
        Ok(())
    }

    /// End of the virtual range covered by the tree.
    pub fn end_offset(&self) -> u64 {
        self.end_offset
    }

    pub fn entries(&self) -> impl Iterator<Item = &E> {
        self.buckets.iter().flat_map(|b| b.entries.iter())
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry covering `offset` and the end of its range.
    pub fn find(&self, offset: u64) -> Option<(&E, u64)> {
        if offset >= self.end_offset {
            return None;
        }
        let b = self.buckets.partition_point(|b| b.start <= offset).checked_sub(1)?;
        let bucket = &self.buckets[b];
        let i = bucket
            .entries
            .partition_point(|e| e.virtual_offset() <= offset)
            .checked_sub(1)?;
        let end = match bucket.entries.get(i + 1) {
            Some(next) => next.virtual_offset(),
            None => bucket.end,
        };
        if end <= offset {
            return None;
        }
        Some((&bucket.entries[i], end))
    }
}

/// Patched logical storage assembled from `base` and `patch`.
#[derive(Debug)]
pub struct IndirectStorage {
    base: Arc<Storage>,
    patch: Arc<Storage>,
    table: Arc<BucketTree<RelocationEntry>>,
}

impl IndirectStorage {
    pub fn new(base: Arc<Storage>, patch: Arc<Storage>, table: Arc<BucketTree<RelocationEntry>>) -> Self {
        Self { base, patch, table }
    }

    pub fn len(&self) -> u64 {
        self.table.end_offset()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn patch(&self) -> &Storage {
        &self.patch
    }

    pub fn base(&self) -> &Storage {
        &self.base
    }

    pub fn table(&self) -> &BucketTree<RelocationEntry> {
        &self.table
    }

    pub(super) fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut pos = offset;
        let mut done = 0;
        while done < buf.len() {
            let (entry, end) = self
                .table
                .find(pos)
                .ok_or_else(|| Error::format(format!("offset {pos:#x} is not covered by the relocation table")))?;
            let source = match entry.storage_index {
                0 => &self.base,
                1 => &self.patch,
                other => return Err(Error::format(format!("relocation entry names storage {other}"))),
            };
            if end <= pos {
                return Err(Error::format(format!("relocation entry ends at {end:#x}, before {pos:#x}")));
            }
            let n = (end - pos).min((buf.len() - done) as u64) as usize;
            let physical = entry
                .physical_offset
                .checked_add(pos - entry.virtual_offset)
                .ok_or_else(|| Error::format("relocated offset overflows"))?;
            source.read(physical, &mut buf[done..done + n])?;
            done += n;
            pos += n as u64;
        }
        Ok(())
    }
}

impl Storage {
    /// Relocate reads between `base` and `patch` through `table`.
    pub fn indirect(base: Arc<Storage>, patch: Arc<Storage>, table: Arc<BucketTree<RelocationEntry>>) -> Arc<Self> {
        Arc::new(Storage::Indirect(IndirectStorage::new(base, patch, table)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reloc(virtual_offset: u64, physical_offset: u64, storage_index: u32) -> RelocationEntry {
        RelocationEntry {
            virtual_offset,
            physical_offset,
            storage_index,
        }
    }

    #[test]
    fn reads_split_between_base_and_patch() {
        let base = Storage::memory(vec![0xAA; 200]);
        let patch = Storage::memory(vec![0xBB; 200]);
        let table = BucketTree::from_entries(vec![reloc(0, 0, 0), reloc(100, 0, 1)], 200).unwrap();
        let s = Storage::indirect(base, patch, Arc::new(table));

        let got = s.read_vec(50, 100).unwrap();
        assert_eq!(&got[..50], &[0xAA; 50]);
        assert_eq!(&got[50..], &[0xBB; 50]);
        assert!(s.read_vec(150, 51).is_err());
        assert_eq!(s.layers(), vec!["Indirect", "Memory"]);
    }

    #[test]
    fn physical_offsets_are_applied() {
        let base = Storage::memory((0..100u8).collect::<Vec<_>>());
        let patch = Storage::memory((100..200u8).collect::<Vec<_>>());
        let table = BucketTree::from_entries(
            vec![reloc(0, 10, 0), reloc(4, 20, 1), reloc(8, 0, 0)],
            12,
        )
        .unwrap();
        let s = Storage::indirect(base, patch, Arc::new(table));
        assert_eq!(s.read_vec(2, 8).unwrap(), [12, 13, 120, 121, 122, 123, 0, 1]);
    }

    fn encode_tree(entries: &[[u8; 0x14]], starts: &[u64], end: u64, per_bucket: usize) -> Vec<u8> {
        let buckets: Vec<_> = entries.chunks(per_bucket).collect();
        let mut table = vec![0u8; NODE_SIZE * (buckets.len() + 1)];
        table[4..8].copy_from_slice(&(buckets.len() as u32).to_le_bytes());
        table[8..16].copy_from_slice(&end.to_le_bytes());
        for (i, bucket) in buckets.iter().enumerate() {
            table[0x10 + i * 8..0x18 + i * 8].copy_from_slice(&starts[i].to_le_bytes());
            let base = NODE_SIZE * (i + 1);
            table[base..base + 4].copy_from_slice(&(i as u32).to_le_bytes());
            table[base + 4..base + 8].copy_from_slice(&(bucket.len() as u32).to_le_bytes());
            let bucket_end = starts.get(i + 1).copied().unwrap_or(end);
            table[base + 8..base + 16].copy_from_slice(&bucket_end.to_le_bytes());
            for (j, e) in bucket.iter().enumerate() {
                let at = base + 0x10 + j * 0x14;
                table[at..at + 0x14].copy_from_slice(e);
            }
        }
        table
    }

    fn raw_reloc(v: u64, p: u64, idx: u32) -> [u8; 0x14] {
        let mut out = [0u8; 0x14];
        out[..8].copy_from_slice(&v.to_le_bytes());
        out[8..16].copy_from_slice(&p.to_le_bytes());
        out[16..].copy_from_slice(&idx.to_le_bytes());
        out
    }

    #[test]
    fn parses_multi_bucket_tree() {
        let per_bucket = (NODE_SIZE - 0x10) / 0x14;
        let n = per_bucket + 3;
        let entries: Vec<_> = (0..n as u64).map(|i| raw_reloc(i * 0x100, i, (i % 2) as u32)).collect();
        let starts = [0, per_bucket as u64 * 0x100];
        let end = n as u64 * 0x100;
        let table = encode_tree(&entries, &starts, end, per_bucket);

        let tree = BucketTree::<RelocationEntry>::parse(&table, n as u32).unwrap();
        assert_eq!(tree.len(), n);
        assert_eq!(tree.end_offset(), end);

        let (e, e_end) = tree.find(per_bucket as u64 * 0x100 - 1).unwrap();
        assert_eq!(e.physical_offset, per_bucket as u64 - 1);
        assert_eq!(e_end, per_bucket as u64 * 0x100);

        let (e, e_end) = tree.find(end - 1).unwrap();
        assert_eq!(e.virtual_offset, (n as u64 - 1) * 0x100);
        assert_eq!(e_end, end);
        assert!(tree.find(end).is_none());

        assert!(BucketTree::<RelocationEntry>::parse(&table, n as u32 - 1).is_err());
    }

    #[test]
    fn trees_needing_l2_are_unsupported() {
        let per_bucket = (NODE_SIZE - 0x10) / 0x10;
        let per_l1 = (NODE_SIZE - 0x10) / 8;
        let count = (per_bucket * (per_l1 + 1)) as u32;
        assert!(matches!(
            BucketTree::<SubsectionEntry>::parse(&[], count),
            Err(Error::UnsupportedLayout(_))
        ));
    }

    fn single_bucket(entries: &[[u8; 0x14]], end: u64, bucket_end: u64) -> Vec<u8> {
        let mut table = encode_tree(entries, &[0], end, entries.len());
        table[NODE_SIZE + 8..NODE_SIZE + 16].copy_from_slice(&bucket_end.to_le_bytes());
        table
    }

    #[test]
    fn short_bucket_end_fails_reads_past_it() {
        let table = single_bucket(&[raw_reloc(0, 0, 1)], 0x100, 0x10);
        let tree = BucketTree::<RelocationEntry>::parse(&table, 1).unwrap();
        assert!(tree.find(0x20).is_none());

        let s = Storage::indirect(
            Storage::memory(vec![0xAA; 0x100]),
            Storage::memory(vec![0xBB; 0x100]),
            Arc::new(tree),
        );
        assert_eq!(s.read_vec(0x8, 0x8).unwrap(), [0xBB; 8]);
        assert!(matches!(s.read_vec(0x20, 4), Err(Error::InvalidFormat(_))));
        assert!(matches!(s.read_vec(0x8, 0x10), Err(Error::InvalidFormat(_))));
    }

    #[test]
    fn bucket_ranges_must_hold_their_entries() {
        // Bucket ends at its only entry.
        let table = single_bucket(&[raw_reloc(0x40, 0, 1)], 0x100, 0x40);
        assert!(matches!(
            BucketTree::<RelocationEntry>::parse(&table, 1),
            Err(Error::InvalidFormat(_))
        ));
        // Bucket runs past the tree end.
        let table = single_bucket(&[raw_reloc(0, 0, 1)], 0x100, 0x200);
        assert!(BucketTree::<RelocationEntry>::parse(&table, 1).is_err());
        // Entry before the bucket start.
        let mut table = single_bucket(&[raw_reloc(0, 0, 1)], 0x100, 0x100);
        table[0x10..0x18].copy_from_slice(&8u64.to_le_bytes());
        assert!(BucketTree::<RelocationEntry>::parse(&table, 1).is_err());
    }

    #[test]
    fn bucket_starts_must_increase() {
        let per_bucket = (NODE_SIZE - 0x10) / 0x14;
        let n = per_bucket + 1;
        let entries: Vec<_> = (0..n as u64).map(|i| raw_reloc(i * 0x10, 0, 1)).collect();
        let end = n as u64 * 0x10;
        let table = encode_tree(&entries, &[0, 0], end, per_bucket);
        assert!(BucketTree::<RelocationEntry>::parse(&table, n as u32).is_err());
    }

    #[test]
    fn unsorted_entries_are_rejected() {
        let entries = vec![
            SubsectionEntry { offset: 0x100, generation: 1 },
            SubsectionEntry { offset: 0x100, generation: 2 },
        ];
        assert!(BucketTree::from_entries(entries, 0x200).is_err());
    }
}
