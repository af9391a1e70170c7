//! Hash-tree verified storage.
//!
//! A verified level pairs a data storage with a hash storage holding one
//! SHA-256 per data block (`hash of block i` at `i * 0x20`). Levels chain:
//! the hash storage of level *n* is the verified level *n - 1*, and the hash
//! storage of level 1 is the master hash supplied by the section header.
//!
//! ```text
//! master hash ──> level 1 ──> level 2 ──> ... ──> data
//!  (memory)      (Verified)  (Verified)          (Verified)
//! ```
//!
//! Two layouts are in use:
//!
//! * **Sha256** (PartitionFS): a hash table checked as a single block against
//!   the master hash, then the data. The last data block is hashed as-is.
//! * **IVFC** (RomFS): up to six levels, every block hashed after zero
//!   padding to the full block size.
//!
//! Validity is tracked per block and never moves from `Invalid` back to
//! `Valid`. The [`IntegrityCheckLevel`] only decides what a read does with an
//! invalid block.

use std::sync::{Arc, Mutex, PoisonError};

use crate::crypto::sha256;
use crate::storage::Storage;
use crate::utils::is_zero;
use crate::{Error, Result};

const HASH_SIZE: u64 = 0x20;

/// Outcome of a signature or hash check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Validity {
    #[default]
    Unchecked,
    Valid,
    Invalid,
    /// The key needed to perform the check is unknown.
    MissingKey,
}

impl Validity {
    /// Combine two results. `Invalid` dominates, then `MissingKey`, then
    /// `Unchecked`.
    pub fn merge(self, other: Validity) -> Validity {
        use Validity::*;
        match (self, other) {
            (Invalid, _) | (_, Invalid) => Invalid,
            (MissingKey, _) | (_, MissingKey) => MissingKey,
            (Unchecked, _) | (_, Unchecked) => Unchecked,
            (Valid, Valid) => Valid,
        }
    }

    fn record(self, new: Validity) -> Validity {
        if self == Validity::Invalid { self } else { new }
    }
}

/// What a read does when it hits a block that fails verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntegrityCheckLevel {
    /// Do not hash anything.
    None,
    /// Log a warning and return the bytes.
    WarnOnInvalid,
    /// Fail the read with [`Error::IntegrityViolation`].
    #[default]
    ErrorOnInvalid,
    /// Return the bytes silently. Validity is still recorded.
    IgnoreOnInvalid,
}

/// One level of a hash tree.
pub struct IntegrityStorage {
    data: Arc<Storage>,
    hashes: Arc<Storage>,
    block_size: u64,
    level: usize,
    policy: IntegrityCheckLevel,
    pad_partial: bool,
    /// Grown on demand up to the highest block checked so far.
    blocks: Mutex<Vec<Validity>>,
}

impl IntegrityStorage {
    pub fn new(
        data: Arc<Storage>,
        hashes: Arc<Storage>,
        block_size: u64,
        level: usize,
        policy: IntegrityCheckLevel,
        pad_partial: bool,
    ) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::format("hash block size is zero"));
        }
        let count = data.len().div_ceil(block_size);
        if count.checked_mul(HASH_SIZE).is_none_or(|need| need > hashes.len()) {
            return Err(Error::format(format!(
                "hash level {level} has {:#x} bytes of hashes for {count} blocks",
                hashes.len()
            )));
        }
        Ok(Self {
            data,
            hashes,
            block_size,
            level,
            policy,
            pad_partial,
            blocks: Mutex::new(Vec::new()),
        })
    }

    pub fn len(&self) -> u64 {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data(&self) -> &Storage {
        &self.data
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.len().div_ceil(self.block_size)
    }

    /// Recorded validity of one block.
    pub fn block_validity(&self, block: u64) -> Validity {
        let blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);
        blocks.get(block as usize).copied().unwrap_or_default()
    }

    /// Aggregate of every block's recorded validity.
    pub fn validity(&self) -> Validity {
        let blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);
        let seen = blocks.iter().fold(Validity::Valid, |acc, v| acc.merge(*v));
        if (blocks.len() as u64) < self.block_count() {
            seen.merge(Validity::Unchecked)
        } else {
            seen
        }
    }

    pub(crate) fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if self.policy == IntegrityCheckLevel::None {
            return self.data.read(offset, buf);
        }
        let mut pos = offset;
        let mut done = 0;
        while done < buf.len() {
            let block = pos / self.block_size;
            let (data, validity) = self.check_block(block)?;
            self.apply_policy(block, validity)?;
            let within = (pos - block * self.block_size) as usize;
            let n = (data.len() - within).min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&data[within..within + n]);
            done += n;
            pos += n as u64;
        }
        Ok(())
    }

    /// Hash every block. Returns the aggregate validity without applying the
    /// read policy.
    pub fn validate(&self) -> Result<Validity> {
        let mut result = Validity::Valid;
        for block in 0..self.block_count() {
            result = result.merge(self.check_block(block)?.1);
        }
        Ok(result)
    }

    fn check_block(&self, block: u64) -> Result<(Vec<u8>, Validity)> {
        let start = block * self.block_size;
        let len = self.block_size.min(self.len() - start) as usize;
        let data = self.data.read_vec(start, len)?;

        let recorded = self.block_validity(block);
        if recorded != Validity::Unchecked {
            return Ok((data, recorded));
        }

        let mut expected = [0u8; HASH_SIZE as usize];
        self.hashes.read(block * HASH_SIZE, &mut expected)?;

        let validity = if is_zero(&expected) && is_zero(&data) {
            Validity::Valid
        } else {
            let actual = if self.pad_partial && data.len() < self.block_size as usize {
                let mut padded = data.clone();
                padded.resize(self.block_size as usize, 0);
                sha256(&padded)
            } else {
                sha256(&data)
            };
            if actual == expected { Validity::Valid } else { Validity::Invalid }
        };

        let mut blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);
        let index = block as usize;
        if blocks.len() <= index {
            blocks.resize(index + 1, Validity::Unchecked);
        }
        let slot = &mut blocks[index];
        *slot = slot.record(validity);
        Ok((data, *slot))
    }

    fn apply_policy(&self, block: u64, validity: Validity) -> Result<()> {
        if validity != Validity::Invalid {
            return Ok(());
        }
        match self.policy {
            IntegrityCheckLevel::ErrorOnInvalid => Err(Error::IntegrityViolation {
                level: self.level,
                block,
            }),
            IntegrityCheckLevel::WarnOnInvalid => {
                tracing::warn!(level = self.level, block, "hash mismatch");
                Ok(())
            }
            IntegrityCheckLevel::None | IntegrityCheckLevel::IgnoreOnInvalid => Ok(()),
        }
    }
}

impl Storage {
    /// Verify `data` block by block against the hashes in `hashes`.
    pub fn verified(
        data: Arc<Storage>,
        hashes: Arc<Storage>,
        block_size: u64,
        level: usize,
        policy: IntegrityCheckLevel,
        pad_partial: bool,
    ) -> Result<Arc<Self>> {
        Ok(Arc::new(Storage::Verified(IntegrityStorage::new(
            data,
            hashes,
            block_size,
            level,
            policy,
            pad_partial,
        )?)))
    }
}

/// Placement of one hash-tree level inside a section, in section bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashLevel {
    pub offset: u64,
    pub size: u64,
    pub block_size: u64,
}

/// A chain of verified levels over one section.
#[derive(Debug)]
pub struct IntegrityTree {
    levels: Vec<Arc<Storage>>,
}

impl IntegrityTree {
    /// Build the chain over `section`. `levels` run from the level checked
    /// by `master_hash` down to the data. The first level is validated
    /// immediately.
    pub fn new(
        section: &Arc<Storage>,
        master_hash: &[u8],
        levels: &[HashLevel],
        pad_partial: bool,
        policy: IntegrityCheckLevel,
    ) -> Result<Self> {
        if levels.is_empty() {
            return Err(Error::format("hash tree without levels"));
        }
        let mut hashes = Storage::memory(master_hash.to_vec());
        let mut built = Vec::with_capacity(levels.len());
        for (i, level) in levels.iter().enumerate() {
            let data = Storage::slice(section, level.offset, level.size)?;
            let node = Storage::verified(data, hashes, level.block_size, i + 1, policy, pad_partial)?;
            built.push(Arc::clone(&node));
            hashes = node;
        }
        let tree = Self { levels: built };

        if policy != IntegrityCheckLevel::None {
            let top = tree.level(0)?;
            let validity = top.validate()?;
            if validity == Validity::Invalid {
                let block = (0..top.block_count())
                    .find(|&b| top.block_validity(b) == Validity::Invalid)
                    .unwrap_or(0);
                top.apply_policy(block, validity)?;
            }
        }
        Ok(tree)
    }

    /// Two-level PartitionFS layout: the hash table is one block under the
    /// master hash, the data is hashed per `block_size` without padding.
    pub fn sha256(
        section: &Arc<Storage>,
        master_hash: &[u8; 0x20],
        hash_table: (u64, u64),
        data: (u64, u64),
        block_size: u64,
        policy: IntegrityCheckLevel,
    ) -> Result<Self> {
        let levels = [
            HashLevel {
                offset: hash_table.0,
                size: hash_table.1,
                block_size: hash_table.1.max(1),
            },
            HashLevel {
                offset: data.0,
                size: data.1,
                block_size,
            },
        ];
        Self::new(section, master_hash, &levels, false, policy)
    }

    /// IVFC layout: every level zero-padded to its block size.
    pub fn ivfc(
        section: &Arc<Storage>,
        master_hash: &[u8],
        levels: &[HashLevel],
        policy: IntegrityCheckLevel,
    ) -> Result<Self> {
        Self::new(section, master_hash, levels, true, policy)
    }

    fn level(&self, i: usize) -> Result<&IntegrityStorage> {
        match self.levels.get(i).map(|s| s.as_ref()) {
            Some(Storage::Verified(v)) => Ok(v),
            _ => Err(Error::format("hash tree level out of range")),
        }
    }

    /// The verified data level.
    pub fn storage(&self) -> Arc<Storage> {
        // `new` guarantees at least one level.
        Arc::clone(&self.levels[self.levels.len() - 1])
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Recorded validity of each level, top first.
    pub fn level_validity(&self) -> Vec<Validity> {
        (0..self.levels.len())
            .map(|i| self.level(i).map_or(Validity::Unchecked, IntegrityStorage::validity))
            .collect()
    }

    /// Hash every block of every level.
    pub fn validate(&self) -> Result<Validity> {
        let mut result = Validity::Valid;
        for i in 0..self.levels.len() {
            result = result.merge(self.level(i)?.validate()?);
        }
        Ok(result)
    }
}
