//! Per-read decryption.
//!
//! The ciphertext is fetched from the inner storage at the same offset and
//! decrypted on the caller's buffer. Counters and tweaks are computed for
//! each read on the stack; nothing is shared between concurrent readers.

use std::sync::Arc;

use super::Storage;
use super::indirect::{BucketTree, SubsectionEntry};
use crate::crypto::aes::{self, BLOCK_SIZE, ctr_transform_at, nca_counter};
use crate::{Error, Result};

/// Cipher applied by a [`DecryptStorage`].
#[derive(Clone)]
pub enum Transform {
    /// AES-128-CTR. `counter` is the counter of byte 0 of the inner storage,
    /// which must sit on a 16-byte boundary of the container.
    Ctr { key: [u8; 16], counter: [u8; 16] },
    /// AES-128-CTR with the counter generation taken from a subsection tree.
    /// `offset` is the container offset of byte 0 of the inner storage.
    CtrEx {
        key: [u8; 16],
        upper: u64,
        offset: u64,
        subsections: Arc<BucketTree<SubsectionEntry>>,
    },
    /// AES-128-XTS over whole sectors; byte 0 starts sector `first_sector`.
    Xts {
        key: [u8; 32],
        sector_size: usize,
        first_sector: u64,
    },
    /// AES-128-ECB over whole blocks.
    Ecb { key: [u8; 16] },
}

impl Transform {
    pub fn name(&self) -> &'static str {
        match self {
            Transform::Ctr { .. } => "AES-CTR",
            Transform::CtrEx { .. } => "AES-CTR-Ex",
            Transform::Xts { .. } => "AES-XTS",
            Transform::Ecb { .. } => "AES-ECB",
        }
    }
}

impl std::fmt::Debug for Transform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Counter for a CTR-Ex subsection: the section's upper counter with bytes
/// 4..8 replaced by the generation, lower half left for the block index.
pub fn ctr_ex_counter(upper: u64, generation: u32) -> [u8; 16] {
    let mut ctr = nca_counter(upper, 0);
    ctr[4..8].copy_from_slice(&generation.to_be_bytes());
    ctr
}

#[derive(Debug)]
pub struct DecryptStorage {
    inner: Arc<Storage>,
    transform: Transform,
}

impl DecryptStorage {
    pub fn new(inner: Arc<Storage>, transform: Transform) -> Self {
        Self { inner, transform }
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

    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    pub(super) fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match &self.transform {
            Transform::Ctr { key, counter } => {
                self.inner.read(offset, buf)?;
                ctr_transform_at(key, counter, offset, buf);
                Ok(())
            }
            Transform::CtrEx {
                key,
                upper,
                offset: base,
                subsections,
            } => {
                self.inner.read(offset, buf)?;
                let mut pos = offset;
                let mut done = 0;
                while done < buf.len() {
                    let (entry, end) = subsections.find(pos).ok_or_else(|| {
                        Error::format(format!("offset {pos:#x} is not covered by the subsection table"))
                    })?;
                    if end <= pos {
                        return Err(Error::format(format!("subsection ends at {end:#x}, before {pos:#x}")));
                    }
                    let generation = entry.generation;
                    let n = (end - pos).min((buf.len() - done) as u64) as usize;
                    let counter = ctr_ex_counter(*upper, generation);
                    ctr_transform_at(key, &counter, base + pos, &mut buf[done..done + n]);
                    done += n;
                    pos += n as u64;
                }
                Ok(())
            }
            Transform::Xts {
                key,
                sector_size,
                first_sector,
            } => self.read_aligned(offset, buf, *sector_size, |data, start| {
                let sector = first_sector + start / *sector_size as u64;
                aes::xts_decrypt(key, data, sector, *sector_size)
            }),
            Transform::Ecb { key } => {
                self.read_aligned(offset, buf, BLOCK_SIZE, |data, _| aes::ecb_decrypt(key, data))
            }
        }
    }

    // Widen the read to whole units, decrypt, copy out the requested bytes.
    fn read_aligned(
        &self,
        offset: u64,
        buf: &mut [u8],
        unit: usize,
        decrypt: impl Fn(&mut [u8], u64) -> Result<()>,
    ) -> Result<()> {
        let unit = unit as u64;
        let start = offset / unit * unit;
        let end = (offset + buf.len() as u64).div_ceil(unit) * unit;
        if end > self.inner.len() {
            return Err(Error::UnsupportedLayout(format!(
                "{} storage of {:#x} bytes is not a whole number of {unit:#x}-byte units",
                self.transform.name(),
                self.inner.len()
            )));
        }
        if start == offset && end == offset + buf.len() as u64 {
            self.inner.read(offset, buf)?;
            return decrypt(buf, start);
        }
        let mut tmp = self.inner.read_vec(start, (end - start) as usize)?;
        decrypt(&mut tmp, start)?;
        let skip = (offset - start) as usize;
        buf.copy_from_slice(&tmp[skip..skip + buf.len()]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::aes::{ctr_transform, ecb_encrypt, xts_encrypt};

    #[test]
    fn ctr_section_reads_anywhere() {
        let key = [7u8; 16];
        let section_offset = 0x4000u64;
        let counter = nca_counter(0x1122_3344_5566_7788, section_offset);
        let plain: Vec<u8> = (0..0x300u32).map(|i| (i ^ 0x5A) as u8).collect();
        let mut enc = plain.clone();
        ctr_transform(&key, &counter, &mut enc);

        let s = Storage::decrypt(Storage::memory(enc), Transform::Ctr { key, counter });
        for k in [0u64, 3, 20, 47] {
            assert_eq!(s.read_vec(k * 16, 16).unwrap(), plain[(k * 16) as usize..][..16]);
        }
        assert_eq!(s.read_vec(0x11, 0x101).unwrap(), plain[0x11..0x112]);
        assert_eq!(s.layers(), vec!["Decrypt", "Memory"]);
    }

    #[test]
    fn ctr_ex_switches_generation_per_subsection() {
        let key = [9u8; 16];
        let upper = 0xAABB_CCDD_0000_0000u64;
        let base = 0x1000u64;
        let plain = vec![0x42u8; 0x200];

        let mut enc = plain.clone();
        ctr_transform_at(&key, &ctr_ex_counter(upper, 1), base, &mut enc[..0x100]);
        ctr_transform_at(&key, &ctr_ex_counter(upper, 2), base + 0x100, &mut enc[0x100..]);

        let subsections = BucketTree::from_entries(
            vec![
                SubsectionEntry { offset: 0, generation: 1 },
                SubsectionEntry { offset: 0x100, generation: 2 },
            ],
            0x200,
        )
        .unwrap();
        let s = Storage::decrypt(
            Storage::memory(enc),
            Transform::CtrEx {
                key,
                upper,
                offset: base,
                subsections: Arc::new(subsections),
            },
        );
        assert_eq!(s.read_vec(0xF8, 0x10).unwrap(), plain[0xF8..0x108]);
        assert_eq!(s.read_all().unwrap(), plain);

        let ctr = ctr_ex_counter(upper, 2);
        assert_eq!(&ctr[..4], &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(&ctr[4..8], &[0, 0, 0, 2]);
    }

    #[test]
    fn ctr_ex_rejects_reads_outside_the_subsections() {
        let subsections = BucketTree::from_entries(
            vec![
                SubsectionEntry { offset: 0x100, generation: 1 },
                SubsectionEntry { offset: 0x180, generation: 2 },
            ],
            0x200,
        )
        .unwrap();
        let s = Storage::decrypt(
            Storage::memory(vec![0u8; 0x300]),
            Transform::CtrEx {
                key: [9; 16],
                upper: 0,
                offset: 0,
                subsections: Arc::new(subsections),
            },
        );
        assert!(s.read_vec(0x100, 0x100).is_ok());
        assert!(matches!(s.read_vec(0xF0, 0x20), Err(Error::InvalidFormat(_))));
        assert!(matches!(s.read_vec(0x1F0, 0x20), Err(Error::InvalidFormat(_))));
    }

    #[test]
    fn xts_reads_unaligned_ranges() {
        let key: [u8; 32] = core::array::from_fn(|i| (i * 3) as u8);
        let plain: Vec<u8> = (0..0x800u32).map(|i| (i % 251) as u8).collect();
        let mut enc = plain.clone();
        xts_encrypt(&key, &mut enc, 2, 0x200).unwrap();

        let s = Storage::decrypt(
            Storage::memory(enc),
            Transform::Xts {
                key,
                sector_size: 0x200,
                first_sector: 2,
            },
        );
        assert_eq!(s.read_vec(0x1F0, 0x220).unwrap(), plain[0x1F0..0x410]);
        assert_eq!(s.read_vec(0x400, 0x200).unwrap(), plain[0x400..0x600]);
    }

    #[test]
    fn ecb_and_partial_units() {
        let key = [1u8; 16];
        let plain: Vec<u8> = (0..0x40u8).collect();
        let mut enc = plain.clone();
        ecb_encrypt(&key, &mut enc).unwrap();
        let s = Storage::decrypt(Storage::memory(enc), Transform::Ecb { key });
        assert_eq!(s.read_vec(0x5, 0x20).unwrap(), plain[0x5..0x25]);

        let odd = Storage::decrypt(Storage::memory(vec![0u8; 0x18]), Transform::Ecb { key });
        assert!(matches!(odd.read_vec(0x10, 4), Err(Error::UnsupportedLayout(_))));
    }
}
