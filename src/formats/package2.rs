//! Package2 - the kernel and built-in system modules.
//!
//! ## Layout
//! ```text
//! [0x000] RSA-2048 PSS signature over [0x100..0x200] (as stored)
//! [0x100] HeaderCounter      (0x10 bytes, plaintext IV of the header)
//! [0x110] SectionCounters    (4 × 0x10)
//! [0x150] Magic "PK21"
//! [0x154] BaseOffset         (u32 LE)
//! [0x158] Reserved
//! [0x15C] VersionMax, VersionMin (u8 each)
//! [0x15E] Reserved
//! [0x160] SectionSizes       (4 × u32 LE)
//! [0x170] SectionOffsets     (4 × u32 LE, load addresses)
//! [0x180] SectionHashes      (4 × SHA-256)
//! [0x200] Section data, back to back
//! ```
//!
//! `[0x100..0x200]` is AES-128-CTR encrypted under `package2_key_XX` with
//! the header counter as IV; the counter field itself is left as stored.
//! Each section has its own counter.

use std::sync::Arc;

use crate::crypto::aes::ctr_transform;
use crate::crypto::{rsa, sha256};
use crate::integrity::Validity;
use crate::keys::{KeySet, MAX_KEY_GENERATION};
use crate::storage::{Storage, Transform};
use crate::utils::{array_at, le_u32_at};
use crate::{Error, KeyKind, Result};

pub const HEADER_SIZE: usize = 0x200;
pub const SECTION_COUNT: usize = 4;
const MAGIC_OFFSET: usize = 0x150;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package2Header {
    pub header_counter: [u8; 0x10],
    pub section_counters: [[u8; 0x10]; SECTION_COUNT],
    pub base_offset: u32,
    pub version_max: u8,
    pub version_min: u8,
    pub section_sizes: [u32; SECTION_COUNT],
    pub section_offsets: [u32; SECTION_COUNT],
    pub section_hashes: [[u8; 0x20]; SECTION_COUNT],
}

impl Package2Header {
    fn parse(plain: &[u8; HEADER_SIZE]) -> Result<Self> {
        let mut section_counters = [[0u8; 0x10]; SECTION_COUNT];
        let mut section_sizes = [0u32; SECTION_COUNT];
        let mut section_offsets = [0u32; SECTION_COUNT];
        let mut section_hashes = [[0u8; 0x20]; SECTION_COUNT];
        for i in 0..SECTION_COUNT {
            section_counters[i] = array_at(plain, 0x110 + i * 0x10)?;
            section_sizes[i] = le_u32_at(plain, 0x160 + i * 4)?;
            section_offsets[i] = le_u32_at(plain, 0x170 + i * 4)?;
            section_hashes[i] = array_at(plain, 0x180 + i * 0x20)?;
        }
        Ok(Self {
            header_counter: array_at(plain, 0x100)?,
            section_counters,
            base_offset: le_u32_at(plain, 0x154)?,
            version_max: plain[0x15C],
            version_min: plain[0x15D],
            section_sizes,
            section_offsets,
            section_hashes,
        })
    }
}

/// An opened Package2.
#[derive(Debug)]
pub struct Package2 {
    storage: Arc<Storage>,
    pub key_generation: usize,
    pub header: Package2Header,
    key: [u8; 0x10],
    /// Header bytes as stored, for signature checks.
    raw_header: Vec<u8>,
}

impl Package2 {
    pub fn open(keys: &KeySet, storage: Arc<Storage>) -> Result<Self> {
        let raw: [u8; HEADER_SIZE] = array_at(&storage.read_vec(0, HEADER_SIZE)?, 0)?;
        let counter: [u8; 0x10] = array_at(&raw, 0x100)?;

        let mut tried = 0;
        for generation in 0..MAX_KEY_GENERATION {
            let Some(key) = keys.package2_keys[generation].get() else {
                continue;
            };
            tried += 1;
            let mut plain = raw;
            ctr_transform(key, &counter, &mut plain[0x100..]);
            if &plain[MAGIC_OFFSET..MAGIC_OFFSET + 4] != b"PK21" {
                continue;
            }
            plain[0x100..0x110].copy_from_slice(&counter);
            let header = Package2Header::parse(&plain)?;
            let total: u64 = header.section_sizes.iter().map(|&s| s as u64).sum();
            if HEADER_SIZE as u64 + total > storage.len() {
                return Err(Error::format("package2 sections run past the image"));
            }
            tracing::debug!(generation, version = header.version_max, "decrypted package2 header");
            return Ok(Self {
                storage,
                key_generation: generation,
                header,
                key: *key,
                raw_header: raw.to_vec(),
            });
        }
        if tried == 0 {
            return Err(Error::missing_key("package2_key_00", KeyKind::Common));
        }
        Err(Error::format(format!("none of {tried} package2 keys decrypts the header")))
    }

    /// Check the header signature against `package2_fixed_key_modulus`.
    pub fn verify_signature(&self, keys: &KeySet) -> Result<Validity> {
        let Some(modulus) = keys.package2_fixed_key_modulus.get() else {
            return Ok(Validity::MissingKey);
        };
        rsa::verify_pss(modulus, &self.raw_header[0x100..], &self.raw_header[..0x100])
    }

    /// Decrypted contents of section `index`.
    pub fn open_section(&self, index: usize) -> Result<Arc<Storage>> {
        if index >= SECTION_COUNT {
            return Err(Error::format(format!("package2 has no section {index}")));
        }
        let start: u64 = HEADER_SIZE as u64
            + self.header.section_sizes[..index].iter().map(|&s| s as u64).sum::<u64>();
        let raw = Storage::slice(&self.storage, start, self.header.section_sizes[index] as u64)?;
        Ok(Storage::decrypt(
            raw,
            Transform::Ctr {
                key: self.key,
                counter: self.header.section_counters[index],
            },
        ))
    }

    /// Hash section `index` and compare it with the header.
    pub fn verify_section(&self, index: usize) -> Result<Validity> {
        let data = self.open_section(index)?.read_all()?;
        Ok(if sha256(&data) == self.header.section_hashes[index] {
            Validity::Valid
        } else {
            tracing::warn!(section = index, "package2 section hash mismatch");
            Validity::Invalid
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = [0x6B; 16];

    fn image() -> Vec<u8> {
        let kernel = vec![0x4Bu8; 0x80];
        let ini1 = vec![0x49u8; 0x40];
        let mut h = [0u8; HEADER_SIZE];
        h[0x100..0x110].copy_from_slice(&[0x10; 16]);
        h[0x110..0x120].copy_from_slice(&[0x20; 16]);
        h[0x120..0x130].copy_from_slice(&[0x30; 16]);
        h[0x150..0x154].copy_from_slice(b"PK21");
        h[0x15C] = 0x12;
        h[0x160..0x164].copy_from_slice(&(kernel.len() as u32).to_le_bytes());
        h[0x164..0x168].copy_from_slice(&(ini1.len() as u32).to_le_bytes());
        h[0x180..0x1A0].copy_from_slice(&sha256(&kernel));
        h[0x1A0..0x1C0].copy_from_slice(&sha256(&ini1));

        let mut enc = h;
        ctr_transform(&KEY, &[0x10; 16], &mut enc[0x100..]);
        enc[0x100..0x110].copy_from_slice(&[0x10; 16]);
        let mut out = enc.to_vec();
        for (data, counter) in [(kernel, [0x20u8; 16]), (ini1, [0x30; 16])] {
            let mut data = data;
            ctr_transform(&KEY, &counter, &mut data);
            out.extend(data);
        }
        out
    }

    #[test]
    fn header_and_sections_decrypt() {
        let mut keys = KeySet::new();
        keys.package2_keys[2].0 = KEY;
        let pkg = Package2::open(&keys, Storage::memory(image())).unwrap();
        assert_eq!(pkg.key_generation, 2);
        assert_eq!(pkg.header.version_max, 0x12);
        assert_eq!(pkg.open_section(1).unwrap().read_all().unwrap(), vec![0x49; 0x40]);
        assert_eq!(pkg.verify_section(0).unwrap(), Validity::Valid);
        assert_eq!(pkg.verify_section(1).unwrap(), Validity::Valid);
        assert_eq!(pkg.verify_signature(&keys).unwrap(), Validity::MissingKey);
    }

    #[test]
    fn tampered_section_is_invalid() {
        let mut data = image();
        data[0x210] ^= 0xFF;
        let mut keys = KeySet::new();
        keys.package2_keys[0].0 = KEY;
        let pkg = Package2::open(&keys, Storage::memory(data)).unwrap();
        assert_eq!(pkg.verify_section(0).unwrap(), Validity::Invalid);
        assert_eq!(pkg.verify_section(1).unwrap(), Validity::Valid);
    }

    #[test]
    fn needs_a_package2_key() {
        match Package2::open(&KeySet::new(), Storage::memory(image())) {
            Err(Error::MissingKey { name, .. }) => assert_eq!(name, "package2_key_00"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
