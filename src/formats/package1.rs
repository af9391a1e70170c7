//! Package1 - the encrypted first-stage boot package.
//!
//! ## Layout
//! ```text
//! [0x0000] Stage-1 bootloader (plaintext)
//! [0x3FE0] Pk11Size      (u32 LE)
//! [0x3FF0] Pk11Counter   (0x10 bytes, AES-CTR IV)
//! [0x4000] PK11 blob     (Pk11Size bytes, AES-128-CTR with package1_key_XX)
//! ```
//!
//! ## PK11 header (decrypted, 0x20 bytes)
//! ```text
//! [0x00] Magic "PK11"
//! [0x04] WarmbootSize           [0x08] WarmbootOffset
//! [0x0C] BootloaderSize         [0x10] BootloaderOffset
//! [0x14] SecureMonitorSize      [0x18] SecureMonitorOffset
//! [0x1C] Reserved
//! ```
//! Section offsets are relative to the end of the PK11 header.
//!
//! The key generation is not recorded in the package, so every known
//! `package1_key_XX` is tried until one yields the magic.

use std::sync::Arc;

use crate::crypto::aes::ctr_transform;
use crate::keys::{KeySet, MAX_KEY_GENERATION};
use crate::storage::Storage;
use crate::utils::{array_at, le_u32_at};
use crate::{Error, KeyKind, Result};

const PK11_SIZE_OFFSET: u64 = 0x3FE0;
const PK11_COUNTER_OFFSET: u64 = 0x3FF0;
const PK11_OFFSET: u64 = 0x4000;
const PK11_HEADER_SIZE: u64 = 0x20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pk11Section {
    Warmboot,
    Bootloader,
    SecureMonitor,
}

impl Pk11Section {
    pub const ALL: [Pk11Section; 3] = [Self::Warmboot, Self::Bootloader, Self::SecureMonitor];
}

/// A decrypted Package1.
#[derive(Debug, Clone)]
pub struct Package1 {
    /// Generation whose key decrypted the PK11 blob.
    pub key_generation: usize,
    pub counter: [u8; 0x10],
    /// `(offset, size)` of each section, relative to the blob.
    sections: [(u64, u64); 3],
    pk11: Arc<Storage>,
}

impl Package1 {
    pub fn open(keys: &KeySet, storage: &Storage) -> Result<Self> {
        let pk11_size = le_u32_at(&storage.read_vec(PK11_SIZE_OFFSET, 4)?, 0)? as usize;
        let counter = array_at::<0x10>(&storage.read_vec(PK11_COUNTER_OFFSET, 0x10)?, 0)?;
        if pk11_size < PK11_HEADER_SIZE as usize {
            return Err(Error::format(format!("PK11 blob of {pk11_size:#x} bytes")));
        }
        let encrypted = storage.read_vec(PK11_OFFSET, pk11_size)?;

        let mut tried = 0;
        for generation in 0..MAX_KEY_GENERATION {
            let Some(key) = keys.package1_keys[generation].get() else {
                continue;
            };
            tried += 1;
            let mut head = [0u8; 4];
            head.copy_from_slice(&encrypted[..4]);
            ctr_transform(key, &counter, &mut head);
            if &head != b"PK11" {
                continue;
            }
            let mut plain = encrypted;
            ctr_transform(key, &counter, &mut plain);
            let sections = Self::section_table(&plain)?;
            tracing::debug!(generation, "decrypted package1");
            return Ok(Self {
                key_generation: generation,
                counter,
                sections,
                pk11: Storage::memory(plain),
            });
        }
        if tried == 0 {
            return Err(Error::missing_key("package1_key_00", KeyKind::Common));
        }
        Err(Error::format(format!("none of {tried} package1 keys decrypts the PK11 blob")))
    }

    fn section_table(plain: &[u8]) -> Result<[(u64, u64); 3]> {
        let mut sections = [(0u64, 0u64); 3];
        for (i, section) in sections.iter_mut().enumerate() {
            let size = le_u32_at(plain, 4 + i * 8)? as u64;
            let offset = le_u32_at(plain, 8 + i * 8)? as u64;
            let start = PK11_HEADER_SIZE + offset;
            if start + size > plain.len() as u64 {
                return Err(Error::format(format!("PK11 section {i} runs past the blob")));
            }
            *section = (start, size);
        }
        Ok(sections)
    }

    /// The decrypted PK11 blob, header included.
    pub fn pk11(&self) -> &Arc<Storage> {
        &self.pk11
    }

    pub fn open_section(&self, section: Pk11Section) -> Result<Arc<Storage>> {
        let (offset, size) = self.sections[section as usize];
        Storage::slice(&self.pk11, offset, size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COUNTER: [u8; 16] = [0x0F; 16];

    fn package(key: &[u8; 16]) -> Vec<u8> {
        let mut pk11 = Vec::new();
        pk11.extend_from_slice(b"PK11");
        for (size, offset) in [(0x10u32, 0u32), (0x20, 0x10), (0x30, 0x30)] {
            pk11.extend_from_slice(&size.to_le_bytes());
            pk11.extend_from_slice(&offset.to_le_bytes());
        }
        pk11.extend_from_slice(&[0; 4]);
        for (fill, len) in [(0xA1u8, 0x10), (0xB2, 0x20), (0xC3, 0x30)] {
            pk11.extend(std::iter::repeat_n(fill, len));
        }
        ctr_transform(key, &COUNTER, &mut pk11);

        let mut image = vec![0u8; PK11_OFFSET as usize];
        image[0x3FE0..0x3FE4].copy_from_slice(&(pk11.len() as u32).to_le_bytes());
        image[0x3FF0..0x4000].copy_from_slice(&COUNTER);
        image.extend(pk11);
        image
    }

    #[test]
    fn tries_each_generation() {
        let mut keys = KeySet::new();
        keys.package1_keys[0].0 = [1; 16];
        keys.package1_keys[3].0 = [4; 16];
        let pkg = Package1::open(&keys, &Storage::memory(package(&[4; 16]))).unwrap();
        assert_eq!(pkg.key_generation, 3);
        let sm = pkg.open_section(Pk11Section::SecureMonitor).unwrap();
        assert_eq!(sm.read_all().unwrap(), vec![0xC3; 0x30]);
        let bl = pkg.open_section(Pk11Section::Bootloader).unwrap();
        assert_eq!(bl.read_vec(0, 1).unwrap(), [0xB2]);
    }

    #[test]
    fn missing_or_wrong_keys() {
        let image = Storage::memory(package(&[4; 16]));
        assert!(matches!(
            Package1::open(&KeySet::new(), &image),
            Err(Error::MissingKey { .. })
        ));
        let mut keys = KeySet::new();
        keys.package1_keys[0].0 = [1; 16];
        assert!(matches!(Package1::open(&keys, &image), Err(Error::InvalidFormat(_))));
    }
}
