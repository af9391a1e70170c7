//! XCI (NX Card Image) - game card dump.
//!
//! ## Overall Layout
//! ```text
//! [0x0000–0x0FFF] CardKeyArea
//! [0x1000–0x11FF] CardHeader       (0x200 bytes; see below)
//! [0x1200–0xFFFF] T2 header, certificate, reserved
//! [hfs0_offset]   root HFS0 listing the partitions
//! ```
//!
//! ## CardHeader (at 0x1000)
//! ```text
//! [+0x000] RSA-2048 signature over [+0x100..+0x200]
//! [+0x100] Magic "HEAD"
//! [+0x104] RomAreaStartPageAddress   (u32 LE, media units)
//! [+0x108] BackupAreaStartPageAddress
//! [+0x10C] TitleKeyDecIndex | KekIndex
//! [+0x10D] RomSize
//! [+0x10E] Version
//! [+0x10F] Flags
//! [+0x110] PackageId                 (u64 LE)
//! [+0x118] ValidDataEndAddress       (u32 LE, media units)
//! [+0x11C] Reserved
//! [+0x120] IV (byte-reversed for AES-CBC)
//! [+0x130] PartitionFsHeaderAddress  (u64 LE)
//! [+0x138] PartitionFsHeaderSize     (u64 LE)
//! [+0x140] PartitionFsHeaderHash     (SHA-256)
//! [+0x160] InitialDataHash           (SHA-256)
//! [+0x180] SelSec, SelT1Key, SelKey, LimArea (u32 LE each)
//! [+0x190] CardHeaderEncryptedData   (0x70 bytes, AES-128-CBC)
//! ```
//!
//! ## CardHeaderEncryptedData (decrypted)
//! ```text
//! [0x00] FwVersion       (u64 LE)
//! [0x08] AccCtrl1        (u32 LE)
//! [0x0C] Wait1TimeRead   (u32 LE)
//! [0x10] Wait2TimeRead   (u32 LE)
//! [0x14] Wait1TimeWrite  (u32 LE)
//! [0x18] Wait2TimeWrite  (u32 LE)
//! [0x1C] FwMode          (u32 LE)
//! [0x20] CupVersion      (u32 LE)
//! [0x24] Reserved
//! [0x28] UppHash         (8 bytes)
//! [0x30] CupId           (u64 LE)
//! [0x38] Reserved        (0x38 bytes)
//! ```

use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use super::hfs0::{HashedFs, Hfs0};
use super::nca::Nca;
use crate::config::OpenOptions;
use crate::crypto::aes::cbc_decrypt;
use crate::crypto::sha256;
use crate::integrity::Validity;
use crate::keys::KeySet;
use crate::storage::{Storage, StorageReader};
use crate::utils::{bytesa, le_u32, le_u32_at, le_u64, le_u64_at, magic, media_to_bytes, u8};
use crate::{Error, KeyKind, Result};

/// Well-known partition names.
pub const PARTITION_NAMES: [&str; 4] = ["update", "normal", "logo", "secure"];

/// Parsed CardHeader and root partition table.
#[derive(Debug, Clone)]
pub struct Xci {
    pub rom_area_start: u64,
    pub key_indices: u8,
    /// RomSize byte (see [`Xci::rom_capacity`]).
    pub rom_size: u8,
    pub version: u8,
    pub flags: u8,
    pub package_id: u64,
    pub valid_data_end: u64,
    /// IV as stored; reversed before use.
    pub iv: [u8; 0x10],
    /// Absolute offset of the root HFS0 header.
    pub hfs0_offset: u64,
    pub hfs0_size: u64,
    pub hfs0_header_hash: [u8; 32],
    pub initial_data_hash: [u8; 32],
    pub sel_sec: u32,
    pub encrypted_data: [u8; 0x70],
    pub root_partition: Hfs0,
}

/// Fields of the decrypted `CardHeaderEncryptedData`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardInfo {
    pub firmware_version: u64,
    pub access_control: u32,
    pub firmware_mode: u32,
    pub cup_version: u32,
    pub update_partition_hash: [u8; 8],
    pub cup_id: u64,
}

impl Xci {
    /// Parse an XCI. The reader must be positioned at the start of the
    /// image.
    pub fn parse<R: Read + Seek>(r: &mut R) -> Result<Self> {
        // Skip CardKeyArea (0x1000 bytes) and the signature (0x100 bytes).
        r.seek(SeekFrom::Start(0x1100))?;
        magic(r, b"HEAD")?;

        // 0x1104
        let rom_area_start = media_to_bytes(le_u32(r)?);
        let _backup = le_u32(r)?;
        // 0x110C
        let key_indices = u8(r)?;
        let rom_size = u8(r)?;
        let version = u8(r)?;
        let flags = u8(r)?;
        // 0x1110
        let package_id = le_u64(r)?;
        let valid_data_end = media_to_bytes(le_u32(r)?);
        let _reserved = le_u32(r)?;
        // 0x1120
        let iv = bytesa::<0x10>(r)?;
        // 0x1130
        let hfs0_offset = le_u64(r)?;
        let hfs0_size = le_u64(r)?;
        // 0x1140
        let hfs0_header_hash = bytesa::<0x20>(r)?;
        let initial_data_hash = bytesa::<0x20>(r)?;
        // 0x1180
        let sel_sec = le_u32(r)?;
        let _sel_t1_key = le_u32(r)?;
        let _sel_key = le_u32(r)?;
        let _lim_area = le_u32(r)?;
        // 0x1190
        let encrypted_data = bytesa::<0x70>(r)?;

        r.seek(SeekFrom::Start(hfs0_offset))?;
        let root_partition = Hfs0::parse(r)?;

        Ok(Self {
            rom_area_start,
            key_indices,
            rom_size,
            version,
            flags,
            package_id,
            valid_data_end,
            iv,
            hfs0_offset,
            hfs0_size,
            hfs0_header_hash,
            initial_data_hash,
            sel_sec,
            encrypted_data,
            root_partition,
        })
    }

    /// ROM capacity as a human-readable string.
    pub fn rom_capacity(&self) -> &'static str {
        match self.rom_size {
            0xFA => "1 GB",
            0xF8 => "2 GB",
            0xF0 => "4 GB",
            0xE0 => "8 GB",
            0xE1 => "16 GB",
            0xE2 => "32 GB",
            _ => "unknown",
        }
    }

    /// Decrypt `CardHeaderEncryptedData` with `xci_header_key`.
    pub fn decrypt_card_info(&self, keys: &KeySet) -> Result<CardInfo> {
        let key = keys
            .xci_header_key
            .get()
            .ok_or_else(|| Error::missing_key("xci_header_key", KeyKind::Common))?;
        let mut iv = self.iv;
        iv.reverse();
        let mut data = self.encrypted_data;
        cbc_decrypt(key, &iv, &mut data)?;
        Ok(CardInfo {
            firmware_version: le_u64_at(&data, 0x00)?,
            access_control: le_u32_at(&data, 0x08)?,
            firmware_mode: le_u32_at(&data, 0x1C)?,
            cup_version: le_u32_at(&data, 0x20)?,
            update_partition_hash: crate::utils::array_at::<8>(&data, 0x28)?,
            cup_id: le_u64_at(&data, 0x30)?,
        })
    }
}

/// An XCI read out of a [`Storage`].
#[derive(Debug, Clone)]
pub struct XciImage {
    storage: Arc<Storage>,
    pub xci: Xci,
}

impl XciImage {
    pub fn new(storage: Arc<Storage>) -> Result<Self> {
        let mut reader = StorageReader::new(Arc::clone(&storage));
        let xci = Xci::parse(&mut reader)?;
        tracing::debug!(
            capacity = xci.rom_capacity(),
            partitions = xci.root_partition.files.len(),
            "parsed XCI"
        );
        Ok(Self { storage, xci })
    }

    /// Hash of the root partition header against the card header.
    pub fn verify_root_header(&self) -> Result<Validity> {
        let header = self.storage.read_vec(self.xci.hfs0_offset, self.xci.hfs0_size as usize)?;
        Ok(if sha256(&header) == self.xci.hfs0_header_hash {
            Validity::Valid
        } else {
            Validity::Invalid
        })
    }

    pub fn root(&self) -> Result<HashedFs> {
        HashedFs::new(Storage::slice(
            &self.storage,
            self.xci.hfs0_offset,
            self.storage.len() - self.xci.hfs0_offset.min(self.storage.len()),
        )?)
    }

    pub fn has_partition(&self, name: &str) -> bool {
        self.xci.root_partition.get_file_by_name(name).is_some()
    }

    /// Open a partition by name (`update`, `normal`, `logo`, `secure`).
    pub fn open_partition(&self, name: &str) -> Result<HashedFs> {
        let root = self.root()?;
        let file = root
            .get_file_by_name(name)
            .ok_or_else(|| Error::format(format!("XCI has no {name} partition")))?;
        HashedFs::new(root.open_file(file)?)
    }

    /// Open an NCA stored in a partition.
    pub fn open_nca(&self, keys: &KeySet, partition: &str, name: &str, options: OpenOptions) -> Result<Nca> {
        let partition = self.open_partition(partition)?;
        let file = partition
            .get_file_by_name(name)
            .ok_or_else(|| Error::format(format!("partition has no file {name}")))?;
        Nca::open_with(keys, partition.open_file(file)?, options)
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::aes::cbc_encrypt;
    use crate::formats::hfs0;

    const XCI_KEY: [u8; 16] = [0x3C; 16];

    fn image() -> Vec<u8> {
        let secure = hfs0::build(&[("a.nca", &b"not really an nca"[..])], 0x200);
        let root = hfs0::build(&[("update", &b""[..]), ("secure", &secure[..])], 0x200);
        let root_header_len = 0x10 + 2 * 0x40 + "update\0secure\0".len();

        let mut img = vec![0u8; 0xF000];
        let h = &mut img[0x1000..0x1200];
        h[0x100..0x104].copy_from_slice(b"HEAD");
        h[0x10D] = 0xE0;
        h[0x110..0x118].copy_from_slice(&0x1122_3344u64.to_le_bytes());
        let iv: [u8; 16] = core::array::from_fn(|i| i as u8);
        h[0x120..0x130].copy_from_slice(&iv);
        h[0x130..0x138].copy_from_slice(&0xF000u64.to_le_bytes());
        h[0x138..0x140].copy_from_slice(&(root_header_len as u64).to_le_bytes());
        h[0x140..0x160].copy_from_slice(&sha256(&root[..root_header_len]));

        let mut info = [0u8; 0x70];
        info[..8].copy_from_slice(&0x0000_0001_0000_0000u64.to_le_bytes());
        info[0x20..0x24].copy_from_slice(&0x0C00_0000u32.to_le_bytes());
        let mut reversed = iv;
        reversed.reverse();
        cbc_encrypt(&XCI_KEY, &reversed, &mut info).unwrap();
        h[0x190..0x200].copy_from_slice(&info);

        img.extend(root);
        img
    }

    #[test]
    fn partitions_and_card_info() {
        let xci = XciImage::new(Storage::memory(image())).unwrap();
        assert_eq!(xci.xci.rom_capacity(), "8 GB");
        assert_eq!(xci.xci.package_id, 0x1122_3344);
        assert!(xci.has_partition("secure"));
        assert!(!xci.has_partition("logo"));
        assert_eq!(xci.verify_root_header().unwrap(), Validity::Valid);

        let secure = xci.open_partition("secure").unwrap();
        let file = secure.get_file_by_name("a.nca").unwrap();
        assert_eq!(secure.open_file(file).unwrap().read_all().unwrap(), b"not really an nca");
        assert_eq!(secure.verify_file(file).unwrap(), Validity::Valid);

        let mut keys = KeySet::new();
        assert!(matches!(xci.xci.decrypt_card_info(&keys), Err(Error::MissingKey { .. })));
        keys.xci_header_key.0 = XCI_KEY;
        let info = xci.xci.decrypt_card_info(&keys).unwrap();
        assert_eq!(info.firmware_version, 0x0000_0001_0000_0000);
        assert_eq!(info.cup_version, 0x0C00_0000);
    }

    #[test]
    fn non_nca_file_fails_to_open() {
        let xci = XciImage::new(Storage::memory(image())).unwrap();
        assert!(xci.open_nca(&KeySet::new(), "secure", "a.nca", OpenOptions::default()).is_err());
        assert!(xci.open_partition("normal").is_err());
    }
}
