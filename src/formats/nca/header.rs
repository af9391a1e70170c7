//! NCA header and FsHeader parsing.
//!
//! ## Encryption
//! The first 0xC00 bytes are AES-128-XTS encrypted with `header_key`
//! (sector size 0x200, big-endian tweak). NCA3 numbers the six sectors
//! 0..5 contiguously; NCA2 encrypts each FsHeader as sector 0. A header
//! whose raw bytes already carry the magic is taken as plaintext.
//!
//! ## Header Layout (after decryption)
//! ```text
//! [0x000] RSA-2048 sig[0]  (0x100) - fixed key, over [0x200..0x400]
//! [0x100] RSA-2048 sig[1]  (0x100) - NPDM key
//! [0x200] Magic            NCA3/NCA2 (NCA0/NCA1 unsupported)
//! [0x204] DistributionType (1 byte)
//! [0x205] ContentType      (1 byte)
//! [0x206] KeyGenerationOld (1 byte)
//! [0x207] KeyAreaEncKeyIdx (1 byte)
//! [0x208] ContentSize      (u64 LE)
//! [0x210] ProgramId        (u64 LE)
//! [0x218] ContentIndex     (u32 LE)
//! [0x21C] SdkAddonVersion  (u32 LE)
//! [0x220] KeyGeneration    (1 byte)
//! [0x221] SignatureKeyGen  (1 byte, 9.0.0+)
//! [0x222] Reserved         (0xE bytes)
//! [0x230] RightsId         (0x10 bytes)
//! [0x240] FsEntries        (4 × 0x10 bytes, media units)
//! [0x280] FsHeaderHashes   (4 × 0x20 bytes SHA-256)
//! [0x300] EncryptedKeyArea (4 × 0x10 bytes)
//! [0x400] FsHeaders        (4 × 0x200 bytes)
//! ```
//!
//! ## FsHeader (0x200 bytes)
//! ```text
//! [0x000] Version          (u16 LE)
//! [0x002] FsType           0 = RomFS, 1 = PartitionFS
//! [0x003] HashType         0 = Auto, 1 = None, 2 = Sha256, 3 = Ivfc
//! [0x004] EncryptionType   0 = Auto, 1 = None, 2 = XTS, 3 = CTR, 4 = CTR-Ex
//! [0x008] HashData         (0xF8 bytes; Sha256 or IVFC descriptor)
//! [0x100] PatchInfo        indirect bucket tree {offset, size, BKTR header}
//! [0x120]                  AES-CTR-Ex bucket tree {offset, size, BKTR header}
//! [0x140] UpperCounter     (u64 LE, stored big-endian in the CTR IV)
//! ```
//! Offsets inside HashData and PatchInfo are section-relative bytes.

use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use crate::crypto::aes::{ecb_decrypt_block, xts_decrypt, xts_encrypt};
use crate::crypto::{rsa, sha256};
use crate::integrity::{HashLevel, Validity};
use crate::keys::{KaekIndex, KeySet, RightsId};
use crate::storage::{Storage, StorageReader};
use crate::utils::{
    array_at, bytesa, is_zero, le_u16, le_u32, le_u32_at, le_u64, le_u64_at, media_to_bytes, u8,
};
use crate::{Error, KeyKind, Result};

/// Size of the encrypted header region.
pub const HEADER_SIZE: usize = 0xC00;
/// XTS sector size of the header.
pub const HEADER_SECTOR_SIZE: usize = 0x200;
/// Size of one FsHeader.
pub const FS_HEADER_SIZE: usize = 0x200;
const FS_HEADERS_OFFSET: usize = 0x400;

/// Distribution type for an NCA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionType {
    Download,
    GameCard,
    Unknown(u8),
}

impl From<u8> for DistributionType {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Download,
            1 => Self::GameCard,
            x => Self::Unknown(x),
        }
    }
}

/// Content type for an NCA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Program,
    Meta,
    Control,
    Manual,
    Data,
    PublicData,
    Unknown(u8),
}

impl From<u8> for ContentType {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Program,
            1 => Self::Meta,
            2 => Self::Control,
            3 => Self::Manual,
            4 => Self::Data,
            5 => Self::PublicData,
            x => Self::Unknown(x),
        }
    }
}

/// A section entry pointing to a region within the NCA.
///
/// Offsets are in 0x200-byte media units; convert with [`media_to_bytes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SectionEntry {
    pub start_block: u32,
    pub end_block: u32,
}

impl SectionEntry {
    /// A zero start offset marks an absent section.
    pub fn is_present(&self) -> bool {
        self.start_block != 0
    }

    /// Byte offset of the section within the NCA.
    pub fn start(&self) -> u64 {
        media_to_bytes(self.start_block)
    }

    /// Byte offset of the end of the section.
    pub fn end(&self) -> u64 {
        media_to_bytes(self.end_block)
    }

    pub fn size(&self) -> u64 {
        self.end().saturating_sub(self.start())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    RomFs,
    PartitionFs,
    Unknown(u8),
}

impl From<u8> for FsType {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::RomFs,
            1 => Self::PartitionFs,
            x => Self::Unknown(x),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashType {
    Auto,
    None,
    Sha256,
    Ivfc,
    Unknown(u8),
}

impl From<u8> for HashType {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Auto,
            1 => Self::None,
            2 => Self::Sha256,
            3 => Self::Ivfc,
            x => Self::Unknown(x),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionType {
    Auto,
    None,
    Xts,
    AesCtr,
    AesCtrEx,
    Unknown(u8),
}

impl From<u8> for EncryptionType {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Auto,
            1 => Self::None,
            2 => Self::Xts,
            3 => Self::AesCtr,
            4 => Self::AesCtrEx,
            x => Self::Unknown(x),
        }
    }
}

/// Byte range inside a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Region {
    pub offset: u64,
    pub size: u64,
}

/// Hash descriptor of a PartitionFS section.
///
/// ```text
/// [0x00] MasterHash      (0x20, SHA-256 of the hash table)
/// [0x20] BlockSize       (u32 LE)
/// [0x24] LayerCount      (u32 LE, always 2)
/// [0x28] HashTable       {offset u64, size u64}
/// [0x38] Data            {offset u64, size u64}
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sha256Info {
    pub master_hash: [u8; 0x20],
    pub block_size: u32,
    pub hash_table: Region,
    pub data: Region,
}

impl Sha256Info {
    fn parse(d: &[u8]) -> Result<Self> {
        Ok(Self {
            master_hash: array_at::<0x20>(d, 0)?,
            block_size: le_u32_at(d, 0x20)?,
            hash_table: Region {
                offset: le_u64_at(d, 0x28)?,
                size: le_u64_at(d, 0x30)?,
            },
            data: Region {
                offset: le_u64_at(d, 0x38)?,
                size: le_u64_at(d, 0x40)?,
            },
        })
    }
}

/// One IVFC level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IvfcLevel {
    pub offset: u64,
    pub size: u64,
    pub block_size_log2: u32,
}

/// Hash descriptor of a RomFS section.
///
/// ```text
/// [0x00] Magic "IVFC"
/// [0x04] Version          (u32 LE)
/// [0x08] MasterHashSize   (u32 LE)
/// [0x0C] LevelCount       (u32 LE, master hash included)
/// [0x10] Levels           (6 × {offset u64, size u64, block_size_log2 u32, reserved u32})
/// [0xA0] Salt             (0x20, unused for NCA sections)
/// [0xC0] MasterHash       (0x20)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IvfcInfo {
    pub version: u32,
    pub master_hash_size: u32,
    /// Levels below the master hash; the last one is the data.
    pub levels: Vec<IvfcLevel>,
    pub master_hash: [u8; 0x20],
}

/// Maximum number of IVFC levels below the master hash.
pub const IVFC_MAX_LEVELS: usize = 6;

impl IvfcInfo {
    fn parse(d: &[u8]) -> Result<Self> {
        if array_at::<4>(d, 0)? != *b"IVFC" {
            return Err(Error::format("IVFC descriptor has a bad magic"));
        }
        let version = le_u32_at(d, 0x4)?;
        let master_hash_size = le_u32_at(d, 0x8)?;
        let level_count = le_u32_at(d, 0xC)? as usize;
        if !(2..=IVFC_MAX_LEVELS + 1).contains(&level_count) {
            return Err(Error::format(format!("IVFC descriptor has {level_count} levels")));
        }
        let levels = (0..level_count - 1)
            .map(|i| {
                let at = 0x10 + i * 0x18;
                Ok(IvfcLevel {
                    offset: le_u64_at(d, at)?,
                    size: le_u64_at(d, at + 0x8)?,
                    block_size_log2: le_u32_at(d, at + 0x10)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if levels.iter().any(|l| l.block_size_log2 >= 32) {
            return Err(Error::format("IVFC block size out of range"));
        }
        Ok(Self {
            version,
            master_hash_size,
            levels,
            master_hash: array_at::<0x20>(d, 0xC0)?,
        })
    }

    /// Levels as placed in the section, for building a hash tree.
    pub fn hash_levels(&self) -> Vec<HashLevel> {
        self.levels
            .iter()
            .map(|l| HashLevel {
                offset: l.offset,
                size: l.size,
                block_size: 1u64 << l.block_size_log2,
            })
            .collect()
    }

    /// The data level.
    pub fn data_level(&self) -> Option<&IvfcLevel> {
        self.levels.last()
    }
}

/// Parsed hash descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashInfo {
    None,
    Sha256(Sha256Info),
    Ivfc(IvfcInfo),
}

/// Location and header of an on-disk bucket tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BucketTreeInfo {
    pub offset: u64,
    pub size: u64,
    pub version: u32,
    pub entry_count: u32,
}

impl BucketTreeInfo {
    fn parse(d: &[u8]) -> Result<Option<Self>> {
        let offset = le_u64_at(d, 0)?;
        let size = le_u64_at(d, 8)?;
        if size == 0 {
            return Ok(None);
        }
        if array_at::<4>(d, 0x10)? != *b"BKTR" {
            return Err(Error::format("patch info has a bad BKTR magic"));
        }
        Ok(Some(Self {
            offset,
            size,
            version: le_u32_at(d, 0x14)?,
            entry_count: le_u32_at(d, 0x18)?,
        }))
    }
}

/// Relocation and subsection trees of a patch section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchInfo {
    pub indirect: BucketTreeInfo,
    pub aes_ctr_ex: BucketTreeInfo,
}

/// Parsed FsHeader.
#[derive(Debug, Clone)]
pub struct FsHeader {
    pub version: u16,
    pub fs_type: FsType,
    pub hash_type: HashType,
    pub encryption_type: EncryptionType,
    pub hash_info: HashInfo,
    pub patch_info: Option<PatchInfo>,
    pub upper_counter: u64,
}

impl FsHeader {
    /// Parse an FsHeader from a reader positioned at its start.
    pub fn parse<R: Read + Seek>(r: &mut R) -> Result<Self> {
        let version = le_u16(r)?;
        let fs_type = FsType::from(u8(r)?);
        let mut hash_type = HashType::from(u8(r)?);
        let mut encryption_type = EncryptionType::from(u8(r)?);
        let _reserved = bytesa::<3>(r)?;
        let hash_data = bytesa::<0xF8>(r)?;
        let patch_data = bytesa::<0x40>(r)?;
        let upper_counter = le_u64(r)?;

        // Auto picks the layout implied by the filesystem type.
        if hash_type == HashType::Auto {
            hash_type = match fs_type {
                FsType::RomFs => HashType::Ivfc,
                FsType::PartitionFs => HashType::Sha256,
                FsType::Unknown(_) => HashType::Auto,
            };
        }
        if encryption_type == EncryptionType::Auto {
            encryption_type = EncryptionType::AesCtr;
        }

        let hash_info = match hash_type {
            HashType::None => HashInfo::None,
            HashType::Sha256 => HashInfo::Sha256(Sha256Info::parse(&hash_data)?),
            HashType::Ivfc => HashInfo::Ivfc(IvfcInfo::parse(&hash_data)?),
            HashType::Auto | HashType::Unknown(_) => HashInfo::None,
        };

        let patch_info = match (
            BucketTreeInfo::parse(&patch_data[..0x20])?,
            BucketTreeInfo::parse(&patch_data[0x20..])?,
        ) {
            (Some(indirect), Some(aes_ctr_ex)) => Some(PatchInfo { indirect, aes_ctr_ex }),
            _ => None,
        };

        Ok(Self {
            version,
            fs_type,
            hash_type,
            encryption_type,
            hash_info,
            patch_info,
            upper_counter,
        })
    }
}

/// Parsed, decrypted NCA header.
#[derive(Debug, Clone)]
pub struct NcaHeader {
    /// NCA format version: 2 or 3.
    pub version: u8,
    pub distribution_type: DistributionType,
    pub content_type: ContentType,
    /// Effective key generation (max of KeyGenerationOld and KeyGeneration).
    pub key_generation: u8,
    pub key_area_key_index: KaekIndex,
    pub content_size: u64,
    pub program_id: u64,
    pub content_index: u32,
    pub sdk_addon_version: u32,
    pub signature_key_generation: u8,
    /// Rights ID (all zeros if no titlekey crypto).
    pub rights_id: RightsId,
    pub section_entries: [SectionEntry; 4],
    pub fs_header_hashes: [[u8; 32]; 4],
    pub encrypted_key_area: [[u8; 16]; 4],
    /// FsHeaders of present sections.
    pub fs_headers: [Option<FsHeader>; 4],
    /// Whether the header was stored encrypted.
    pub encrypted: bool,
    /// Decrypted header bytes.
    storage: Arc<Storage>,
}

impl NcaHeader {
    /// Read the header at the start of `nca`, decrypting it if needed.
    pub fn read(keys: &KeySet, nca: &Storage) -> Result<Self> {
        if nca.len() < HEADER_SIZE as u64 {
            return Err(Error::format(format!("NCA of {:#x} bytes is shorter than its header", nca.len())));
        }
        let mut raw = [0u8; HEADER_SIZE];
        nca.read(0, &mut raw)?;

        let (plain, encrypted) = if header_version(&raw).is_some() {
            (raw, false)
        } else {
            (decrypt_header(keys.header_key()?, &raw)?, true)
        };
        let mut header = Self::parse(Storage::memory(plain.to_vec()))?;
        header.encrypted = encrypted;
        tracing::debug!(
            version = header.version,
            content_type = ?header.content_type,
            key_generation = header.key_generation,
            encrypted,
            "parsed NCA header"
        );
        Ok(header)
    }

    /// Parse a decrypted header held in `storage`.
    pub fn parse(storage: Arc<Storage>) -> Result<Self> {
        let mut r = StorageReader::new(Arc::clone(&storage));
        // Skip the two RSA-2048 signatures (2 × 0x100 = 0x200 bytes).
        r.seek(SeekFrom::Start(0x200))?;

        let magic = bytesa::<4>(&mut r)?;
        let version = match &magic {
            b"NCA3" => 3,
            b"NCA2" => 2,
            b"NCA1" | b"NCA0" => {
                return Err(Error::UnsupportedLayout(format!(
                    "{} headers are not supported",
                    String::from_utf8_lossy(&magic)
                )));
            }
            _ => return Err(Error::format("invalid NCA magic")),
        };

        let distribution_type = DistributionType::from(u8(&mut r)?);
        let content_type = ContentType::from(u8(&mut r)?);
        let key_gen_old = u8(&mut r)?;
        let key_area_key_index = KaekIndex::try_from(u8(&mut r)?)?;
        let content_size = le_u64(&mut r)?;
        let program_id = le_u64(&mut r)?;
        let content_index = le_u32(&mut r)?;
        let sdk_addon_version = le_u32(&mut r)?;
        let key_gen_new = u8(&mut r)?;
        let signature_key_generation = u8(&mut r)?;
        let _reserved = bytesa::<0xE>(&mut r)?;

        // Effective key generation: whichever is newer.
        let key_generation = key_gen_old.max(key_gen_new);

        let rights_id = bytesa::<0x10>(&mut r)?;

        let mut section_entries = [SectionEntry::default(); 4];
        for entry in &mut section_entries {
            let start_block = le_u32(&mut r)?;
            let end_block = le_u32(&mut r)?;
            let _reserved = le_u64(&mut r)?;
            *entry = SectionEntry { start_block, end_block };
            if entry.is_present() && end_block < start_block {
                return Err(Error::format("section ends before it starts"));
            }
        }

        let mut fs_header_hashes = [[0u8; 0x20]; 4];
        for hash in &mut fs_header_hashes {
            *hash = bytesa::<0x20>(&mut r)?;
        }

        let mut encrypted_key_area = [[0u8; 0x10]; 4];
        for key in &mut encrypted_key_area {
            *key = bytesa::<0x10>(&mut r)?;
        }

        let mut fs_headers: [Option<FsHeader>; 4] = Default::default();
        for (i, fs_header) in fs_headers.iter_mut().enumerate() {
            if !section_entries[i].is_present() {
                continue;
            }
            let at = (FS_HEADERS_OFFSET + i * FS_HEADER_SIZE) as u64;
            let raw = storage.read_vec(at, FS_HEADER_SIZE)?;
            if sha256(&raw) != fs_header_hashes[i] {
                return Err(Error::format(format!("FsHeader {i} does not match its hash")));
            }
            r.seek(SeekFrom::Start(at))?;
            *fs_header = Some(FsHeader::parse(&mut r)?);
        }

        Ok(Self {
            version,
            distribution_type,
            content_type,
            key_generation,
            key_area_key_index,
            content_size,
            program_id,
            content_index,
            sdk_addon_version,
            signature_key_generation,
            rights_id,
            section_entries,
            fs_header_hashes,
            encrypted_key_area,
            fs_headers,
            encrypted: false,
            storage,
        })
    }

    /// Decrypted header bytes as a storage.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Returns true if the NCA uses titlekey crypto (RightsId is not all zeros).
    pub fn has_rights_id(&self) -> bool {
        !is_zero(&self.rights_id)
    }

    /// Index used for per-generation keys: generations 0 and 1 both use
    /// index 0.
    pub fn key_generation_index(&self) -> usize {
        self.key_generation.saturating_sub(1) as usize
    }

    /// Key-area slots decrypted with the generation's key-area key.
    pub fn decrypt_key_area(&self, keys: &KeySet) -> Result<[[u8; 16]; 4]> {
        let kaek = keys.key_area_key(self.key_area_key_index, self.key_generation_index())?;
        Ok(self.encrypted_key_area.map(|slot| ecb_decrypt_block(kaek, &slot)))
    }

    /// The title key of a rights-ID NCA, unwrapped with the generation's
    /// titlekek.
    pub fn decrypt_title_key(&self, keys: &KeySet) -> Result<[u8; 16]> {
        if !self.has_rights_id() {
            return Err(Error::missing_key("rights ID", KeyKind::TitleKey));
        }
        let encrypted = keys.title_key(&self.rights_id)?;
        let kek = keys.titlekek(self.key_generation_index())?;
        Ok(ecb_decrypt_block(kek, encrypted))
    }

    /// Check the fixed-key RSA-PSS signature over `0x200..0x400`.
    pub fn verify_signature(&self, keys: &KeySet) -> Result<Validity> {
        let Some(modulus) = keys
            .nca_hdr_fixed_key_moduli
            .get(self.signature_key_generation as usize)
            .and_then(|m| m.get())
        else {
            return Ok(Validity::MissingKey);
        };
        let signature = self.storage.read_vec(0, 0x100)?;
        let message = self.storage.read_vec(0x200, 0x200)?;
        rsa::verify_pss(modulus, &message, &signature)
    }

    /// Entry of a present section.
    pub fn section(&self, index: usize) -> Option<(&SectionEntry, &FsHeader)> {
        let entry = self.section_entries.get(index)?;
        let fs = self.fs_headers.get(index)?.as_ref()?;
        Some((entry, fs))
    }
}

fn header_version(raw: &[u8; HEADER_SIZE]) -> Option<u8> {
    match &raw[0x200..0x204] {
        b"NCA3" => Some(3),
        b"NCA2" => Some(2),
        _ => None,
    }
}

/// Sector used for FsHeader `i` of a header with `version`.
fn fs_header_sector(version: u8, i: usize) -> u64 {
    if version == 2 { 0 } else { (i + 2) as u64 }
}

/// Decrypt the 0xC00-byte header.
pub fn decrypt_header(key: &[u8; 32], encrypted: &[u8; HEADER_SIZE]) -> Result<[u8; HEADER_SIZE]> {
    let mut out = *encrypted;
    // Sectors 0 and 1 are numbered the same way by every version.
    xts_decrypt(key, &mut out[..FS_HEADERS_OFFSET], 0, HEADER_SECTOR_SIZE)?;
    let version = match &out[0x200..0x204] {
        b"NCA2" => 2,
        b"NCA3" => 3,
        b"NCA0" | b"NCA1" => {
            return Err(Error::UnsupportedLayout("NCA0/NCA1 headers are not supported".into()));
        }
        _ => return Err(Error::format("invalid NCA magic after header decryption")),
    };
    for i in 0..4 {
        let at = FS_HEADERS_OFFSET + i * FS_HEADER_SIZE;
        xts_decrypt(
            key,
            &mut out[at..at + FS_HEADER_SIZE],
            fs_header_sector(version, i),
            HEADER_SECTOR_SIZE,
        )?;
    }
    Ok(out)
}

/// Encrypt a plaintext 0xC00-byte header. The inverse of [`decrypt_header`].
pub fn encrypt_header(key: &[u8; 32], plain: &[u8; HEADER_SIZE]) -> Result<[u8; HEADER_SIZE]> {
    let version = header_version(plain).ok_or_else(|| Error::format("invalid NCA magic"))?;
    let mut out = *plain;
    xts_encrypt(key, &mut out[..FS_HEADERS_OFFSET], 0, HEADER_SECTOR_SIZE)?;
    for i in 0..4 {
        let at = FS_HEADERS_OFFSET + i * FS_HEADER_SIZE;
        xts_encrypt(
            key,
            &mut out[at..at + FS_HEADER_SIZE],
            fs_header_sector(version, i),
            HEADER_SECTOR_SIZE,
        )?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_header(magic: &[u8; 4]) -> [u8; HEADER_SIZE] {
        let mut h = [0u8; HEADER_SIZE];
        h[0x200..0x204].copy_from_slice(magic);
        h[0x204] = 1; // game card
        h[0x205] = 2; // control
        h[0x206] = 2;
        h[0x207] = 1; // ocean
        h[0x208..0x210].copy_from_slice(&0x1234_5000u64.to_le_bytes());
        h[0x210..0x218].copy_from_slice(&0x0100_0000_0000_1000u64.to_le_bytes());
        h[0x220] = 5;
        h[0x221] = 1;
        h[0x230] = 0xAB;
        // Section 0 at [0x6, 0x10) media units, RomFS without hashing.
        h[0x240..0x244].copy_from_slice(&6u32.to_le_bytes());
        h[0x244..0x248].copy_from_slice(&0x10u32.to_le_bytes());
        let fs = &mut h[0x400..0x600];
        fs[0..2].copy_from_slice(&2u16.to_le_bytes());
        fs[3] = 1;
        fs[4] = 3;
        fs[0x140..0x148].copy_from_slice(&0x0000_0002_0000_0007u64.to_le_bytes());
        let hash = sha256(&h[0x400..0x600]);
        h[0x280..0x2A0].copy_from_slice(&hash);
        for (i, b) in h[0x300..0x340].iter_mut().enumerate() {
            *b = i as u8;
        }
        h
    }

    #[test]
    fn encrypted_header_round_trips() {
        let key: [u8; 32] = core::array::from_fn(|i| (0x80 + i) as u8);
        let mut keys = KeySet::new();
        keys.header_key.0 = key;

        for magic in [b"NCA3", b"NCA2"] {
            let plain = plain_header(magic);
            let enc = encrypt_header(&key, &plain).unwrap();
            assert_ne!(enc[0x200..0x204], *magic);
            assert_eq!(decrypt_header(&key, &enc).unwrap(), plain);

            let header = NcaHeader::read(&keys, &Storage::memory(enc.to_vec())).unwrap();
            assert!(header.encrypted);
            assert_eq!(header.version, if magic == b"NCA3" { 3 } else { 2 });
            assert_eq!(header.distribution_type, DistributionType::GameCard);
            assert_eq!(header.content_type, ContentType::Control);
            assert_eq!(header.key_generation, 5);
            assert_eq!(header.key_generation_index(), 4);
            assert_eq!(header.key_area_key_index, KaekIndex::Ocean);
            assert_eq!(header.content_size, 0x1234_5000);
            assert_eq!(header.program_id, 0x0100_0000_0000_1000);
            assert_eq!(header.signature_key_generation, 1);
            assert!(header.has_rights_id());
            assert_eq!(header.section_entries[0].start(), 0xC00);
            assert_eq!(header.section_entries[0].size(), 0x1400);
            assert_eq!(header.encrypted_key_area[1][0], 0x10);

            let (_, fs) = header.section(0).unwrap();
            assert_eq!(fs.fs_type, FsType::RomFs);
            assert_eq!(fs.hash_type, HashType::None);
            assert_eq!(fs.encryption_type, EncryptionType::AesCtr);
            assert_eq!(fs.upper_counter, 0x0000_0002_0000_0007);
            assert!(header.section(1).is_none());
        }
    }

    #[test]
    fn plaintext_header_needs_no_key() {
        let header = NcaHeader::read(&KeySet::new(), &Storage::memory(plain_header(b"NCA3").to_vec())).unwrap();
        assert!(!header.encrypted);
    }

    #[test]
    fn missing_header_key_is_named() {
        let enc = encrypt_header(&[7; 32], &plain_header(b"NCA3")).unwrap();
        match NcaHeader::read(&KeySet::new(), &Storage::memory(enc.to_vec())) {
            Err(Error::MissingKey { name, .. }) => assert_eq!(name, "header_key"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn wrong_key_or_magic_is_invalid_format() {
        let enc = encrypt_header(&[7; 32], &plain_header(b"NCA3")).unwrap();
        let mut keys = KeySet::new();
        keys.header_key.0 = [8; 32];
        assert!(matches!(
            NcaHeader::read(&keys, &Storage::memory(enc.to_vec())),
            Err(Error::InvalidFormat(_))
        ));

        let mut legacy = plain_header(b"NCA3");
        legacy[0x200..0x204].copy_from_slice(b"NCA0");
        assert!(matches!(
            NcaHeader::parse(Storage::memory(legacy.to_vec())),
            Err(Error::UnsupportedLayout(_))
        ));
    }

    #[test]
    fn tampered_fs_header_fails_its_hash() {
        let mut h = plain_header(b"NCA3");
        h[0x500] ^= 1;
        assert!(matches!(
            NcaHeader::parse(Storage::memory(h.to_vec())),
            Err(Error::InvalidFormat(_))
        ));
    }

    #[test]
    fn ivfc_and_patch_descriptors_parse() {
        let mut fs = [0u8; FS_HEADER_SIZE];
        fs[2] = 0;
        fs[3] = 3;
        fs[4] = 4;
        let d = &mut fs[8..0x100];
        d[..4].copy_from_slice(b"IVFC");
        d[0xC..0x10].copy_from_slice(&7u32.to_le_bytes());
        for i in 0..6 {
            let at = 0x10 + i * 0x18;
            d[at..at + 8].copy_from_slice(&((i as u64) * 0x4000).to_le_bytes());
            d[at + 8..at + 16].copy_from_slice(&0x4000u64.to_le_bytes());
            d[at + 16..at + 20].copy_from_slice(&14u32.to_le_bytes());
        }
        d[0xC0] = 0xEE;
        let p = &mut fs[0x100..0x140];
        p[0..8].copy_from_slice(&0x18000u64.to_le_bytes());
        p[8..16].copy_from_slice(&0x8000u64.to_le_bytes());
        p[0x10..0x14].copy_from_slice(b"BKTR");
        p[0x18..0x1C].copy_from_slice(&3u32.to_le_bytes());
        p[0x20..0x28].copy_from_slice(&0x20000u64.to_le_bytes());
        p[0x28..0x30].copy_from_slice(&0x4000u64.to_le_bytes());
        p[0x30..0x34].copy_from_slice(b"BKTR");
        p[0x38..0x3C].copy_from_slice(&1u32.to_le_bytes());

        let header = FsHeader::parse(&mut std::io::Cursor::new(fs)).unwrap();
        let HashInfo::Ivfc(ivfc) = &header.hash_info else {
            panic!("expected IVFC");
        };
        assert_eq!(ivfc.levels.len(), 6);
        assert_eq!(ivfc.master_hash[0], 0xEE);
        assert_eq!(ivfc.hash_levels()[5].offset, 0x14000);
        assert_eq!(ivfc.hash_levels()[5].block_size, 0x4000);
        let patch = header.patch_info.unwrap();
        assert_eq!(patch.indirect.entry_count, 3);
        assert_eq!(patch.aes_ctr_ex.offset, 0x20000);
        assert_eq!(header.encryption_type, EncryptionType::AesCtrEx);
    }
}
