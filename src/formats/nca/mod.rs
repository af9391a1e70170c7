//! NCA (Nintendo Content Archive) - the encrypted content container.
//!
//! [`Nca::open`] reads and decrypts the header, then resolves the content
//! keys for every section up front. A section whose key is unknown can
//! still be listed; opening it returns the [`Error::MissingKey`] recorded
//! at open time.
//!
//! A section is read through a chain of storages built on demand:
//!
//! ```text
//! raw:       Slice(container, start, end)
//! decrypted: Cache ─> Decrypt(CTR | XTS) ─> raw
//! patch:     Cache ─> Indirect ┬ base:  decrypted section of the base NCA
//!                              └ patch: Concat[Decrypt(CTR-Ex) ─> raw[..bktr],
//!                                              Decrypt(CTR) ─> raw[bktr..]]
//! verified:  IntegrityTree over decrypted (or patch)
//! ```

#[cfg(test)]
mod fixture;
pub mod header;

use std::sync::Arc;

use crate::config::OpenOptions;
use crate::crypto::aes::nca_counter;
use crate::formats::pfs0::PartitionFs;
use crate::formats::romfs::RomFs;
use crate::integrity::{IntegrityCheckLevel, IntegrityTree, Validity};
use crate::keys::KeySet;
use crate::storage::indirect::{BucketTree, RelocationEntry, SubsectionEntry};
use crate::storage::{Storage, Transform};
use crate::{Error, KeyKind, Result};

pub use header::{
    ContentType, DistributionType, EncryptionType, FsHeader, FsType, HashInfo, HashType, NcaHeader,
    SectionEntry,
};

/// Key-area slot holding the CTR key.
const CTR_KEY_SLOT: usize = 2;

/// A key that was either resolved or found missing at open time.
#[derive(Debug, Clone)]
enum KeyState<T> {
    Ready(T),
    Missing { name: String, kind: KeyKind },
    /// Not applicable to this container.
    Unsupported(&'static str),
}

impl<T: Copy> KeyState<T> {
    fn from_result(r: Result<T>) -> Self {
        match r {
            Ok(key) => Self::Ready(key),
            Err(Error::MissingKey { name, kind }) => Self::Missing { name, kind },
            Err(e) => {
                tracing::warn!(error = %e, "content key unavailable");
                Self::Unsupported("content key could not be derived")
            }
        }
    }

    fn get(&self) -> Result<T> {
        match self {
            Self::Ready(key) => Ok(*key),
            Self::Missing { name, kind } => Err(Error::missing_key(name.clone(), *kind)),
            Self::Unsupported(why) => Err(Error::UnsupportedLayout((*why).into())),
        }
    }

    fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

#[derive(Debug, Clone)]
struct ContentKeys {
    xts: KeyState<[u8; 32]>,
    ctr: KeyState<[u8; 16]>,
}

impl ContentKeys {
    fn resolve(header: &NcaHeader, keys: &KeySet) -> Self {
        if header.has_rights_id() {
            return Self {
                xts: KeyState::Unsupported("XTS sections cannot use a title key"),
                ctr: KeyState::from_result(header.decrypt_title_key(keys)),
            };
        }
        match header.decrypt_key_area(keys) {
            Ok(area) => {
                let mut xts = [0u8; 32];
                xts[..16].copy_from_slice(&area[0]);
                xts[16..].copy_from_slice(&area[1]);
                Self {
                    xts: KeyState::Ready(xts),
                    ctr: KeyState::Ready(area[CTR_KEY_SLOT]),
                }
            }
            Err(e) => {
                let state = KeyState::<[u8; 16]>::from_result(Err(e));
                let xts = match &state {
                    KeyState::Missing { name, kind } => KeyState::Missing {
                        name: name.clone(),
                        kind: *kind,
                    },
                    _ => KeyState::Unsupported("content key could not be derived"),
                };
                Self { xts, ctr: state }
            }
        }
    }
}

/// Filesystem view of a section.
#[derive(Debug, Clone)]
pub enum SectionFs {
    Partition(PartitionFs),
    RomFs(RomFs),
}

impl SectionFs {
    /// Paths of every file; PartitionFS names are returned as `/name`.
    pub fn file_paths(&self) -> Vec<String> {
        match self {
            Self::Partition(fs) => fs.files().map(|f| format!("/{}", f.name)).collect(),
            Self::RomFs(fs) => fs.files().map(|f| f.path.clone()).collect(),
        }
    }

    pub fn open_file(&self, path: &str) -> Result<Arc<Storage>> {
        let missing = || Error::format(format!("no file {path} in section"));
        match self {
            Self::Partition(fs) => {
                let file = fs.get_file_by_name(path.trim_start_matches('/')).ok_or_else(missing)?;
                fs.open_file(file)
            }
            Self::RomFs(fs) => fs.open_file(fs.get_file(path).ok_or_else(missing)?),
        }
    }
}

/// An opened NCA.
#[derive(Debug)]
pub struct Nca {
    storage: Arc<Storage>,
    pub header: NcaHeader,
    keys: ContentKeys,
    options: OpenOptions,
    base: Option<Arc<Nca>>,
}

impl Nca {
    /// Open with default [`OpenOptions`].
    pub fn open(keys: &KeySet, storage: Arc<Storage>) -> Result<Self> {
        Self::open_with(keys, storage, OpenOptions::default())
    }

    pub fn open_with(keys: &KeySet, storage: Arc<Storage>, options: OpenOptions) -> Result<Self> {
        let header = NcaHeader::read(keys, &storage)?;
        let content_keys = ContentKeys::resolve(&header, keys);
        if let KeyState::Missing { name, .. } = &content_keys.ctr {
            tracing::debug!(key = %name, "NCA content key missing; encrypted sections will not open");
        }
        Ok(Self {
            storage,
            header,
            keys: content_keys,
            options,
            base: None,
        })
    }

    /// Register the NCA that patch sections of this one are applied to.
    pub fn with_base(mut self, base: Arc<Nca>) -> Self {
        self.base = Some(base);
        self
    }

    pub fn base(&self) -> Option<&Arc<Nca>> {
        self.base.as_ref()
    }

    pub fn options(&self) -> &OpenOptions {
        &self.options
    }

    /// The whole container.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn section_exists(&self, index: usize) -> bool {
        self.header.section(index).is_some()
    }

    /// Whether every key and container needed to decrypt the section is
    /// available.
    pub fn can_open_section(&self, index: usize) -> bool {
        let Some((_, fs)) = self.header.section(index) else {
            return false;
        };
        match fs.encryption_type {
            EncryptionType::None => true,
            EncryptionType::Xts => self.keys.xts.is_ready(),
            EncryptionType::AesCtr => self.keys.ctr.is_ready(),
            EncryptionType::AesCtrEx => {
                self.keys.ctr.is_ready() && self.base.as_ref().is_some_and(|b| b.can_open_section(index))
            }
            EncryptionType::Auto | EncryptionType::Unknown(_) => false,
        }
    }

    fn section(&self, index: usize) -> Result<(&SectionEntry, &FsHeader)> {
        self.header
            .section(index)
            .ok_or_else(|| Error::format(format!("section {index} is not present")))
    }

    /// The section's bytes as stored.
    pub fn open_raw_storage(&self, index: usize) -> Result<Arc<Storage>> {
        let (entry, _) = self.section(index)?;
        Storage::slice(&self.storage, entry.start(), entry.size())
    }

    /// The section's plaintext, before any hash verification.
    pub fn open_decrypted_storage(&self, index: usize) -> Result<Arc<Storage>> {
        let (entry, fs) = self.section(index)?;
        let raw = self.open_raw_storage(index)?;
        let plain = match fs.encryption_type {
            EncryptionType::None => return Ok(raw),
            EncryptionType::AesCtr => Storage::decrypt(
                raw,
                Transform::Ctr {
                    key: self.keys.ctr.get()?,
                    counter: nca_counter(fs.upper_counter, entry.start()),
                },
            ),
            EncryptionType::Xts => Storage::decrypt(
                raw,
                Transform::Xts {
                    key: self.keys.xts.get()?,
                    sector_size: header::HEADER_SECTOR_SIZE,
                    first_sector: 0,
                },
            ),
            EncryptionType::AesCtrEx => self.open_patch_storage(index, entry, fs, raw)?,
            EncryptionType::Auto | EncryptionType::Unknown(_) => {
                return Err(Error::UnsupportedLayout(format!(
                    "section {index} has encryption type {:?}",
                    fs.encryption_type
                )));
            }
        };
        tracing::debug!(section = index, layers = ?plain.layers(), "opened NCA section");
        Ok(self.cached(plain))
    }

    fn cached(&self, storage: Arc<Storage>) -> Arc<Storage> {
        if self.options.cache_capacity == 0 {
            return storage;
        }
        Storage::cached(storage, self.options.cache_block_size, self.options.cache_capacity)
    }

    // The BKTR region [indirect offset, section end) is plain CTR; the data
    // before it uses per-subsection generations. The patched view relocates
    // reads between that data and the base NCA's section.
    fn open_patch_storage(
        &self,
        index: usize,
        entry: &SectionEntry,
        fs: &FsHeader,
        raw: Arc<Storage>,
    ) -> Result<Arc<Storage>> {
        let key = self.keys.ctr.get()?;
        let base = self.base.as_ref().ok_or(Error::MissingBaseContainer { section: index })?;
        let patch = fs
            .patch_info
            .ok_or_else(|| Error::format(format!("section {index} is CTR-Ex without patch info")))?;
        let (indirect, ctr_ex) = (patch.indirect, patch.aes_ctr_ex);

        if indirect.offset % 0x10 != 0 {
            return Err(Error::UnsupportedLayout(format!(
                "relocation table at unaligned offset {:#x}",
                indirect.offset
            )));
        }
        if ctr_ex.offset < indirect.offset {
            return Err(Error::format("subsection table precedes the relocation table"));
        }

        let bktr = Storage::decrypt(
            Storage::slice(&raw, indirect.offset, raw.len().saturating_sub(indirect.offset))?,
            Transform::Ctr {
                key,
                counter: nca_counter(fs.upper_counter, entry.start() + indirect.offset),
            },
        );
        let relocation_table = bktr.read_vec(0, indirect.size as usize)?;
        let subsection_table = bktr.read_vec(ctr_ex.offset - indirect.offset, ctr_ex.size as usize)?;
        let relocations =
            Arc::new(BucketTree::<RelocationEntry>::parse(&relocation_table, indirect.entry_count)?);
        let subsections =
            Arc::new(BucketTree::<SubsectionEntry>::parse(&subsection_table, ctr_ex.entry_count)?);
        tracing::debug!(
            section = index,
            relocations = relocations.len(),
            subsections = subsections.len(),
            "parsed patch tables"
        );

        let data = Storage::decrypt(
            Storage::slice(&raw, 0, indirect.offset)?,
            Transform::CtrEx {
                key,
                upper: fs.upper_counter,
                offset: entry.start(),
                subsections,
            },
        );
        let patched = Storage::concat(vec![data, bktr]);
        let original = base.open_decrypted_storage(index)?;
        Ok(Storage::indirect(original, patched, relocations))
    }

    /// The section's hash tree. Fails with `UnsupportedLayout` for sections
    /// without one.
    pub fn open_verified(&self, index: usize, policy: IntegrityCheckLevel) -> Result<IntegrityTree> {
        let (_, fs) = self.section(index)?;
        let section = self.open_decrypted_storage(index)?;
        match &fs.hash_info {
            HashInfo::Sha256(info) => IntegrityTree::sha256(
                &section,
                &info.master_hash,
                (info.hash_table.offset, info.hash_table.size),
                (info.data.offset, info.data.size),
                info.block_size as u64,
                policy,
            ),
            HashInfo::Ivfc(info) => IntegrityTree::ivfc(&section, &info.master_hash, &info.hash_levels(), policy),
            HashInfo::None => Err(Error::UnsupportedLayout(format!("section {index} has no hash tree"))),
        }
    }

    /// The section's data, verified with `policy`. Sections without a hash
    /// tree are returned decrypted.
    pub fn open_storage(&self, index: usize, policy: IntegrityCheckLevel) -> Result<Arc<Storage>> {
        let (_, fs) = self.section(index)?;
        if matches!(fs.hash_info, HashInfo::None) || policy == IntegrityCheckLevel::None {
            return self.open_unverified_data(index);
        }
        Ok(self.open_verified(index, policy)?.storage())
    }

    // Data region of the section with hash levels skipped but not checked.
    fn open_unverified_data(&self, index: usize) -> Result<Arc<Storage>> {
        let (_, fs) = self.section(index)?;
        let section = self.open_decrypted_storage(index)?;
        match &fs.hash_info {
            HashInfo::None => Ok(section),
            HashInfo::Sha256(info) => Storage::slice(&section, info.data.offset, info.data.size),
            HashInfo::Ivfc(info) => {
                let data = info
                    .data_level()
                    .ok_or_else(|| Error::format("IVFC descriptor without levels"))?;
                Storage::slice(&section, data.offset, data.size)
            }
        }
    }

    /// The section's data using the policy from [`OpenOptions`].
    pub fn open_default_storage(&self, index: usize) -> Result<Arc<Storage>> {
        self.open_storage(index, self.options.integrity_level)
    }

    pub fn open_pfs0(&self, index: usize) -> Result<PartitionFs> {
        PartitionFs::new(self.open_default_storage(index)?)
    }

    pub fn open_romfs(&self, index: usize) -> Result<RomFs> {
        RomFs::new(self.open_default_storage(index)?)
    }

    /// Open the section's filesystem according to its fs type.
    pub fn open_fs(&self, index: usize) -> Result<SectionFs> {
        let (_, fs) = self.section(index)?;
        match fs.fs_type {
            FsType::PartitionFs => self.open_pfs0(index).map(SectionFs::Partition),
            FsType::RomFs => self.open_romfs(index).map(SectionFs::RomFs),
            FsType::Unknown(t) => Err(Error::UnsupportedLayout(format!("section {index} has fs type {t}"))),
        }
    }

    /// Hash every block of the section.
    pub fn verify_section(&self, index: usize) -> Result<Validity> {
        let (_, fs) = self.section(index)?;
        if matches!(fs.hash_info, HashInfo::None) {
            return Ok(Validity::Unchecked);
        }
        let tree = self.open_verified(index, IntegrityCheckLevel::IgnoreOnInvalid)?;
        let validity = tree.validate()?;
        if validity == Validity::Invalid {
            tracing::warn!(section = index, levels = ?tree.level_validity(), "section failed verification");
        }
        Ok(validity)
    }

    /// Check the fixed-key header signature.
    pub fn verify_header_signature(&self, keys: &KeySet) -> Result<Validity> {
        self.header.verify_signature(keys)
    }
}
