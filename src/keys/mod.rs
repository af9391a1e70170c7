//! Key management for Nintendo Switch cryptography.
//!
//! Nintendo Switch titles use a layered key derivation scheme:
//!
//! * **Seeds** are console-unique secrets read out of the hardware
//!   (`secure_boot_key`, `tsec_key`, `sd_seed`, the encrypted keyblobs).
//! * **Sources** are constants embedded in system software that are unwrapped
//!   with a parent key to produce the next key in the chain.
//! * **Master keys** (`master_key_XX`) are the root of everything shared
//!   between consoles. There is one per firmware generation.
//! * **Key area encryption keys** (KAEK) are derived per content type
//!   (Application / Ocean / System) from the master key.
//! * **Title keys** decrypt rights-ID NCAs; they are wrapped with the
//!   generation's `titlekek`.
//! * **Header key** decrypts the AES-XTS NCA header.
//!
//! [`KeySet`] is a plain value owned by the caller. Keys are imported with
//! [`KeySet::load_prod_keys`] / [`KeySet::load_title_keys`] (see
//! [`file`]) and completed with [`KeySet::derive_keys`] (see [`derive`]).
//! Every slot starts zero-filled; all-zero means "unknown".
//!
//! ## Key file format
//! Key files are simple `name = hex_value` text files, one entry per line,
//! comments prefixed with `;`.

pub mod derive;
pub mod file;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use crate::crypto::rsa::RsaKeyParams;
use crate::{Error, KeyKind, Result};

/// Number of master key generations understood by this library.
pub const MAX_KEY_GENERATION: usize = 0x20;

/// Generations that shipped legacy (package1 keyblob) key material.
pub const KEYBLOB_GENERATIONS: usize = 6;

/// A fixed-size key buffer. All zeroes means the key is unknown.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct KeyBuf<const N: usize>(pub [u8; N]);

/// 128-bit AES key.
pub type AesKey = KeyBuf<0x10>;
/// 256-bit AES-XTS key (data key followed by tweak key).
pub type AesXtsKey = KeyBuf<0x20>;
/// CMAC + counter + encrypted keyblob, as stored in package1.
pub type EncryptedKeyblob = KeyBuf<0xB0>;
/// Decrypted keyblob holding the master kek and package1 key.
pub type Keyblob = KeyBuf<0x90>;
/// RSA-2048 public modulus.
pub type RsaModulus = KeyBuf<0x100>;

impl<const N: usize> KeyBuf<N> {
    /// Length in bytes.
    pub const LEN: usize = N;

    pub const fn new(bytes: [u8; N]) -> Self {
        Self(bytes)
    }

    /// Returns true if the key is unknown (all zeroes).
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// `Some(bytes)` if the key is known.
    pub fn get(&self) -> Option<&[u8; N]> {
        if self.is_empty() { None } else { Some(&self.0) }
    }

    pub fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }
}

impl<const N: usize> Default for KeyBuf<N> {
    fn default() -> Self {
        Self([0u8; N])
    }
}

impl<const N: usize> fmt::Debug for KeyBuf<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "<empty>")
        } else {
            write!(f, "{}", hex::encode_upper(self.0))
        }
    }
}

/// 16-byte rights ID binding an NCA to a title key.
pub type RightsId = [u8; 16];

/// Key area encryption key index (determines which KAEK derivation chain is
/// used for a particular NCA).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KaekIndex {
    /// Application content (most games).
    Application = 0,
    /// Ocean content (game-card specific).
    Ocean = 1,
    /// System content (OS modules).
    System = 2,
}

impl KaekIndex {
    /// Key-file name stem of this index.
    pub fn name(self) -> &'static str {
        match self {
            Self::Application => "application",
            Self::Ocean => "ocean",
            Self::System => "system",
        }
    }
}

impl TryFrom<u8> for KaekIndex {
    type Error = Error;
    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::Application),
            1 => Ok(Self::Ocean),
            2 => Ok(Self::System),
            _ => Err(Error::format(format!("invalid key area key index {v}"))),
        }
    }
}

/// What a key slot is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    /// Console-supplied secret material.
    Seed,
    /// Constant unwrapped by a parent key.
    Source,
    /// Key used only to unwrap another key.
    Kek,
    /// Working key produced by derivation.
    Derived,
    /// Console-unique key; omitted from exports unless asked for.
    DeviceUnique,
}

/// Identifies a slot (or a generation-indexed family of slots) in a
/// [`KeySet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyId {
    SecureBootKey,
    TsecKey,
    SdSeed,
    DeviceKey,
    KeyblobKeySource,
    KeyblobKey,
    KeyblobMacKeySource,
    KeyblobMacKey,
    EncryptedKeyblob,
    Keyblob,
    TsecRootKey,
    MasterKekSource,
    MarikoKek,
    MarikoMasterKekSource,
    MasterKek,
    MasterKeySource,
    MasterKey,
    Package1Key,
    Package2KeySource,
    Package2Key,
    PerConsoleKeySource,
    RetailSpecificAesKeySource,
    AesKekGenerationSource,
    AesKeyGenerationSource,
    KeyAreaKeySource(KaekIndex),
    KeyAreaKey(KaekIndex),
    TitlekekSource,
    Titlekek,
    HeaderKekSource,
    HeaderKeySource,
    HeaderKey,
    SdCardKekSource,
    SdCardKeySource(SdKeyType),
    SdCardKey(SdKeyType),
    SaveMacKekSource,
    SaveMacKeySource,
    SaveMacKey,
    BisKekSource,
    BisKeySource,
    BisKey,
    XciHeaderKey,
    NcaHeaderFixedKeyModulus,
    AcidFixedKeyModulus,
    Package2FixedKeyModulus,
}

/// The three SD-card key purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SdKeyType {
    Save = 0,
    Nca = 1,
    CustomStorage = 2,
}

/// Static description of a key slot family.
#[derive(Debug, Clone, Copy)]
pub struct KeyInfo {
    /// Key-file name. Indexed slots append `_XX` (two hex digits).
    pub name: &'static str,
    pub id: KeyId,
    pub purpose: KeyPurpose,
    /// Number of indexed slots, or `None` for a single slot.
    pub count: Option<usize>,
    /// Slot size in bytes.
    pub len: usize,
}

const fn single(name: &'static str, id: KeyId, purpose: KeyPurpose, len: usize) -> KeyInfo {
    KeyInfo {
        name,
        id,
        purpose,
        count: None,
        len,
    }
}

const fn indexed(name: &'static str, id: KeyId, purpose: KeyPurpose, count: usize, len: usize) -> KeyInfo {
    KeyInfo {
        name,
        id,
        purpose,
        count: Some(count),
        len,
    }
}

use KeyId as K;
use KeyPurpose as P;

const G: usize = MAX_KEY_GENERATION;

/// Every key slot known to the library, in key-file order.
pub static KEY_TABLE: &[KeyInfo] = &[
    single("secure_boot_key", K::SecureBootKey, P::DeviceUnique, 0x10),
    single("tsec_key", K::TsecKey, P::DeviceUnique, 0x10),
    single("sd_seed", K::SdSeed, P::DeviceUnique, 0x10),
    single("device_key", K::DeviceKey, P::DeviceUnique, 0x10),
    indexed("keyblob_key_source", K::KeyblobKeySource, P::Source, KEYBLOB_GENERATIONS, 0x10),
    indexed("keyblob_key", K::KeyblobKey, P::DeviceUnique, KEYBLOB_GENERATIONS, 0x10),
    single("keyblob_mac_key_source", K::KeyblobMacKeySource, P::Source, 0x10),
    indexed("keyblob_mac_key", K::KeyblobMacKey, P::DeviceUnique, KEYBLOB_GENERATIONS, 0x10),
    indexed("encrypted_keyblob", K::EncryptedKeyblob, P::DeviceUnique, KEYBLOB_GENERATIONS, 0xB0),
    indexed("keyblob", K::Keyblob, P::Derived, KEYBLOB_GENERATIONS, 0x90),
    indexed("tsec_root_key", K::TsecRootKey, P::Seed, G - KEYBLOB_GENERATIONS, 0x10),
    indexed("master_kek_source", K::MasterKekSource, P::Source, G, 0x10),
    single("mariko_kek", K::MarikoKek, P::Kek, 0x10),
    indexed("mariko_master_kek_source", K::MarikoMasterKekSource, P::Source, G, 0x10),
    indexed("master_kek", K::MasterKek, P::Kek, G, 0x10),
    single("master_key_source", K::MasterKeySource, P::Source, 0x10),
    indexed("master_key", K::MasterKey, P::Derived, G, 0x10),
    indexed("package1_key", K::Package1Key, P::Derived, G, 0x10),
    single("package2_key_source", K::Package2KeySource, P::Source, 0x10),
    indexed("package2_key", K::Package2Key, P::Derived, G, 0x10),
    single("per_console_key_source", K::PerConsoleKeySource, P::Source, 0x10),
    single("retail_specific_aes_key_source", K::RetailSpecificAesKeySource, P::Source, 0x10),
    single("aes_kek_generation_source", K::AesKekGenerationSource, P::Source, 0x10),
    single("aes_key_generation_source", K::AesKeyGenerationSource, P::Source, 0x10),
    single("key_area_key_application_source", K::KeyAreaKeySource(KaekIndex::Application), P::Source, 0x10),
    single("key_area_key_ocean_source", K::KeyAreaKeySource(KaekIndex::Ocean), P::Source, 0x10),
    single("key_area_key_system_source", K::KeyAreaKeySource(KaekIndex::System), P::Source, 0x10),
    indexed("key_area_key_application", K::KeyAreaKey(KaekIndex::Application), P::Derived, G, 0x10),
    indexed("key_area_key_ocean", K::KeyAreaKey(KaekIndex::Ocean), P::Derived, G, 0x10),
    indexed("key_area_key_system", K::KeyAreaKey(KaekIndex::System), P::Derived, G, 0x10),
    single("titlekek_source", K::TitlekekSource, P::Source, 0x10),
    indexed("titlekek", K::Titlekek, P::Kek, G, 0x10),
    single("header_kek_source", K::HeaderKekSource, P::Source, 0x10),
    single("header_key_source", K::HeaderKeySource, P::Source, 0x20),
    single("header_key", K::HeaderKey, P::Derived, 0x20),
    single("sd_card_kek_source", K::SdCardKekSource, P::Source, 0x10),
    single("sd_card_save_key_source", K::SdCardKeySource(SdKeyType::Save), P::Source, 0x20),
    single("sd_card_nca_key_source", K::SdCardKeySource(SdKeyType::Nca), P::Source, 0x20),
    single("sd_card_custom_storage_key_source", K::SdCardKeySource(SdKeyType::CustomStorage), P::Source, 0x20),
    single("sd_card_save_key", K::SdCardKey(SdKeyType::Save), P::DeviceUnique, 0x20),
    single("sd_card_nca_key", K::SdCardKey(SdKeyType::Nca), P::DeviceUnique, 0x20),
    single("sd_card_custom_storage_key", K::SdCardKey(SdKeyType::CustomStorage), P::DeviceUnique, 0x20),
    single("save_mac_kek_source", K::SaveMacKekSource, P::Source, 0x10),
    single("save_mac_key_source", K::SaveMacKeySource, P::Source, 0x10),
    single("save_mac_key", K::SaveMacKey, P::DeviceUnique, 0x10),
    single("bis_kek_source", K::BisKekSource, P::Source, 0x10),
    indexed("bis_key_source", K::BisKeySource, P::Source, 4, 0x20),
    indexed("bis_key", K::BisKey, P::DeviceUnique, 4, 0x20),
    single("xci_header_key", K::XciHeaderKey, P::Seed, 0x10),
    indexed("nca_hdr_fixed_key_modulus", K::NcaHeaderFixedKeyModulus, P::Seed, 2, 0x100),
    indexed("acid_fixed_key_modulus", K::AcidFixedKeyModulus, P::Seed, 2, 0x100),
    single("package2_fixed_key_modulus", K::Package2FixedKeyModulus, P::Seed, 0x100),
];

/// Look up a key-file name, returning its table entry and slot index.
///
/// Indexed families take a `_XX` suffix of exactly two hex digits.
pub fn lookup_key_name(name: &str) -> Option<(&'static KeyInfo, usize)> {
    let name = name.trim();
    for info in KEY_TABLE {
        match info.count {
            None if name.eq_ignore_ascii_case(info.name) => return Some((info, 0)),
            Some(count) => {
                let Some(rest) = strip_prefix_ignore_case(name, info.name) else {
                    continue;
                };
                let Some(idx) = rest.strip_prefix('_') else {
                    continue;
                };
                if idx.len() == 2
                    && let Ok(i) = usize::from_str_radix(idx, 16)
                    && i < count
                {
                    return Some((info, i));
                }
            }
            None => {}
        }
    }
    None
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s.is_char_boundary(prefix.len()) && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

/// Key-file name of a slot, e.g. `master_key_0a`.
pub fn slot_name(id: KeyId, index: usize) -> String {
    let info = KEY_TABLE.iter().find(|k| k.id == id);
    match info {
        Some(KeyInfo { name, count: Some(_), .. }) => format!("{name}_{index:02x}"),
        Some(KeyInfo { name, .. }) => (*name).to_string(),
        None => format!("{id:?}"),
    }
}

/// All keys needed to decrypt Switch content.
///
/// Unknown keys are zero-filled; the crypto and container layers return
/// [`Error::MissingKey`] naming the slot rather than silently producing
/// garbage output.
#[derive(Debug, Clone)]
pub struct KeySet {
    pub secure_boot_key: AesKey,
    pub tsec_key: AesKey,
    pub sd_seed: AesKey,
    pub device_key: AesKey,

    pub keyblob_key_sources: [AesKey; KEYBLOB_GENERATIONS],
    pub keyblob_keys: [AesKey; KEYBLOB_GENERATIONS],
    pub keyblob_mac_key_source: AesKey,
    pub keyblob_mac_keys: [AesKey; KEYBLOB_GENERATIONS],
    pub encrypted_keyblobs: [EncryptedKeyblob; KEYBLOB_GENERATIONS],
    pub keyblobs: [Keyblob; KEYBLOB_GENERATIONS],

    /// Indexed from generation 6: `tsec_root_keys[0]` serves generation 6.
    pub tsec_root_keys: [AesKey; MAX_KEY_GENERATION - KEYBLOB_GENERATIONS],
    pub master_kek_sources: [AesKey; MAX_KEY_GENERATION],
    pub mariko_kek: AesKey,
    pub mariko_master_kek_sources: [AesKey; MAX_KEY_GENERATION],
    pub master_keks: [AesKey; MAX_KEY_GENERATION],
    pub master_key_source: AesKey,
    pub master_keys: [AesKey; MAX_KEY_GENERATION],

    pub package1_keys: [AesKey; MAX_KEY_GENERATION],
    pub package2_key_source: AesKey,
    pub package2_keys: [AesKey; MAX_KEY_GENERATION],

    pub per_console_key_source: AesKey,
    pub retail_specific_aes_key_source: AesKey,
    pub aes_kek_generation_source: AesKey,
    pub aes_key_generation_source: AesKey,

    /// Indexed by [`KaekIndex`].
    pub key_area_key_sources: [AesKey; 3],
    /// `key_area_keys[index][generation]`.
    pub key_area_keys: [[AesKey; MAX_KEY_GENERATION]; 3],

    pub titlekek_source: AesKey,
    pub titlekeks: [AesKey; MAX_KEY_GENERATION],

    pub header_kek_source: AesKey,
    pub header_key_source: AesXtsKey,
    /// AES-XTS key pair (two 16-byte keys) used to decrypt NCA headers.
    pub header_key: AesXtsKey,

    pub sd_card_kek_source: AesKey,
    /// Indexed by [`SdKeyType`].
    pub sd_card_key_sources: [AesXtsKey; 3],
    pub sd_card_keys: [AesXtsKey; 3],

    pub save_mac_kek_source: AesKey,
    pub save_mac_key_source: AesKey,
    pub save_mac_key: AesKey,

    pub bis_kek_source: AesKey,
    pub bis_key_sources: [AesXtsKey; 4],
    pub bis_keys: [AesXtsKey; 4],

    /// AES-CBC key for the encrypted part of the XCI card header.
    pub xci_header_key: AesKey,

    pub nca_hdr_fixed_key_moduli: [RsaModulus; 2],
    pub acid_fixed_key_moduli: [RsaModulus; 2],
    pub package2_fixed_key_modulus: RsaModulus,

    /// Encrypted title keys, keyed by rights ID.
    pub title_keys: HashMap<RightsId, AesKey>,

    /// Device eTicket RSA key used to unwrap personalized tickets.
    pub eticket_rsa_key: Option<RsaKeyParams>,
}

impl Default for KeySet {
    fn default() -> Self {
        Self {
            secure_boot_key: AesKey::default(),
            tsec_key: AesKey::default(),
            sd_seed: AesKey::default(),
            device_key: AesKey::default(),
            keyblob_key_sources: Default::default(),
            keyblob_keys: Default::default(),
            keyblob_mac_key_source: AesKey::default(),
            keyblob_mac_keys: Default::default(),
            encrypted_keyblobs: Default::default(),
            keyblobs: Default::default(),
            tsec_root_keys: [AesKey::default(); MAX_KEY_GENERATION - KEYBLOB_GENERATIONS],
            master_kek_sources: [AesKey::default(); MAX_KEY_GENERATION],
            mariko_kek: AesKey::default(),
            mariko_master_kek_sources: [AesKey::default(); MAX_KEY_GENERATION],
            master_keks: [AesKey::default(); MAX_KEY_GENERATION],
            master_key_source: AesKey::default(),
            master_keys: [AesKey::default(); MAX_KEY_GENERATION],
            package1_keys: [AesKey::default(); MAX_KEY_GENERATION],
            package2_key_source: AesKey::default(),
            package2_keys: [AesKey::default(); MAX_KEY_GENERATION],
            per_console_key_source: AesKey::default(),
            retail_specific_aes_key_source: AesKey::default(),
            aes_kek_generation_source: AesKey::default(),
            aes_key_generation_source: AesKey::default(),
            key_area_key_sources: Default::default(),
            key_area_keys: [[AesKey::default(); MAX_KEY_GENERATION]; 3],
            titlekek_source: AesKey::default(),
            titlekeks: [AesKey::default(); MAX_KEY_GENERATION],
            header_kek_source: AesKey::default(),
            header_key_source: AesXtsKey::default(),
            header_key: AesXtsKey::default(),
            sd_card_kek_source: AesKey::default(),
            sd_card_key_sources: Default::default(),
            sd_card_keys: Default::default(),
            save_mac_kek_source: AesKey::default(),
            save_mac_key_source: AesKey::default(),
            save_mac_key: AesKey::default(),
            bis_kek_source: AesKey::default(),
            bis_key_sources: Default::default(),
            bis_keys: Default::default(),
            xci_header_key: AesKey::default(),
            nca_hdr_fixed_key_moduli: Default::default(),
            acid_fixed_key_moduli: Default::default(),
            package2_fixed_key_modulus: RsaModulus::default(),
            title_keys: HashMap::new(),
            eticket_rsa_key: None,
        }
    }
}

impl KeySet {
    /// Create an empty key set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw bytes of a slot. Out-of-range indices yield `None`.
    pub fn slot(&self, id: KeyId, index: usize) -> Option<&[u8]> {
        Some(match id {
            K::SecureBootKey => &self.secure_boot_key.0[..],
            K::TsecKey => &self.tsec_key.0[..],
            K::SdSeed => &self.sd_seed.0[..],
            K::DeviceKey => &self.device_key.0[..],
            K::KeyblobKeySource => &self.keyblob_key_sources.get(index)?.0[..],
            K::KeyblobKey => &self.keyblob_keys.get(index)?.0[..],
            K::KeyblobMacKeySource => &self.keyblob_mac_key_source.0[..],
            K::KeyblobMacKey => &self.keyblob_mac_keys.get(index)?.0[..],
            K::EncryptedKeyblob => &self.encrypted_keyblobs.get(index)?.0[..],
            K::Keyblob => &self.keyblobs.get(index)?.0[..],
            K::TsecRootKey => &self.tsec_root_keys.get(index)?.0[..],
            K::MasterKekSource => &self.master_kek_sources.get(index)?.0[..],
            K::MarikoKek => &self.mariko_kek.0[..],
            K::MarikoMasterKekSource => &self.mariko_master_kek_sources.get(index)?.0[..],
            K::MasterKek => &self.master_keks.get(index)?.0[..],
            K::MasterKeySource => &self.master_key_source.0[..],
            K::MasterKey => &self.master_keys.get(index)?.0[..],
            K::Package1Key => &self.package1_keys.get(index)?.0[..],
            K::Package2KeySource => &self.package2_key_source.0[..],
            K::Package2Key => &self.package2_keys.get(index)?.0[..],
            K::PerConsoleKeySource => &self.per_console_key_source.0[..],
            K::RetailSpecificAesKeySource => &self.retail_specific_aes_key_source.0[..],
            K::AesKekGenerationSource => &self.aes_kek_generation_source.0[..],
            K::AesKeyGenerationSource => &self.aes_key_generation_source.0[..],
            K::KeyAreaKeySource(i) => &self.key_area_key_sources[i as usize].0[..],
            K::KeyAreaKey(i) => &self.key_area_keys[i as usize].get(index)?.0[..],
            K::TitlekekSource => &self.titlekek_source.0[..],
            K::Titlekek => &self.titlekeks.get(index)?.0[..],
            K::HeaderKekSource => &self.header_kek_source.0[..],
            K::HeaderKeySource => &self.header_key_source.0[..],
            K::HeaderKey => &self.header_key.0[..],
            K::SdCardKekSource => &self.sd_card_kek_source.0[..],
            K::SdCardKeySource(t) => &self.sd_card_key_sources[t as usize].0[..],
            K::SdCardKey(t) => &self.sd_card_keys[t as usize].0[..],
            K::SaveMacKekSource => &self.save_mac_kek_source.0[..],
            K::SaveMacKeySource => &self.save_mac_key_source.0[..],
            K::SaveMacKey => &self.save_mac_key.0[..],
            K::BisKekSource => &self.bis_kek_source.0[..],
            K::BisKeySource => &self.bis_key_sources.get(index)?.0[..],
            K::BisKey => &self.bis_keys.get(index)?.0[..],
            K::XciHeaderKey => &self.xci_header_key.0[..],
            K::NcaHeaderFixedKeyModulus => &self.nca_hdr_fixed_key_moduli.get(index)?.0[..],
            K::AcidFixedKeyModulus => &self.acid_fixed_key_moduli.get(index)?.0[..],
            K::Package2FixedKeyModulus => &self.package2_fixed_key_modulus.0[..],
        })
    }

    /// Mutable raw bytes of a slot. Out-of-range indices yield `None`.
    pub fn slot_mut(&mut self, id: KeyId, index: usize) -> Option<&mut [u8]> {
        Some(match id {
            K::SecureBootKey => &mut self.secure_boot_key.0[..],
            K::TsecKey => &mut self.tsec_key.0[..],
            K::SdSeed => &mut self.sd_seed.0[..],
            K::DeviceKey => &mut self.device_key.0[..],
            K::KeyblobKeySource => &mut self.keyblob_key_sources.get_mut(index)?.0[..],
            K::KeyblobKey => &mut self.keyblob_keys.get_mut(index)?.0[..],
            K::KeyblobMacKeySource => &mut self.keyblob_mac_key_source.0[..],
            K::KeyblobMacKey => &mut self.keyblob_mac_keys.get_mut(index)?.0[..],
            K::EncryptedKeyblob => &mut self.encrypted_keyblobs.get_mut(index)?.0[..],
            K::Keyblob => &mut self.keyblobs.get_mut(index)?.0[..],
            K::TsecRootKey => &mut self.tsec_root_keys.get_mut(index)?.0[..],
            K::MasterKekSource => &mut self.master_kek_sources.get_mut(index)?.0[..],
            K::MarikoKek => &mut self.mariko_kek.0[..],
            K::MarikoMasterKekSource => &mut self.mariko_master_kek_sources.get_mut(index)?.0[..],
            K::MasterKek => &mut self.master_keks.get_mut(index)?.0[..],
            K::MasterKeySource => &mut self.master_key_source.0[..],
            K::MasterKey => &mut self.master_keys.get_mut(index)?.0[..],
            K::Package1Key => &mut self.package1_keys.get_mut(index)?.0[..],
            K::Package2KeySource => &mut self.package2_key_source.0[..],
            K::Package2Key => &mut self.package2_keys.get_mut(index)?.0[..],
            K::PerConsoleKeySource => &mut self.per_console_key_source.0[..],
            K::RetailSpecificAesKeySource => &mut self.retail_specific_aes_key_source.0[..],
            K::AesKekGenerationSource => &mut self.aes_kek_generation_source.0[..],
            K::AesKeyGenerationSource => &mut self.aes_key_generation_source.0[..],
            K::KeyAreaKeySource(i) => &mut self.key_area_key_sources[i as usize].0[..],
            K::KeyAreaKey(i) => &mut self.key_area_keys[i as usize].get_mut(index)?.0[..],
            K::TitlekekSource => &mut self.titlekek_source.0[..],
            K::Titlekek => &mut self.titlekeks.get_mut(index)?.0[..],
            K::HeaderKekSource => &mut self.header_kek_source.0[..],
            K::HeaderKeySource => &mut self.header_key_source.0[..],
            K::HeaderKey => &mut self.header_key.0[..],
            K::SdCardKekSource => &mut self.sd_card_kek_source.0[..],
            K::SdCardKeySource(t) => &mut self.sd_card_key_sources[t as usize].0[..],
            K::SdCardKey(t) => &mut self.sd_card_keys[t as usize].0[..],
            K::SaveMacKekSource => &mut self.save_mac_kek_source.0[..],
            K::SaveMacKeySource => &mut self.save_mac_key_source.0[..],
            K::SaveMacKey => &mut self.save_mac_key.0[..],
            K::BisKekSource => &mut self.bis_kek_source.0[..],
            K::BisKeySource => &mut self.bis_key_sources.get_mut(index)?.0[..],
            K::BisKey => &mut self.bis_keys.get_mut(index)?.0[..],
            K::XciHeaderKey => &mut self.xci_header_key.0[..],
            K::NcaHeaderFixedKeyModulus => &mut self.nca_hdr_fixed_key_moduli.get_mut(index)?.0[..],
            K::AcidFixedKeyModulus => &mut self.acid_fixed_key_moduli.get_mut(index)?.0[..],
            K::Package2FixedKeyModulus => &mut self.package2_fixed_key_modulus.0[..],
        })
    }

    /// Header key, or [`Error::MissingKey`] naming `header_key`.
    pub fn header_key(&self) -> Result<&[u8; 0x20]> {
        self.header_key
            .get()
            .ok_or_else(|| Error::missing_key("header_key", KeyKind::Common))
    }

    /// Look up the KAEK for the given index and key generation index.
    pub fn key_area_key(&self, index: KaekIndex, generation: usize) -> Result<&[u8; 0x10]> {
        self.key_area_keys[index as usize]
            .get(generation)
            .and_then(AesKey::get)
            .ok_or_else(|| {
                Error::missing_key(
                    format!("key_area_key_{}_{generation:02x}", index.name()),
                    KeyKind::Common,
                )
            })
    }

    /// Look up the titlekek for a key generation index.
    pub fn titlekek(&self, generation: usize) -> Result<&[u8; 0x10]> {
        self.titlekeks
            .get(generation)
            .and_then(AesKey::get)
            .ok_or_else(|| Error::missing_key(format!("titlekek_{generation:02x}"), KeyKind::Common))
    }

    /// Look up an encrypted title key by rights ID.
    pub fn title_key(&self, rights_id: &RightsId) -> Result<&[u8; 0x10]> {
        self.title_keys
            .get(rights_id)
            .and_then(AesKey::get)
            .ok_or_else(|| Error::missing_key(hex::encode_upper(rights_id), KeyKind::TitleKey))
    }

    /// Register an encrypted title key (e.g. extracted from a ticket).
    pub fn add_title_key(&mut self, rights_id: RightsId, key: [u8; 0x10]) {
        self.title_keys.insert(rights_id, AesKey::new(key));
    }

    /// Recover and store the eTicket RSA key from its modulus and private
    /// exponent.
    pub fn set_eticket_rsa_key(&mut self, modulus: &[u8], private_exponent: &[u8]) -> Result<()> {
        let e = crate::crypto::rsa::PUBLIC_EXPONENT.to_be_bytes();
        let params = crate::crypto::rsa::recover_key(modulus, &e, private_exponent)?;
        self.eticket_rsa_key = Some(params);
        Ok(())
    }
}

/// Directory holding `prod.keys` / `title.keys` by convention
/// (`$HOME/.switch`).
pub fn default_keys_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".switch"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_resolves_single_and_indexed_names() {
        let (info, idx) = lookup_key_name("header_key").unwrap();
        assert_eq!(info.id, KeyId::HeaderKey);
        assert_eq!(idx, 0);

        let (info, idx) = lookup_key_name("master_key_0a").unwrap();
        assert_eq!(info.id, KeyId::MasterKey);
        assert_eq!(idx, 10);

        let (info, idx) = lookup_key_name("KEY_AREA_KEY_OCEAN_02").unwrap();
        assert_eq!(info.id, KeyId::KeyAreaKey(KaekIndex::Ocean));
        assert_eq!(idx, 2);

        // Prefix of another name must not match the indexed family.
        let (info, _) = lookup_key_name("keyblob_key_source_03").unwrap();
        assert_eq!(info.id, KeyId::KeyblobKeySource);

        assert!(lookup_key_name("keyblob_key_06").is_none());
        assert!(lookup_key_name("master_key_1").is_none());
        assert!(lookup_key_name("not_a_key").is_none());
    }

    #[test]
    fn every_table_entry_has_a_slot_of_matching_size() {
        let mut keys = KeySet::new();
        for info in KEY_TABLE {
            for i in 0..info.count.unwrap_or(1) {
                assert_eq!(keys.slot(info.id, i).unwrap().len(), info.len, "{}", info.name);
                assert_eq!(keys.slot_mut(info.id, i).unwrap().len(), info.len, "{}", info.name);
            }
            assert!(keys.slot(info.id, info.count.unwrap_or(1) + 40).is_none() || info.count.is_none());
        }
    }

    #[test]
    fn missing_keys_are_named() {
        let keys = KeySet::new();
        match keys.titlekek(3) {
            Err(Error::MissingKey { name, kind }) => {
                assert_eq!(name, "titlekek_03");
                assert_eq!(kind, KeyKind::Common);
            }
            other => panic!("unexpected {other:?}"),
        }
        match keys.key_area_key(KaekIndex::System, 0x10) {
            Err(Error::MissingKey { name, .. }) => assert_eq!(name, "key_area_key_system_10"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(slot_name(KeyId::Package2Key, 5), "package2_key_05");
        assert_eq!(slot_name(KeyId::HeaderKey, 0), "header_key");
    }
}
