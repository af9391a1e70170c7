//! eTicket - carries the encrypted title key of a rights-ID title.
//!
//! ## Layout
//! ```text
//! [0x000] SignatureType      (u32 LE, selects the signature size below)
//! [0x004] Signature + padding
//! [data]  Issuer             (0x40 bytes)
//! [+0x40] TitleKeyBlock      (0x100 bytes)
//! [+0x140] FormatVersion     (u8)
//! [+0x141] TitleKeyType      0 = common, 1 = personalized
//! [+0x142] TicketVersion     (u16 LE)
//! [+0x144] LicenseType       (u8)
//! [+0x145] KeyGeneration     (u8)
//! [+0x146] PropertyMask      (u16 LE)
//! [+0x148] Reserved          (8 bytes)
//! [+0x150] TicketId          (u64 LE)
//! [+0x158] DeviceId          (u64 LE)
//! [+0x160] RightsId          (0x10 bytes)
//! [+0x170] AccountId         (u32 LE)
//! ```
//!
//! A common ticket stores the encrypted title key in the first 0x10 bytes
//! of the key block. A personalized ticket stores it RSA-OAEP encrypted to
//! the console's eTicket key.

use std::io::{Read, Seek, SeekFrom};

use crate::crypto::rsa::decrypt_oaep;
use crate::keys::{KeySet, RightsId};
use crate::utils::{bytesa, le_u16, le_u32, le_u64, u8};
use crate::{Error, KeyKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureType {
    Rsa4096Sha1,
    Rsa2048Sha1,
    EcdsaSha1,
    Rsa4096Sha256,
    Rsa2048Sha256,
    EcdsaSha256,
}

impl SignatureType {
    fn from_raw(v: u32) -> Result<Self> {
        Ok(match v {
            0x10000 => Self::Rsa4096Sha1,
            0x10001 => Self::Rsa2048Sha1,
            0x10002 => Self::EcdsaSha1,
            0x10003 => Self::Rsa4096Sha256,
            0x10004 => Self::Rsa2048Sha256,
            0x10005 => Self::EcdsaSha256,
            x => return Err(Error::format(format!("unknown ticket signature type {x:#x}"))),
        })
    }

    /// Bytes of signature plus padding after the type field.
    fn body_size(self) -> u64 {
        match self {
            Self::Rsa4096Sha1 | Self::Rsa4096Sha256 => 0x200 + 0x3C,
            Self::Rsa2048Sha1 | Self::Rsa2048Sha256 => 0x100 + 0x3C,
            Self::EcdsaSha1 | Self::EcdsaSha256 => 0x3C + 0x40,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TitleKeyType {
    Common,
    Personalized,
}

#[derive(Debug, Clone)]
pub struct Ticket {
    pub signature_type: SignatureType,
    pub issuer: String,
    pub title_key_block: [u8; 0x100],
    pub format_version: u8,
    pub title_key_type: TitleKeyType,
    pub ticket_version: u16,
    pub license_type: u8,
    pub key_generation: u8,
    pub property_mask: u16,
    pub ticket_id: u64,
    pub device_id: u64,
    pub rights_id: RightsId,
    pub account_id: u32,
}

impl Ticket {
    pub fn parse<R: Read + Seek>(r: &mut R) -> Result<Self> {
        let base = r.stream_position()?;
        let signature_type = SignatureType::from_raw(le_u32(r)?)?;
        r.seek(SeekFrom::Start(base + 4 + signature_type.body_size()))?;

        let issuer_raw = bytesa::<0x40>(r)?;
        let end = issuer_raw.iter().position(|&b| b == 0).unwrap_or(issuer_raw.len());
        let issuer = String::from_utf8_lossy(&issuer_raw[..end]).into_owned();
        let title_key_block = bytesa::<0x100>(r)?;
        let format_version = u8(r)?;
        let title_key_type = match u8(r)? {
            0 => TitleKeyType::Common,
            1 => TitleKeyType::Personalized,
            x => return Err(Error::format(format!("unknown title key type {x}"))),
        };
        let ticket_version = le_u16(r)?;
        let license_type = u8(r)?;
        let key_generation = u8(r)?;
        let property_mask = le_u16(r)?;
        let _reserved = le_u64(r)?;
        let ticket_id = le_u64(r)?;
        let device_id = le_u64(r)?;
        let rights_id = bytesa::<0x10>(r)?;
        let account_id = le_u32(r)?;

        Ok(Self {
            signature_type,
            issuer,
            title_key_block,
            format_version,
            title_key_type,
            ticket_version,
            license_type,
            key_generation,
            property_mask,
            ticket_id,
            device_id,
            rights_id,
            account_id,
        })
    }

    /// The title key as stored for NCA use, still wrapped with the
    /// generation's titlekek.
    pub fn encrypted_title_key(&self, keys: &KeySet) -> Result<[u8; 0x10]> {
        match self.title_key_type {
            TitleKeyType::Common => {
                let mut key = [0u8; 0x10];
                key.copy_from_slice(&self.title_key_block[..0x10]);
                Ok(key)
            }
            TitleKeyType::Personalized => {
                let rsa = keys
                    .eticket_rsa_key
                    .as_ref()
                    .ok_or_else(|| Error::missing_key("eticket_rsa_keypair", KeyKind::DeviceUnique))?;
                let plain = decrypt_oaep(rsa, &self.title_key_block)?;
                plain
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::format(format!("personalized title key is {} bytes", plain.len())))
            }
        }
    }

    /// Add this ticket's title key to `keys`.
    pub fn register(&self, keys: &mut KeySet) -> Result<()> {
        let key = self.encrypted_title_key(keys)?;
        tracing::debug!(rights_id = %hex::encode(self.rights_id), "registered ticket title key");
        keys.add_title_key(self.rights_id, key);
        Ok(())
    }
}
