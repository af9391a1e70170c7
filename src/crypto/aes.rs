//! AES-128 transforms used by Switch content.
//!
//! ## AES-128-XTS
//!
//! NCA headers are AES-128-XTS encrypted:
//! * Key material: two 16-byte halves of a 32-byte key (data key, tweak key).
//! * Sector size: 0x200 bytes for headers.
//! * Tweak: the sector index stored **big-endian** (Nintendo's non-standard
//!   variant; standard XTS stores it little-endian).
//!
//! ## AES-128-CTR
//!
//! Section data uses AES-128-CTR with a 128-bit big-endian counter. The upper
//! eight bytes come from the section's FsHeader and the lower eight bytes are
//! the absolute byte offset divided by 0x10, so any block can be decrypted
//! without touching the blocks before it.
//!
//! ## AES-128-ECB / CBC
//!
//! ECB unwraps keys (key area, key derivation). CBC is only used for the
//! encrypted part of the XCI card header. Neither mode pads; callers always
//! pass whole blocks.

use aes::Aes128;
use aes::cipher::block_padding::NoPadding;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{
    BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit,
    StreamCipher, StreamCipherSeek,
};
use cmac::{Cmac, Mac};
use xts_mode::Xts128;

use crate::{Error, Result};

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 0x10;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;

fn check_blocks(len: usize) -> Result<()> {
    if len % BLOCK_SIZE != 0 {
        return Err(Error::Crypto("buffer is not a multiple of the AES block size"));
    }
    Ok(())
}

/// Decrypt `data` in place with AES-128-ECB.
pub fn ecb_decrypt(key: &[u8; 16], data: &mut [u8]) -> Result<()> {
    check_blocks(data.len())?;
    let cipher = Aes128::new(GenericArray::from_slice(key));
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }
    Ok(())
}

/// Encrypt `data` in place with AES-128-ECB.
pub fn ecb_encrypt(key: &[u8; 16], data: &mut [u8]) -> Result<()> {
    check_blocks(data.len())?;
    let cipher = Aes128::new(GenericArray::from_slice(key));
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    Ok(())
}

/// Decrypt a single block with AES-128-ECB. This is the "unwrap" step of
/// every key derivation.
pub fn ecb_decrypt_block(key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
    let mut out = *block;
    let cipher = Aes128::new(GenericArray::from_slice(key));
    cipher.decrypt_block(GenericArray::from_mut_slice(&mut out));
    out
}

/// Encrypt a single block with AES-128-ECB.
pub fn ecb_encrypt_block(key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
    let mut out = *block;
    let cipher = Aes128::new(GenericArray::from_slice(key));
    cipher.encrypt_block(GenericArray::from_mut_slice(&mut out));
    out
}

/// Decrypt `data` in place with AES-128-CBC.
pub fn cbc_decrypt(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) -> Result<()> {
    check_blocks(data.len())?;
    Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded_mut::<NoPadding>(data)
        .map_err(|_| Error::Crypto("AES-CBC decryption failed"))?;
    Ok(())
}

/// Encrypt `data` in place with AES-128-CBC.
pub fn cbc_encrypt(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) -> Result<()> {
    check_blocks(data.len())?;
    let len = data.len();
    Aes128CbcEnc::new(key.into(), iv.into())
        .encrypt_padded_mut::<NoPadding>(data, len)
        .map_err(|_| Error::Crypto("AES-CBC encryption failed"))?;
    Ok(())
}

/// Build the NCA section counter: bytes `[0..8]` are the section's upper
/// counter, bytes `[8..16]` are `offset / 0x10`, both big-endian.
pub fn nca_counter(upper: u64, offset: u64) -> [u8; 16] {
    let mut ctr = [0u8; 16];
    ctr[..8].copy_from_slice(&upper.to_be_bytes());
    ctr[8..].copy_from_slice(&(offset / BLOCK_SIZE as u64).to_be_bytes());
    ctr
}

/// Apply the AES-128-CTR keystream starting at `counter` to `data`.
///
/// CTR is symmetric; this both encrypts and decrypts.
pub fn ctr_transform(key: &[u8; 16], counter: &[u8; 16], data: &mut [u8]) {
    let mut cipher = Aes128Ctr::new(key.into(), counter.into());
    cipher.apply_keystream(data);
}

/// Apply the keystream for bytes starting at `offset` of a stream whose byte
/// 0 uses `base_counter`.
///
/// The counter for the first block is `base_counter + offset / 0x10`
/// (128-bit, wrapping) and the first `offset % 0x10` keystream bytes of that
/// block are skipped.
pub fn ctr_transform_at(key: &[u8; 16], base_counter: &[u8; 16], offset: u64, data: &mut [u8]) {
    let block = u128::from_be_bytes(*base_counter).wrapping_add((offset / BLOCK_SIZE as u64) as u128);
    let iv = block.to_be_bytes();
    let mut cipher = Aes128Ctr::new(key.into(), (&iv).into());
    cipher.seek(offset % BLOCK_SIZE as u64);
    cipher.apply_keystream(data);
}

// Nintendo stores the XTS sector number big-endian in the tweak.
fn nintendo_tweak(sector: u128) -> [u8; 16] {
    sector.to_be_bytes()
}

fn xts_cipher(key: &[u8; 32]) -> Xts128<Aes128> {
    let data_key = Aes128::new(GenericArray::from_slice(&key[..16]));
    let tweak_key = Aes128::new(GenericArray::from_slice(&key[16..]));
    Xts128::new(data_key, tweak_key)
}

fn check_sectors(len: usize, sector_size: usize) -> Result<()> {
    if sector_size == 0 || sector_size % BLOCK_SIZE != 0 || len % sector_size != 0 {
        return Err(Error::Crypto("buffer is not a whole number of XTS sectors"));
    }
    Ok(())
}

/// Decrypt whole sectors in place with AES-128-XTS.
///
/// `first_sector` is the index of the sector at the start of `data`.
pub fn xts_decrypt(key: &[u8; 32], data: &mut [u8], first_sector: u64, sector_size: usize) -> Result<()> {
    check_sectors(data.len(), sector_size)?;
    xts_cipher(key).decrypt_area(data, sector_size, first_sector as u128, nintendo_tweak);
    Ok(())
}

/// Encrypt whole sectors in place with AES-128-XTS.
pub fn xts_encrypt(key: &[u8; 32], data: &mut [u8], first_sector: u64, sector_size: usize) -> Result<()> {
    check_sectors(data.len(), sector_size)?;
    xts_cipher(key).encrypt_area(data, sector_size, first_sector as u128, nintendo_tweak);
    Ok(())
}

/// AES-CMAC of `data`.
pub fn cmac(key: &[u8; 16], data: &[u8]) -> [u8; 16] {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(key.into());
    mac.update(data);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unhex<const N: usize>(s: &str) -> [u8; N] {
        let mut out = [0u8; N];
        hex::decode_to_slice(s, &mut out).unwrap();
        out
    }

    #[test]
    fn ecb_matches_fips197_vector() {
        let key = unhex::<16>("000102030405060708090a0b0c0d0e0f");
        let pt = unhex::<16>("00112233445566778899aabbccddeeff");
        let ct = ecb_encrypt_block(&key, &pt);
        assert_eq!(ct, unhex::<16>("69c4e0d86a7b0430d8cdb78070b4c55a"));
        assert_eq!(ecb_decrypt_block(&key, &ct), pt);
    }

    #[test]
    fn ecb_rejects_partial_block() {
        let mut data = [0u8; 20];
        assert!(ecb_decrypt(&[0; 16], &mut data).is_err());
    }

    #[test]
    fn cmac_matches_rfc4493_vectors() {
        let key = unhex::<16>("2b7e151628aed2a6abf7158809cf4f3c");
        assert_eq!(cmac(&key, &[]), unhex::<16>("bb1d6929e95937287fa37d129b756746"));
        let msg = unhex::<16>("6bc1bee22e409f96e93d7e117393172a");
        assert_eq!(cmac(&key, &msg), unhex::<16>("070a16b46b4d4144f79bdd9dd04a287c"));
    }

    #[test]
    fn cbc_round_trip() {
        let key = [0x11; 16];
        let iv = [0x22; 16];
        let plain: Vec<u8> = (0..0x70u8).collect();
        let mut data = plain.clone();
        cbc_encrypt(&key, &iv, &mut data).unwrap();
        assert_ne!(data, plain);
        cbc_decrypt(&key, &iv, &mut data).unwrap();
        assert_eq!(data, plain);
    }

    #[test]
    fn ctr_random_access_matches_sequential() {
        let key = [0x5A; 16];
        let base = nca_counter(0x0000_0001_0000_0002, 0x4000);
        let plain: Vec<u8> = (0..0x400u32).map(|i| (i * 7) as u8).collect();

        let mut whole = plain.clone();
        ctr_transform(&key, &base, &mut whole);

        for k in [0u64, 1, 17, 63] {
            let start = (k * 16) as usize;
            let mut piece = plain[start..start + 16].to_vec();
            ctr_transform_at(&key, &base, k * 16, &mut piece);
            assert_eq!(piece, &whole[start..start + 16]);
        }

        // Unaligned start inside a block.
        let mut piece = plain[0x123..0x180].to_vec();
        ctr_transform_at(&key, &base, 0x123, &mut piece);
        assert_eq!(piece, &whole[0x123..0x180]);
    }

    #[test]
    fn nca_counter_layout() {
        let ctr = nca_counter(0x0102030405060708, 0x100);
        assert_eq!(&ctr[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&ctr[8..], &[0, 0, 0, 0, 0, 0, 0, 0x10]);
    }

    #[test]
    fn xts_round_trip_and_sector_dependence() {
        let key: [u8; 32] = core::array::from_fn(|i| i as u8);
        let plain = vec![0x42u8; 0x600];
        let mut data = plain.clone();
        xts_encrypt(&key, &mut data, 0, 0x200).unwrap();
        assert_ne!(data, plain);
        // Same plaintext in different sectors encrypts differently.
        assert_ne!(data[..0x200], data[0x200..0x400]);

        // Decrypting the middle sector on its own needs its own index.
        let mut middle = data[0x200..0x400].to_vec();
        xts_decrypt(&key, &mut middle, 1, 0x200).unwrap();
        assert_eq!(middle, plain[0x200..0x400]);

        xts_decrypt(&key, &mut data, 0, 0x200).unwrap();
        assert_eq!(data, plain);
    }

    #[test]
    fn xts_rejects_partial_sector() {
        let mut data = vec![0u8; 0x210];
        assert!(xts_decrypt(&[0; 32], &mut data, 0, 0x200).is_err());
    }
}
