//! Cryptographic primitives for Nintendo Switch content.
//!
//! All functions accept already-loaded key material; key derivation and key
//! file loading are handled by [`crate::keys::KeySet`].
//!
//! ## Submodules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`aes`] | AES-128 ECB / CBC / CTR / XTS transforms and AES-CMAC |
//! | [`rsa`] | RSA-2048 PKCS#1 v1.5 and PSS verification, OAEP decryption, key recovery |
//!
//! ## Key hierarchy (brief)
//!
//! ```text
//! prod.keys
//!   └── header_key (32 bytes)
//!         ├── key1 (bytes  0–15)  ─┐  AES-XTS decrypt NCA header
//!         └── key2 (bytes 16–31)  ─┘
//!
//!   └── key_area_key_{application,ocean,system}_XX (16 bytes each)
//!         └── AES-ECB unwrap EncryptedKeyArea entries in NCA header
//!               └── section key → AES-CTR / AES-XTS decrypt section data
//!
//!   └── titlekek_XX
//!         └── AES-ECB unwrap the title key of a rights-ID NCA
//! ```

pub mod aes;
pub mod rsa;

use sha2::{Digest, Sha256};

/// SHA-256 digest of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}
