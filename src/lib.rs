//! **nxvault** - key derivation, decryption and verified reads for Switch
//! content containers.
//!
//! A [`KeySet`] is loaded from key files and completed with
//! [`KeySet::derive_keys`]. Containers are opened over a [`Storage`] and
//! hand back each section as another [`Storage`]: decrypted on read,
//! cached, and checked against its hash tree.
//!
//! ```no_run
//! use std::fs::File;
//! use std::io::BufReader;
//!
//! use nxvault::formats::nca::Nca;
//! use nxvault::{IntegrityCheckLevel, KeySet, Storage};
//!
//! # fn main() -> nxvault::Result<()> {
//! let mut keys = KeySet::new();
//! keys.load_prod_keys(BufReader::new(File::open("prod.keys")?))?;
//! keys.derive_keys();
//!
//! let nca = Nca::open(&keys, Storage::from_reader(File::open("program.nca")?)?)?;
//! let data = nca.open_storage(1, IntegrityCheckLevel::ErrorOnInvalid)?;
//! let first_block = data.read_vec(0, 0x200)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//! | Module | Contents |
//! |--------|----------|
//! | [`crypto`]    | AES (ECB, CBC, CTR, XTS, CMAC), SHA-256, RSA |
//! | [`keys`]      | Key slots, key files, derivation |
//! | [`storage`]   | Composable read-only storages |
//! | [`integrity`] | Hash-tree verification |
//! | [`formats`]   | NCA, XCI, Package1/2 and the filesystem views |
//! | [`config`]    | Open options |

pub mod config;
pub mod crypto;
pub mod error;
pub mod formats;
pub mod integrity;
pub mod keys;
pub mod storage;
pub mod utils;

pub use config::OpenOptions;
pub use error::{Error, KeyKind, Result};
pub use integrity::{IntegrityCheckLevel, Validity};
pub use keys::KeySet;
pub use storage::Storage;
