//! Container and filesystem formats.
//!
//! Parsers follow the same conventions:
//!
//! * **Table parsers are generic over** [`std::io::Read`] + [`std::io::Seek`].
//!   `parse` reads headers only; file data is never eagerly loaded.
//! * **Storage views** ([`pfs0::PartitionFs`], [`hfs0::HashedFs`],
//!   [`romfs::RomFs`], [`xci::XciImage`]) own an
//!   [`Arc<Storage>`](crate::storage::Storage) and open file contents as
//!   windows onto it.
//! * **Crypto is resolved by the container** ([`nca::Nca`],
//!   [`package1::Package1`], [`package2::Package2`]); the views only ever
//!   see plaintext.
//!
//! | Module       | Format      | Description |
//! |--------------|-------------|-------------|
//! | [`nca`]      | NCA         | Encrypted content container with up to four sections |
//! | [`xci`]      | XCI         | Game card image; root HFS0 of partitions |
//! | [`package1`] | Package1    | PK11 first-stage boot package |
//! | [`package2`] | Package2    | PK21 kernel package |
//! | [`pfs0`]     | PFS0 / NSP  | Flat archive; NSP files and NCA ExeFS/Meta sections |
//! | [`hfs0`]     | HFS0        | Hashed archive used by game cards |
//! | [`romfs`]    | RomFS       | Directory tree stored in NCA data sections |
//! | [`cnmt`]     | CNMT        | Content meta records of a title |
//! | [`ticket`]   | Ticket      | Title key delivery |

pub mod cnmt;
pub mod hfs0;
pub mod nca;
pub mod package1;
pub mod package2;
pub mod pfs0;
pub mod romfs;
pub mod ticket;
pub mod xci;
