//! HFS0 (SHA-256 FileSystem) - hashed archive used on game cards.
//!
//! The root HFS0 of an XCI lists the sub-partitions (`update`, `normal`,
//! `logo`, `secure`), each of which is itself an HFS0.
//!
//! ## Layout
//! ```text
//! [0x00] Magic "HFS0"              (4 bytes)
//! [0x04] FileCount                 (u32 LE)
//! [0x08] StringTableSize           (u32 LE)
//! [0x0C] Reserved                  (4 bytes)
//! [0x10] EntryTable                (FileCount × 0x40 bytes)
//! [0x10 + FileCount×0x40]
//!        StringTable               (StringTableSize bytes)
//! [(after StringTable)]
//!        FileData
//! ```
//!
//! ## File Entry (0x40 bytes)
//! ```text
//! [0x00] DataOffset - relative to the data section start (u64 LE)
//! [0x08] DataSize   (u64 LE)
//! [0x10] NameOffset (u32 LE)
//! [0x14] HashedRegionSize - leading bytes covered by the hash (u32 LE)
//! [0x18] Reserved   (8 bytes)
//! [0x20] SHA-256 of the first HashedRegionSize bytes
//! ```

use std::io::{Read, Seek};
use std::sync::Arc;

use crate::Result;
use crate::crypto::sha256;
use crate::integrity::Validity;
use crate::storage::{Storage, StorageReader};
use crate::utils::{bytesa, bytesv, le_u32, le_u64, magic, null_string};

const ENTRY_SIZE: u64 = 0x40;

/// Parsed HFS0 container (metadata only).
#[derive(Debug, Clone)]
pub struct Hfs0 {
    pub files: Vec<Hfs0File>,
    /// Offset where file data begins, relative to the reader origin.
    pub data_offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hfs0File {
    pub name: String,
    /// Offset relative to the HFS0 data section.
    pub offset: u64,
    pub size: u64,
    /// Number of leading bytes covered by `sha256`.
    pub hashed_region_size: u32,
    pub sha256: [u8; 32],
}

impl Hfs0 {
    /// Parse an HFS0 table from `r`, positioned at the magic.
    pub fn parse<R: Read + Seek>(r: &mut R) -> Result<Self> {
        let base = r.stream_position()?;

        magic(r, b"HFS0")?;
        let file_count = le_u32(r)?;
        let string_table_size = le_u32(r)?;
        let _reserved = le_u32(r)?;

        let mut entries = Vec::with_capacity(file_count.min(0x1000) as usize);
        for _ in 0..file_count {
            let offset = le_u64(r)?;
            let size = le_u64(r)?;
            let name_offset = le_u32(r)?;
            let hashed_region_size = le_u32(r)?;
            let _reserved = le_u64(r)?;
            let sha256 = bytesa::<32>(r)?;
            entries.push((offset, size, name_offset, hashed_region_size, sha256));
        }

        let string_table = bytesv(r, string_table_size as usize)?;
        let mut files = Vec::with_capacity(entries.len());
        for (offset, size, name_offset, hashed_region_size, sha256) in entries {
            files.push(Hfs0File {
                name: null_string(&string_table, name_offset as usize)?,
                offset,
                size,
                hashed_region_size,
                sha256,
            });
        }

        let data_offset = base + 0x10 + file_count as u64 * ENTRY_SIZE + string_table_size as u64;
        Ok(Self { files, data_offset })
    }

    pub fn get_file_by_name(&self, name: &str) -> Option<&Hfs0File> {
        self.files.iter().find(|f| f.name == name)
    }
}

/// An HFS0 read out of a [`Storage`].
#[derive(Debug, Clone)]
pub struct HashedFs {
    storage: Arc<Storage>,
    pub hfs0: Hfs0,
}

impl HashedFs {
    pub fn new(storage: Arc<Storage>) -> Result<Self> {
        let mut reader = StorageReader::new(Arc::clone(&storage));
        let hfs0 = Hfs0::parse(&mut reader)?;
        Ok(Self { storage, hfs0 })
    }

    pub fn files(&self) -> impl Iterator<Item = &Hfs0File> {
        self.hfs0.files.iter()
    }

    pub fn get_file_by_name(&self, name: &str) -> Option<&Hfs0File> {
        self.hfs0.get_file_by_name(name)
    }

    pub fn open_file(&self, file: &Hfs0File) -> Result<Arc<Storage>> {
        Storage::slice(&self.storage, self.hfs0.data_offset + file.offset, file.size)
    }

    /// Hash the covered prefix of `file` and compare it with the table.
    pub fn verify_file(&self, file: &Hfs0File) -> Result<Validity> {
        let covered = (file.hashed_region_size as u64).min(file.size);
        let data = self.open_file(file)?.read_vec(0, covered as usize)?;
        Ok(if sha256(&data) == file.sha256 {
            Validity::Valid
        } else {
            tracing::warn!(file = %file.name, "HFS0 entry hash mismatch");
            Validity::Invalid
        })
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }
}

/// Serialize an HFS0 holding `files`, each hashed over its first
/// `hashed` bytes.
pub fn build(files: &[(&str, &[u8])], hashed: usize) -> Vec<u8> {
    let mut names = Vec::new();
    let mut table = Vec::new();
    let mut offset = 0u64;
    for (name, data) in files {
        let covered = hashed.min(data.len());
        table.extend_from_slice(&offset.to_le_bytes());
        table.extend_from_slice(&(data.len() as u64).to_le_bytes());
        table.extend_from_slice(&(names.len() as u32).to_le_bytes());
        table.extend_from_slice(&(covered as u32).to_le_bytes());
        table.extend_from_slice(&[0; 8]);
        table.extend_from_slice(&sha256(&data[..covered]));
        names.extend_from_slice(name.as_bytes());
        names.push(0);
        offset += data.len() as u64;
    }
    let mut out = Vec::new();
    out.extend_from_slice(b"HFS0");
    out.extend_from_slice(&(files.len() as u32).to_le_bytes());
    out.extend_from_slice(&(names.len() as u32).to_le_bytes());
    out.extend_from_slice(&[0; 4]);
    out.extend(table);
    out.extend(names);
    for (_, data) in files {
        out.extend_from_slice(data);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_verify_against_their_hash() {
        let image = build(&[("secure", &[7u8; 0x300][..]), ("logo", &b"nintendo"[..])], 0x200);
        let fs = HashedFs::new(Storage::memory(image.clone())).unwrap();
        let secure = fs.get_file_by_name("secure").unwrap();
        assert_eq!(secure.hashed_region_size, 0x200);
        assert_eq!(fs.verify_file(secure).unwrap(), Validity::Valid);
        let logo = fs.get_file_by_name("logo").unwrap();
        assert_eq!(fs.open_file(logo).unwrap().read_all().unwrap(), b"nintendo");

        // Bytes past the hashed region are not covered.
        let mut tail = image.clone();
        let at = (fs.hfs0.data_offset + 0x250) as usize;
        tail[at] ^= 1;
        let fs = HashedFs::new(Storage::memory(tail)).unwrap();
        assert_eq!(fs.verify_file(&fs.hfs0.files[0]).unwrap(), Validity::Valid);

        let mut head = image;
        let at = (fs.hfs0.data_offset + 0x10) as usize;
        head[at] ^= 1;
        let fs = HashedFs::new(Storage::memory(head)).unwrap();
        assert_eq!(fs.verify_file(&fs.hfs0.files[0]).unwrap(), Validity::Invalid);
    }
}
