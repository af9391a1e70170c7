//! PFS0 (PartitionFS) - flat archive container.
//!
//! Used as the outer container for NSP files and inside NCAs as the ExeFS,
//! Logo and Meta sections.
//!
//! ## Layout
//! ```text
//! [0x00] Magic "PFS0"              (4 bytes)
//! [0x04] FileCount                 (u32 LE)
//! [0x08] StringTableSize           (u32 LE)
//! [0x0C] Reserved (always 0)       (4 bytes)
//! [0x10] EntryTable                (FileCount × 0x18 bytes)
//! [0x10 + FileCount×0x18]
//!        StringTable               (StringTableSize bytes)
//! [0x10 + FileCount×0x18 + StringTableSize]
//!        FileData                  (remaining bytes)
//! ```
//!
//! ## File Entry (0x18 bytes)
//! ```text
//! [0x00] Offset  - relative to the data section start (u64 LE)
//! [0x08] Size    - in bytes (u64 LE)
//! [0x10] NameOffset - byte offset into the string table (u32 LE)
//! [0x14] Reserved   (u32)
//! ```

use std::io::{Read, Seek};
use std::sync::Arc;

use crate::Result;
use crate::storage::{Storage, StorageReader};
use crate::utils::{bytesv, le_u32, le_u64, magic, null_string};

const HEADER_SIZE: u64 = 0x10;
const ENTRY_SIZE: u64 = 0x18;

/// Parsed PFS0 container (metadata only).
#[derive(Debug, Clone)]
pub struct Pfs0 {
    /// All file entries in declaration order.
    pub files: Vec<Pfs0File>,
    /// Offset of the file data section, relative to the origin of the
    /// reader the table was parsed from.
    pub data_offset: u64,
}

/// Metadata for a single file inside a PFS0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pfs0File {
    pub name: String,
    /// Offset relative to the PFS0 data section.
    pub offset: u64,
    pub size: u64,
}

impl Pfs0 {
    /// Parse a PFS0 table from `r`, positioned at the magic.
    pub fn parse<R: Read + Seek>(r: &mut R) -> Result<Self> {
        let base = r.stream_position()?;

        magic(r, b"PFS0")?;
        let file_count = le_u32(r)?;
        let string_table_size = le_u32(r)?;
        let _reserved = le_u32(r)?;

        let mut entries = Vec::with_capacity(file_count.min(0x1000) as usize);
        for _ in 0..file_count {
            let offset = le_u64(r)?;
            let size = le_u64(r)?;
            let name_offset = le_u32(r)?;
            let _reserved = le_u32(r)?;
            entries.push((offset, size, name_offset));
        }

        let string_table = bytesv(r, string_table_size as usize)?;
        let files = entries
            .into_iter()
            .map(|(offset, size, name_offset)| {
                let name = null_string(&string_table, name_offset as usize)?;
                Ok(Pfs0File { name, offset, size })
            })
            .collect::<Result<Vec<_>>>()?;

        let data_offset =
            base + HEADER_SIZE + file_count as u64 * ENTRY_SIZE + string_table_size as u64;
        Ok(Self { files, data_offset })
    }

    pub fn get_file_by_name(&self, name: &str) -> Option<&Pfs0File> {
        self.files.iter().find(|f| f.name == name)
    }
}

/// A PFS0 read out of a [`Storage`], with file contents opened as
/// sub-storages.
#[derive(Debug, Clone)]
pub struct PartitionFs {
    storage: Arc<Storage>,
    pub pfs0: Pfs0,
}

impl PartitionFs {
    /// Parse the table at the start of `storage`.
    pub fn new(storage: Arc<Storage>) -> Result<Self> {
        let mut reader = StorageReader::new(Arc::clone(&storage));
        let pfs0 = Pfs0::parse(&mut reader)?;
        Ok(Self { storage, pfs0 })
    }

    pub fn files(&self) -> impl Iterator<Item = &Pfs0File> {
        self.pfs0.files.iter()
    }

    pub fn get_file_by_name(&self, name: &str) -> Option<&Pfs0File> {
        self.pfs0.get_file_by_name(name)
    }

    /// Contents of `file` as a window onto the partition.
    pub fn open_file(&self, file: &Pfs0File) -> Result<Arc<Storage>> {
        Storage::slice(&self.storage, self.pfs0.data_offset + file.offset, file.size)
    }

    /// Whole contents of `file`.
    pub fn read_file(&self, file: &Pfs0File) -> Result<Vec<u8>> {
        self.open_file(file)?.read_all()
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }
}

/// Serialize a PFS0 holding `files` in order. Used to build images.
pub fn build(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut names = Vec::new();
    let mut entries = Vec::new();
    let mut offset = 0u64;
    for (name, data) in files {
        entries.push((offset, data.len() as u64, names.len() as u32));
        names.extend_from_slice(name.as_bytes());
        names.push(0);
        offset += data.len() as u64;
    }
    // Pad the string table so the data section starts 0x20-aligned.
    let unpadded = HEADER_SIZE as usize + entries.len() * ENTRY_SIZE as usize + names.len();
    names.resize(names.len() + (unpadded.next_multiple_of(0x20) - unpadded), 0);

    let mut out = Vec::new();
    out.extend_from_slice(b"PFS0");
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    out.extend_from_slice(&(names.len() as u32).to_le_bytes());
    out.extend_from_slice(&[0; 4]);
    for (offset, size, name_offset) in entries {
        out.extend_from_slice(&offset.to_le_bytes());
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&name_offset.to_le_bytes());
        out.extend_from_slice(&[0; 4]);
    }
    out.extend_from_slice(&names);
    for (_, data) in files {
        out.extend_from_slice(data);
    }
    out
}
