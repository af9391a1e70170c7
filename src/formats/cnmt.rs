//! CNMT (Content Meta) - the table of contents of a title.
//!
//! Found as `<Type>_<TitleId>.cnmt` inside the PartitionFS section of a Meta
//! NCA.
//!
//! ## Header (0x20 bytes)
//! ```text
//! [0x00] TitleId                    (u64 LE)
//! [0x08] Version                    (u32 LE)
//! [0x0C] MetaType                   (u8)
//! [0x0D] Reserved
//! [0x0E] ExtendedHeaderSize         (u16 LE)
//! [0x10] ContentCount               (u16 LE)
//! [0x12] ContentMetaCount           (u16 LE)
//! [0x14] Attributes                 (u8)
//! [0x15] Reserved                   (3 bytes)
//! [0x18] RequiredDownloadSysVersion (u32 LE)
//! [0x1C] Reserved                   (4 bytes)
//! [0x20] ExtendedHeader             (ExtendedHeaderSize bytes)
//!        ContentRecords             (ContentCount × 0x38)
//!        ContentMetaRecords         (ContentMetaCount × 0x10)
//! ```
//!
//! ## Content record (0x38 bytes)
//! ```text
//! [0x00] Hash       (SHA-256 of the NCA)
//! [0x20] ContentId  (0x10 bytes, first half of the hash)
//! [0x30] Size       (u48 LE)
//! [0x36] Type       (u8)
//! [0x37] IdOffset   (u8)
//! ```

use std::io::{Read, Seek, SeekFrom};

use crate::formats::nca::{Nca, SectionFs};
use crate::utils::{bytesa, le_u16, le_u32, le_u64, u8};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaType {
    SystemProgram,
    SystemData,
    SystemUpdate,
    BootImagePackage,
    BootImagePackageSafe,
    Application,
    Patch,
    AddOnContent,
    Delta,
    Unknown(u8),
}

impl From<u8> for MetaType {
    fn from(v: u8) -> Self {
        match v {
            0x01 => Self::SystemProgram,
            0x02 => Self::SystemData,
            0x03 => Self::SystemUpdate,
            0x04 => Self::BootImagePackage,
            0x05 => Self::BootImagePackageSafe,
            0x80 => Self::Application,
            0x81 => Self::Patch,
            0x82 => Self::AddOnContent,
            0x83 => Self::Delta,
            x => Self::Unknown(x),
        }
    }
}

/// Type of one content listed by a CNMT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentRecordType {
    Meta,
    Program,
    Data,
    Control,
    HtmlDocument,
    LegalInformation,
    DeltaFragment,
    Unknown(u8),
}

impl From<u8> for ContentRecordType {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Meta,
            1 => Self::Program,
            2 => Self::Data,
            3 => Self::Control,
            4 => Self::HtmlDocument,
            5 => Self::LegalInformation,
            6 => Self::DeltaFragment,
            x => Self::Unknown(x),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentRecord {
    pub hash: [u8; 0x20],
    pub content_id: [u8; 0x10],
    pub size: u64,
    pub content_type: ContentRecordType,
    pub id_offset: u8,
}

impl ContentRecord {
    /// File name of the content inside an NSP or a card partition.
    pub fn nca_name(&self) -> String {
        format!("{}.nca", hex::encode(self.content_id))
    }
}

/// Reference to another title.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaRecord {
    pub title_id: u64,
    pub version: u32,
    pub meta_type: MetaType,
    pub attributes: u8,
}

#[derive(Debug, Clone)]
pub struct Cnmt {
    pub title_id: u64,
    pub version: u32,
    pub meta_type: MetaType,
    pub attributes: u8,
    pub required_download_system_version: u32,
    /// Raw extended header; its layout depends on `meta_type`.
    pub extended_header: Vec<u8>,
    pub contents: Vec<ContentRecord>,
    pub meta: Vec<MetaRecord>,
}

impl Cnmt {
    /// Parse a CNMT from `r`, positioned at its start.
    pub fn parse<R: Read + Seek>(r: &mut R) -> Result<Self> {
        let base = r.stream_position()?;
        let title_id = le_u64(r)?;
        let version = le_u32(r)?;
        let meta_type = MetaType::from(u8(r)?);
        let _reserved = u8(r)?;
        let extended_header_size = le_u16(r)?;
        let content_count = le_u16(r)?;
        let meta_count = le_u16(r)?;
        let attributes = u8(r)?;
        let _reserved = bytesa::<3>(r)?;
        let required_download_system_version = le_u32(r)?;
        let _reserved = le_u32(r)?;

        let mut extended_header = vec![0u8; extended_header_size as usize];
        r.read_exact(&mut extended_header)?;

        r.seek(SeekFrom::Start(base + 0x20 + extended_header_size as u64))?;
        let mut contents = Vec::with_capacity(content_count as usize);
        for _ in 0..content_count {
            let hash = bytesa::<0x20>(r)?;
            let content_id = bytesa::<0x10>(r)?;
            let size = bytesa::<6>(r)?;
            let mut size8 = [0u8; 8];
            size8[..6].copy_from_slice(&size);
            contents.push(ContentRecord {
                hash,
                content_id,
                size: u64::from_le_bytes(size8),
                content_type: ContentRecordType::from(u8(r)?),
                id_offset: u8(r)?,
            });
        }

        let mut meta = Vec::with_capacity(meta_count as usize);
        for _ in 0..meta_count {
            let title_id = le_u64(r)?;
            let version = le_u32(r)?;
            let meta_type = MetaType::from(u8(r)?);
            let attributes = u8(r)?;
            let _reserved = le_u16(r)?;
            meta.push(MetaRecord {
                title_id,
                version,
                meta_type,
                attributes,
            });
        }

        Ok(Self {
            title_id,
            version,
            meta_type,
            attributes,
            required_download_system_version,
            extended_header,
            contents,
            meta,
        })
    }

    /// Read the CNMT out of section 0 of a Meta NCA.
    pub fn from_nca(nca: &Nca) -> Result<Self> {
        let SectionFs::Partition(fs) = nca.open_fs(0)? else {
            return Err(Error::format("meta NCA section 0 is not a PartitionFS"));
        };
        let file = fs
            .files()
            .find(|f| f.name.ends_with(".cnmt"))
            .ok_or_else(|| Error::format("meta NCA holds no .cnmt file"))?;
        let mut reader = crate::storage::StorageReader::new(fs.open_file(file)?);
        Self::parse(&mut reader)
    }

    /// Records of the given type.
    pub fn contents_of(&self, content_type: ContentRecordType) -> impl Iterator<Item = &ContentRecord> {
        self.contents.iter().filter(move |c| c.content_type == content_type)
    }
}
