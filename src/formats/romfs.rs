//! RomFS - hierarchical read-only filesystem stored in NCA data sections.
//!
//! ## Header (0x50 bytes, all u64 LE)
//! ```text
//! [0x00] HeaderSize            (0x50)
//! [0x08] DirHashTableOffset    [0x10] DirHashTableSize
//! [0x18] DirMetaTableOffset    [0x20] DirMetaTableSize
//! [0x28] FileHashTableOffset   [0x30] FileHashTableSize
//! [0x38] FileMetaTableOffset   [0x40] FileMetaTableSize
//! [0x48] DataOffset
//! ```
//!
//! ## Directory entry
//! ```text
//! [0x00] Parent  [0x04] Sibling  [0x08] FirstChildDir  [0x0C] FirstFile
//! [0x10] NextInHashBucket        [0x14] NameLength     [0x18] Name (4-aligned)
//! ```
//!
//! ## File entry
//! ```text
//! [0x00] Parent  [0x04] Sibling  [0x08] DataOffset (u64)  [0x10] DataSize (u64)
//! [0x18] NextInHashBucket        [0x1C] NameLength        [0x20] Name (4-aligned)
//! ```
//!
//! Entry links are byte offsets into the meta tables; `0xFFFFFFFF` ends a
//! list. The hash tables are only needed for lookups by name and are not
//! read here.

use std::collections::HashSet;
use std::io::{Read, Seek};
use std::sync::Arc;

use crate::storage::{Storage, StorageReader};
use crate::utils::{le_u32_at, le_u64, le_u64_at};
use crate::{Error, Result};

const HEADER_SIZE: u64 = 0x50;
const EMPTY: u32 = 0xFFFF_FFFF;
const DIR_ENTRY_SIZE: usize = 0x18;
const FILE_ENTRY_SIZE: usize = 0x20;
/// Horizon paths are at most 0x300 bytes, two per level at minimum.
const MAX_DEPTH: usize = 0x180;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RomFsHeader {
    pub dir_hash_table: (u64, u64),
    pub dir_meta_table: (u64, u64),
    pub file_hash_table: (u64, u64),
    pub file_meta_table: (u64, u64),
    pub data_offset: u64,
}

impl RomFsHeader {
    pub fn parse<R: Read + Seek>(r: &mut R) -> Result<Self> {
        let header_size = le_u64(r)?;
        if header_size != HEADER_SIZE {
            return Err(Error::format(format!("RomFS header size {header_size:#x}")));
        }
        let mut pair = || -> Result<(u64, u64)> { Ok((le_u64(r)?, le_u64(r)?)) };
        let dir_hash_table = pair()?;
        let dir_meta_table = pair()?;
        let file_hash_table = pair()?;
        let file_meta_table = pair()?;
        let data_offset = le_u64(r)?;
        Ok(Self {
            dir_hash_table,
            dir_meta_table,
            file_hash_table,
            file_meta_table,
            data_offset,
        })
    }
}

/// A file found while walking the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomFsFile {
    /// Absolute path, `/`-separated, starting with `/`.
    pub path: String,
    /// Offset relative to the data section.
    pub offset: u64,
    pub size: u64,
}

/// A RomFS read out of a [`Storage`].
#[derive(Debug, Clone)]
pub struct RomFs {
    storage: Arc<Storage>,
    pub header: RomFsHeader,
    directories: Vec<String>,
    files: Vec<RomFsFile>,
}

impl RomFs {
    /// Parse the header and walk the directory tree from the root.
    pub fn new(storage: Arc<Storage>) -> Result<Self> {
        let mut reader = StorageReader::new(Arc::clone(&storage));
        let header = RomFsHeader::parse(&mut reader)?;

        let (off, size) = header.dir_meta_table;
        let dirs = storage.read_vec(off, size as usize)?;
        let (off, size) = header.file_meta_table;
        let file_meta = storage.read_vec(off, size as usize)?;

        let mut walker = Walker {
            dirs: &dirs,
            files: &file_meta,
            seen: HashSet::new(),
            directories: Vec::new(),
            found: Vec::new(),
        };
        if !dirs.is_empty() {
            walker.walk()?;
        }
        tracing::debug!(
            directories = walker.directories.len(),
            files = walker.found.len(),
            "walked RomFS"
        );
        let Walker { directories, found, .. } = walker;
        Ok(Self {
            storage,
            header,
            directories,
            files: found,
        })
    }

    /// Every file, depth first in table order.
    pub fn files(&self) -> impl Iterator<Item = &RomFsFile> {
        self.files.iter()
    }

    /// Every directory path below the root, depth first.
    pub fn directories(&self) -> impl Iterator<Item = &str> {
        self.directories.iter().map(String::as_str)
    }

    pub fn get_file(&self, path: &str) -> Option<&RomFsFile> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn open_file(&self, file: &RomFsFile) -> Result<Arc<Storage>> {
        Storage::slice(&self.storage, self.header.data_offset + file.offset, file.size)
    }

    pub fn read_file(&self, file: &RomFsFile) -> Result<Vec<u8>> {
        self.open_file(file)?.read_all()
    }
}

struct Walker<'a> {
    dirs: &'a [u8],
    files: &'a [u8],
    seen: HashSet<(bool, u32)>,
    directories: Vec<String>,
    found: Vec<RomFsFile>,
}

impl Walker<'_> {
    fn visit(&mut self, is_dir: bool, offset: u32) -> Result<()> {
        if !self.seen.insert((is_dir, offset)) {
            return Err(Error::format(format!("RomFS entry {offset:#x} is linked twice")));
        }
        Ok(())
    }

    // Depth-first from the root with an explicit stack. Directories are
    // marked seen when first linked, so each one is queued at most once.
    fn walk(&mut self) -> Result<()> {
        self.visit(true, 0)?;
        let mut stack = vec![(0u32, String::new(), 0usize)];
        while let Some((offset, path, depth)) = stack.pop() {
            if !path.is_empty() {
                self.directories.push(path.clone());
            }
            let at = offset as usize;
            let first_dir = le_u32_at(self.dirs, at + 0x8)?;
            let first_file = le_u32_at(self.dirs, at + 0xC)?;

            let mut file = first_file;
            while file != EMPTY {
                self.visit(false, file)?;
                let at = file as usize;
                let name = entry_name(self.files, at + 0x1C, at + FILE_ENTRY_SIZE)?;
                self.found.push(RomFsFile {
                    path: format!("{path}/{name}"),
                    offset: le_u64_at(self.files, at + 0x8)?,
                    size: le_u64_at(self.files, at + 0x10)?,
                });
                file = le_u32_at(self.files, at + 0x4)?;
            }

            if first_dir != EMPTY && depth >= MAX_DEPTH {
                return Err(Error::format(format!("RomFS directories nest deeper than {MAX_DEPTH}")));
            }
            let mut children = Vec::new();
            let mut child = first_dir;
            while child != EMPTY {
                self.visit(true, child)?;
                let at = child as usize;
                let name = entry_name(self.dirs, at + 0x14, at + DIR_ENTRY_SIZE)?;
                children.push((child, format!("{path}/{name}"), depth + 1));
                child = le_u32_at(self.dirs, at + 0x4)?;
            }
            // Reversed so the first child is popped first.
            stack.extend(children.into_iter().rev());
        }
        Ok(())
    }
}

fn entry_name(table: &[u8], len_at: usize, name_at: usize) -> Result<String> {
    let len = le_u32_at(table, len_at)? as usize;
    let bytes = table.get(name_at..name_at + len).ok_or(Error::UnexpectedEof)?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

/// Serialize a RomFS holding `files` given as absolute paths. Directories
/// are created from the path components. Hash tables are left empty.
pub fn build(files: &[(&str, &[u8])]) -> Vec<u8> {
    struct Dir {
        name: String,
        parent: usize,
        dirs: Vec<usize>,
        files: Vec<usize>,
    }
    let mut dirs = vec![Dir {
        name: String::new(),
        parent: 0,
        dirs: Vec::new(),
        files: Vec::new(),
    }];
    for (index, (path, _)) in files.iter().enumerate() {
        let parts: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        let mut current = 0;
        for part in &parts[..parts.len() - 1] {
            let existing = dirs[current].dirs.iter().copied().find(|&d| dirs[d].name == *part);
            current = match existing {
                Some(d) => d,
                None => {
                    dirs.push(Dir {
                        name: part.to_string(),
                        parent: current,
                        dirs: Vec::new(),
                        files: Vec::new(),
                    });
                    let id = dirs.len() - 1;
                    dirs[current].dirs.push(id);
                    id
                }
            };
        }
        dirs[current].files.push(index);
    }

    let padded = |n: usize| n.next_multiple_of(4);
    let file_name = |i: usize| files[i].0.rsplit('/').next().unwrap_or_default();

    let mut dir_offsets = Vec::with_capacity(dirs.len());
    let mut at = 0;
    for d in &dirs {
        dir_offsets.push(at as u32);
        at += DIR_ENTRY_SIZE + padded(d.name.len());
    }
    let mut file_offsets = vec![0u32; files.len()];
    let mut at = 0;
    for d in &dirs {
        for &f in &d.files {
            file_offsets[f] = at as u32;
            at += FILE_ENTRY_SIZE + padded(file_name(f).len());
        }
    }

    let mut dir_meta = Vec::new();
    for (di, d) in dirs.iter().enumerate() {
        let siblings = &dirs[d.parent].dirs;
        let sibling = siblings
            .iter()
            .position(|&c| c == di)
            .and_then(|k| siblings.get(k + 1))
            .map_or(EMPTY, |&n| dir_offsets[n]);
        let first_dir = d.dirs.first().map_or(EMPTY, |&c| dir_offsets[c]);
        let first_file = d.files.first().map_or(EMPTY, |&f| file_offsets[f]);
        for v in [dir_offsets[d.parent], sibling, first_dir, first_file, EMPTY] {
            dir_meta.extend_from_slice(&v.to_le_bytes());
        }
        dir_meta.extend_from_slice(&(d.name.len() as u32).to_le_bytes());
        dir_meta.extend_from_slice(d.name.as_bytes());
        dir_meta.resize(padded(dir_meta.len()), 0);
    }

    let mut file_meta = Vec::new();
    let mut data = Vec::new();
    for (di, d) in dirs.iter().enumerate() {
        for (k, &f) in d.files.iter().enumerate() {
            let sibling = d.files.get(k + 1).map_or(EMPTY, |&n| file_offsets[n]);
            let name = file_name(f);
            file_meta.extend_from_slice(&dir_offsets[di].to_le_bytes());
            file_meta.extend_from_slice(&sibling.to_le_bytes());
            file_meta.extend_from_slice(&(data.len() as u64).to_le_bytes());
            file_meta.extend_from_slice(&(files[f].1.len() as u64).to_le_bytes());
            file_meta.extend_from_slice(&EMPTY.to_le_bytes());
            file_meta.extend_from_slice(&(name.len() as u32).to_le_bytes());
            file_meta.extend_from_slice(name.as_bytes());
            file_meta.resize(padded(file_meta.len()), 0);
            data.extend_from_slice(files[f].1);
            data.resize(data.len().next_multiple_of(0x10), 0);
        }
    }

    let dir_meta_off = HEADER_SIZE;
    let file_meta_off = dir_meta_off + dir_meta.len() as u64;
    let data_off = (file_meta_off + file_meta.len() as u64).next_multiple_of(0x200);
    let mut out = Vec::new();
    for v in [
        HEADER_SIZE,
        dir_meta_off,
        0,
        dir_meta_off,
        dir_meta.len() as u64,
        file_meta_off,
        0,
        file_meta_off,
        file_meta.len() as u64,
        data_off,
    ] {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out.extend(dir_meta);
    out.extend(file_meta);
    out.resize(data_off as usize, 0);
    out.extend(data);
    out
}
