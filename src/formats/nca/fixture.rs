//! Synthetic NCAs for tests.

use crate::crypto::aes::{ctr_transform, ecb_encrypt_block, nca_counter};
use crate::crypto::sha256;

use super::header::{HEADER_SIZE, encrypt_header};

/// How the builder stores a section body.
pub enum Body {
    /// Encrypted by the builder according to the section's encryption type.
    Plain(Vec<u8>),
    /// Written as given; the caller already applied the cipher.
    Stored(Vec<u8>),
}

pub struct Section {
    pub fs_type: u8,
    pub hash_type: u8,
    pub encryption_type: u8,
    pub upper_counter: u64,
    pub hash_data: Vec<u8>,
    pub patch_data: Vec<u8>,
    pub body: Body,
}

impl Section {
    pub fn new(fs_type: u8, hash_type: u8, encryption_type: u8, upper_counter: u64) -> Self {
        Self {
            fs_type,
            hash_type,
            encryption_type,
            upper_counter,
            hash_data: Vec::new(),
            patch_data: Vec::new(),
            body: Body::Plain(Vec::new()),
        }
    }

    pub fn hashed(mut self, (hash_data, body): (Vec<u8>, Vec<u8>)) -> Self {
        self.hash_data = hash_data;
        self.body = Body::Plain(body);
        self
    }

    pub fn plain(mut self, body: Vec<u8>) -> Self {
        self.body = Body::Plain(body);
        self
    }
}

pub struct NcaBuilder {
    pub header_key: [u8; 32],
    pub key_area_key: [u8; 16],
    pub ctr_key: [u8; 16],
    pub program_id: u64,
    /// All zero for NCAs keyed through the key area.
    pub rights_id: [u8; 16],
    pub sections: Vec<Section>,
}

/// Container offset of the first section.
pub const FIRST_SECTION: u64 = 0xC00;

impl NcaBuilder {
    pub fn build(&self) -> Vec<u8> {
        let mut h = [0u8; HEADER_SIZE];
        h[0x200..0x204].copy_from_slice(b"NCA3");
        h[0x210..0x218].copy_from_slice(&self.program_id.to_le_bytes());
        h[0x230..0x240].copy_from_slice(&self.rights_id);
        h[0x320..0x330].copy_from_slice(&ecb_encrypt_block(&self.key_area_key, &self.ctr_key));

        let mut bodies = Vec::new();
        let mut offset = FIRST_SECTION;
        for (i, section) in self.sections.iter().enumerate() {
            let (mut body, encrypt) = match &section.body {
                Body::Plain(b) => (b.clone(), true),
                Body::Stored(b) => (b.clone(), false),
            };
            body.resize(body.len().next_multiple_of(0x200), 0);
            if encrypt && section.encryption_type == 3 {
                ctr_transform(&self.ctr_key, &nca_counter(section.upper_counter, offset), &mut body);
            }

            let start = (offset / 0x200) as u32;
            let end = start + (body.len() / 0x200) as u32;
            let e = 0x240 + i * 0x10;
            h[e..e + 4].copy_from_slice(&start.to_le_bytes());
            h[e + 4..e + 8].copy_from_slice(&end.to_le_bytes());

            let at = 0x400 + i * 0x200;
            let fs = &mut h[at..at + 0x200];
            fs[0..2].copy_from_slice(&2u16.to_le_bytes());
            fs[2] = section.fs_type;
            fs[3] = section.hash_type;
            fs[4] = section.encryption_type;
            fs[8..8 + section.hash_data.len()].copy_from_slice(&section.hash_data);
            fs[0x100..0x100 + section.patch_data.len()].copy_from_slice(&section.patch_data);
            fs[0x140..0x148].copy_from_slice(&section.upper_counter.to_le_bytes());
            let hash = sha256(&h[at..at + 0x200]);
            h[0x280 + i * 0x20..0x2A0 + i * 0x20].copy_from_slice(&hash);

            offset += body.len() as u64;
            bodies.push(body);
        }

        let mut out = encrypt_header(&self.header_key, &h).unwrap().to_vec();
        for body in bodies {
            out.extend(body);
        }
        out
    }
}

fn padded_hash(chunk: &[u8], block_size: usize) -> [u8; 32] {
    let mut block = chunk.to_vec();
    block.resize(block_size, 0);
    sha256(&block)
}

/// `(hash descriptor, section body)` for a PartitionFS-style hash table.
pub fn sha256_layout(data: &[u8], block_size: usize) -> (Vec<u8>, Vec<u8>) {
    let table: Vec<u8> = data.chunks(block_size).flat_map(sha256).collect();
    let data_offset = table.len().next_multiple_of(0x200);

    let mut body = table.clone();
    body.resize(data_offset, 0);
    body.extend_from_slice(data);

    let mut d = vec![0u8; 0x48];
    d[..0x20].copy_from_slice(&sha256(&table));
    d[0x20..0x24].copy_from_slice(&(block_size as u32).to_le_bytes());
    d[0x24..0x28].copy_from_slice(&2u32.to_le_bytes());
    d[0x30..0x38].copy_from_slice(&(table.len() as u64).to_le_bytes());
    d[0x38..0x40].copy_from_slice(&(data_offset as u64).to_le_bytes());
    d[0x40..0x48].copy_from_slice(&(data.len() as u64).to_le_bytes());
    (d, body)
}

/// Block size of every IVFC level built here.
pub const IVFC_BLOCK_LOG2: u32 = 9;

/// `(hash descriptor, section body)` for a six-level IVFC tree over `data`.
/// Levels are placed back to back on block boundaries.
pub fn ivfc_layout(data: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let block = 1usize << IVFC_BLOCK_LOG2;
    let mut levels = vec![data.to_vec()];
    for _ in 0..5 {
        let below = &levels[0];
        let hashes: Vec<u8> = below.chunks(block).flat_map(|c| padded_hash(c, block)).collect();
        levels.insert(0, hashes);
    }
    let master = padded_hash(&levels[0], block);

    let mut d = vec![0u8; 0xE0];
    d[..4].copy_from_slice(b"IVFC");
    d[4..8].copy_from_slice(&0x20000u32.to_le_bytes());
    d[8..0xC].copy_from_slice(&0x20u32.to_le_bytes());
    d[0xC..0x10].copy_from_slice(&7u32.to_le_bytes());
    d[0xC0..0xE0].copy_from_slice(&master);

    let mut body = Vec::new();
    for (i, level) in levels.iter().enumerate() {
        let at = 0x10 + i * 0x18;
        d[at..at + 8].copy_from_slice(&(body.len() as u64).to_le_bytes());
        d[at + 8..at + 16].copy_from_slice(&(level.len() as u64).to_le_bytes());
        d[at + 16..at + 20].copy_from_slice(&IVFC_BLOCK_LOG2.to_le_bytes());
        body.extend_from_slice(level);
        body.resize(body.len().next_multiple_of(block), 0);
    }
    (d, body)
}

/// One-bucket tree in the on-disk node format: an L1 node listing the
/// bucket, then the bucket node at 0x4000.
pub fn bucket_tree(entries: &[Vec<u8>], start: u64, end: u64) -> Vec<u8> {
    let mut table = vec![0u8; 0x8000];
    table[4..8].copy_from_slice(&1u32.to_le_bytes());
    table[8..16].copy_from_slice(&end.to_le_bytes());
    table[0x10..0x18].copy_from_slice(&start.to_le_bytes());
    table[0x4004..0x4008].copy_from_slice(&(entries.len() as u32).to_le_bytes());
    table[0x4008..0x4010].copy_from_slice(&end.to_le_bytes());
    let mut at = 0x4010;
    for e in entries {
        table[at..at + e.len()].copy_from_slice(e);
        at += e.len();
    }
    table
}

pub fn relocation(virtual_offset: u64, physical_offset: u64, storage_index: u32) -> Vec<u8> {
    let mut e = Vec::with_capacity(0x14);
    e.extend_from_slice(&virtual_offset.to_le_bytes());
    e.extend_from_slice(&physical_offset.to_le_bytes());
    e.extend_from_slice(&storage_index.to_le_bytes());
    e
}

pub fn subsection(offset: u64, generation: u32) -> Vec<u8> {
    let mut e = vec![0u8; 0x10];
    e[..8].copy_from_slice(&offset.to_le_bytes());
    e[0xC..].copy_from_slice(&generation.to_le_bytes());
    e
}

/// Patch descriptor for a relocation table at `indirect` and a subsection
/// table at `ctr_ex`, each `(offset, size, entry count)`.
pub fn patch_info(indirect: (u64, u64, u32), ctr_ex: (u64, u64, u32)) -> Vec<u8> {
    let mut p = vec![0u8; 0x40];
    for (at, (offset, size, count)) in [(0, indirect), (0x20, ctr_ex)] {
        p[at..at + 8].copy_from_slice(&offset.to_le_bytes());
        p[at + 8..at + 16].copy_from_slice(&size.to_le_bytes());
        p[at + 0x10..at + 0x14].copy_from_slice(b"BKTR");
        p[at + 0x14..at + 0x18].copy_from_slice(&1u32.to_le_bytes());
        p[at + 0x18..at + 0x1C].copy_from_slice(&count.to_le_bytes());
    }
    p
}
