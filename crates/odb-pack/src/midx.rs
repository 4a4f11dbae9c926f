//! Multi-pack index (MIDX) reading.
//!
//! The MIDX is a chunk-file consumer: a 12-byte outer header, the chunk
//! TOC, and per-chunk payloads indexing objects across several packs.
//!
//! ```text
//! Header: MIDX | version (1) | OID version (1) | chunk count (1)
//!         | base MIDX count (1) | pack count (4)
//! Chunks: PNAM pack names (optional here), OIDF fanout, OIDL sorted OIDs,
//!         OOFF (pack index be32, offset be32) pairs, LOFF large offsets
//! Trailer: rawsz digest
//! ```

use std::ops::Range;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use odb_hash::{HashAlgorithm, ObjectId};

use crate::chunk::read_table_of_contents;
use crate::PackError;

pub const MIDX_SIGNATURE: u32 = 0x4d49_4458; // "MIDX"
pub const MIDX_VERSION: u8 = 1;

pub const MIDX_CHUNK_PACK_NAMES: u32 = 0x504e_414d; // "PNAM"
pub const MIDX_CHUNK_OID_FANOUT: u32 = 0x4f49_4446; // "OIDF"
pub const MIDX_CHUNK_OID_LOOKUP: u32 = 0x4f49_444c; // "OIDL"
pub const MIDX_CHUNK_OBJECT_OFFSETS: u32 = 0x4f4f_4646; // "OOFF"
pub const MIDX_CHUNK_LARGE_OFFSETS: u32 = 0x4c4f_4646; // "LOFF"

const MIDX_HEADER_SIZE: usize = 12;

/// A memory-mapped multi-pack index.
#[derive(Debug)]
pub struct MultiPackIndex {
    data: Mmap,
    num_packs: u32,
    num_objects: u32,
    pack_names: Vec<String>,
    hash_algo: HashAlgorithm,
    fanout: Range<usize>,
    oid_lookup: Range<usize>,
    object_offsets: Range<usize>,
    large_offsets: Option<Range<usize>>,
    midx_path: PathBuf,
}

impl MultiPackIndex {
    /// Open a multi-pack index file.
    pub fn open(midx_path: impl AsRef<Path>) -> Result<Self, PackError> {
        let midx_path = midx_path.as_ref().to_path_buf();
        let file = std::fs::File::open(&midx_path).map_err(|e| PackError::io(&midx_path, e))?;
        let data = unsafe { Mmap::map(&file) }.map_err(|e| PackError::io(&midx_path, e))?;

        if data.len() < MIDX_HEADER_SIZE {
            return Err(PackError::InvalidIndex("MIDX file too small".into()));
        }
        if be32(&data, 0) != MIDX_SIGNATURE {
            return Err(PackError::InvalidIndex("bad MIDX signature".into()));
        }
        let version = data[4];
        if version != MIDX_VERSION {
            return Err(PackError::InvalidIndex(format!(
                "unsupported MIDX version {version}"
            )));
        }
        let oid_version = u32::from(data[5]);
        let hash_algo = HashAlgorithm::from_oid_version(oid_version)
            .ok_or(PackError::UnknownHashAlgorithm { value: oid_version })?;
        let num_chunks = data[6] as usize;
        let num_packs = be32(&data, 8);

        let rawsz = hash_algo.digest_len();
        let toc = read_table_of_contents(&data, MIDX_HEADER_SIZE, num_chunks, rawsz)?;

        let fanout = toc
            .chunk_range(MIDX_CHUNK_OID_FANOUT)
            .ok_or(PackError::ChunkNotFound {
                id: MIDX_CHUNK_OID_FANOUT,
            })?;
        if fanout.len() != 1024 {
            return Err(PackError::InvalidIndex("OID fanout chunk truncated".into()));
        }
        let oid_lookup =
            toc.chunk_range(MIDX_CHUNK_OID_LOOKUP)
                .ok_or(PackError::ChunkNotFound {
                    id: MIDX_CHUNK_OID_LOOKUP,
                })?;
        let object_offsets =
            toc.chunk_range(MIDX_CHUNK_OBJECT_OFFSETS)
                .ok_or(PackError::ChunkNotFound {
                    id: MIDX_CHUNK_OBJECT_OFFSETS,
                })?;
        // Optional chunks: their absence is a sentinel, not an error.
        let large_offsets = toc.chunk_range(MIDX_CHUNK_LARGE_OFFSETS);
        let pack_names = toc
            .chunk(MIDX_CHUNK_PACK_NAMES)
            .map(parse_pack_names)
            .unwrap_or_default();

        let num_objects = be32(&data, fanout.start + 255 * 4);
        let n = num_objects as usize;
        if oid_lookup.len() < n * rawsz {
            return Err(PackError::InvalidIndex("OID lookup chunk truncated".into()));
        }
        if object_offsets.len() < n * 8 {
            return Err(PackError::InvalidIndex(
                "object offsets chunk truncated".into(),
            ));
        }

        Ok(Self {
            data,
            num_packs,
            num_objects,
            pack_names,
            hash_algo,
            fanout,
            oid_lookup,
            object_offsets,
            large_offsets,
            midx_path,
        })
    }

    /// Look up an OID, returning `(pack index, offset)` when present.
    pub fn lookup(&self, oid: &ObjectId) -> Option<(u32, u64)> {
        let (mut low, mut high) = self.fanout_range(oid.first_byte());
        let target = oid.as_bytes();
        while low < high {
            let mid = low + (high - low) / 2;
            match self.oid_bytes_at(mid).cmp(target) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
                std::cmp::Ordering::Equal => return Some(self.object_entry(mid as u32)),
            }
        }
        None
    }

    /// Number of objects across all indexed packs.
    pub fn num_objects(&self) -> u32 {
        self.num_objects
    }

    /// Number of packs this MIDX covers.
    pub fn num_packs(&self) -> u32 {
        self.num_packs
    }

    /// Pack names from the PNAM chunk, if present.
    pub fn pack_names(&self) -> &[String] {
        &self.pack_names
    }

    /// Path of the MIDX file.
    pub fn path(&self) -> &Path {
        &self.midx_path
    }

    /// Iterate over `(oid, pack index, offset)` triples in OID order.
    pub fn iter(&self) -> MultiPackIndexIter<'_> {
        MultiPackIndexIter { midx: self, pos: 0 }
    }

    fn fanout_range(&self, first_byte: u8) -> (usize, usize) {
        let base = self.fanout.start;
        let end = be32(&self.data, base + first_byte as usize * 4) as usize;
        let start = if first_byte == 0 {
            0
        } else {
            be32(&self.data, base + (first_byte as usize - 1) * 4) as usize
        };
        (start, end)
    }

    fn oid_bytes_at(&self, index: usize) -> &[u8] {
        let rawsz = self.hash_algo.digest_len();
        let start = self.oid_lookup.start + index * rawsz;
        &self.data[start..start + rawsz]
    }

    fn object_entry(&self, index: u32) -> (u32, u64) {
        let pos = self.object_offsets.start + index as usize * 8;
        let pack_index = be32(&self.data, pos);
        let offset_val = be32(&self.data, pos + 4);

        let offset = if offset_val & 0x8000_0000 != 0 {
            match &self.large_offsets {
                Some(range) => {
                    let large = (offset_val & 0x7fff_ffff) as usize;
                    be64(&self.data, range.start + large * 8)
                }
                // A promoted slot without a LOFF chunk is malformed; expose
                // the raw value rather than fabricating an offset.
                None => u64::from(offset_val),
            }
        } else {
            u64::from(offset_val)
        };

        (pack_index, offset)
    }
}

/// Iterator over MIDX entries.
pub struct MultiPackIndexIter<'a> {
    midx: &'a MultiPackIndex,
    pos: u32,
}

impl Iterator for MultiPackIndexIter<'_> {
    type Item = (ObjectId, u32, u64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.midx.num_objects {
            return None;
        }
        let oid = ObjectId::from_bytes(
            self.midx.oid_bytes_at(self.pos as usize),
            self.midx.hash_algo,
        )
        .expect("valid OID in MIDX");
        let (pack_index, offset) = self.midx.object_entry(self.pos);
        self.pos += 1;
        Some((oid, pack_index, offset))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.midx.num_objects - self.pos) as usize;
        (remaining, Some(remaining))
    }
}

/// Parse null-terminated pack names from the PNAM chunk.
fn parse_pack_names(data: &[u8]) -> Vec<String> {
    let mut names = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        match data[pos..].iter().position(|&b| b == 0) {
            Some(len) if len > 0 => {
                if let Ok(name) = std::str::from_utf8(&data[pos..pos + len]) {
                    names.push(name.to_string());
                }
                pos += len + 1;
            }
            _ => break,
        }
    }
    names
}


fn be32(data: &[u8], pos: usize) -> u32 {
    u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
}

fn be64(data: &[u8], pos: usize) -> u64 {
    u64::from_be_bytes([
        data[pos],
        data[pos + 1],
        data[pos + 2],
        data[pos + 3],
        data[pos + 4],
        data[pos + 5],
        data[pos + 6],
        data[pos + 7],
    ])
}
