//! Pack index writing and reading.
//!
//! The index maps OIDs to in-pack offsets. Two versions exist on disk:
//!
//! ```text
//! v1: fanout (256 × be32) | N × (offset be32, oid) | pack checksum | index checksum
//! v2: \377tOc | version=2 | fanout | N × oid | N × crc32 | N × offset32
//!     | M × offset64 | pack checksum | index checksum
//! ```
//!
//! In v2 a small-table slot with the high bit set holds an index into the
//! 64-bit table instead of an offset; v2 is forced whenever any offset needs
//! such a slot.

use std::path::{Path, PathBuf};

use bitflags::bitflags;
use memmap2::Mmap;
use odb_hash::fanout::FanoutTable;
use odb_hash::{HashAlgorithm, ObjectId};

use crate::csum::{ChecksumFlags, Hashfile};
use crate::entry::PackEntry;
use crate::{PackError, IDX_SIGNATURE, IDX_VERSION};

bitflags! {
    /// Mode flags shared by the index and reverse-index writers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PackIdxFlags: u32 {
        /// Check an existing index instead of producing one.
        const VERIFY = 1 << 0;
        /// Refuse duplicate OIDs in the input.
        const STRICT = 1 << 1;
        /// Produce a reverse index alongside the index.
        const WRITE_REV = 1 << 2;
        /// Check an existing reverse index.
        const WRITE_REV_VERIFY = 1 << 3;
    }
}

/// Knobs for [`write_index_file`].
#[derive(Debug, Clone)]
pub struct PackIndexOptions {
    /// Preferred index version; overridden to 2 when any offset needs a
    /// large-table slot.
    pub version: u32,
    /// Offsets above this value go to the 64-bit table even below 2³¹.
    pub off32_limit: u32,
    /// Sorted offsets that must use the 64-bit table regardless of
    /// magnitude. Escape hatch for packs whose 32-bit slots cannot be
    /// trusted.
    pub anomaly_offsets: Vec<u32>,
    pub flags: PackIdxFlags,
}

impl Default for PackIndexOptions {
    fn default() -> Self {
        Self {
            version: 2,
            off32_limit: 0x7fff_ffff,
            anomaly_offsets: Vec::new(),
            flags: PackIdxFlags::empty(),
        }
    }
}

fn need_large_offset(offset: u64, opts: &PackIndexOptions) -> bool {
    if (offset >> 31) != 0 || u64::from(opts.off32_limit) < offset {
        return true;
    }
    if opts.anomaly_offsets.is_empty() {
        return false;
    }
    // offset < 2^31 here, so the narrowing is exact.
    opts.anomaly_offsets.binary_search(&(offset as u32)).is_ok()
}

/// Write (or verify) a pack index over `entries`.
///
/// `entries` is sorted in place by OID; `pack_checksum` is the trailer of
/// the pack the entries describe and lands before the index's own trailer.
/// Returns the index trailer digest.
///
/// In write mode the target is replaced: any stale file at `index_path` is
/// unlinked, the new one is created exclusively, and a failure mid-write
/// removes the partial file. With [`PackIdxFlags::VERIFY`] the index is
/// instead re-generated against the existing file.
pub fn write_index_file(
    index_path: &Path,
    entries: &mut [PackEntry],
    pack_checksum: &ObjectId,
    opts: &PackIndexOptions,
) -> Result<ObjectId, PackError> {
    let algo = pack_checksum.algorithm();

    entries.sort_by(|a, b| a.oid.cmp(&b.oid));
    let last_offset = entries.iter().map(|e| e.offset).max().unwrap_or(0);
    let version = if need_large_offset(last_offset, opts) {
        2
    } else {
        opts.version
    };

    let verify = opts.flags.contains(PackIdxFlags::VERIFY);
    let f = if verify {
        Hashfile::check(index_path, algo)?
    } else {
        match std::fs::remove_file(index_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(PackError::io(index_path, e)),
        }
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(index_path)
            .map_err(|e| PackError::io(index_path, e))?;
        Hashfile::new(file, index_path, algo)
    };

    match write_index_stream(f, entries, pack_checksum, opts, version, verify) {
        Ok(digest) => Ok(digest),
        Err(e) => {
            if !verify {
                let _ = std::fs::remove_file(index_path);
            }
            Err(e)
        }
    }
}

fn write_index_stream(
    mut f: Hashfile,
    entries: &[PackEntry],
    pack_checksum: &ObjectId,
    opts: &PackIndexOptions,
    version: u32,
    verify: bool,
) -> Result<ObjectId, PackError> {
    if version >= 2 {
        f.write_be32(IDX_SIGNATURE)?;
        f.write_be32(version)?;
    }

    let fanout = FanoutTable::build(entries.iter().map(|e| e.oid.first_byte()));
    for bucket in 0..=255u8 {
        f.write_be32(fanout.get(bucket))?;
    }

    let strict = opts.flags.contains(PackIdxFlags::STRICT);
    let mut prev: Option<ObjectId> = None;
    for entry in entries {
        if version < 2 {
            // v1 stores the offset inline; version selection guarantees it fits.
            f.write_be32(entry.offset as u32)?;
        }
        f.write(entry.oid.as_bytes())?;
        if strict && prev == Some(entry.oid) {
            return Err(PackError::DuplicateObject { oid: entry.oid });
        }
        prev = Some(entry.oid);
    }

    if version >= 2 {
        for entry in entries {
            f.write_be32(entry.crc32)?;
        }

        // Small-offset table; large slots are allocated in first-seen order.
        let mut nr_large = 0u32;
        for entry in entries {
            let slot = if need_large_offset(entry.offset, opts) {
                let index = nr_large;
                nr_large += 1;
                0x8000_0000 | index
            } else {
                entry.offset as u32
            };
            f.write_be32(slot)?;
        }

        // Large-offset table, in the order the small table references it.
        for entry in entries {
            if nr_large == 0 {
                break;
            }
            if !need_large_offset(entry.offset, opts) {
                continue;
            }
            f.write_be64(entry.offset)?;
            nr_large -= 1;
        }
    }

    f.write(pack_checksum.as_bytes())?;

    let mut flags = ChecksumFlags::HASH_IN_STREAM;
    if !verify {
        flags |= ChecksumFlags::FSYNC;
    }
    let (digest, _file) = f.finalize(flags)?;
    Ok(digest)
}

/// A memory-mapped pack index (v1 or v2).
pub struct PackIndex {
    data: Mmap,
    version: u32,
    num_objects: u32,
    hash_algo: HashAlgorithm,
    /// Byte offset of the sorted OID area (v1: the (offset, oid) records).
    oid_offset: usize,
    /// v2 only: CRC-32 table offset.
    crc_offset: usize,
    /// v2 only: 32-bit offset table.
    offset32_offset: usize,
    /// v2 only: 64-bit offset table.
    offset64_offset: usize,
    idx_path: PathBuf,
}

impl PackIndex {
    /// Open a pack index file produced under `algo`.
    pub fn open(idx_path: impl AsRef<Path>, algo: HashAlgorithm) -> Result<Self, PackError> {
        let idx_path = idx_path.as_ref().to_path_buf();
        let file = std::fs::File::open(&idx_path).map_err(|e| PackError::io(&idx_path, e))?;
        let data = unsafe { Mmap::map(&file) }.map_err(|e| PackError::io(&idx_path, e))?;

        let rawsz = algo.digest_len();

        // Minimum v1 size: fanout(1024) + trailer(2 * rawsz).
        if data.len() < 1024 + 2 * rawsz {
            return Err(PackError::InvalidIndex("file too small".into()));
        }

        let version = if be32(&data, 0) == IDX_SIGNATURE {
            let version = be32(&data, 4);
            if version != IDX_VERSION {
                return Err(PackError::InvalidIndex(format!(
                    "unsupported version {version}, expected {IDX_VERSION}"
                )));
            }
            version
        } else {
            1
        };

        let fanout_offset = if version >= 2 { 8 } else { 0 };
        let num_objects = be32(&data, fanout_offset + 255 * 4);
        let n = num_objects as usize;

        let oid_offset = fanout_offset + 1024;
        let (crc_offset, offset32_offset, offset64_offset, min_size) = if version >= 2 {
            let crc_offset = oid_offset + n * rawsz;
            let offset32_offset = crc_offset + n * 4;
            let offset64_offset = offset32_offset + n * 4;
            // The 64-bit table is variable; only a lower bound is checkable.
            (crc_offset, offset32_offset, offset64_offset, offset64_offset + 2 * rawsz)
        } else {
            let end = oid_offset + n * (4 + rawsz);
            (0, 0, 0, end + 2 * rawsz)
        };

        if data.len() < min_size {
            return Err(PackError::InvalidIndex(format!(
                "file too small: {} < {min_size}",
                data.len()
            )));
        }

        Ok(Self {
            data,
            version,
            num_objects,
            hash_algo: algo,
            oid_offset,
            crc_offset,
            offset32_offset,
            offset64_offset,
            idx_path,
        })
    }

    /// Look up an OID, returning its offset in the pack.
    pub fn lookup(&self, oid: &ObjectId) -> Option<u64> {
        let (mut low, mut high) = self.fanout_range(oid.first_byte());
        let target = oid.as_bytes();
        while low < high {
            let mid = low + (high - low) / 2;
            match self.oid_bytes_at(mid).cmp(target) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
                std::cmp::Ordering::Equal => return Some(self.offset_at_index(mid as u32)),
            }
        }
        None
    }

    /// The OID at the given sorted position.
    pub fn oid_at_index(&self, index: u32) -> ObjectId {
        ObjectId::from_bytes(self.oid_bytes_at(index as usize), self.hash_algo)
            .expect("valid OID in index")
    }

    /// The pack offset at the given sorted position.
    pub fn offset_at_index(&self, index: u32) -> u64 {
        if self.version < 2 {
            let pos = self.oid_offset + index as usize * (4 + self.hash_algo.digest_len());
            return u64::from(be32(&self.data, pos));
        }
        let value = be32(&self.data, self.offset32_offset + index as usize * 4);
        if value & 0x8000_0000 != 0 {
            let large = (value & 0x7fff_ffff) as usize;
            be64(&self.data, self.offset64_offset + large * 8)
        } else {
            u64::from(value)
        }
    }

    /// The CRC-32 at the given sorted position. v1 indexes store none.
    pub fn crc32_at_index(&self, index: u32) -> Option<u32> {
        if self.version < 2 {
            return None;
        }
        Some(be32(&self.data, self.crc_offset + index as usize * 4))
    }

    /// Number of objects in this index.
    pub fn num_objects(&self) -> u32 {
        self.num_objects
    }

    /// Index version (1 or 2).
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Path of the `.idx` file.
    pub fn path(&self) -> &Path {
        &self.idx_path
    }

    /// Pack checksum stored before the index's own trailer.
    pub fn pack_checksum(&self) -> ObjectId {
        let rawsz = self.hash_algo.digest_len();
        let start = self.data.len() - 2 * rawsz;
        ObjectId::from_bytes(&self.data[start..start + rawsz], self.hash_algo)
            .expect("valid checksum in index trailer")
    }

    /// The index's own trailing digest.
    pub fn index_checksum(&self) -> ObjectId {
        let rawsz = self.hash_algo.digest_len();
        let start = self.data.len() - rawsz;
        ObjectId::from_bytes(&self.data[start..], self.hash_algo)
            .expect("valid checksum in index trailer")
    }

    /// Iterate over `(oid, offset)` in sorted order.
    pub fn iter(&self) -> PackIndexIter<'_> {
        PackIndexIter { index: self, pos: 0 }
    }

    fn fanout_range(&self, first_byte: u8) -> (usize, usize) {
        let fanout_offset = if self.version >= 2 { 8 } else { 0 };
        let end = be32(&self.data, fanout_offset + first_byte as usize * 4) as usize;
        let start = if first_byte == 0 {
            0
        } else {
            be32(&self.data, fanout_offset + (first_byte as usize - 1) * 4) as usize
        };
        (start, end)
    }

    fn oid_bytes_at(&self, index: usize) -> &[u8] {
        let rawsz = self.hash_algo.digest_len();
        let start = if self.version >= 2 {
            self.oid_offset + index * rawsz
        } else {
            self.oid_offset + index * (4 + rawsz) + 4
        };
        &self.data[start..start + rawsz]
    }
}

/// Iterator over `(oid, offset)` pairs in a pack index.
pub struct PackIndexIter<'a> {
    index: &'a PackIndex,
    pos: u32,
}

impl Iterator for PackIndexIter<'_> {
    type Item = (ObjectId, u64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.index.num_objects {
            return None;
        }
        let oid = self.index.oid_at_index(self.pos);
        let offset = self.index.offset_at_index(self.pos);
        self.pos += 1;
        Some((oid, offset))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.index.num_objects - self.pos) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for PackIndexIter<'_> {}

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

#[cfg(test)]
mod tests {
    use super::*;
    use odb_hash::hasher::Hasher;

    fn make_oid(first_byte: u8, suffix: u8) -> ObjectId {
        let mut bytes = [0u8; 20];
        bytes[0] = first_byte;
        bytes[19] = suffix;
        ObjectId::from_bytes(&bytes, HashAlgorithm::Sha1).unwrap()
    }

    fn entry(first_byte: u8, offset: u64) -> PackEntry {
        PackEntry {
            oid: make_oid(first_byte, 1),
            offset,
            crc32: 0xc0de_0000 | u32::from(first_byte),
        }
    }

    fn fake_pack_checksum() -> ObjectId {
        Hasher::digest(HashAlgorithm::Sha1, b"not a real pack").unwrap()
    }

    #[test]
    fn v1_when_offsets_are_small() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.idx");
        let mut entries = vec![entry(0xaa, 12), entry(0x55, 400), entry(0x11, 900)];
        let opts = PackIndexOptions {
            version: 1,
            ..Default::default()
        };

        write_index_file(&path, &mut entries, &fake_pack_checksum(), &opts).unwrap();

        // Entries came back sorted by OID.
        let oids: Vec<u8> = entries.iter().map(|e| e.oid.first_byte()).collect();
        assert_eq!(oids, vec![0x11, 0x55, 0xaa]);

        let data = std::fs::read(&path).unwrap();
        // No v2 magic; the file starts with fanout[0].
        assert_ne!(be32(&data, 0), IDX_SIGNATURE);
        assert_eq!(be32(&data, 0x10 * 4), 0); // fanout[0x10]
        assert_eq!(be32(&data, 0x11 * 4), 1);
        assert_eq!(be32(&data, 0x55 * 4), 2);
        assert_eq!(be32(&data, 0xaa * 4), 3);
        assert_eq!(be32(&data, 0xff * 4), 3);
        // First record after fanout: offset 900, then the 0x11... OID.
        assert_eq!(be32(&data, 1024), 900);
        assert_eq!(data[1028], 0x11);

        let idx = PackIndex::open(&path, HashAlgorithm::Sha1).unwrap();
        assert_eq!(idx.version(), 1);
        assert_eq!(idx.num_objects(), 3);
        assert_eq!(idx.lookup(&make_oid(0xaa, 1)), Some(12));
        assert_eq!(idx.lookup(&make_oid(0x55, 1)), Some(400));
        assert_eq!(idx.lookup(&make_oid(0x11, 1)), Some(900));
        assert_eq!(idx.crc32_at_index(0), None);
    }

    #[test]
    fn large_offsets_force_v2() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("large.idx");
        let mut entries = vec![
            entry(0x11, 10),
            entry(0x22, 1 << 31),
            entry(0x33, (1 << 31) + 5),
        ];
        let opts = PackIndexOptions {
            version: 1, // asks for v1; large offsets must win
            ..Default::default()
        };

        write_index_file(&path, &mut entries, &fake_pack_checksum(), &opts).unwrap();

        let data = std::fs::read(&path).unwrap();
        assert_eq!(be32(&data, 0), IDX_SIGNATURE);
        assert_eq!(be32(&data, 4), 2);

        // Small-offset table: direct 10, then large slots 0 and 1.
        let n = 3;
        let off32 = 8 + 1024 + n * 20 + n * 4;
        assert_eq!(be32(&data, off32), 10);
        assert_eq!(be32(&data, off32 + 4), 0x8000_0000);
        assert_eq!(be32(&data, off32 + 8), 0x8000_0001);

        // Large table holds the real values in reference order.
        let off64 = off32 + n * 4;
        assert_eq!(be64(&data, off64), 1 << 31);
        assert_eq!(be64(&data, off64 + 8), (1 << 31) + 5);

        let idx = PackIndex::open(&path, HashAlgorithm::Sha1).unwrap();
        assert_eq!(idx.lookup(&make_oid(0x22, 1)), Some(1 << 31));
        assert_eq!(idx.lookup(&make_oid(0x33, 1)), Some((1 << 31) + 5));
        assert_eq!(idx.lookup(&make_oid(0x11, 1)), Some(10));
    }

    #[test]
    fn anomaly_offsets_are_promoted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anomaly.idx");
        let mut entries = vec![entry(0x11, 10), entry(0x22, 20), entry(0x33, 30)];
        let opts = PackIndexOptions {
            anomaly_offsets: vec![20],
            ..Default::default()
        };

        write_index_file(&path, &mut entries, &fake_pack_checksum(), &opts).unwrap();

        let data = std::fs::read(&path).unwrap();
        assert_eq!(be32(&data, 0), IDX_SIGNATURE);

        let n = 3;
        let off32 = 8 + 1024 + n * 20 + n * 4;
        assert_eq!(be32(&data, off32), 10);
        assert_eq!(be32(&data, off32 + 4), 0x8000_0000);
        assert_eq!(be32(&data, off32 + 8), 30);
        let off64 = off32 + n * 4;
        assert_eq!(be64(&data, off64), 20);

        // The reader resolves the promoted slot transparently.
        let idx = PackIndex::open(&path, HashAlgorithm::Sha1).unwrap();
        assert_eq!(idx.lookup(&make_oid(0x22, 1)), Some(20));
    }

    #[test]
    fn off32_limit_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("limit.idx");
        let mut entries = vec![entry(0x11, 5000)];
        let opts = PackIndexOptions {
            off32_limit: 4096,
            ..Default::default()
        };

        write_index_file(&path, &mut entries, &fake_pack_checksum(), &opts).unwrap();

        let data = std::fs::read(&path).unwrap();
        let off32 = 8 + 1024 + 20 + 4;
        assert_eq!(be32(&data, off32), 0x8000_0000);
        assert_eq!(be64(&data, off32 + 4), 5000);
    }

    #[test]
    fn strict_rejects_duplicate_oids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dup.idx");
        let oid = make_oid(0x42, 7);
        let mut entries = vec![
            PackEntry { oid, offset: 12, crc32: 1 },
            PackEntry { oid, offset: 300, crc32: 2 },
        ];
        let opts = PackIndexOptions {
            flags: PackIdxFlags::STRICT,
            ..Default::default()
        };

        let err =
            write_index_file(&path, &mut entries, &fake_pack_checksum(), &opts).unwrap_err();
        assert!(matches!(err, PackError::DuplicateObject { oid: d } if d == oid));
        // The partial file is gone.
        assert!(!path.exists());
    }

    #[test]
    fn duplicates_pass_without_strict() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dup-ok.idx");
        let oid = make_oid(0x42, 7);
        let mut entries = vec![
            PackEntry { oid, offset: 12, crc32: 1 },
            PackEntry { oid, offset: 300, crc32: 2 },
        ];

        write_index_file(
            &path,
            &mut entries,
            &fake_pack_checksum(),
            &PackIndexOptions::default(),
        )
        .unwrap();
        assert!(path.exists());
    }

    #[test]
    fn v2_roundtrip_through_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rt.idx");
        let mut entries = vec![
            entry(0xff, 500),
            entry(0x01, 100),
            entry(0x80, 300),
            entry(0x02, 200),
        ];
        let pack_checksum = fake_pack_checksum();

        let trailer = write_index_file(
            &path,
            &mut entries,
            &pack_checksum,
            &PackIndexOptions::default(),
        )
        .unwrap();

        let idx = PackIndex::open(&path, HashAlgorithm::Sha1).unwrap();
        assert_eq!(idx.version(), 2);
        assert_eq!(idx.num_objects(), 4);
        assert_eq!(idx.pack_checksum(), pack_checksum);
        assert_eq!(idx.index_checksum(), trailer);

        // The sorted view reconstructs (oid, offset, crc) for every slot.
        for (i, entry) in entries.iter().enumerate() {
            let i = i as u32;
            assert_eq!(idx.oid_at_index(i), entry.oid);
            assert_eq!(idx.offset_at_index(i), entry.offset);
            assert_eq!(idx.crc32_at_index(i), Some(entry.crc32));
        }
        assert_eq!(idx.iter().count(), 4);
    }

    #[test]
    fn empty_entry_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.idx");
        let mut entries: Vec<PackEntry> = Vec::new();

        write_index_file(
            &path,
            &mut entries,
            &fake_pack_checksum(),
            &PackIndexOptions::default(),
        )
        .unwrap();

        let idx = PackIndex::open(&path, HashAlgorithm::Sha1).unwrap();
        assert_eq!(idx.num_objects(), 0);
        assert_eq!(idx.lookup(&make_oid(0x00, 0)), None);
    }

    #[test]
    fn verify_mode_accepts_written_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("verify.idx");
        let mut entries = vec![entry(0x10, 100), entry(0x20, 200)];
        let pack_checksum = fake_pack_checksum();

        let written = write_index_file(
            &path,
            &mut entries,
            &pack_checksum,
            &PackIndexOptions::default(),
        )
        .unwrap();

        let opts = PackIndexOptions {
            flags: PackIdxFlags::VERIFY,
            ..Default::default()
        };
        let verified = write_index_file(&path, &mut entries, &pack_checksum, &opts).unwrap();
        assert_eq!(written, verified);
    }

    #[test]
    fn verify_mode_rejects_tampered_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tampered.idx");
        let mut entries = vec![entry(0x10, 100), entry(0x20, 200)];
        let pack_checksum = fake_pack_checksum();

        write_index_file(
            &path,
            &mut entries,
            &pack_checksum,
            &PackIndexOptions::default(),
        )
        .unwrap();

        let mut data = std::fs::read(&path).unwrap();
        data[1100] ^= 0x01;
        std::fs::write(&path, &data).unwrap();

        let opts = PackIndexOptions {
            flags: PackIdxFlags::VERIFY,
            ..Default::default()
        };
        let err = write_index_file(&path, &mut entries, &pack_checksum, &opts).unwrap_err();
        assert!(matches!(err, PackError::HashfileValidation { .. }));
        // Verify never removes the file under test.
        assert!(path.exists());
    }
}
