//! Reverse index: pack-order positions back to index-order positions.
//!
//! `.rev` file format:
//!
//! ```text
//! Header:  RIDX | version=1 | oid_version (1 = 20-byte, 2 = 32-byte)
//! Body:    N × be32 index positions, sorted by the entry's pack offset
//! Trailer: pack checksum | rev checksum
//! ```
//!
//! The entry count is not stored; it falls out of the file size.

use std::path::Path;

use memmap2::Mmap;
use odb_hash::{HashAlgorithm, ObjectId};

use crate::csum::{ChecksumFlags, Hashfile};
use crate::entry::PackEntry;
use crate::index::{PackIdxFlags, PackIndex};
use crate::{PackError, RIDX_SIGNATURE, RIDX_VERSION};

/// Write (or verify) a `.rev` file for `entries`.
///
/// `entries` must already be in OID order — the order the index writer
/// leaves them in — because the positions written here index into that
/// sorted view.
///
/// Returns the rev trailer digest, or `None` when nothing was produced:
/// with neither [`PackIdxFlags::WRITE_REV`] nor
/// [`PackIdxFlags::WRITE_REV_VERIFY`] set this is a no-op, and verifying a
/// missing file succeeds silently because reverse indexes are optional.
pub fn write_rev_file(
    rev_path: &Path,
    entries: &[PackEntry],
    pack_checksum: &ObjectId,
    flags: PackIdxFlags,
) -> Result<Option<ObjectId>, PackError> {
    let write = flags.contains(PackIdxFlags::WRITE_REV);
    let verify = flags.contains(PackIdxFlags::WRITE_REV_VERIFY);
    if write && verify {
        return Err(PackError::BothWriteAndVerify);
    }

    let f = if write {
        match std::fs::remove_file(rev_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(PackError::io(rev_path, e)),
        }
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(rev_path)
            .map_err(|e| PackError::io(rev_path, e))?;
        Hashfile::new(file, rev_path, pack_checksum.algorithm())
    } else if verify {
        match std::fs::metadata(rev_path) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PackError::io(rev_path, e)),
        }
        Hashfile::check(rev_path, pack_checksum.algorithm())?
    } else {
        return Ok(None);
    };

    match write_rev_stream(f, entries, pack_checksum, verify) {
        Ok(digest) => Ok(Some(digest)),
        Err(e) => {
            if write {
                let _ = std::fs::remove_file(rev_path);
            }
            Err(e)
        }
    }
}

fn write_rev_stream(
    mut f: Hashfile,
    entries: &[PackEntry],
    pack_checksum: &ObjectId,
    verify: bool,
) -> Result<ObjectId, PackError> {
    f.write_be32(RIDX_SIGNATURE)?;
    f.write_be32(RIDX_VERSION)?;
    f.write_be32(pack_checksum.algorithm().oid_version())?;

    // Positions into the OID-sorted list, ordered by pack offset; sort_by_key
    // is stable, so equal offsets keep index order.
    let mut pack_order: Vec<u32> = (0..entries.len() as u32).collect();
    pack_order.sort_by_key(|&i| entries[i as usize].offset);
    for position in pack_order {
        f.write_be32(position)?;
    }

    f.write(pack_checksum.as_bytes())?;

    let mut flags = ChecksumFlags::HASH_IN_STREAM;
    if !verify {
        flags |= ChecksumFlags::FSYNC;
    }
    let (digest, _file) = f.finalize(flags)?;
    Ok(digest)
}

/// Reverse index lookup: pack offset → index position.
///
/// Can be built in memory from a pack index or loaded from a `.rev` file.
#[derive(Debug)]
pub struct ReverseIndex {
    /// `(offset, index_position)` pairs sorted by offset.
    entries: Vec<(u64, u32)>,
}

impl ReverseIndex {
    /// Build the reverse mapping in memory from a pack index.
    pub fn build(index: &PackIndex) -> Self {
        let mut entries: Vec<(u64, u32)> = (0..index.num_objects())
            .map(|i| (index.offset_at_index(i), i))
            .collect();
        entries.sort_by_key(|&(offset, _)| offset);
        Self { entries }
    }

    /// Load a `.rev` file, validating it against its pack index.
    pub fn open(rev_path: impl AsRef<Path>, index: &PackIndex) -> Result<Self, PackError> {
        let rev_path = rev_path.as_ref();
        let file = std::fs::File::open(rev_path).map_err(|e| PackError::io(rev_path, e))?;
        let data = unsafe { Mmap::map(&file) }.map_err(|e| PackError::io(rev_path, e))?;

        let rawsz = index.pack_checksum().algorithm().digest_len();
        if data.len() < 12 + 2 * rawsz {
            return Err(PackError::InvalidIndex("rev file too small".into()));
        }

        if be32(&data, 0) != RIDX_SIGNATURE {
            return Err(PackError::InvalidIndex("bad RIDX signature".into()));
        }
        let version = be32(&data, 4);
        if version != RIDX_VERSION {
            return Err(PackError::InvalidIndex(format!(
                "unsupported rev index version {version}"
            )));
        }
        let oid_version = be32(&data, 8);
        let algo = HashAlgorithm::from_oid_version(oid_version)
            .ok_or(PackError::UnknownHashAlgorithm { value: oid_version })?;
        if algo.digest_len() != rawsz {
            return Err(PackError::InvalidIndex(format!(
                "rev index is {algo} but the pack index is not"
            )));
        }

        let body = data.len() - 12 - 2 * rawsz;
        if body % 4 != 0 {
            return Err(PackError::InvalidIndex("rev file truncated".into()));
        }
        let num_objects = (body / 4) as u32;
        if num_objects != index.num_objects() {
            return Err(PackError::InvalidIndex(format!(
                "rev index has {num_objects} objects but the pack index has {}",
                index.num_objects()
            )));
        }

        let mut entries = Vec::with_capacity(num_objects as usize);
        for i in 0..num_objects as usize {
            let position = be32(&data, 12 + i * 4);
            if position >= num_objects {
                return Err(PackError::InvalidIndex(format!(
                    "rev index position {position} out of range"
                )));
            }
            entries.push((index.offset_at_index(position), position));
        }

        // The body is sorted by offset by construction.
        Ok(Self { entries })
    }

    /// Index position of the object at the given pack offset.
    pub fn index_position_at_offset(&self, offset: u64) -> Option<u32> {
        self.entries
            .binary_search_by_key(&offset, |&(off, _)| off)
            .ok()
            .map(|pos| self.entries[pos].1)
    }

    /// OID of the object at the given pack offset.
    pub fn lookup_offset(&self, offset: u64, index: &PackIndex) -> Option<ObjectId> {
        self.index_position_at_offset(offset)
            .map(|pos| index.oid_at_index(pos))
    }

    /// Number of entries.
    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    /// Iterate over `(offset, index_position)` pairs in offset order.
    pub fn iter(&self) -> impl Iterator<Item = &(u64, u32)> {
        self.entries.iter()
    }
}

fn be32(data: &[u8], pos: usize) -> u32 {
    u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{write_index_file, PackIndexOptions};
    use odb_hash::hasher::Hasher;

    fn make_oid(first_byte: u8, suffix: u8) -> ObjectId {
        let mut bytes = [0u8; 20];
        bytes[0] = first_byte;
        bytes[19] = suffix;
        ObjectId::from_bytes(&bytes, HashAlgorithm::Sha1).unwrap()
    }

    fn pack_checksum() -> ObjectId {
        Hasher::digest(HashAlgorithm::Sha1, b"rev test pack").unwrap()
    }

    fn sample_entries() -> Vec<PackEntry> {
        // OID order: 0x10, 0x20, 0x30; pack order: 0x20, 0x30, 0x10.
        vec![
            PackEntry { oid: make_oid(0x10, 1), offset: 900, crc32: 0 },
            PackEntry { oid: make_oid(0x20, 2), offset: 12, crc32: 0 },
            PackEntry { oid: make_oid(0x30, 3), offset: 400, crc32: 0 },
        ]
    }

    #[test]
    fn positions_sorted_by_pack_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.rev");

        let digest = write_rev_file(
            &path,
            &sample_entries(),
            &pack_checksum(),
            PackIdxFlags::WRITE_REV,
        )
        .unwrap();
        assert!(digest.is_some());

        let data = std::fs::read(&path).unwrap();
        assert_eq!(be32(&data, 0), RIDX_SIGNATURE);
        assert_eq!(be32(&data, 4), RIDX_VERSION);
        assert_eq!(be32(&data, 8), 1); // SHA-1
        // Offsets 12, 400, 900 belong to sorted positions 1, 2, 0.
        assert_eq!(be32(&data, 12), 1);
        assert_eq!(be32(&data, 16), 2);
        assert_eq!(be32(&data, 20), 0);
        assert_eq!(data.len(), 12 + 3 * 4 + 40);
    }

    #[test]
    fn sha256_oid_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s256.rev");
        let checksum = Hasher::digest(HashAlgorithm::Sha256, b"pack").unwrap();
        let entries = [PackEntry {
            oid: ObjectId::from_bytes(&[7u8; 32], HashAlgorithm::Sha256).unwrap(),
            offset: 12,
            crc32: 0,
        }];

        write_rev_file(&path, &entries, &checksum, PackIdxFlags::WRITE_REV).unwrap();

        let data = std::fs::read(&path).unwrap();
        assert_eq!(be32(&data, 8), 2);
        assert_eq!(data.len(), 12 + 4 + 64);
    }

    #[test]
    fn write_and_verify_are_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("both.rev");
        let err = write_rev_file(
            &path,
            &sample_entries(),
            &pack_checksum(),
            PackIdxFlags::WRITE_REV | PackIdxFlags::WRITE_REV_VERIFY,
        )
        .unwrap_err();
        assert!(matches!(err, PackError::BothWriteAndVerify));
    }

    #[test]
    fn no_flags_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noop.rev");
        let result = write_rev_file(
            &path,
            &sample_entries(),
            &pack_checksum(),
            PackIdxFlags::empty(),
        )
        .unwrap();
        assert!(result.is_none());
        assert!(!path.exists());
    }

    #[test]
    fn verify_missing_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.rev");
        let result = write_rev_file(
            &path,
            &sample_entries(),
            &pack_checksum(),
            PackIdxFlags::WRITE_REV_VERIFY,
        )
        .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn verify_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("check.rev");
        let entries = sample_entries();
        let checksum = pack_checksum();

        let written =
            write_rev_file(&path, &entries, &checksum, PackIdxFlags::WRITE_REV).unwrap();
        let verified =
            write_rev_file(&path, &entries, &checksum, PackIdxFlags::WRITE_REV_VERIFY).unwrap();
        assert_eq!(written, verified);
    }

    #[test]
    fn reader_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let idx_path = dir.path().join("rt.idx");
        let rev_path = dir.path().join("rt.rev");
        let checksum = pack_checksum();

        let mut entries = sample_entries();
        write_index_file(&idx_path, &mut entries, &checksum, &PackIndexOptions::default())
            .unwrap();
        write_rev_file(&rev_path, &entries, &checksum, PackIdxFlags::WRITE_REV).unwrap();

        let index = PackIndex::open(&idx_path, HashAlgorithm::Sha1).unwrap();
        let rev = ReverseIndex::open(&rev_path, &index).unwrap();

        assert_eq!(rev.num_entries(), 3);
        assert_eq!(rev.lookup_offset(12, &index), Some(make_oid(0x20, 2)));
        assert_eq!(rev.lookup_offset(400, &index), Some(make_oid(0x30, 3)));
        assert_eq!(rev.lookup_offset(900, &index), Some(make_oid(0x10, 1)));
        assert_eq!(rev.lookup_offset(777, &index), None);

        // Offsets of sorted positions are non-decreasing in pack order.
        let offsets: Vec<u64> = rev.iter().map(|&(off, _)| off).collect();
        assert_eq!(offsets, vec![12, 400, 900]);

        // The in-memory construction agrees with the file.
        let built = ReverseIndex::build(&index);
        let built_pairs: Vec<_> = built.iter().copied().collect();
        let read_pairs: Vec<_> = rev.iter().copied().collect();
        assert_eq!(built_pairs, read_pairs);
    }

    #[test]
    fn reader_rejects_unknown_oid_version() {
        let dir = tempfile::tempdir().unwrap();
        let idx_path = dir.path().join("bad.idx");
        let rev_path = dir.path().join("bad.rev");
        let checksum = pack_checksum();

        let mut entries = sample_entries();
        write_index_file(&idx_path, &mut entries, &checksum, &PackIndexOptions::default())
            .unwrap();
        write_rev_file(&rev_path, &entries, &checksum, PackIdxFlags::WRITE_REV).unwrap();

        let mut data = std::fs::read(&rev_path).unwrap();
        data[8..12].copy_from_slice(&9u32.to_be_bytes());
        std::fs::write(&rev_path, &data).unwrap();

        let index = PackIndex::open(&idx_path, HashAlgorithm::Sha1).unwrap();
        let err = ReverseIndex::open(&rev_path, &index).unwrap_err();
        assert!(matches!(err, PackError::UnknownHashAlgorithm { value: 9 }));
    }
}
