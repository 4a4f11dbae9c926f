//! Pack header emission and post-stream fixup.
//!
//! A pack being streamed to disk starts with a placeholder entry count; once
//! the real count is known the header is rewritten in place and the trailing
//! digest computed over the rewritten file. The fixup can simultaneously
//! validate that a prefix of the file, as it originally stood, hashes to a
//! caller-provided digest — used when a pack was resumed from a partial
//! download.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use odb_hash::hasher::Hasher;
use odb_hash::{HashAlgorithm, ObjectId};

use crate::csum::Hashfile;
use crate::{PackError, PACK_HEADER_SIZE, PACK_SIGNATURE, PACK_VERSION};

/// Write the 12-byte pack header through a digesting stream. Returns the
/// header size, which is the offset of the first entry.
pub fn write_pack_header(f: &mut Hashfile, num_entries: u32) -> Result<u64, PackError> {
    f.write_be32(PACK_SIGNATURE)?;
    f.write_be32(PACK_VERSION)?;
    f.write_be32(num_entries)?;
    Ok(PACK_HEADER_SIZE as u64)
}

/// A prefix validation request for [`fixup_pack_header_footer`]: bytes
/// `[0, offset)` of the file as they originally stood must hash to
/// `expected`.
#[derive(Debug, Clone)]
pub struct PartialChecksum {
    pub expected: ObjectId,
    pub offset: u64,
}

/// What the fixup produced.
#[derive(Debug, Clone)]
pub struct FixupOutcome {
    /// The new pack trailer, written as the last rawsz bytes of the file.
    pub pack_checksum: ObjectId,
    /// With a [`PartialChecksum`] in effect: the digest of the bytes from
    /// the validated boundary to the end of the (pre-trailer) file.
    pub tail_checksum: Option<ObjectId>,
}

/// Rewrite the entry count of a streamed pack and append its trailer.
///
/// The header rewrite lands on disk before any body byte is read, so the
/// trailing digest covers the file exactly as it now appears. The body is
/// streamed in 8 KiB buffers; the first read is shortened by the header size
/// so later reads stay block-aligned.
///
/// A mismatching [`PartialChecksum`] fails with
/// [`PackError::CorruptPackPrefix`] and leaves the file with a rewritten
/// header but no trailer.
pub fn fixup_pack_header_footer(
    file: &mut File,
    path: &Path,
    algo: HashAlgorithm,
    object_count: u32,
    partial: Option<PartialChecksum>,
) -> Result<FixupOutcome, PackError> {
    const BUF_SZ: usize = 8 * 1024;

    let io_err = |e| PackError::io(path, e);

    let mut old_hash = Hasher::new(algo);
    let mut new_hash = Hasher::new(algo);

    file.seek(SeekFrom::Start(0)).map_err(io_err)?;
    let mut hdr = [0u8; PACK_HEADER_SIZE];
    file.read_exact(&mut hdr).map_err(io_err)?;
    old_hash.update(&hdr);
    hdr[8..12].copy_from_slice(&object_count.to_be_bytes());
    new_hash.update(&hdr);
    file.seek(SeekFrom::Start(0)).map_err(io_err)?;
    file.write_all(&hdr).map_err(io_err)?;

    let mut prefix_remaining = partial
        .as_ref()
        .map(|p| p.offset.saturating_sub(PACK_HEADER_SIZE as u64));
    let mut prefix_done = false;

    let mut buf = vec![0u8; BUF_SZ];
    let mut aligned = BUF_SZ - PACK_HEADER_SIZE;
    loop {
        if !prefix_done {
            if let (Some(0), Some(p)) = (prefix_remaining, partial.as_ref()) {
                // The prefix is fully hashed; verify it and let the context
                // start over on the remainder.
                let digest = old_hash.finalize_reset()?;
                if digest != p.expected {
                    return Err(PackError::CorruptPackPrefix);
                }
                prefix_done = true;
            }
        }

        let want = match prefix_remaining {
            Some(remaining) if !prefix_done => aligned.min(remaining as usize),
            _ => aligned,
        };
        let n = file.read(&mut buf[..want]).map_err(io_err)?;
        if n == 0 {
            break;
        }
        new_hash.update(&buf[..n]);

        aligned -= n;
        if aligned == 0 {
            aligned = BUF_SZ;
        }

        if partial.is_some() {
            old_hash.update(&buf[..n]);
            if !prefix_done {
                prefix_remaining = prefix_remaining.map(|r| r - n as u64);
            }
        }
    }

    let tail_checksum = if partial.is_some() {
        Some(old_hash.finalize()?)
    } else {
        None
    };

    let pack_checksum = new_hash.finalize()?;
    file.write_all(pack_checksum.as_bytes()).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;

    Ok(FixupOutcome {
        pack_checksum,
        tail_checksum,
    })
}
