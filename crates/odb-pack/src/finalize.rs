//! Publishing a finished pack.
//!
//! A pack is streamed into a temp file; once its trailer digest is known the
//! triplet `(pack, idx, rev)` is produced beside it under the
//! content-addressed name `pack-<hex>` and renamed into place. The renames
//! are the publish point: before the first one only discardable temps
//! exist.

use std::path::{Path, PathBuf};

use odb_hash::ObjectId;
use odb_utils::perm::adjust_shared_perm;
use odb_utils::tempfile::TempFile;

use crate::entry::PackEntry;
use crate::index::{write_index_file, PackIdxFlags, PackIndexOptions};
use crate::revindex::write_rev_file;
use crate::PackError;

/// Final paths of a published pack triplet.
#[derive(Debug, Clone)]
pub struct PublishedPack {
    pub pack: PathBuf,
    pub index: PathBuf,
    pub rev_index: Option<PathBuf>,
}

/// Index and publish a streamed pack.
///
/// `pack_tmp` is the finished temp pack (header fixed up, trailer written)
/// and `pack_checksum` its trailer digest, which also names the published
/// files. `entries` is sorted by OID as a side effect.
///
/// Renames happen in the order pack, idx, rev. A rename failure after the
/// pack rename leaves a published pack without its index; recovering from
/// that is the caller's problem — no rollback is attempted here.
pub fn finish_tmp_packfile(
    pack_dir: &Path,
    pack_tmp: &Path,
    entries: &mut [PackEntry],
    pack_checksum: &ObjectId,
    opts: &PackIndexOptions,
) -> Result<PublishedPack, PackError> {
    adjust_shared_perm(pack_tmp).map_err(|e| PackError::io(pack_tmp, e))?;

    let idx_tmp = TempFile::with_prefix_in("tmp_idx_", pack_dir)?;
    write_index_file(idx_tmp.path(), entries, pack_checksum, opts)?;
    adjust_shared_perm(idx_tmp.path()).map_err(|e| PackError::io(idx_tmp.path(), e))?;

    let mut rev_tmp = None;
    if opts.flags.contains(PackIdxFlags::WRITE_REV) {
        let tmp = TempFile::with_prefix_in("tmp_rev_", pack_dir)?;
        write_rev_file(tmp.path(), entries, pack_checksum, opts.flags)?;
        adjust_shared_perm(tmp.path()).map_err(|e| PackError::io(tmp.path(), e))?;
        rev_tmp = Some(tmp);
    }

    let hex = pack_checksum.to_hex();

    let pack = pack_dir.join(format!("pack-{hex}.pack"));
    std::fs::rename(pack_tmp, &pack).map_err(|e| PackError::io(pack_tmp, e))?;

    let index = pack_dir.join(format!("pack-{hex}.idx"));
    idx_tmp.persist(&index)?;

    let rev_index = match rev_tmp {
        Some(tmp) => {
            let path = pack_dir.join(format!("pack-{hex}.rev"));
            tmp.persist(&path)?;
            Some(path)
        }
        None => None,
    };

    Ok(PublishedPack {
        pack,
        index,
        rev_index,
    })
}
