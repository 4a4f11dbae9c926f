//! Promisor pack annotation files.
//!
//! A `.promisor` file beside a pack records which remote refs the pack was
//! fetched for: one `<hex-oid> <refname>` line per ref. Ref names are byte
//! strings; they usually look like UTF-8 but nothing guarantees it.

use std::io::Write;
use std::path::Path;

use bstr::BString;
use odb_hash::ObjectId;

use crate::PackError;

/// A ref a fetch asked for, recorded in the promisor file.
#[derive(Debug, Clone)]
pub struct SoughtRef {
    pub oid: ObjectId,
    pub name: BString,
}

/// Write the promisor file for `sought`.
pub fn write_promisor_file(path: &Path, sought: &[SoughtRef]) -> Result<(), PackError> {
    let io_err = |e| PackError::io(path, e);

    let file = std::fs::File::create(path).map_err(io_err)?;
    let mut out = std::io::BufWriter::new(file);
    for r in sought {
        write!(out, "{} ", r.oid).map_err(io_err)?;
        out.write_all(r.name.as_slice()).map_err(io_err)?;
        out.write_all(b"\n").map_err(io_err)?;
    }
    out.flush().map_err(io_err)?;
    Ok(())
}
