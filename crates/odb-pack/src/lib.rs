//! Pack and index file formats for the odbpack object store.
//!
//! This crate owns the authoritative on-disk formats: the pack index (v1 and
//! v2), the reverse index, the streamed-pack header/trailer fixup, and the
//! generic chunk-file container used by auxiliary indexes such as the
//! multi-pack-index. Writers run over a digesting stream ([`csum::Hashfile`])
//! so every file carries its digest as a trailer; readers work off memory
//! maps and validate structure as they parse.
//!
//! The digest algorithm is always threaded through as a value — there is no
//! process-wide "current hash" here, so packs under different digests can be
//! produced concurrently from one process.

pub mod chunk;
pub mod csum;
pub mod entry;
pub mod finalize;
pub mod fixup;
pub mod index;
pub mod midx;
pub mod promisor;
pub mod revindex;

use std::path::PathBuf;

use odb_hash::ObjectId;

/// Errors produced while writing or reading pack format files.
///
/// Every error is returned to the caller; the core never retries and never
/// logs. Whether a failure is fatal is the caller's decision.
#[derive(Debug, thiserror::Error)]
pub enum PackError {
    #[error("I/O error on '{path}'")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    CorruptChecksum { expected: ObjectId, actual: ObjectId },

    #[error("hashfile '{path}' validation error at byte {offset}")]
    HashfileValidation { path: PathBuf, offset: u64 },

    #[error("partial pack checksum did not match (disk corruption?)")]
    CorruptPackPrefix,

    #[error("the same object {oid} appears twice in the pack")]
    DuplicateObject { oid: ObjectId },

    #[error("bad object type {value}")]
    BadType { value: u8 },

    #[error("object header does not fit the provided buffer")]
    HeaderTooLong,

    #[error("chunk {id:#010x} declared {declared} bytes but wrote {actual}")]
    ChunkSizeMismatch { id: u32, declared: u64, actual: u64 },

    #[error("corrupt chunk table of contents: {reason}")]
    CorruptChunkHeader { reason: String },

    #[error("chunk {id:#010x} not found")]
    ChunkNotFound { id: u32 },

    #[error("unknown hash algorithm version {value}")]
    UnknownHashAlgorithm { value: u32 },

    #[error("cannot both write and verify reverse index")]
    BothWriteAndVerify,

    #[error("invalid pack index: {0}")]
    InvalidIndex(String),

    #[error(transparent)]
    Hash(#[from] odb_hash::HashError),

    #[error(transparent)]
    Util(#[from] odb_utils::UtilError),
}

impl PackError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Pack stream constants.
pub const PACK_SIGNATURE: u32 = 0x5041_434b; // "PACK"
pub const PACK_VERSION: u32 = 2;
pub const PACK_HEADER_SIZE: usize = 12;

/// Pack index v2 constants. (v1 has no header; its fanout starts at byte 0.)
pub const IDX_SIGNATURE: u32 = 0xff74_4f63; // "\377tOc"
pub const IDX_VERSION: u32 = 2;

/// Reverse index constants.
pub const RIDX_SIGNATURE: u32 = 0x5249_4458; // "RIDX"
pub const RIDX_VERSION: u32 = 1;
