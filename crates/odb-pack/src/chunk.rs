//! The chunk-file container.
//!
//! Auxiliary indexes (multi-pack-index, commit-graph style files) store
//! several independently addressable blobs in one file:
//!
//! ```text
//! caller-supplied outer header
//! TOC: (id be32, offset be64) × k, then (0, end-of-last-chunk)
//! chunk bodies, in declaration order
//! caller-supplied outer trailer (rawsz digest)
//! ```
//!
//! The writer emits the TOC from declared sizes, then runs each chunk's
//! callback and holds it to its declaration. The reader parses a TOC out of
//! a memory-mapped file and hands out chunk slices by id.

use crate::csum::Hashfile;
use crate::PackError;

/// Size of one TOC slot: a 32-bit id plus a 64-bit offset.
pub const CHUNK_TOC_ENTRY_SIZE: usize = 12;

type ChunkWriteFn<C> = Box<dyn FnMut(&mut Hashfile, &mut C) -> Result<(), PackError>>;

struct ChunkDecl<C> {
    id: u32,
    size: u64,
    write: ChunkWriteFn<C>,
}

/// Writer half of the chunk-file container.
///
/// Chunks are declared up front with their exact body size, then emitted in
/// declaration order in a single pass over the output stream. The context
/// value is threaded to every callback; the stream is borrowed mutably only
/// for the duration of one body.
pub struct ChunkWriter<C> {
    chunks: Vec<ChunkDecl<C>>,
}

impl<C> ChunkWriter<C> {
    pub fn new() -> Self {
        Self { chunks: Vec::new() }
    }

    /// Declare a chunk. `id` must be non-zero (zero terminates the TOC) and
    /// `size` is the exact number of bytes `write` will produce.
    pub fn add_chunk(
        &mut self,
        id: u32,
        size: u64,
        write: impl FnMut(&mut Hashfile, &mut C) -> Result<(), PackError> + 'static,
    ) {
        debug_assert!(id != 0, "chunk id 0 is the TOC terminator");
        self.chunks.push(ChunkDecl {
            id,
            size,
            write: Box::new(write),
        });
    }

    /// Number of declared chunks.
    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Emit the TOC and every chunk body through `f`.
    ///
    /// A callback that produces a byte count different from its declaration
    /// is a bug in the caller and fails with
    /// [`PackError::ChunkSizeMismatch`]; any partial output is already on
    /// disk and is discarded by not publishing the temp file.
    pub fn write(mut self, f: &mut Hashfile, context: &mut C) -> Result<(), PackError> {
        let mut cur_offset =
            f.position() + ((self.chunks.len() as u64 + 1) * CHUNK_TOC_ENTRY_SIZE as u64);

        for chunk in &self.chunks {
            f.write_be32(chunk.id)?;
            f.write_be64(cur_offset)?;
            cur_offset += chunk.size;
        }
        // Trailing slot marks the end of the chunks.
        f.write_be32(0)?;
        f.write_be64(cur_offset)?;

        for chunk in &mut self.chunks {
            let start = f.position();
            (chunk.write)(f, context)?;
            let actual = f.position() - start;
            if actual != chunk.size {
                return Err(PackError::ChunkSizeMismatch {
                    id: chunk.id,
                    declared: chunk.size,
                    actual,
                });
            }
        }
        Ok(())
    }
}

impl<C> Default for ChunkWriter<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Reader half: the parsed TOC of a memory-mapped chunk file.
#[derive(Debug)]
pub struct ChunkReader<'a> {
    data: &'a [u8],
    chunks: Vec<(u32, std::ops::Range<usize>)>,
}

fn corrupt(reason: impl Into<String>) -> PackError {
    PackError::CorruptChunkHeader {
        reason: reason.into(),
    }
}

/// Parse the table of contents of a chunk file.
///
/// `toc_offset` is where the TOC begins in `data` and `toc_length` the
/// number of real chunks the caller expects; the final rawsz bytes of the
/// file are reserved for the outer trailer and no chunk may reach into
/// them.
pub fn read_table_of_contents(
    data: &[u8],
    toc_offset: usize,
    toc_length: usize,
    rawsz: usize,
) -> Result<ChunkReader<'_>, PackError> {
    let toc_end = toc_offset + (toc_length + 1) * CHUNK_TOC_ENTRY_SIZE;
    if toc_end > data.len() {
        return Err(corrupt("truncated table of contents"));
    }
    let limit = data
        .len()
        .checked_sub(rawsz)
        .ok_or_else(|| corrupt("file too small for trailer"))?;

    let mut chunks: Vec<(u32, std::ops::Range<usize>)> = Vec::with_capacity(toc_length);
    let mut pos = toc_offset;
    for _ in 0..toc_length {
        let id = be32(data, pos);
        let offset = be64(data, pos + 4);
        if id == 0 {
            return Err(corrupt("terminating chunk id appears earlier than expected"));
        }
        pos += CHUNK_TOC_ENTRY_SIZE;
        let next_offset = be64(data, pos + 4);

        if next_offset < offset || next_offset > limit as u64 {
            return Err(corrupt(format!(
                "improper chunk offsets {offset:#x} and {next_offset:#x}"
            )));
        }
        if chunks.iter().any(|&(existing, _)| existing == id) {
            return Err(corrupt(format!("duplicate chunk id {id:#010x}")));
        }
        chunks.push((id, offset as usize..next_offset as usize));
    }

    if be32(data, pos) != 0 {
        return Err(corrupt(format!(
            "final chunk has non-zero id {:#010x}",
            be32(data, pos)
        )));
    }

    Ok(ChunkReader { data, chunks })
}

impl<'a> ChunkReader<'a> {
    /// Number of chunks in the TOC.
    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Look up a chunk body by id.
    ///
    /// `None` is a sentinel, not a failure: optional chunks are simply
    /// absent. Use [`require_chunk`](Self::require_chunk) for mandatory
    /// ones.
    pub fn chunk(&self, id: u32) -> Option<&'a [u8]> {
        self.chunk_range(id).map(|range| &self.data[range])
    }

    /// The byte range a chunk occupies within the file.
    pub fn chunk_range(&self, id: u32) -> Option<std::ops::Range<usize>> {
        self.chunks
            .iter()
            .find(|&&(existing, _)| existing == id)
            .map(|(_, range)| range.clone())
    }

    /// Look up a chunk that must exist.
    pub fn require_chunk(&self, id: u32) -> Result<&'a [u8], PackError> {
        self.chunk(id).ok_or(PackError::ChunkNotFound { id })
    }
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
