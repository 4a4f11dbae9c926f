//! Digesting file streams.
//!
//! Every pack side file ends in the digest of its preceding bytes. A
//! [`Hashfile`] is a write-only sink that tees each written byte into a
//! running digest and can emit that digest as the file trailer on finalize.
//! The same surface runs in *check* mode against an existing file: written
//! bytes are compared with the on-disk content instead of stored, which is
//! how index and reverse-index verification re-generates a file without
//! touching it.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;

use bitflags::bitflags;
use odb_hash::hasher::Hasher;
use odb_hash::{HashAlgorithm, ObjectId};

use crate::PackError;

bitflags! {
    /// Finalization behavior for a [`Hashfile`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChecksumFlags: u32 {
        /// Append the digest as the file trailer (in check mode: compare it
        /// against the trailing bytes of the file).
        const HASH_IN_STREAM = 1 << 0;
        /// fsync before returning.
        const FSYNC = 1 << 1;
    }
}

enum Stream {
    Write(BufWriter<File>),
    Check(BufReader<File>),
}

/// A file stream that digests everything written through it.
pub struct Hashfile {
    stream: Stream,
    hasher: Hasher,
    path: PathBuf,
}

impl Hashfile {
    /// Wrap an already-open file for writing.
    pub fn new(file: File, path: impl Into<PathBuf>, algo: HashAlgorithm) -> Self {
        Self {
            stream: Stream::Write(BufWriter::new(file)),
            hasher: Hasher::new(algo),
            path: path.into(),
        }
    }

    /// Open an existing file in check mode: subsequent writes are compared
    /// against the file's content instead of stored.
    pub fn check(path: impl Into<PathBuf>, algo: HashAlgorithm) -> Result<Self, PackError> {
        let path = path.into();
        let file = File::open(&path).map_err(|e| PackError::io(&path, e))?;
        Ok(Self {
            stream: Stream::Check(BufReader::new(file)),
            hasher: Hasher::new(algo),
            path,
        })
    }

    /// Total bytes written so far, including bytes already flushed to the
    /// OS. The hasher sees every byte exactly once, so its count is the
    /// stream offset.
    pub fn position(&self) -> u64 {
        self.hasher.bytes_hashed()
    }

    /// The digest algorithm this stream was created with.
    pub fn algorithm(&self) -> HashAlgorithm {
        self.hasher.algorithm()
    }

    /// Append bytes; they reach the file and the digest exactly once, in
    /// program order.
    pub fn write(&mut self, buf: &[u8]) -> Result<(), PackError> {
        let start = self.hasher.bytes_hashed();
        match &mut self.stream {
            Stream::Write(w) => {
                w.write_all(buf).map_err(|e| PackError::io(&self.path, e))?;
            }
            Stream::Check(r) => {
                let mut disk = vec![0u8; buf.len()];
                r.read_exact(&mut disk).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        PackError::HashfileValidation {
                            path: self.path.clone(),
                            offset: start,
                        }
                    } else {
                        PackError::io(&self.path, e)
                    }
                })?;
                if disk != buf {
                    let first_diff = disk
                        .iter()
                        .zip(buf)
                        .position(|(a, b)| a != b)
                        .unwrap_or(0) as u64;
                    return Err(PackError::HashfileValidation {
                        path: self.path.clone(),
                        offset: start + first_diff,
                    });
                }
            }
        }
        self.hasher.update(buf);
        Ok(())
    }

    /// Write a big-endian u32.
    pub fn write_be32(&mut self, value: u32) -> Result<(), PackError> {
        self.write(&value.to_be_bytes())
    }

    /// Write a big-endian u64.
    pub fn write_be64(&mut self, value: u64) -> Result<(), PackError> {
        self.write(&value.to_be_bytes())
    }

    /// Start accumulating a CRC-32 over subsequent writes.
    ///
    /// Packers use this to collect the per-entry CRC that later lands in the
    /// index, without buffering the entry.
    pub fn crc32_begin(&mut self) {
        self.hasher.crc32_begin();
    }

    /// Stop CRC accumulation and return the value.
    pub fn crc32_end(&mut self) -> u32 {
        self.hasher.crc32_end()
    }

    /// Finish the stream: optionally emit (or check) the digest trailer and
    /// fsync. Returns the digest and the underlying file.
    pub fn finalize(self, flags: ChecksumFlags) -> Result<(ObjectId, File), PackError> {
        let Hashfile {
            stream,
            hasher,
            path,
        } = self;
        let algo = hasher.algorithm();
        let digest = hasher.finalize()?;

        match stream {
            Stream::Write(mut w) => {
                if flags.contains(ChecksumFlags::HASH_IN_STREAM) {
                    w.write_all(digest.as_bytes())
                        .map_err(|e| PackError::io(&path, e))?;
                }
                w.flush().map_err(|e| PackError::io(&path, e))?;
                let file = w
                    .into_inner()
                    .map_err(|e| PackError::io(&path, e.into_error()))?;
                if flags.contains(ChecksumFlags::FSYNC) {
                    file.sync_all().map_err(|e| PackError::io(&path, e))?;
                }
                Ok((digest, file))
            }
            Stream::Check(mut r) => {
                if flags.contains(ChecksumFlags::HASH_IN_STREAM) {
                    let mut trailer = vec![0u8; algo.digest_len()];
                    r.read_exact(&mut trailer)
                        .map_err(|e| PackError::io(&path, e))?;
                    let stored = ObjectId::from_bytes(&trailer, algo)?;
                    if stored != digest {
                        return Err(PackError::CorruptChecksum {
                            expected: stored,
                            actual: digest,
                        });
                    }
                }
                Ok((digest, r.into_inner()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    fn scratch_file(dir: &tempfile::TempDir, name: &str) -> (File, std::path::PathBuf) {
        let path = dir.path().join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .unwrap();
        (file, path)
    }

    #[test]
    fn digest_matches_content() {
        let dir = tempfile::tempdir().unwrap();
        let (file, path) = scratch_file(&dir, "out");

        let mut f = Hashfile::new(file, &path, HashAlgorithm::Sha1);
        f.write(b"hello ").unwrap();
        f.write(b"world").unwrap();
        assert_eq!(f.position(), 11);
        let (digest, _) = f.finalize(ChecksumFlags::HASH_IN_STREAM).unwrap();

        let expected = Hasher::digest(HashAlgorithm::Sha1, b"hello world").unwrap();
        assert_eq!(digest, expected);

        // Trailer on disk is the digest itself.
        let content = std::fs::read(&path).unwrap();
        assert_eq!(content.len(), 11 + 20);
        assert_eq!(&content[11..], expected.as_bytes());
    }

    #[test]
    fn be_encoders() {
        let dir = tempfile::tempdir().unwrap();
        let (file, path) = scratch_file(&dir, "out");

        let mut f = Hashfile::new(file, &path, HashAlgorithm::Sha1);
        f.write_be32(0x11223344).unwrap();
        f.write_be64(0x5566778899aabbcc).unwrap();
        assert_eq!(f.position(), 12);
        f.finalize(ChecksumFlags::empty()).unwrap();

        let content = std::fs::read(&path).unwrap();
        assert_eq!(
            content,
            [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc]
        );
    }

    #[test]
    fn check_mode_accepts_identical_stream() {
        let dir = tempfile::tempdir().unwrap();
        let (file, path) = scratch_file(&dir, "out");

        let mut f = Hashfile::new(file, &path, HashAlgorithm::Sha1);
        f.write(b"stable content").unwrap();
        f.finalize(ChecksumFlags::HASH_IN_STREAM).unwrap();

        let mut c = Hashfile::check(&path, HashAlgorithm::Sha1).unwrap();
        c.write(b"stable content").unwrap();
        c.finalize(ChecksumFlags::HASH_IN_STREAM).unwrap();
    }

    #[test]
    fn check_mode_rejects_divergent_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let (file, path) = scratch_file(&dir, "out");

        let mut f = Hashfile::new(file, &path, HashAlgorithm::Sha1);
        f.write(b"stable content").unwrap();
        f.finalize(ChecksumFlags::HASH_IN_STREAM).unwrap();

        let mut c = Hashfile::check(&path, HashAlgorithm::Sha1).unwrap();
        let err = c.write(b"stable CONTENT").unwrap_err();
        match err {
            PackError::HashfileValidation { offset, .. } => assert_eq!(offset, 7),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn check_mode_rejects_corrupt_trailer() {
        let dir = tempfile::tempdir().unwrap();
        let (file, path) = scratch_file(&dir, "out");

        let mut f = Hashfile::new(file, &path, HashAlgorithm::Sha1);
        f.write(b"payload").unwrap();
        f.finalize(ChecksumFlags::HASH_IN_STREAM).unwrap();

        // Flip one trailer byte.
        let mut content = std::fs::read(&path).unwrap();
        let last = content.len() - 1;
        content[last] ^= 0xff;
        std::fs::write(&path, &content).unwrap();

        let mut c = Hashfile::check(&path, HashAlgorithm::Sha1).unwrap();
        c.write(b"payload").unwrap();
        let err = c.finalize(ChecksumFlags::HASH_IN_STREAM).unwrap_err();
        assert!(matches!(err, PackError::CorruptChecksum { .. }));
    }

    #[test]
    fn crc_accumulates_between_markers() {
        let dir = tempfile::tempdir().unwrap();
        let (file, path) = scratch_file(&dir, "out");

        let mut f = Hashfile::new(file, &path, HashAlgorithm::Sha1);
        f.write(b"before").unwrap();
        f.crc32_begin();
        f.write(b"tracked ").unwrap();
        f.write(b"bytes").unwrap();
        let crc = f.crc32_end();
        f.write(b"after").unwrap();
        f.finalize(ChecksumFlags::empty()).unwrap();

        assert_eq!(crc, crc32fast::hash(b"tracked bytes"));
    }

    #[test]
    fn sha256_trailer_width() {
        let dir = tempfile::tempdir().unwrap();
        let (file, path) = scratch_file(&dir, "out");

        let mut f = Hashfile::new(file, &path, HashAlgorithm::Sha256);
        f.write(b"x").unwrap();
        f.finalize(ChecksumFlags::HASH_IN_STREAM | ChecksumFlags::FSYNC)
            .unwrap();

        assert_eq!(std::fs::read(&path).unwrap().len(), 1 + 32);
    }
}
