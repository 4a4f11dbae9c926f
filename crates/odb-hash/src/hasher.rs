use crate::{HashAlgorithm, HashError, ObjectId};

enum DigestState {
    Sha1(Box<sha1_checked::Sha1>),
    Sha256(sha2::Sha256),
}

impl DigestState {
    fn new(algo: HashAlgorithm) -> Self {
        use digest::Digest;
        match algo {
            HashAlgorithm::Sha1 => Self::Sha1(Box::new(sha1_checked::Sha1::new())),
            HashAlgorithm::Sha256 => Self::Sha256(sha2::Sha256::new()),
        }
    }

    fn finish(self) -> Result<ObjectId, HashError> {
        match self {
            Self::Sha1(h) => {
                let result = h.try_finalize();
                if result.has_collision() {
                    return Err(HashError::Sha1Collision);
                }
                let mut bytes = [0u8; 20];
                bytes.copy_from_slice(result.hash().as_slice());
                Ok(ObjectId::Sha1(bytes))
            }
            Self::Sha256(h) => {
                use digest::Digest;
                let result = h.finalize();
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(result.as_slice());
                Ok(ObjectId::Sha256(bytes))
            }
        }
    }
}

/// Streaming digest for pack-format streams.
///
/// Beyond hashing (collision-detected SHA-1 or SHA-256), this carries the
/// bookkeeping every trailer-carrying pack file needs: it counts the bytes
/// fed in, so a stream writer derives its file offsets from the digest it
/// is already maintaining, and it can open a CRC-32 window over a span of
/// the stream — the per-entry checksum a packer collects while an entry's
/// bytes flow by. [`finalize_reset`](Hasher::finalize_reset) closes the
/// current chain and starts a fresh one in place, which is how a resumed
/// pack's prefix digest is verified mid-stream.
pub struct Hasher {
    state: DigestState,
    algo: HashAlgorithm,
    nbytes: u64,
    crc: Option<crc32fast::Hasher>,
}

impl Hasher {
    /// Create a new hasher for the given algorithm.
    pub fn new(algo: HashAlgorithm) -> Self {
        Self {
            state: DigestState::new(algo),
            algo,
            nbytes: 0,
            crc: None,
        }
    }

    /// Feed data into the digest, and into the CRC window when one is open.
    pub fn update(&mut self, data: &[u8]) {
        use digest::Digest;
        match &mut self.state {
            DigestState::Sha1(h) => h.update(data),
            DigestState::Sha256(h) => h.update(data),
        }
        if let Some(crc) = &mut self.crc {
            crc.update(data);
        }
        self.nbytes += data.len() as u64;
    }

    /// The algorithm this hasher runs.
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algo
    }

    /// Total bytes fed in since creation or the last reset.
    pub fn bytes_hashed(&self) -> u64 {
        self.nbytes
    }

    /// Open a CRC-32 window over subsequent updates.
    pub fn crc32_begin(&mut self) {
        self.crc = Some(crc32fast::Hasher::new());
    }

    /// Close the CRC-32 window and return its value.
    pub fn crc32_end(&mut self) -> u32 {
        self.crc.take().map(|c| c.finalize()).unwrap_or(0)
    }

    /// Finalize and return the ObjectId.
    ///
    /// Returns an error if SHA-1 collision detection fires.
    pub fn finalize(self) -> Result<ObjectId, HashError> {
        self.state.finish()
    }

    /// Finalize, then restart the chain in place.
    ///
    /// The returned digest covers everything since the last reset;
    /// subsequent updates hash a fresh stream and the byte count starts
    /// over. An open CRC window is unaffected.
    pub fn finalize_reset(&mut self) -> Result<ObjectId, HashError> {
        let state = std::mem::replace(&mut self.state, DigestState::new(self.algo));
        self.nbytes = 0;
        state.finish()
    }

    /// Convenience: hash data in one call.
    pub fn digest(algo: HashAlgorithm, data: &[u8]) -> Result<ObjectId, HashError> {
        let mut h = Self::new(algo);
        h.update(data);
        h.finalize()
    }
}

impl std::io::Write for Hasher {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
