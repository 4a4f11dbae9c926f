use std::fs;
use std::io::{self, Write};
use std::path::Path;

use crate::Result;

/// A temporary file with RAII cleanup.
///
/// Created in the same directory as its eventual target so the final rename
/// is atomic. Deleted on drop unless persisted. Writers that need their own
/// open/create semantics (the index writer opens its target exclusively) can
/// treat the temp purely as a reserved unique path: the path stays owned by
/// this value and is renamed or deleted through it.
pub struct TempFile {
    inner: Option<::tempfile::NamedTempFile>,
}

impl TempFile {
    /// Create a new temporary file in the given directory with a unique name.
    pub fn new_in(dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_prefix_in(".tmp_", dir)
    }

    /// Create a new temporary file with a mkstemp-style prefixed name, e.g.
    /// `with_prefix_in("tmp_idx_", pack_dir)` yields `pack_dir/tmp_idx_XXXXXX`.
    pub fn with_prefix_in(prefix: &str, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let named = ::tempfile::Builder::new().prefix(prefix).tempfile_in(dir)?;

        Ok(Self { inner: Some(named) })
    }

    /// The unique path reserved by this temp file.
    pub fn path(&self) -> &Path {
        self.inner.as_ref().map(|n| n.path()).unwrap_or(Path::new(""))
    }

    /// Mutable access to the underlying file handle.
    pub fn file_mut(&mut self) -> Option<&mut std::fs::File> {
        self.inner.as_mut().map(|n| n.as_file_mut())
    }

    /// Persist the temporary file by renaming it to the target path.
    /// This is the publish point; it consumes the TempFile.
    pub fn persist(mut self, target: impl AsRef<Path>) -> Result<()> {
        if let Some(named) = self.inner.take() {
            named
                .persist(target.as_ref())
                .map_err(|e| crate::error::UtilError::Io(e.error))?;
        }
        Ok(())
    }
}

impl Write for TempFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::other("temp file already closed"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::other("temp file already closed"))?
            .flush()
    }
}
