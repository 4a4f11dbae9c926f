use std::io;
use std::path::Path;

/// Widen a freshly written temp file's permissions so other readers of a
/// shared repository can use it once it is renamed into place.
///
/// Temp files are created mode 0600; published pack files must be at least
/// world-readable. Owner write permission is preserved.
#[cfg(unix)]
pub fn adjust_shared_perm(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path)?;
    let mut perms = metadata.permissions();
    let mode = perms.mode();
    perms.set_mode(mode | 0o444);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
pub fn adjust_shared_perm(_path: &Path) -> io::Result<()> {
    Ok(())
}
