use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Applies `mode` to `path` only if it doesn't already match, to avoid
/// needless metadata churn on every session.
fn apply_mode<P: AsRef<Path>>(path: P, mode: u32) -> std::io::Result<()> {
    let current = std::fs::metadata(&path)?.permissions();
    if (current.mode() & 0o777) != mode {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

/// `0750` — per-session recording directories.
pub fn secure_directory<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    apply_mode(path, 0o750)
}

/// `0640` — recording artifact files.
pub fn secure_file<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    apply_mode(path, 0o640)
}

/// `0600` — the known-hosts file, append-only and host-key bearing.
pub fn secure_secret_file<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    apply_mode(path, 0o600)
}
