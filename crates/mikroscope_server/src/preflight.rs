//! Startup preflight: directory writability and free-space probes.

use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::info;

const PROBE_FILE_NAME: &str = ".mikroscope-preflight";

/// Verify a directory exists, is writable, and sits on a filesystem
/// with at least `min_free_bytes` available. Any failure aborts
/// startup.
pub fn preflight_dir(dir: &Path, min_free_bytes: u64) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))?;

    let probe = dir.join(PROBE_FILE_NAME);
    std::fs::write(&probe, b"probe")
        .with_context(|| format!("directory {} is not writable", dir.display()))?;
    std::fs::remove_file(&probe)
        .with_context(|| format!("failed to remove probe file in {}", dir.display()))?;

    if let Some(free) = free_bytes(dir) {
        if free < min_free_bytes {
            bail!(
                "{} has {free} bytes free, below the required {min_free_bytes}",
                dir.display()
            );
        }
        info!(dir = %dir.display(), free_bytes = free, "preflight ok");
    }

    Ok(())
}

/// Free bytes on the filesystem holding `path`, when the platform can
/// tell us.
#[cfg(unix)]
pub fn free_bytes(path: &Path) -> Option<u64> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    Some(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
pub fn free_bytes(_path: &Path) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn preflight_creates_and_probes() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("data").join("index");
        preflight_dir(&target, 0).expect("preflight");
        assert!(target.is_dir());
        assert!(!target.join(PROBE_FILE_NAME).exists());
    }

    #[test]
    fn preflight_rejects_absurd_free_space_requirement() {
        let dir = TempDir::new().expect("tempdir");
        let err = preflight_dir(dir.path(), u64::MAX).expect_err("must fail");
        assert!(err.to_string().contains("below the required"));
    }

    #[cfg(unix)]
    #[test]
    fn free_bytes_reports_something() {
        let dir = TempDir::new().expect("tempdir");
        assert!(free_bytes(dir.path()).is_some());
    }
}
