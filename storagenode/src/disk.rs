//! Disk usage probing for registration and heartbeat reports.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl DiskUsage {
    /// statvfs on the mount point; free space is what unprivileged
    /// writers can actually use (f_bavail).
    pub fn probe(mount_point: &Path) -> std::io::Result<DiskUsage> {
        let c_path = CString::new(mount_point.as_os_str().as_bytes())
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
        let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
        if unsafe { libc::statvfs(c_path.as_ptr(), &mut st) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(DiskUsage {
            total_bytes: st.f_blocks as u64 * st.f_frsize as u64,
            free_bytes: st.f_bavail as u64 * st.f_frsize as u64,
        })
    }
}

/// Creates the data directory when absent and verifies it is a directory.
pub fn ensure_data_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)?;
    if !path.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotADirectory,
            format!("{} is not a directory", path.display()),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_reports_plausible_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let usage = DiskUsage::probe(dir.path()).unwrap();
        assert!(usage.total_bytes > 0);
        assert!(usage.free_bytes <= usage.total_bytes);
    }

    #[test]
    fn probe_of_missing_path_fails() {
        assert!(DiskUsage::probe(Path::new("/definitely/not/here")).is_err());
    }

    #[test]
    fn ensure_data_dir_creates_nested() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        ensure_data_dir(&nested).unwrap();
        assert!(nested.is_dir());
    }
}
