//! Per-run scratch directory.

use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// RAII guard: the scratch tree is removed on drop, whatever ended the run.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    /// Create a fresh, uniquely named directory under `parent`.
    pub fn create(parent: &Path) -> Result<Self> {
        let n = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let path = parent.join(format!("livecd-builder.{}.{n}", std::process::id()));
        fs::create_dir_all(&path)
            .with_context(|| format!("creating scratch directory '{}'", path.display()))?;
        debug!(path = %path.display(), "Created scratch directory");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed scratch directory"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                path = %self.path.display(),
                error = %err,
                "Failed to remove scratch directory"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn removed_on_drop() {
        let tmp = TempDir::new().unwrap();
        let path = {
            let scratch = ScratchDir::create(tmp.path()).unwrap();
            fs::create_dir_all(scratch.path().join("build-a/chroot/etc")).unwrap();
            fs::write(scratch.path().join("build-a/chroot/etc/motd"), b"hi").unwrap();
            scratch.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn each_run_gets_its_own_directory() {
        let tmp = TempDir::new().unwrap();
        let a = ScratchDir::create(tmp.path()).unwrap();
        let b = ScratchDir::create(tmp.path()).unwrap();
        assert_ne!(a.path(), b.path());
    }
}
