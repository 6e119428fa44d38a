//! Exclusive ownership of a data directory.
//!
//! Journals are mirrored in memory by the process that opened them, so two
//! processes appending to the same directory would hand out the same audit
//! sequence numbers. The first opener takes an advisory lock on `LOCK`; any
//! other opener is refused until the holder drops it.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::error::{GatewayError, Result};

/// Lock file name inside the data directory.
pub const LOCK_FILE: &str = "LOCK";

/// Held for as long as the directory is in use. Unlocks on drop.
#[derive(Debug)]
pub struct DirLock {
    file: File,
    path: PathBuf,
}

impl DirLock {
    /// Take the lock on `dir`, failing with `Configuration` if another
    /// gateway holds it.
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind() {
                let holder = std::fs::read_to_string(&path).unwrap_or_default();
                return Err(GatewayError::configuration(format!(
                    "data directory {} is in use by another gateway (pid {})",
                    dir.display(),
                    holder.trim()
                )));
            }
            return Err(e.into());
        }

        file.set_len(0)?;
        write!(file, "{}", std::process::id())?;
        file.sync_data()?;
        debug!(path = %path.display(), "data directory locked");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_holder_is_refused_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let held = DirLock::acquire(dir.path()).unwrap();
        assert!(held.path().ends_with(LOCK_FILE));

        let err = DirLock::acquire(dir.path()).unwrap_err();
        assert!(matches!(err, GatewayError::Configuration { .. }));
        assert!(err.to_string().contains(&std::process::id().to_string()));

        drop(held);
        assert!(DirLock::acquire(dir.path()).is_ok());
    }
}
