//! Crash-safe file persistence for the vault file.

use anyhow::{Context, Result};
use getrandom::fill;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Exclusive lock on the vault's `.lock` sibling, held across processes.
/// Released when dropped, or by the OS when the process dies.
#[derive(Debug)]
pub struct StorageLock {
    _file: File,
}

/// Reads and atomically replaces a single file on disk.
///
/// A save is only visible once it is complete: after a crash the file holds
/// either the previous contents or the new ones, never a partial write. The
/// file backend relies on this to make a passphrase rotation all-or-nothing.
#[derive(Clone, Debug)]
pub struct Storage {
    path: PathBuf,
}

impl Storage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the entire file into memory.
    pub fn load(&self) -> Result<Vec<u8>> {
        fs::read(&self.path).with_context(|| format!("failed to read {}", self.path.display()))
    }

    /// Blocks until no other process or handle holds the vault lock.
    ///
    /// The lock covers a whole read-modify-write cycle; plain reads do not
    /// need it since saves replace the file atomically.
    pub fn lock(&self) -> Result<StorageLock> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let lock_path = self.sibling("lock")?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("failed to open {}", lock_path.display()))?;
        file.lock()
            .with_context(|| format!("failed to lock {}", lock_path.display()))?;

        Ok(StorageLock { _file: file })
    }

    /// Replaces the file contents atomically.
    ///
    /// 1. write to a fresh temporary file next to the target and fsync it
    /// 2. rename it over the target
    /// 3. fsync the parent directory so the rename survives a crash
    ///
    /// Parent directories are created when missing. The temporary file is
    /// removed if the replace fails.
    pub fn save(&self, data: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let tmp_path = self.random_tmp_path()?;

        let mut tmp_file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .context("failed to create temporary file")?;

        if let Err(e) = tmp_file.write_all(data).and_then(|_| tmp_file.sync_all()) {
            drop(tmp_file);
            let _ = fs::remove_file(&tmp_path);
            return Err(e).context("failed to write temporary file");
        }
        drop(tmp_file);

        if let Err(e) = self.atomic_replace(&tmp_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }

        if let Some(parent) = self.path.parent() {
            File::open(parent)?.sync_all()?;
        }

        debug!(path = %self.path.display(), bytes = data.len(), "vault file replaced");
        Ok(())
    }

    /// `<file name>.tmp.<16 hex chars>` in the target's directory.
    fn random_tmp_path(&self) -> Result<PathBuf> {
        let mut buf = [0u8; 8];
        fill(&mut buf).map_err(|_| anyhow::anyhow!("OS random generator unavailable"))?;

        let suffix: String = buf.iter().map(|b| format!("{b:02x}")).collect();
        self.sibling(&format!("tmp.{suffix}"))
    }

    /// `<file name>.<extension>` next to the vault file.
    fn sibling(&self, extension: &str) -> Result<PathBuf> {
        let file_name = self
            .path
            .file_name()
            .context("vault path has no file name")?
            .to_string_lossy();

        Ok(self.path.with_file_name(format!("{file_name}.{extension}")))
    }

    /// Uses `ReplaceFileW` with `REPLACEFILE_WRITE_THROUGH`; falls back to a
    /// plain rename when the target does not exist yet.
    #[cfg(target_os = "windows")]
    fn atomic_replace(&self, tmp_path: &Path) -> Result<()> {
        use std::ffi::OsStr;
        use std::os::windows::ffi::OsStrExt;
        use windows_sys::Win32::Storage::FileSystem::{REPLACEFILE_WRITE_THROUGH, ReplaceFileW};

        if !self.path.exists() {
            fs::rename(tmp_path, &self.path)?;
            return Ok(());
        }

        fn to_wide(s: &OsStr) -> Vec<u16> {
            s.encode_wide().chain(std::iter::once(0)).collect()
        }

        let target_w = to_wide(self.path.as_os_str());
        let tmp_w = to_wide(tmp_path.as_os_str());

        // SAFETY: both buffers are NUL-terminated UTF-16 and outlive the call;
        // Windows does not keep the pointers.
        let result = unsafe {
            ReplaceFileW(
                target_w.as_ptr(),
                tmp_w.as_ptr(),
                std::ptr::null(),
                REPLACEFILE_WRITE_THROUGH,
                std::ptr::null(),
                std::ptr::null(),
            )
        };

        if result == 0 {
            let err = std::io::Error::last_os_error();
            return Err(err).context("atomic replace failed");
        }

        Ok(())
    }

    /// `rename()` is atomic on the same filesystem.
    #[cfg(not(target_os = "windows"))]
    fn atomic_replace(&self, tmp_path: &Path) -> Result<()> {
        fs::rename(tmp_path, &self.path).context("atomic replace failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_returns_written_data() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("vault.db"));

        storage.save(b"hello world").unwrap();

        assert_eq!(storage.load().unwrap(), b"hello world");
    }

    #[test]
    fn load_fails_if_file_does_not_exist() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("missing.db"));

        assert!(storage.load().is_err());
        assert!(!storage.exists());
    }

    #[test]
    fn save_replaces_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.db");
        let storage = Storage::new(path.clone());

        storage.save(b"first").unwrap();
        storage.save(b"second").unwrap();

        assert_eq!(fs::read(path).unwrap(), b"second");
    }

    #[test]
    fn tmp_file_is_removed_after_success() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("vault.db"));
        storage.save(b"data").unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();

        assert_eq!(entries, vec!["vault.db"]);
    }

    #[test]
    fn tmp_paths_are_unique_siblings() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.db");
        let storage = Storage::new(path.clone());

        let a = storage.random_tmp_path().unwrap();
        let b = storage.random_tmp_path().unwrap();

        assert_ne!(a, b);
        assert_ne!(a, path);
        assert_eq!(a.parent(), path.parent());
    }

    #[test]
    fn path_without_file_name_is_an_error() {
        let storage = Storage::new(PathBuf::from("/"));
        assert!(storage.random_tmp_path().is_err());
    }

    #[test]
    fn lock_is_exclusive_across_handles() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("vault.db"));

        let held = storage.lock().unwrap();
        let other = File::open(dir.path().join("vault.db.lock")).unwrap();
        assert!(other.try_lock().is_err());

        drop(held);
        assert!(other.try_lock().is_ok());
    }

    #[test]
    fn parent_directory_is_created() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b").join("vault.db");

        Storage::new(nested.clone()).save(b"data").unwrap();

        assert!(nested.exists());
    }
}
