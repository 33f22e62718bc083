use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Exclusive advisory lock guarding a cache directory. Exactly one backend
/// may own the backing files at a time; a second open of the same directory
/// fails instead of corrupting entries.
pub struct DirLock {
    _file: File,
    path: PathBuf,
}

impl DirLock {
    /// Creates the lock file (truncating any stale one) and locks it.
    /// The lock file contains the process ID for debugging purposes.
    pub fn lock<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Self::try_lock(&file)?;

        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> io::Result<()> {
        // No advisory locking on this platform; allow the open so the
        // engine still runs, without cross-process exclusion.
        Ok(())
    }

    /// Get the path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        // The OS releases the lock when the descriptor closes. The lock
        // file itself is left in place to avoid unlink races with another
        // process acquiring it.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_lock_records_pid() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let lock_path = dir.path().join("cinder.lock");

        let lock = DirLock::lock(&lock_path).expect("Failed to acquire lock");

        assert!(lock_path.exists());
        let content = fs::read_to_string(&lock_path).expect("Failed to read lock file");
        assert!(content.contains(&std::process::id().to_string()));
        assert_eq!(lock.path(), lock_path.as_path());
    }

    #[cfg(unix)]
    #[test]
    fn test_double_lock_fails() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let lock_path = dir.path().join("cinder.lock");

        let _lock1 = DirLock::lock(&lock_path).expect("Failed to acquire first lock");
        let lock2 = DirLock::lock(&lock_path);
        assert!(lock2.is_err());
    }

    #[test]
    fn test_relock_after_drop() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let lock_path = dir.path().join("cinder.lock");

        {
            let _lock = DirLock::lock(&lock_path).expect("Failed to acquire lock");
            assert!(lock_path.exists());
        }

        let _lock2 = DirLock::lock(&lock_path).expect("Should re-acquire lock after drop");
    }
}
