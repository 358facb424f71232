//! Advisory file locking and crash-safe writes for the metadata files.
//!
//! Writers take an exclusive `flock(2)` on a sibling `.lock` file, write a
//! temporary file, and `rename` it into place so concurrent readers never
//! observe a torn write.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Block until the exclusive lock on `path` is held. The lock is
    /// released when the guard drops, on every exit path.
    pub fn acquire(path: &Path) -> io::Result<FileLock> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(FileLock { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os: OsString = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

/// Path of the lock file guarding `path`.
pub fn lock_path(path: &Path) -> PathBuf {
    with_suffix(path, ".lock")
}

/// Write `bytes` to `path` atomically while holding the sibling lock.
pub fn write_locked(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let _guard = FileLock::acquire(&lock_path(path))?;

    let tmp = with_suffix(path, ".tmp");
    {
        let mut f = File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_and_leaves_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("metadata.json");
        write_locked(&target, b"{\"a\":1}").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"{\"a\":1}");
        assert!(dir.path().join("metadata.json.lock").exists());
        assert!(!dir.path().join("metadata.json.tmp").exists());
    }

    #[test]
    fn concurrent_writers_never_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("metadata.json");

        let a = vec![b'a'; 64 * 1024];
        let b = vec![b'b'; 64 * 1024];

        let ta = {
            let (target, a) = (target.clone(), a.clone());
            std::thread::spawn(move || {
                for _ in 0..50 {
                    write_locked(&target, &a).unwrap();
                }
            })
        };
        let tb = {
            let (target, b) = (target.clone(), b.clone());
            std::thread::spawn(move || {
                for _ in 0..50 {
                    write_locked(&target, &b).unwrap();
                }
            })
        };
        ta.join().unwrap();
        tb.join().unwrap();

        let got = std::fs::read(&target).unwrap();
        assert!(got == a || got == b, "file must equal exactly one payload");
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let lp = dir.path().join("m.lock");
        {
            let _g = FileLock::acquire(&lp).unwrap();
        }
        // Re-acquiring immediately must not block.
        let _g2 = FileLock::acquire(&lp).unwrap();
    }
}
