//! PID file for the background server
//!
//! The pid file is the only record of which process serves this
//! installation. It is a convention, not a lock.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Contents of a pid file that exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidRecord {
    Valid(u32),
    /// Present but not a positive integer
    Malformed,
}

/// Parse pid file contents; only positive integers are plausible
pub fn parse_pid(contents: &str) -> Option<u32> {
    contents.trim().parse::<u32>().ok().filter(|&pid| pid > 0)
}

/// Read the pid file.
///
/// Returns `Ok(None)` if the file doesn't exist.
pub fn read_pid_file(path: &Path) -> io::Result<Option<PidRecord>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(match parse_pid(&contents) {
            Some(pid) => PidRecord::Valid(pid),
            None => PidRecord::Malformed,
        })),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Write `pid` to the pid file, creating parent directories
pub fn write_pid_file(path: &Path, pid: u32) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = fs::File::create(path)?;
    writeln!(file, "{}", pid)?;
    Ok(())
}

/// Remove the pid file; a missing file is not an error
pub fn remove_pid_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Time since the pid file was last written
pub fn pid_file_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    SystemTime::now().duration_since(modified).ok()
}

/// Removes the pid file when dropped, if it still names our pid
pub struct PidFileGuard {
    path: PathBuf,
    pid: u32,
}

impl PidFileGuard {
    /// Write the pid file and return a guard for it
    pub fn new(path: PathBuf, pid: u32) -> io::Result<Self> {
        write_pid_file(&path, pid)?;
        Ok(Self { path, pid })
    }
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        // Another server may have taken over the file after a restart
        if let Ok(Some(PidRecord::Valid(pid))) = read_pid_file(&self.path) {
            if pid != self.pid {
                return;
            }
        }
        if let Err(e) = remove_pid_file(&self.path) {
            tracing::warn!("Failed to remove PID file {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_nonexistent_pid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.pid");
        assert!(read_pid_file(&path).unwrap().is_none());
    }

    #[test]
    fn test_write_and_read_pid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("test.pid");

        write_pid_file(&path, 12345).unwrap();
        assert_eq!(read_pid_file(&path).unwrap(), Some(PidRecord::Valid(12345)));
    }

    #[test]
    fn test_malformed_pid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.pid");

        fs::write(&path, "garbage").unwrap();
        assert_eq!(read_pid_file(&path).unwrap(), Some(PidRecord::Malformed));

        fs::write(&path, "0\n").unwrap();
        assert_eq!(read_pid_file(&path).unwrap(), Some(PidRecord::Malformed));

        fs::write(&path, "-5").unwrap();
        assert_eq!(read_pid_file(&path).unwrap(), Some(PidRecord::Malformed));
    }

    #[test]
    fn test_parse_pid() {
        assert_eq!(parse_pid(" 4242\n"), Some(4242));
        assert_eq!(parse_pid(""), None);
        assert_eq!(parse_pid("0"), None);
    }

    #[test]
    fn test_remove_nonexistent_pid_file() {
        let dir = TempDir::new().unwrap();
        remove_pid_file(&dir.path().join("nonexistent.pid")).unwrap();
    }

    #[test]
    fn test_pid_file_age() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.pid");
        assert!(pid_file_age(&path).is_none());

        write_pid_file(&path, 1).unwrap();
        assert!(pid_file_age(&path).unwrap() < Duration::from_secs(60));
    }

    #[test]
    fn test_pid_file_guard() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("guard.pid");

        {
            let _guard = PidFileGuard::new(path.clone(), 12345).unwrap();
            assert!(path.exists());
        }

        assert!(!path.exists());
    }

    #[test]
    fn test_pid_file_guard_leaves_foreign_pid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("guard.pid");

        {
            let _guard = PidFileGuard::new(path.clone(), 12345).unwrap();
            write_pid_file(&path, 54321).unwrap();
        }

        assert_eq!(read_pid_file(&path).unwrap(), Some(PidRecord::Valid(54321)));
    }
}
