//! Time and filesystem adapters.
//!
//! The ingestor's stability gate and directory scan go through these traits
//! so tests can drive them deterministically.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of a file's attributes at observation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSnapshot {
    /// File size in bytes.
    pub size_bytes: u64,
    /// Last modification time.
    pub mod_time: DateTime<Utc>,
}

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Directory walking and stat access.
pub trait Filesystem: Send + Sync {
    /// Recursively collect all regular files under `root`.
    fn walk(&self, root: &Path) -> io::Result<Vec<(PathBuf, FileSnapshot)>>;

    /// Stat a single path.
    fn stat(&self, path: &Path) -> io::Result<FileSnapshot>;
}

/// Real-filesystem implementation backed by `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFilesystem;

impl OsFilesystem {
    fn snapshot(meta: &std::fs::Metadata) -> FileSnapshot {
        let mod_time = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        FileSnapshot {
            size_bytes: meta.len(),
            mod_time,
        }
    }

    fn walk_into(dir: &Path, out: &mut Vec<(PathBuf, FileSnapshot)>) -> io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                Self::walk_into(&entry.path(), out)?;
            } else if meta.is_file() {
                out.push((entry.path(), Self::snapshot(&meta)));
            }
        }
        Ok(())
    }
}

impl Filesystem for OsFilesystem {
    fn walk(&self, root: &Path) -> io::Result<Vec<(PathBuf, FileSnapshot)>> {
        let mut out = Vec::new();
        Self::walk_into(root, &mut out)?;
        Ok(out)
    }

    fn stat(&self, path: &Path) -> io::Result<FileSnapshot> {
        let meta = std::fs::metadata(path)?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        Ok(Self::snapshot(&meta))
    }
}
