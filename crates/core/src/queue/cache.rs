//! Exclusion cache: the persisted set of already-processed paths.
//!
//! Stored as a newline-delimited list of absolute paths. The cache only
//! grows; it is reloaded on every ingest tick so external edits (or
//! deletion) of the file are picked up.

use std::collections::HashSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Persistent set of completed source paths.
#[derive(Debug)]
pub struct ExclusionCache {
    path: PathBuf,
    entries: HashSet<PathBuf>,
}

impl ExclusionCache {
    /// Open the cache, loading any existing entries. A missing file is an
    /// empty cache.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let mut cache = Self {
            path: path.into(),
            entries: HashSet::new(),
        };
        cache.reload()?;
        Ok(cache)
    }

    /// Re-read the backing file, replacing the in-memory set.
    pub fn reload(&mut self) -> io::Result<()> {
        self.entries.clear();
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        for line in contents.lines() {
            let line = line.trim();
            if !line.is_empty() {
                self.entries.insert(PathBuf::from(line));
            }
        }
        Ok(())
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a completed path and flush the whole set to disk.
    pub fn record(&mut self, path: &Path) -> io::Result<()> {
        if !self.entries.insert(path.to_path_buf()) {
            return Ok(());
        }
        self.flush()
    }

    fn flush(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(&self.path)?;
        for entry in &self.entries {
            writeln!(file, "{}", entry.display())?;
        }
        file.sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty_cache() {
        let dir = TempDir::new().unwrap();
        let cache = ExclusionCache::open(dir.path().join("cache")).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_record_then_reload_round_trips() {
        let dir = TempDir::new().unwrap();
        let cache_path = dir.path().join("cache");

        let mut cache = ExclusionCache::open(&cache_path).unwrap();
        cache.record(Path::new("/import/a.mkv")).unwrap();
        cache.record(Path::new("/import/b.mkv")).unwrap();

        let reloaded = ExclusionCache::open(&cache_path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.contains(Path::new("/import/a.mkv")));
        assert!(reloaded.contains(Path::new("/import/b.mkv")));
        assert!(!reloaded.contains(Path::new("/import/c.mkv")));
    }

    #[test]
    fn test_record_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut cache = ExclusionCache::open(dir.path().join("cache")).unwrap();
        cache.record(Path::new("/import/a.mkv")).unwrap();
        cache.record(Path::new("/import/a.mkv")).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_reload_picks_up_external_edit() {
        let dir = TempDir::new().unwrap();
        let cache_path = dir.path().join("cache");
        let mut cache = ExclusionCache::open(&cache_path).unwrap();
        cache.record(Path::new("/import/a.mkv")).unwrap();

        // Externally truncated cache forgets everything on reload.
        std::fs::write(&cache_path, "").unwrap();
        cache.reload().unwrap();
        assert!(cache.is_empty());
    }
}
