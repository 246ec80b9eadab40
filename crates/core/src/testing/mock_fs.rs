//! In-memory filesystem.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::adapters::{FileSnapshot, Filesystem};

/// A filesystem backed by a map of paths; tests add and remove files to
/// simulate the import directory changing between ticks.
#[derive(Default)]
pub struct MockFilesystem {
    files: Mutex<HashMap<PathBuf, FileSnapshot>>,
}

impl MockFilesystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&self, path: impl Into<PathBuf>, size_bytes: u64, mod_time: DateTime<Utc>) {
        self.files.lock().unwrap().insert(
            path.into(),
            FileSnapshot {
                size_bytes,
                mod_time,
            },
        );
    }

    pub fn remove_file(&self, path: &Path) {
        self.files.lock().unwrap().remove(path);
    }

    /// Update a file's modification time, as a writer still appending would.
    pub fn touch(&self, path: &Path, mod_time: DateTime<Utc>) {
        if let Some(snapshot) = self.files.lock().unwrap().get_mut(path) {
            snapshot.mod_time = mod_time;
        }
    }

    pub fn file_count(&self) -> usize {
        self.files.lock().unwrap().len()
    }
}

impl Filesystem for MockFilesystem {
    fn walk(&self, root: &Path) -> io::Result<Vec<(PathBuf, FileSnapshot)>> {
        let files = self.files.lock().unwrap();
        let mut out: Vec<(PathBuf, FileSnapshot)> = files
            .iter()
            .filter(|(path, _)| path.starts_with(root))
            .map(|(path, snapshot)| (path.clone(), *snapshot))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn stat(&self, path: &Path) -> io::Result<FileSnapshot> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walk_is_scoped_to_root() {
        let fs = MockFilesystem::new();
        fs.add_file("/import/a.mkv", 10, Utc::now());
        fs.add_file("/elsewhere/b.mkv", 10, Utc::now());

        let found = fs.walk(Path::new("/import")).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].0.ends_with("a.mkv"));
    }

    #[test]
    fn test_stat_missing_is_not_found() {
        let fs = MockFilesystem::new();
        let err = fs.stat(Path::new("/import/missing.mkv")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
