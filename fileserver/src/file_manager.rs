//! Registry of completed files, keyed by client-supplied MD5.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Flat-file store under one base directory. Each completed upload is a
/// file named by its MD5; the in-memory set is a fast-path cache over the
/// directory listing.
pub struct FileManager {
    base_dir: PathBuf,
    files: Mutex<HashSet<String>>,
}

impl FileManager {
    /// Open the store, creating `base_dir` if needed and indexing whatever
    /// is already there.
    pub fn new(base_dir: &Path) -> io::Result<Self> {
        if !base_dir.is_dir() {
            std::fs::create_dir_all(base_dir)?;
        }

        let mut files = HashSet::new();
        for entry in std::fs::read_dir(base_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    debug!(name, "indexed cached file");
                    files.insert(name.to_string());
                }
            }
        }
        info!(dir = %base_dir.display(), count = files.len(), "file store opened");

        Ok(FileManager {
            base_dir: base_dir.to_path_buf(),
            files: Mutex::new(files),
        })
    }

    /// Is a completed file registered under `md5`?
    ///
    /// Consults the cache first, then the filesystem (back-filling the
    /// cache on a hit, so files dropped in out-of-band are picked up).
    pub fn contains(&self, md5: &str) -> bool {
        let mut files = self.files.lock();
        if files.contains(md5) {
            return true;
        }
        if self.path_for(md5).is_file() {
            files.insert(md5.to_string());
            return true;
        }
        false
    }

    /// Register a completed upload.
    pub fn add(&self, md5: &str) {
        self.files.lock().insert(md5.to_string());
    }

    /// Where the file for `md5` lives (whether or not it exists yet).
    pub fn path_for(&self, md5: &str) -> PathBuf {
        self.base_dir.join(md5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creates_missing_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("cache").join("files");
        let manager = FileManager::new(&nested).unwrap();
        assert!(nested.is_dir());
        assert!(!manager.contains("missing"));
    }

    #[test]
    fn test_indexes_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("d41d8cd98f00b204e9800998ecf8427e"), b"x").unwrap();
        let manager = FileManager::new(dir.path()).unwrap();
        assert!(manager.contains("d41d8cd98f00b204e9800998ecf8427e"));
    }

    #[test]
    fn test_add_and_contains() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FileManager::new(dir.path()).unwrap();
        assert!(!manager.contains("abc123"));
        manager.add("abc123");
        assert!(manager.contains("abc123"));
    }

    #[test]
    fn test_filesystem_backfills_cache() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FileManager::new(dir.path()).unwrap();
        // Appears on disk after the manager was opened.
        std::fs::write(dir.path().join("late-arrival"), b"data").unwrap();
        assert!(manager.contains("late-arrival"));
    }

    #[test]
    fn test_path_for_joins_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FileManager::new(dir.path()).unwrap();
        assert_eq!(manager.path_for("key"), dir.path().join("key"));
    }
}
