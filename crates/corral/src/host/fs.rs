//
// host/fs.rs
//
// Storage access for closed files and configuration
//

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use walkdir::WalkDir;

/// Read-only view of storage
pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> io::Result<String>;
    fn exists(&self, path: &Path) -> bool;
    /// All regular files below `dir`, sorted
    fn walk_files(&self, dir: &Path) -> Vec<PathBuf>;
}

/// The real file system
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFileSystem;

impl FileSystem for OsFileSystem {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn walk_files(&self, dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(e) => Some(e),
                Err(e) => {
                    log::trace!("Skipping unreadable entry under {}: {}", dir.display(), e);
                    None
                }
            })
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect();
        files.sort();
        files
    }
}

/// In-memory storage for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    files: RwLock<BTreeMap<PathBuf, String>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, path: impl Into<PathBuf>, text: impl Into<String>) {
        if let Ok(mut guard) = self.files.write() {
            guard.insert(path.into(), text.into());
        }
    }

    pub fn remove(&self, path: &Path) -> bool {
        self.files
            .write()
            .map(|mut guard| guard.remove(path).is_some())
            .unwrap_or(false)
    }
}

impl FileSystem for MemoryFileSystem {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        let guard = self
            .files
            .read()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "file table poisoned"))?;
        guard
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))
    }

    fn exists(&self, path: &Path) -> bool {
        self.files
            .read()
            .map(|guard| guard.contains_key(path))
            .unwrap_or(false)
    }

    fn walk_files(&self, dir: &Path) -> Vec<PathBuf> {
        let Ok(guard) = self.files.read() else {
            return Vec::new();
        };
        guard
            .range(dir.to_path_buf()..)
            .take_while(|(p, _)| p.starts_with(dir))
            .map(|(p, _)| p.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_walk_is_scoped_to_directory() {
        let fs = MemoryFileSystem::new();
        fs.write("/w/a.lm", "");
        fs.write("/w/sub/b.lm", "");
        fs.write("/w2/c.lm", "");
        fs.write("/v/d.lm", "");

        let files = fs.walk_files(Path::new("/w"));
        assert_eq!(
            files,
            vec![PathBuf::from("/w/a.lm"), PathBuf::from("/w/sub/b.lm")]
        );
    }

    #[test]
    fn test_memory_read_missing() {
        let fs = MemoryFileSystem::new();
        let err = fs.read_to_string(Path::new("/nope.lm")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        fs.write("/nope.lm", "x");
        assert!(fs.exists(Path::new("/nope.lm")));
        assert!(fs.remove(Path::new("/nope.lm")));
        assert!(!fs.exists(Path::new("/nope.lm")));
    }

    #[test]
    fn test_os_walk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("a.lm"), "").unwrap();
        std::fs::write(dir.path().join("nested/b.lm"), "").unwrap();

        let files = OsFileSystem.walk_files(dir.path());
        assert_eq!(files.len(), 2);
        assert!(OsFileSystem.exists(&dir.path().join("a.lm")));
        assert!(!OsFileSystem.exists(&dir.path().join("nested")));
    }
}
