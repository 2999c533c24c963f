//
// file_record.rs
//
// Per-path service state ("script info")
//

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use tower_lsp::lsp_types::TextDocumentContentChangeEvent;

use crate::error::ServiceError;
use crate::host::{FileSystem, FileWatcher, WatchHandle};
use crate::project::ProjectId;
use crate::snapshot::FileSnapshot;

/// Editor-side state of an open file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenState {
    pub editor_version: i32,
    /// Root hint the editor supplied on open
    pub project_root: Option<PathBuf>,
}

#[derive(Debug)]
pub struct FileRecord {
    pub path: PathBuf,
    snapshot: Option<FileSnapshot>,
    pub open: Option<OpenState>,
    pub owners: BTreeSet<ProjectId>,
    watch: Option<WatchHandle>,
    /// Content must be re-read from storage before next use
    disk_stale: bool,
}

impl FileRecord {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            snapshot: None,
            open: None,
            owners: BTreeSet::new(),
            watch: None,
            disk_stale: true,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    pub fn is_watched(&self) -> bool {
        self.watch.is_some()
    }

    /// Last known snapshot, without touching storage
    pub fn latest(&self) -> Option<&FileSnapshot> {
        self.snapshot.as_ref()
    }
}

/// All file records of one service. Only the project service mutates it.
#[derive(Debug, Default)]
pub struct FileRecordStore {
    records: HashMap<PathBuf, FileRecord>,
}

impl FileRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &Path) -> Option<&FileRecord> {
        self.records.get(path)
    }

    pub fn is_open(&self, path: &Path) -> bool {
        self.records.get(path).is_some_and(FileRecord::is_open)
    }

    pub fn open_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = self
            .records
            .values()
            .filter(|r| r.is_open())
            .map(|r| r.path.clone())
            .collect();
        files.sort();
        files
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Mark a file open with editor-supplied content.
    ///
    /// Returns true when the content differs from the last snapshot. An
    /// identical text keeps the existing snapshot and version.
    pub fn open(
        &mut self,
        path: &Path,
        text: &str,
        editor_version: i32,
        project_root: Option<PathBuf>,
    ) -> bool {
        let record = self
            .records
            .entry(path.to_path_buf())
            .or_insert_with(|| FileRecord::new(path.to_path_buf()));
        record.open = Some(OpenState {
            editor_version,
            project_root,
        });
        record.watch = None;
        record.disk_stale = false;

        if record.snapshot.as_ref().is_some_and(|s| s.has_text(text)) {
            return false;
        }
        record.snapshot = Some(FileSnapshot::new(path, text));
        true
    }

    /// Mark a file closed. Its content comes from storage from now on.
    pub fn close(&mut self, path: &Path, watcher: &dyn FileWatcher) -> Result<(), ServiceError> {
        let record = self
            .records
            .get_mut(path)
            .filter(|r| r.is_open())
            .ok_or_else(|| ServiceError::NotOpen(path.to_path_buf()))?;
        record.open = None;
        record.disk_stale = true;
        if !record.owners.is_empty() {
            record.watch = Some(watcher.watch_file(path));
        }
        Ok(())
    }

    /// Apply an editor change. Versions must strictly increase.
    pub fn edit(
        &mut self,
        path: &Path,
        editor_version: i32,
        changes: Vec<TextDocumentContentChangeEvent>,
    ) -> Result<FileSnapshot, ServiceError> {
        let record = self
            .records
            .get_mut(path)
            .ok_or_else(|| ServiceError::NotOpen(path.to_path_buf()))?;
        let Some(open) = record.open.as_mut() else {
            return Err(ServiceError::NotOpen(path.to_path_buf()));
        };
        if editor_version <= open.editor_version {
            return Err(ServiceError::StaleVersion {
                path: path.to_path_buf(),
                current: open.editor_version,
                received: editor_version,
            });
        }
        let current = match record.snapshot.as_ref() {
            Some(s) => s.clone(),
            None => FileSnapshot::new(path, ""),
        };
        let next = current.with_changes(changes)?;
        open.editor_version = editor_version;
        record.snapshot = Some(next.clone());
        Ok(next)
    }

    /// Current snapshot of `path`, creating the record on first reference.
    ///
    /// Open files never touch storage. Closed files are read lazily and the
    /// result is kept until [`mark_changed_on_disk`](Self::mark_changed_on_disk).
    /// A read failure yields a missing-file marker.
    pub fn snapshot(&mut self, path: &Path, fs: &dyn FileSystem) -> FileSnapshot {
        let record = self
            .records
            .entry(path.to_path_buf())
            .or_insert_with(|| FileRecord::new(path.to_path_buf()));

        if !record.disk_stale || record.is_open() {
            if let Some(snapshot) = &record.snapshot {
                return snapshot.clone();
            }
        }

        let next = match fs.read_to_string(path) {
            Ok(text) => match &record.snapshot {
                Some(s) if s.has_text(&text) => s.clone(),
                _ => FileSnapshot::new(path, text),
            },
            Err(e) => {
                log::trace!("Cannot read {}: {}", path.display(), e);
                match &record.snapshot {
                    Some(s) if s.is_missing() => s.clone(),
                    _ => FileSnapshot::missing(path),
                }
            }
        };
        record.disk_stale = false;
        record.snapshot = Some(next.clone());
        next
    }

    /// Storage changed under a closed file. Returns false for open or
    /// unknown files, whose content does not depend on storage.
    pub fn mark_changed_on_disk(&mut self, path: &Path) -> bool {
        match self.records.get_mut(path) {
            Some(record) if !record.is_open() => {
                record.disk_stale = true;
                true
            }
            _ => false,
        }
    }

    /// Record `project` as an owner; closed files get a watch.
    pub fn attach(&mut self, path: &Path, project: ProjectId, watcher: &dyn FileWatcher) {
        let record = self
            .records
            .entry(path.to_path_buf())
            .or_insert_with(|| FileRecord::new(path.to_path_buf()));
        record.owners.insert(project);
        if !record.is_open() && record.watch.is_none() {
            record.watch = Some(watcher.watch_file(path));
        }
    }

    pub fn detach(&mut self, path: &Path, project: ProjectId) {
        if let Some(record) = self.records.get_mut(path) {
            record.owners.remove(&project);
            if record.owners.is_empty() {
                record.watch = None;
            }
        }
    }

    pub fn owners(&self, path: &Path) -> Vec<ProjectId> {
        self.records
            .get(path)
            .map(|r| r.owners.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drop records that are neither open nor owned by any project.
    pub fn collect_garbage(&mut self) -> Vec<PathBuf> {
        let dead: Vec<PathBuf> = self
            .records
            .values()
            .filter(|r| !r.is_open() && r.owners.is_empty())
            .map(|r| r.path.clone())
            .collect();
        for path in &dead {
            self.records.remove(path);
        }
        dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{MemoryFileSystem, RecordingWatcher};
    use tower_lsp::lsp_types::{Position, Range};

    fn path(name: &str) -> PathBuf {
        PathBuf::from(format!("/w/{}", name))
    }

    fn insert(line: u32, col: u32, text: &str) -> TextDocumentContentChangeEvent {
        TextDocumentContentChangeEvent {
            range: Some(Range::new(Position::new(line, col), Position::new(line, col))),
            range_length: None,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_open_with_same_text_keeps_version() {
        let mut store = FileRecordStore::new();
        assert!(store.open(&path("a.lm"), "fn a()", 1, None));
        let v1 = store.get(&path("a.lm")).unwrap().latest().unwrap().version();
        assert!(!store.open(&path("a.lm"), "fn a()", 2, None));
        let v2 = store.get(&path("a.lm")).unwrap().latest().unwrap().version();
        assert_eq!(v1, v2);
    }

    #[test]
    fn test_edit_requires_newer_version() {
        let mut store = FileRecordStore::new();
        store.open(&path("a.lm"), "fn a()", 3, None);

        let snap = store.edit(&path("a.lm"), 4, vec![insert(0, 6, " {}")]).unwrap();
        assert_eq!(snap.text(), "fn a() {}");

        let err = store.edit(&path("a.lm"), 4, vec![insert(0, 0, "x")]).unwrap_err();
        assert!(matches!(
            err,
            ServiceError::StaleVersion {
                current: 4,
                received: 4,
                ..
            }
        ));
        // Rejected edit changed nothing
        assert_eq!(store.get(&path("a.lm")).unwrap().latest().unwrap().text(), "fn a() {}");
    }

    #[test]
    fn test_edit_closed_file_is_rejected() {
        let mut store = FileRecordStore::new();
        let err = store.edit(&path("a.lm"), 1, vec![]).unwrap_err();
        assert!(matches!(err, ServiceError::NotOpen(_)));
    }

    #[test]
    fn test_closed_file_reads_lazily_and_caches() {
        let fs = MemoryFileSystem::new();
        fs.write(path("b.lm"), "export fn b()");
        let mut store = FileRecordStore::new();

        let first = store.snapshot(&path("b.lm"), &fs);
        fs.write(path("b.lm"), "export fn b(x)");
        let cached = store.snapshot(&path("b.lm"), &fs);
        assert_eq!(first.version(), cached.version());
        assert_eq!(cached.text(), "export fn b()");

        assert!(store.mark_changed_on_disk(&path("b.lm")));
        let fresh = store.snapshot(&path("b.lm"), &fs);
        assert_eq!(fresh.text(), "export fn b(x)");
        assert!(fresh.version() > first.version());
    }

    #[test]
    fn test_read_failure_yields_missing_marker() {
        let fs = MemoryFileSystem::new();
        let mut store = FileRecordStore::new();
        let snap = store.snapshot(&path("gone.lm"), &fs);
        assert!(snap.is_missing());

        // A second failing read keeps the same marker
        store.mark_changed_on_disk(&path("gone.lm"));
        let again = store.snapshot(&path("gone.lm"), &fs);
        assert_eq!(snap.version(), again.version());
    }

    #[test]
    fn test_open_file_ignores_disk() {
        let fs = MemoryFileSystem::new();
        fs.write(path("a.lm"), "disk");
        let mut store = FileRecordStore::new();
        store.open(&path("a.lm"), "editor", 1, None);
        assert!(!store.mark_changed_on_disk(&path("a.lm")));
        assert_eq!(store.snapshot(&path("a.lm"), &fs).text(), "editor");
    }

    #[test]
    fn test_close_switches_to_disk_and_watches_owned_files() {
        let fs = MemoryFileSystem::new();
        fs.write(path("a.lm"), "disk");
        let watcher = RecordingWatcher::new();
        let mut store = FileRecordStore::new();
        store.open(&path("a.lm"), "editor", 1, None);
        store.attach(&path("a.lm"), ProjectId(1), &watcher);
        assert_eq!(watcher.total(), 0);

        store.close(&path("a.lm"), &watcher).unwrap();
        assert_eq!(watcher.watch_count(&path("a.lm")), 1);
        assert_eq!(store.snapshot(&path("a.lm"), &fs).text(), "disk");
        assert!(matches!(
            store.close(&path("a.lm"), &watcher),
            Err(ServiceError::NotOpen(_))
        ));
    }

    #[test]
    fn test_garbage_collection() {
        let watcher = RecordingWatcher::new();
        let mut store = FileRecordStore::new();
        store.open(&path("open.lm"), "", 1, None);
        store.attach(&path("dep.lm"), ProjectId(1), &watcher);
        store.attach(&path("orphan.lm"), ProjectId(1), &watcher);
        store.detach(&path("orphan.lm"), ProjectId(1));

        assert_eq!(store.collect_garbage(), vec![path("orphan.lm")]);
        assert_eq!(store.len(), 2);
        assert_eq!(watcher.watch_count(&path("orphan.lm")), 0);
        assert_eq!(watcher.watch_count(&path("dep.lm")), 1);
    }
}
