//
// host/watch.rs
//
// File system watch API. Callbacks are raw; the project service debounces them.
//

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Keeps a watch alive. Dropping it stops the watch.
pub struct WatchHandle {
    path: PathBuf,
    recursive: bool,
    _guard: Option<Box<dyn Send>>,
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("path", &self.path)
            .field("recursive", &self.recursive)
            .finish_non_exhaustive()
    }
}

impl WatchHandle {
    pub fn new(path: PathBuf, recursive: bool, guard: Option<Box<dyn Send>>) -> Self {
        Self {
            path,
            recursive,
            _guard: guard,
        }
    }

    /// A handle that watches nothing, used when the backend refuses a path
    pub fn inert(path: PathBuf) -> Self {
        Self::new(path, false, None)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_recursive(&self) -> bool {
        self.recursive
    }
}

pub trait FileWatcher: Send + Sync {
    fn watch_file(&self, path: &Path) -> WatchHandle;
    fn watch_directory(&self, path: &Path, recursive: bool) -> WatchHandle;
}

/// `notify`-backed watcher forwarding changed paths into a channel.
pub struct NotifyWatcher {
    tx: UnboundedSender<PathBuf>,
}

impl NotifyWatcher {
    pub fn new() -> (Self, UnboundedReceiver<PathBuf>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn start(&self, dir: &Path, mode: RecursiveMode, only: Option<PathBuf>) -> Option<notify::RecommendedWatcher> {
        let tx = self.tx.clone();
        let handler = move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                if !(event.kind.is_create() || event.kind.is_modify() || event.kind.is_remove()) {
                    return;
                }
                for path in event.paths {
                    if only.as_ref().map_or(true, |o| *o == path) {
                        let _ = tx.send(path);
                    }
                }
            }
            Err(e) => log::warn!("File watcher error: {}", e),
        };
        let mut watcher = match notify::recommended_watcher(handler) {
            Ok(w) => w,
            Err(e) => {
                log::warn!("Cannot create file watcher: {}", e);
                return None;
            }
        };
        if let Err(e) = watcher.watch(dir, mode) {
            log::warn!("Cannot watch {}: {}", dir.display(), e);
            return None;
        }
        Some(watcher)
    }
}

impl FileWatcher for NotifyWatcher {
    fn watch_file(&self, path: &Path) -> WatchHandle {
        // Watch the parent so creation and deletion are observed too
        let Some(parent) = path.parent() else {
            return WatchHandle::inert(path.to_path_buf());
        };
        let guard = self
            .start(parent, RecursiveMode::NonRecursive, Some(path.to_path_buf()))
            .map(|w| Box::new(w) as Box<dyn Send>);
        WatchHandle::new(path.to_path_buf(), false, guard)
    }

    fn watch_directory(&self, path: &Path, recursive: bool) -> WatchHandle {
        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        let guard = self
            .start(path, mode, None)
            .map(|w| Box::new(w) as Box<dyn Send>);
        WatchHandle::new(path.to_path_buf(), recursive, guard)
    }
}

type WatchRegistry = Arc<Mutex<BTreeMap<(PathBuf, bool), usize>>>;

/// Records which watches are alive, for tests
#[derive(Debug, Clone, Default)]
pub struct RecordingWatcher {
    active: WatchRegistry,
}

struct RecordingGuard {
    active: WatchRegistry,
    key: (PathBuf, bool),
}

impl Drop for RecordingGuard {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.active.lock() {
            if let Some(count) = guard.get_mut(&self.key) {
                *count -= 1;
                if *count == 0 {
                    guard.remove(&self.key);
                }
            }
        }
    }
}

impl RecordingWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live watches on `path` (file watches and directory watches)
    pub fn watch_count(&self, path: &Path) -> usize {
        self.active
            .lock()
            .map(|guard| {
                guard
                    .iter()
                    .filter(|((p, _), _)| p == path)
                    .map(|(_, n)| *n)
                    .sum()
            })
            .unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.active
            .lock()
            .map(|guard| guard.values().sum())
            .unwrap_or(0)
    }

    fn register(&self, path: &Path, recursive: bool) -> WatchHandle {
        let key = (path.to_path_buf(), recursive);
        if let Ok(mut guard) = self.active.lock() {
            *guard.entry(key.clone()).or_insert(0) += 1;
        }
        let guard = RecordingGuard {
            active: self.active.clone(),
            key,
        };
        WatchHandle::new(path.to_path_buf(), recursive, Some(Box::new(guard)))
    }
}

impl FileWatcher for RecordingWatcher {
    fn watch_file(&self, path: &Path) -> WatchHandle {
        self.register(path, false)
    }

    fn watch_directory(&self, path: &Path, recursive: bool) -> WatchHandle {
        self.register(path, recursive)
    }
}
