//
// tree_cache.rs
//
// Parsed trees shared across projects ("document registry")
//

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::config::{ParseSettings, SettingsKey};
use crate::host::{ParsedTree, SourceParser};
use crate::project::ProjectId;
use crate::snapshot::FileSnapshot;

#[derive(Debug)]
struct CacheEntry {
    tree: Arc<ParsedTree>,
    /// Projects currently referencing this `(path, settings)` bucket
    holders: HashSet<ProjectId>,
}

/// Hit/miss counters
#[derive(Debug, Default)]
pub struct TreeCacheMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub replaced: AtomicU64,
    pub evicted: AtomicU64,
}

impl TreeCacheMetrics {
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.replaced.load(Ordering::Relaxed),
            self.evicted.load(Ordering::Relaxed),
        )
    }
}

/// Cache of parsed trees keyed by `(path, settings)`, one version per bucket.
///
/// Entries are immutable `Arc`s. Replacing or evicting an entry only drops
/// the cache's reference; a project or query still holding the old tree
/// keeps it alive. A lookup for a version other than the cached one never
/// returns the cached tree.
///
/// The cache is an explicit service object shared by the projects of one
/// (or several) project services.
#[derive(Debug, Default)]
pub struct SharedTreeCache {
    entries: DashMap<(PathBuf, SettingsKey), CacheEntry>,
    metrics: TreeCacheMetrics,
}

impl SharedTreeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tree for exactly `snapshot.version()`, parsing on a miss.
    ///
    /// A newer snapshot replaces the bucket's entry. An older one is parsed
    /// for the caller but not inserted.
    pub fn acquire(
        &self,
        project: ProjectId,
        snapshot: &FileSnapshot,
        settings: &ParseSettings,
        parser: &dyn SourceParser,
    ) -> Arc<ParsedTree> {
        let key = (snapshot.path().to_path_buf(), settings.key());

        if let Some(mut entry) = self.entries.get_mut(&key) {
            if entry.tree.version == snapshot.version() {
                entry.holders.insert(project);
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                return entry.tree.clone();
            }
        }

        self.metrics.misses.fetch_add(1, Ordering::Relaxed);
        let tree = Arc::new(ParsedTree {
            path: snapshot.path().to_path_buf(),
            version: snapshot.version(),
            settings_key: key.1,
            missing: snapshot.is_missing(),
            syntax: parser.parse(snapshot.path(), snapshot.text(), settings),
        });

        let mut entry = self.entries.entry(key).or_insert_with(|| CacheEntry {
            tree: tree.clone(),
            holders: HashSet::new(),
        });
        if entry.tree.version < tree.version {
            log::trace!(
                "Replacing tree for {} (v{} -> v{})",
                snapshot.path().display(),
                entry.tree.version,
                tree.version
            );
            entry.tree = tree.clone();
            self.metrics.replaced.fetch_add(1, Ordering::Relaxed);
        }
        entry.holders.insert(project);
        tree
    }

    /// Drop `project`'s interest in a bucket; the entry goes when nobody
    /// holds it.
    pub fn release(&self, project: ProjectId, path: &Path, key: SettingsKey) {
        let key = (path.to_path_buf(), key);
        let now_empty = match self.entries.get_mut(&key) {
            Some(mut entry) => {
                entry.holders.remove(&project);
                entry.holders.is_empty()
            }
            None => false,
        };
        if now_empty {
            // Re-check under the shard lock; a holder may have arrived
            if self
                .entries
                .remove_if(&key, |_, entry| entry.holders.is_empty())
                .is_some()
            {
                self.metrics.evicted.fetch_add(1, Ordering::Relaxed);
                log::trace!("Evicted tree for {}", path.display());
            }
        }
    }

    /// Cached tree for a bucket, whatever its version
    pub fn peek(&self, path: &Path, key: SettingsKey) -> Option<Arc<ParsedTree>> {
        self.entries
            .get(&(path.to_path_buf(), key))
            .map(|e| e.tree.clone())
    }

    pub fn holders(&self, path: &Path, key: SettingsKey) -> usize {
        self.entries
            .get(&(path.to_path_buf(), key))
            .map(|e| e.holders.len())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn metrics(&self) -> &TreeCacheMetrics {
        &self.metrics
    }
}
