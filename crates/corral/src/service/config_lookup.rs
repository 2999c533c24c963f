//
// service/config_lookup.rs
//
// Nearest-configuration-file lookup with a per-directory cache
//

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use lru::LruCache;

use crate::host::FileSystem;

const DEFAULT_CAPACITY: usize = 512;

/// Directory -> nearest configuration file at or above it.
///
/// Negative results are cached too, so a tree without any configuration is
/// probed once per directory. Any configuration file event must call
/// [`invalidate`](Self::invalidate).
pub struct ConfigLookupCache {
    entries: LruCache<PathBuf, Option<PathBuf>>,
    probes: usize,
}

// LruCache doesn't derive Debug
impl std::fmt::Debug for ConfigLookupCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigLookupCache")
            .field("len", &self.entries.len())
            .field("probes", &self.probes)
            .finish_non_exhaustive()
    }
}

impl ConfigLookupCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .or_else(|| NonZeroUsize::new(DEFAULT_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            probes: 0,
        }
    }

    /// Nearest file named one of `names` in an ancestor directory of `file`
    pub fn find(&mut self, file: &Path, names: &[String], fs: &dyn FileSystem) -> Option<PathBuf> {
        let mut visited = Vec::new();
        let mut found = None;
        let mut dir = file.parent();

        while let Some(current) = dir {
            if let Some(cached) = self.entries.get(current) {
                found = cached.clone();
                break;
            }
            visited.push(current.to_path_buf());
            self.probes += 1;
            if let Some(config) = names
                .iter()
                .map(|name| current.join(name))
                .find(|candidate| fs.exists(candidate))
            {
                found = Some(config);
                break;
            }
            dir = current.parent();
        }

        for dir in visited {
            self.entries.put(dir, found.clone());
        }
        found
    }

    pub fn invalidate(&mut self) {
        self.entries.clear();
    }

    /// Directories probed against storage so far
    pub fn probes(&self) -> usize {
        self.probes
    }
}

impl Default for ConfigLookupCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryFileSystem;

    fn names() -> Vec<String> {
        vec!["corral.json".to_string()]
    }

    #[test]
    fn test_nearest_ancestor_wins() {
        let fs = MemoryFileSystem::new();
        fs.write("/w/corral.json", "{}");
        fs.write("/w/sub/corral.json", "{}");
        let mut cache = ConfigLookupCache::new(16);

        assert_eq!(
            cache.find(Path::new("/w/sub/x/y/a.lm"), &names(), &fs),
            Some(PathBuf::from("/w/sub/corral.json"))
        );
        assert_eq!(
            cache.find(Path::new("/w/other/b.lm"), &names(), &fs),
            Some(PathBuf::from("/w/corral.json"))
        );
    }

    #[test]
    fn test_lookups_are_cached_per_directory() {
        let fs = MemoryFileSystem::new();
        fs.write("/w/corral.json", "{}");
        let mut cache = ConfigLookupCache::new(16);

        cache.find(Path::new("/w/a/b/c/one.lm"), &names(), &fs);
        let probes = cache.probes();
        assert_eq!(probes, 4);
        cache.find(Path::new("/w/a/b/c/two.lm"), &names(), &fs);
        cache.find(Path::new("/w/a/three.lm"), &names(), &fs);
        assert_eq!(cache.probes(), probes);
    }

    #[test]
    fn test_negative_results_need_invalidation() {
        let fs = MemoryFileSystem::new();
        let mut cache = ConfigLookupCache::new(16);
        assert_eq!(cache.find(Path::new("/w/a.lm"), &names(), &fs), None);

        fs.write("/w/corral.json", "{}");
        assert_eq!(cache.find(Path::new("/w/a.lm"), &names(), &fs), None);
        cache.invalidate();
        assert_eq!(
            cache.find(Path::new("/w/a.lm"), &names(), &fs),
            Some(PathBuf::from("/w/corral.json"))
        );
    }
}
