//
// project/diagnostics.rs
//
// Per-project semantic diagnostics cache
//

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tower_lsp::lsp_types::Diagnostic;

#[derive(Debug, Clone)]
struct CachedDiagnostics {
    /// Tree version the result was computed against
    version: u64,
    diagnostics: Vec<Diagnostic>,
}

/// Results keyed by path and file version.
///
/// An entry is served only for the exact version it was computed for, and
/// the owning project drops entries whose dependencies' signatures moved.
#[derive(Debug, Default)]
pub struct DiagnosticsCache {
    entries: HashMap<PathBuf, CachedDiagnostics>,
    enabled: bool,
}

impl DiagnosticsCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            entries: HashMap::new(),
            enabled,
        }
    }

    pub fn get(&self, path: &Path, version: u64) -> Option<&[Diagnostic]> {
        self.entries
            .get(path)
            .filter(|e| e.version == version)
            .map(|e| e.diagnostics.as_slice())
    }

    pub fn insert(&mut self, path: PathBuf, version: u64, diagnostics: Vec<Diagnostic>) {
        if self.enabled {
            self.entries.insert(
                path,
                CachedDiagnostics {
                    version,
                    diagnostics,
                },
            );
        }
    }

    pub fn invalidate<'a>(&mut self, paths: impl IntoIterator<Item = &'a PathBuf>) -> usize {
        paths
            .into_iter()
            .filter(|p| self.entries.remove(p.as_path()).is_some())
            .count()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
