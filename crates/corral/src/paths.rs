//
// paths.rs
//
// Lexical path handling and module specifier resolution
//

use std::path::{Component, Path, PathBuf};

use crate::host::FileSystem;

/// Collapse `.` and `..` without touching the file system.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();

    for component in path.components() {
        match component {
            Component::ParentDir => {
                // Only pop Normal segments; RootDir and Prefix stay
                if let Some(Component::Normal(_)) = components.last() {
                    components.pop();
                }
            }
            Component::CurDir => {}
            c => components.push(c),
        }
    }

    components.iter().collect()
}

pub fn is_relative_specifier(specifier: &str) -> bool {
    specifier.starts_with("./") || specifier.starts_with("../")
}

/// Where an import of `specifier` from `importer` points.
///
/// Relative specifiers always resolve, whether or not the target exists; a
/// missing target becomes a graph node with the `Missing` signature. Bare
/// specifiers are looked up under `search_roots` and yield `None` when no
/// file matches.
pub fn resolve_module(
    importer: &Path,
    specifier: &str,
    extensions: &[String],
    search_roots: &[PathBuf],
    fs: &dyn FileSystem,
) -> Option<PathBuf> {
    if is_relative_specifier(specifier) || Path::new(specifier).is_absolute() {
        let dir = importer.parent().unwrap_or_else(|| Path::new("/"));
        let candidate = normalize_path(&dir.join(specifier));
        return Some(with_default_extension(candidate, extensions));
    }

    search_roots.iter().find_map(|root| {
        let candidate = with_default_extension(normalize_path(&root.join(specifier)), extensions);
        fs.exists(&candidate).then_some(candidate)
    })
}

fn with_default_extension(path: PathBuf, extensions: &[String]) -> PathBuf {
    match (path.extension(), extensions.first()) {
        (None, Some(ext)) => path.with_extension(ext),
        _ => path,
    }
}
