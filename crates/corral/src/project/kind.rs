//
// project/kind.rs
//
// Kind-specific project policy
//

use std::fmt;
use std::path::{Path, PathBuf};

use super::ProjectId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProjectKind {
    Inferred,
    Configured,
    External,
    AuxiliaryAutoImport,
}

impl fmt::Display for ProjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProjectKind::Inferred => "inferred",
            ProjectKind::Configured => "configured",
            ProjectKind::External => "external",
            ProjectKind::AuxiliaryAutoImport => "auto-import",
        };
        f.write_str(name)
    }
}

/// What differs between project kinds. Everything else lives in
/// [`ProjectCore`](super::ProjectCore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KindPolicy {
    /// Roots are the open files no other project claims; assigned by the
    /// service.
    Inferred { root_hint: Option<PathBuf> },
    /// Roots come from a configuration file's include/exclude rules.
    Configured {
        config_path: PathBuf,
        /// Survives having no open files
        keep_alive: bool,
        /// Roots for the auxiliary project, from the last good load
        auto_import_roots: Vec<PathBuf>,
        auxiliary: Option<ProjectId>,
    },
    /// Roots supplied wholesale by the host; lives until explicitly closed.
    External { name: String },
    /// Read-only companion of a configured project, used for completions.
    AuxiliaryAutoImport {
        host: ProjectId,
        root_dirs: Vec<PathBuf>,
    },
}

impl KindPolicy {
    pub fn kind(&self) -> ProjectKind {
        match self {
            KindPolicy::Inferred { .. } => ProjectKind::Inferred,
            KindPolicy::Configured { .. } => ProjectKind::Configured,
            KindPolicy::External { .. } => ProjectKind::External,
            KindPolicy::AuxiliaryAutoImport { .. } => ProjectKind::AuxiliaryAutoImport,
        }
    }

    pub fn config_path(&self) -> Option<&Path> {
        match self {
            KindPolicy::Configured { config_path, .. } => Some(config_path),
            _ => None,
        }
    }

    /// Auxiliary projects never keep results of their own
    pub fn caches_diagnostics(&self) -> bool {
        !matches!(self, KindPolicy::AuxiliaryAutoImport { .. })
    }

    /// Roots are derived by the project itself on load rather than assigned
    pub fn derives_roots(&self) -> bool {
        matches!(
            self,
            KindPolicy::Configured { .. } | KindPolicy::AuxiliaryAutoImport { .. }
        )
    }

    /// Eligible to be a file's default project
    pub fn can_serve_files(&self) -> bool {
        !matches!(self, KindPolicy::AuxiliaryAutoImport { .. })
    }

    /// Retirement rule: may the project go away with no open files?
    pub fn retire_when_unused(&self) -> bool {
        match self {
            KindPolicy::Inferred { .. } => true,
            KindPolicy::Configured { keep_alive, .. } => !keep_alive,
            KindPolicy::External { .. } => false,
            KindPolicy::AuxiliaryAutoImport { .. } => false,
        }
    }

    /// Files appearing or vanishing at `path` may change the root set
    pub fn scans(&self, path: &Path) -> bool {
        match self {
            KindPolicy::Configured { config_path, .. } => config_path
                .parent()
                .is_some_and(|dir| path.starts_with(dir)),
            KindPolicy::AuxiliaryAutoImport { root_dirs, .. } => {
                root_dirs.iter().any(|dir| path.starts_with(dir))
            }
            _ => false,
        }
    }

    /// Directories searched for bare module specifiers
    pub fn search_roots(&self) -> Vec<PathBuf> {
        match self {
            KindPolicy::Inferred { root_hint } => root_hint.iter().cloned().collect(),
            KindPolicy::Configured {
                config_path,
                auto_import_roots,
                ..
            } => config_path
                .parent()
                .map(Path::to_path_buf)
                .into_iter()
                .chain(auto_import_roots.iter().cloned())
                .collect(),
            KindPolicy::External { .. } => Vec::new(),
            KindPolicy::AuxiliaryAutoImport { root_dirs, .. } => root_dirs.clone(),
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            KindPolicy::Inferred { root_hint: Some(root) } => {
                format!("inferred({})", root.display())
            }
            KindPolicy::Inferred { root_hint: None } => "inferred".to_string(),
            KindPolicy::Configured { config_path, .. } => config_path.display().to_string(),
            KindPolicy::External { name } => name.clone(),
            KindPolicy::AuxiliaryAutoImport { host, .. } => format!("auto-import({})", host.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retirement_rules() {
        let configured = KindPolicy::Configured {
            config_path: PathBuf::from("/w/corral.json"),
            keep_alive: false,
            auto_import_roots: vec![PathBuf::from("/lib")],
            auxiliary: None,
        };
        assert!(configured.retire_when_unused());
        assert!(KindPolicy::Inferred { root_hint: None }.retire_when_unused());
        assert!(!KindPolicy::External { name: "x".into() }.retire_when_unused());

        assert_eq!(
            configured.search_roots(),
            vec![PathBuf::from("/w"), PathBuf::from("/lib")]
        );
        assert_eq!(configured.kind().to_string(), "configured");
        assert!(configured.scans(Path::new("/w/src/new.lm")));
        assert!(!configured.scans(Path::new("/elsewhere/new.lm")));
    }

    #[test]
    fn test_auxiliary_policy() {
        let aux = KindPolicy::AuxiliaryAutoImport {
            host: ProjectId(3),
            root_dirs: vec![],
        };
        assert!(!aux.caches_diagnostics());
        assert!(!aux.can_serve_files());
        assert!(aux.derives_roots());
        assert_eq!(aux.display_name(), "auto-import(3)");
    }
}
