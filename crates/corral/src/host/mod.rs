//
// host/mod.rs
//
// Boundary traits for the collaborators the engine consumes: parser,
// checker, configuration resolver, file system and file watcher
//

pub mod fs;
pub mod watch;

use std::any::Any;
use std::fmt;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types::{Diagnostic, Range};

use crate::builder::ProgramView;
use crate::config::{CompilerOptions, ParseSettings, SettingsKey};
use crate::error::{Cancelled, ConfigError};

pub use fs::{FileSystem, MemoryFileSystem, OsFileSystem};
pub use watch::{FileWatcher, NotifyWatcher, RecordingWatcher, WatchHandle};

/// An import-like reference from one file to another
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleReference {
    /// Specifier exactly as written
    pub specifier: String,
    pub range: Range,
}

/// Parser output. Opaque to the engine apart from what it needs to build the
/// dependency graph.
pub trait SyntaxTree: Send + Sync + fmt::Debug {
    fn module_references(&self) -> Vec<ModuleReference>;
    fn syntax_diagnostics(&self) -> Vec<Diagnostic>;
    /// Names visible to importers, used for completions
    fn exported_names(&self) -> Vec<String>;
    fn as_any(&self) -> &dyn Any;
}

/// Pure, deterministic `parse(text, settings) -> tree`
pub trait SourceParser: Send + Sync {
    fn parse(&self, path: &Path, text: &str, settings: &ParseSettings) -> Box<dyn SyntaxTree>;
}

/// A parsed tree for exactly one `(path, version, settings)` triple.
#[derive(Debug)]
pub struct ParsedTree {
    pub path: PathBuf,
    pub version: u64,
    pub settings_key: SettingsKey,
    /// Parsed from a missing-file marker
    pub missing: bool,
    pub syntax: Box<dyn SyntaxTree>,
}

/// Structural hash of a file's externally visible declarations.
///
/// `Missing` is the signature of a file that does not exist (or could not be
/// read); it is an ordinary value so a vanished dependency propagates like
/// any other shape change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signature {
    Missing,
    Shape(u64),
}

/// `check(program, file) -> diagnostics` plus the signature function.
///
/// Implementations must poll `token` at reasonable intervals and return
/// [`Cancelled`] once it fires.
pub trait Checker: Send + Sync {
    /// Must be deterministic. Equal signatures mean dependents need no
    /// recomputation.
    fn signature(&self, program: &ProgramView<'_>, file: &Path) -> Signature;

    fn semantic_diagnostics(
        &self,
        program: &ProgramView<'_>,
        file: &Path,
        token: &CancellationToken,
    ) -> Result<Vec<Diagnostic>, Cancelled>;

    fn syntactic_diagnostics(&self, program: &ProgramView<'_>, file: &Path) -> Vec<Diagnostic> {
        program
            .tree(file)
            .map(|tree| tree.syntax.syntax_diagnostics())
            .unwrap_or_default()
    }
}

/// A configuration file turned into a project description.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedConfig {
    pub root_files: Vec<PathBuf>,
    pub options: CompilerOptions,
    /// Non-fatal problems
    pub errors: Vec<String>,
    /// Roots for the auxiliary auto-import project, if any
    pub auto_import_roots: Vec<PathBuf>,
    /// Directories whose contents can change the root set
    pub watched_directories: Vec<PathBuf>,
}

/// `resolveConfig(path) -> { rootFiles, options, errors }`
pub trait ConfigResolver: Send + Sync {
    /// Roots are the files under the configuration whose extension is one
    /// of `source_extensions`
    fn resolve(
        &self,
        config_path: &Path,
        source_extensions: &[String],
        fs: &dyn FileSystem,
    ) -> Result<ResolvedConfig, ConfigError>;
}
