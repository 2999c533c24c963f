//
// project/mod.rs
//
// Projects: a root file set, compiler options and one incremental builder
//

pub mod diagnostics;
pub mod kind;

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};

use indexmap::IndexSet;
use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types::Diagnostic;

use crate::builder::{Affected, IncrementalBuilder, ProgramFiles, ResolvedImport, SourceFile};
use crate::config::{CompilerOptions, ServiceConfig, SettingsKey};
use crate::error::Cancelled;
use crate::file_record::FileRecordStore;
use crate::host::{Checker, ConfigResolver, FileSystem, FileWatcher, SourceParser, WatchHandle};
use crate::paths::resolve_module;
use crate::tree_cache::SharedTreeCache;

pub use diagnostics::DiagnosticsCache;
pub use kind::{KindPolicy, ProjectKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectId(pub u64);

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Project lifecycle.
///
/// `Unresolved -> Loading -> Ready <-> Dirty`, `Ready -> Loading` on a
/// configuration change, any state `-> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectState {
    Unresolved,
    Loading,
    Ready,
    Dirty,
    Closed,
}

/// Everything a project borrows from its service while updating
pub struct ProjectHost<'a> {
    pub records: &'a mut FileRecordStore,
    pub trees: &'a SharedTreeCache,
    pub parser: &'a dyn SourceParser,
    pub checker: &'a dyn Checker,
    pub resolver: &'a dyn ConfigResolver,
    pub fs: &'a dyn FileSystem,
    pub watcher: &'a dyn FileWatcher,
    pub config: &'a ServiceConfig,
}

/// Result of one graph update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphOutcome {
    pub changed: bool,
    /// The configuration file was (re)read
    pub config_loaded: bool,
    /// Files whose cached results were invalidated
    pub stale: Vec<PathBuf>,
    /// The graph failed verification and was rebuilt from scratch
    pub rebuilt: bool,
}

/// Operations every project kind supports
pub trait ProjectOps {
    /// Bring the graph up to date. Returns whether anything changed; a
    /// second call without intervening mutation returns `false`.
    fn update_graph(&mut self, host: &mut ProjectHost<'_>) -> bool;
    fn root_files(&self) -> Vec<PathBuf>;
    fn close(&mut self, host: &mut ProjectHost<'_>);
}

#[derive(Debug, Default)]
struct DirtyFlags {
    changed_files: BTreeSet<PathBuf>,
    full_resolution: bool,
}

impl DirtyFlags {
    fn any(&self) -> bool {
        self.full_resolution || !self.changed_files.is_empty()
    }
}

/// State shared by all project kinds
#[derive(Debug)]
pub struct ProjectCore {
    pub id: ProjectId,
    state: ProjectState,
    roots: IndexSet<PathBuf>,
    options: CompilerOptions,
    builder: IncrementalBuilder,
    dirty: DirtyFlags,
    diagnostics: DiagnosticsCache,
    config_diagnostics: Vec<String>,
    /// Tree cache buckets this project holds
    held: HashSet<(PathBuf, SettingsKey)>,
    watches: Vec<WatchHandle>,
    graph_generation: u64,
}

impl ProjectCore {
    fn new(id: ProjectId, options: CompilerOptions, cache_diagnostics: bool) -> Self {
        Self {
            id,
            state: ProjectState::Unresolved,
            roots: IndexSet::new(),
            options,
            builder: IncrementalBuilder::new(),
            dirty: DirtyFlags::default(),
            diagnostics: DiagnosticsCache::new(cache_diagnostics),
            config_diagnostics: Vec::new(),
            held: HashSet::new(),
            watches: Vec::new(),
            graph_generation: 0,
        }
    }

    fn mark_dirty(&mut self) {
        if self.state == ProjectState::Ready {
            self.state = ProjectState::Dirty;
        }
    }
}

#[derive(Debug)]
pub struct Project {
    core: ProjectCore,
    policy: KindPolicy,
}

impl Project {
    pub fn inferred(id: ProjectId, root_hint: Option<PathBuf>, options: CompilerOptions) -> Self {
        Self::with_policy(id, KindPolicy::Inferred { root_hint }, options)
    }

    pub fn configured(id: ProjectId, config_path: PathBuf) -> Self {
        Self::with_policy(
            id,
            KindPolicy::Configured {
                config_path,
                keep_alive: false,
                auto_import_roots: Vec::new(),
                auxiliary: None,
            },
            CompilerOptions::default(),
        )
    }

    pub fn external(
        id: ProjectId,
        name: String,
        roots: Vec<PathBuf>,
        options: CompilerOptions,
    ) -> Self {
        let mut project = Self::with_policy(id, KindPolicy::External { name }, options);
        project.core.roots = roots.into_iter().collect();
        project
    }

    pub fn auto_import(
        id: ProjectId,
        host: ProjectId,
        root_dirs: Vec<PathBuf>,
        options: CompilerOptions,
    ) -> Self {
        Self::with_policy(id, KindPolicy::AuxiliaryAutoImport { host, root_dirs }, options)
    }

    fn with_policy(id: ProjectId, policy: KindPolicy, options: CompilerOptions) -> Self {
        let core = ProjectCore::new(id, options, policy.caches_diagnostics());
        Self { core, policy }
    }

    pub fn id(&self) -> ProjectId {
        self.core.id
    }

    pub fn kind(&self) -> ProjectKind {
        self.policy.kind()
    }

    pub fn policy(&self) -> &KindPolicy {
        &self.policy
    }

    pub fn name(&self) -> String {
        self.policy.display_name()
    }

    pub fn state(&self) -> ProjectState {
        self.core.state
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.core.options
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.policy.config_path()
    }

    pub fn config_diagnostics(&self) -> &[String] {
        &self.core.config_diagnostics
    }

    pub fn graph_generation(&self) -> u64 {
        self.core.graph_generation
    }

    pub fn builder(&self) -> &IncrementalBuilder {
        &self.core.builder
    }

    pub fn is_root(&self, path: &Path) -> bool {
        self.core.roots.contains(path)
    }

    /// Part of the current program, as a root or through imports
    pub fn contains(&self, path: &Path) -> bool {
        self.core.builder.contains(path)
    }

    pub fn files(&self) -> Vec<PathBuf> {
        self.core.builder.files().keys().cloned().collect()
    }

    pub fn needs_update(&self) -> bool {
        !matches!(self.core.state, ProjectState::Ready | ProjectState::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.core.state == ProjectState::Closed
    }

    pub fn auto_import_roots(&self) -> &[PathBuf] {
        match &self.policy {
            KindPolicy::Configured {
                auto_import_roots, ..
            } => auto_import_roots,
            _ => &[],
        }
    }

    pub fn auxiliary(&self) -> Option<ProjectId> {
        match &self.policy {
            KindPolicy::Configured { auxiliary, .. } => *auxiliary,
            _ => None,
        }
    }

    pub fn set_auxiliary(&mut self, id: Option<ProjectId>) {
        if let KindPolicy::Configured { auxiliary, .. } = &mut self.policy {
            *auxiliary = id;
        }
    }

    pub fn set_keep_alive(&mut self, value: bool) {
        if let KindPolicy::Configured { keep_alive, .. } = &mut self.policy {
            *keep_alive = value;
        }
    }

    pub fn add_root(&mut self, path: PathBuf) -> bool {
        if self.policy.derives_roots() || !self.core.roots.insert(path) {
            return false;
        }
        self.core.dirty.full_resolution = true;
        self.core.mark_dirty();
        true
    }

    pub fn remove_root(&mut self, path: &Path) -> bool {
        if self.policy.derives_roots() || !self.core.roots.shift_remove(path) {
            return false;
        }
        self.core.dirty.full_resolution = true;
        self.core.mark_dirty();
        true
    }

    pub fn set_roots(&mut self, roots: Vec<PathBuf>) -> bool {
        let roots: IndexSet<PathBuf> = roots.into_iter().collect();
        if self.policy.derives_roots() || roots == self.core.roots {
            return false;
        }
        self.core.roots = roots;
        self.core.dirty.full_resolution = true;
        self.core.mark_dirty();
        true
    }

    pub fn set_options(&mut self, options: CompilerOptions) -> bool {
        if options == self.core.options || self.policy.config_path().is_some() {
            return false;
        }
        self.core.options = options;
        self.core.dirty.full_resolution = true;
        self.core.mark_dirty();
        true
    }

    /// A file of this program changed content
    pub fn mark_file_changed(&mut self, path: &Path) -> bool {
        if !self.contains(path) || self.is_closed() {
            return false;
        }
        self.core.dirty.changed_files.insert(path.to_path_buf());
        self.core.mark_dirty();
        true
    }

    /// Configuration (or the directory it scans) changed; reload on next update
    pub fn mark_config_changed(&mut self) {
        if self.policy.derives_roots() && !self.is_closed() {
            self.core.state = ProjectState::Loading;
        }
    }

    /// Module resolution settings changed. Roots derived from configuration
    /// are reloaded; other projects re-resolve their graph.
    pub fn mark_resolution_changed(&mut self) {
        if self.is_closed() {
            return;
        }
        if self.policy.derives_roots() {
            self.core.state = ProjectState::Loading;
        } else {
            self.core.dirty.full_resolution = true;
            self.core.mark_dirty();
        }
    }

    pub fn try_update_graph(
        &mut self,
        host: &mut ProjectHost<'_>,
        token: &CancellationToken,
    ) -> Result<GraphOutcome, Cancelled> {
        let loading = match self.core.state {
            ProjectState::Closed | ProjectState::Ready => return Ok(GraphOutcome::default()),
            ProjectState::Unresolved | ProjectState::Loading => true,
            ProjectState::Dirty => false,
        };
        if !loading && !self.core.dirty.any() {
            self.core.state = ProjectState::Ready;
            return Ok(GraphOutcome::default());
        }

        let mut outcome = GraphOutcome::default();
        if loading {
            self.core.state = ProjectState::Loading;
            if self.policy.config_path().is_some() {
                self.load_config(host);
                outcome.config_loaded = true;
            } else if let KindPolicy::AuxiliaryAutoImport { root_dirs, .. } = &self.policy {
                let mut roots = IndexSet::new();
                for dir in root_dirs {
                    for file in host.fs.walk_files(dir) {
                        if host.config.is_source_file(&file) {
                            roots.insert(file);
                        }
                    }
                }
                self.core.roots = roots;
            }
        }
        let full = loading || self.core.dirty.full_resolution;

        let before: HashSet<PathBuf> = self.core.builder.files().keys().cloned().collect();
        let (program, acquired) = self.collect_program(host, full, token)?;
        let options = self.core.options.clone();

        let mut update = match self
            .core
            .builder
            .update(program, &options, host.checker, token)
        {
            Ok(update) => update,
            Err(cancelled) => {
                self.release_unheld(host, &acquired);
                return Err(cancelled);
            }
        };

        if let Err(e) = self.core.builder.verify() {
            log::error!("Project {}: {}; rebuilding its graph", self.name(), e);
            let files = self.core.builder.files().clone();
            self.core.builder = IncrementalBuilder::new();
            self.core.diagnostics.clear();
            update = self
                .core
                .builder
                .update(files, &options, host.checker, &CancellationToken::new())
                .unwrap_or_default();
            outcome.rebuilt = true;
        }

        // Ownership and tree holdings follow the committed program
        let after: HashSet<PathBuf> = self.core.builder.files().keys().cloned().collect();
        for path in after.difference(&before) {
            host.records.attach(path, self.core.id, host.watcher);
        }
        for path in before.difference(&after) {
            host.records.detach(path, self.core.id);
        }
        let held: HashSet<(PathBuf, SettingsKey)> = self
            .core
            .builder
            .files()
            .values()
            .map(|f| (f.tree.path.clone(), f.tree.settings_key))
            .collect();
        for (path, key) in self.core.held.difference(&held) {
            host.trees.release(self.core.id, path, *key);
        }
        for (path, key) in acquired.difference(&held) {
            host.trees.release(self.core.id, path, *key);
        }
        self.core.held = held;

        if update.program_changed {
            self.core.diagnostics.clear();
        } else {
            self.core.diagnostics.invalidate(&update.stale);
            self.core.diagnostics.invalidate(&update.removed);
        }

        self.core.dirty = DirtyFlags::default();
        self.core.state = ProjectState::Ready;
        outcome.changed = !update.is_empty() || outcome.rebuilt;
        if outcome.changed {
            self.core.graph_generation += 1;
        }
        log::trace!(
            "Project {} updated: {} files, {} stale, changed={}",
            self.name(),
            after.len(),
            update.stale.len(),
            outcome.changed
        );
        outcome.stale = update.stale;
        Ok(outcome)
    }

    fn load_config(&mut self, host: &mut ProjectHost<'_>) {
        let Some(config_path) = self.policy.config_path().map(Path::to_path_buf) else {
            return;
        };
        log::info!("Loading configuration {}", config_path.display());
        let mut watches = vec![host.watcher.watch_file(&config_path)];

        match host
            .resolver
            .resolve(&config_path, &host.config.source_extensions, host.fs)
        {
            Ok(resolved) => {
                let mut problems = resolved.errors;
                problems.extend(resolved.options.validate());
                for dir in &resolved.watched_directories {
                    watches.push(host.watcher.watch_directory(dir, true));
                }
                self.core.config_diagnostics = problems;
                self.core.roots = resolved.root_files.into_iter().collect();
                self.core.options = resolved.options;
                if let KindPolicy::Configured {
                    auto_import_roots, ..
                } = &mut self.policy
                {
                    *auto_import_roots = resolved.auto_import_roots;
                }
            }
            Err(e) => {
                // Keep the previous roots and options
                log::warn!("Configuration {} failed to load: {}", config_path.display(), e);
                self.core.config_diagnostics = vec![e.to_string()];
                watches.extend(
                    self.core
                        .watches
                        .drain(..)
                        .filter(|w| w.path() != config_path.as_path()),
                );
            }
        }
        self.core.watches = watches;
    }

    /// Walk imports from the roots. Files not marked changed are taken from
    /// the committed program unless a full resolution was requested.
    fn collect_program(
        &mut self,
        host: &mut ProjectHost<'_>,
        full: bool,
        token: &CancellationToken,
    ) -> Result<(ProgramFiles, HashSet<(PathBuf, SettingsKey)>), Cancelled> {
        let settings = self.core.options.parse_settings();
        let search_roots = self.policy.search_roots();
        let mut program = ProgramFiles::new();
        let mut acquired = HashSet::new();
        let mut queue: VecDeque<PathBuf> = self.core.roots.iter().cloned().collect();

        while let Some(path) = queue.pop_front() {
            if program.contains_key(&path) {
                continue;
            }
            let reuse = if full || self.core.dirty.changed_files.contains(&path) {
                None
            } else {
                self.core.builder.files().get(&path).cloned()
            };
            let file = match reuse {
                Some(file) => file,
                None => {
                    let snapshot = host.records.snapshot(&path, host.fs);
                    if token.is_cancelled() {
                        self.release_unheld(host, &acquired);
                        return Err(Cancelled);
                    }
                    let tree = host
                        .trees
                        .acquire(self.core.id, &snapshot, &settings, host.parser);
                    acquired.insert((path.clone(), tree.settings_key));
                    let imports = tree
                        .syntax
                        .module_references()
                        .into_iter()
                        .map(|r| ResolvedImport {
                            target: resolve_module(
                                &path,
                                &r.specifier,
                                &host.config.source_extensions,
                                &search_roots,
                                host.fs,
                            ),
                            specifier: r.specifier,
                        })
                        .collect();
                    SourceFile { tree, imports }
                }
            };
            for import in &file.imports {
                if let Some(target) = &import.target {
                    if !program.contains_key(target) {
                        queue.push_back(target.clone());
                    }
                }
            }
            program.insert(path, file);
        }

        Ok((program, acquired))
    }

    fn release_unheld(&self, host: &ProjectHost<'_>, acquired: &HashSet<(PathBuf, SettingsKey)>) {
        for (path, key) in acquired.difference(&self.core.held) {
            host.trees.release(self.core.id, path, *key);
        }
    }

    /// Parse-level diagnostics, `None` when the file is not in this project
    pub fn syntactic_diagnostics(&self, path: &Path, checker: &dyn Checker) -> Option<Vec<Diagnostic>> {
        let view = self.core.builder.view(&self.core.options);
        view.contains(path)
            .then(|| checker.syntactic_diagnostics(&view, path))
    }

    /// Checker diagnostics, served from the cache when still valid
    pub fn semantic_diagnostics(
        &mut self,
        path: &Path,
        checker: &dyn Checker,
        token: &CancellationToken,
    ) -> Result<Option<Vec<Diagnostic>>, Cancelled> {
        let Some(version) = self.core.builder.files().get(path).map(|f| f.tree.version) else {
            return Ok(None);
        };
        if let Some(cached) = self.core.diagnostics.get(path, version) {
            return Ok(Some(cached.to_vec()));
        }
        let view = self.core.builder.view(&self.core.options);
        let diagnostics = checker.semantic_diagnostics(&view, path, token)?;
        self.core
            .diagnostics
            .insert(path.to_path_buf(), version, diagnostics.clone());
        Ok(Some(diagnostics))
    }

    /// Diagnostics for every existing file of the project.
    ///
    /// Drains the affected-file queue first so only stale files are checked;
    /// cancellation between files leaves the rest queued.
    pub fn project_diagnostics(
        &mut self,
        checker: &dyn Checker,
        token: &CancellationToken,
    ) -> Result<BTreeMap<PathBuf, Vec<Diagnostic>>, Cancelled> {
        while let Some(next) = self.core.builder.next_affected() {
            match next {
                Affected::Program => self.core.diagnostics.clear(),
                Affected::File(path) => {
                    if token.is_cancelled() {
                        self.core.builder.requeue(path);
                        return Err(Cancelled);
                    }
                    if let Err(cancelled) = self.semantic_diagnostics(&path, checker, token) {
                        self.core.builder.requeue(path);
                        return Err(cancelled);
                    }
                }
            }
        }

        let paths: Vec<PathBuf> = self
            .core
            .builder
            .files()
            .iter()
            .filter(|(_, f)| !f.tree.missing)
            .map(|(p, _)| p.clone())
            .collect();
        let mut out = BTreeMap::new();
        for path in paths {
            let mut all = self.syntactic_diagnostics(&path, checker).unwrap_or_default();
            all.extend(
                self.semantic_diagnostics(&path, checker, token)?
                    .unwrap_or_default(),
            );
            out.insert(path, all);
        }
        Ok(out)
    }

    /// Exported names of every file in the program starting with `prefix`
    pub fn exported_names(&self, prefix: &str) -> BTreeSet<String> {
        self.core
            .builder
            .files()
            .values()
            .filter(|f| !f.tree.missing)
            .flat_map(|f| f.tree.syntax.exported_names())
            .filter(|name| name.starts_with(prefix))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn builder_mut(&mut self) -> &mut IncrementalBuilder {
        &mut self.core.builder
    }
}

impl ProjectOps for Project {
    fn update_graph(&mut self, host: &mut ProjectHost<'_>) -> bool {
        // A fresh token is never cancelled
        self.try_update_graph(host, &CancellationToken::new())
            .map(|outcome| outcome.changed)
            .unwrap_or(false)
    }

    fn root_files(&self) -> Vec<PathBuf> {
        self.core.roots.iter().cloned().collect()
    }

    fn close(&mut self, host: &mut ProjectHost<'_>) {
        for path in self.core.builder.files().keys() {
            host.records.detach(path, self.core.id);
        }
        for (path, key) in self.core.held.drain() {
            host.trees.release(self.core.id, &path, key);
        }
        self.core.watches.clear();
        self.core.builder = IncrementalBuilder::new();
        self.core.diagnostics.clear();
        self.core.state = ProjectState::Closed;
        log::info!("Closed project {}", self.policy.display_name());
    }
}
