//
// service/mod.rs
//
// Project service: owns file records and projects, routes editor and
// storage events, debounces graph updates, creates and retires projects
//

pub mod config_lookup;
pub mod events;
pub mod throttle;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types::{Diagnostic, TextDocumentContentChangeEvent};

use crate::config::{CompilerOptions, ServiceConfig};
use crate::error::{Cancelled, ServiceError};
use crate::file_record::FileRecordStore;
use crate::host::{Checker, ConfigResolver, FileSystem, FileWatcher, SourceParser};
use crate::lang::{JsonConfigResolver, LineChecker, LineParser};
use crate::paths::normalize_path;
use crate::project::{
    GraphOutcome, KindPolicy, Project, ProjectHost, ProjectId, ProjectKind, ProjectOps,
    ProjectState,
};
use crate::snapshot::FileSnapshot;
use crate::tree_cache::SharedTreeCache;

pub use config_lookup::ConfigLookupCache;
pub use events::ServiceEvent;
pub use throttle::{Clock, ManualClock, RuntimeClock, ThrottledOperations};

/// Everything the service consumes from outside
#[derive(Clone)]
pub struct Collaborators {
    pub parser: Arc<dyn SourceParser>,
    pub checker: Arc<dyn Checker>,
    pub resolver: Arc<dyn ConfigResolver>,
    pub fs: Arc<dyn FileSystem>,
    pub watcher: Arc<dyn FileWatcher>,
    /// May be shared by several services
    pub trees: Arc<SharedTreeCache>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// The line module language over the given storage, watcher and clock
    pub fn line_language(
        fs: Arc<dyn FileSystem>,
        watcher: Arc<dyn FileWatcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            parser: Arc::new(LineParser),
            checker: Arc::new(LineChecker),
            resolver: Arc::new(JsonConfigResolver),
            fs,
            watcher,
            trees: Arc::new(SharedTreeCache::new()),
            clock,
        }
    }
}

/// Debounced work, keyed by what it acts on
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum Throttled {
    FileEvent(PathBuf),
    UpdateGraph(ProjectId),
}

fn project_host<'a>(
    records: &'a mut FileRecordStore,
    parts: &'a Collaborators,
    config: &'a ServiceConfig,
) -> ProjectHost<'a> {
    ProjectHost {
        records,
        trees: parts.trees.as_ref(),
        parser: parts.parser.as_ref(),
        checker: parts.checker.as_ref(),
        resolver: parts.resolver.as_ref(),
        fs: parts.fs.as_ref(),
        watcher: parts.watcher.as_ref(),
        config,
    }
}

/// Preference order when several projects contain a file
fn serving_rank(kind: ProjectKind) -> u8 {
    match kind {
        ProjectKind::Configured => 0,
        ProjectKind::External => 1,
        ProjectKind::Inferred => 2,
        ProjectKind::AuxiliaryAutoImport => 3,
    }
}

pub struct ProjectService {
    config: ServiceConfig,
    parts: Collaborators,
    records: FileRecordStore,
    projects: BTreeMap<ProjectId, Project>,
    /// Exactly one configured project per configuration path
    configured: HashMap<PathBuf, ProjectId>,
    external: HashMap<String, ProjectId>,
    next_id: u64,
    config_lookup: ConfigLookupCache,
    throttle: ThrottledOperations<Throttled>,
    events: Vec<ServiceEvent>,
    /// Set while open files are being re-homed; a reload during the pass
    /// requests another pass
    rehoming: bool,
    rehome_again: bool,
}

impl ProjectService {
    pub fn new(config: ServiceConfig, parts: Collaborators) -> Self {
        config.log();
        Self {
            config_lookup: ConfigLookupCache::new(config.config_lookup_cache_capacity),
            config,
            parts,
            records: FileRecordStore::new(),
            projects: BTreeMap::new(),
            configured: HashMap::new(),
            external: HashMap::new(),
            next_id: 1,
            throttle: ThrottledOperations::new(),
            events: Vec::new(),
            rehoming: false,
            rehome_again: false,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn records(&self) -> &FileRecordStore {
        &self.records
    }

    pub fn trees(&self) -> &SharedTreeCache {
        &self.parts.trees
    }

    pub fn project(&self, id: ProjectId) -> Option<&Project> {
        self.projects.get(&id)
    }

    pub fn projects(&self) -> impl Iterator<Item = &Project> {
        self.projects.values()
    }

    pub fn configured_project(&self, config_path: &Path) -> Option<&Project> {
        self.configured
            .get(&normalize_path(config_path))
            .and_then(|id| self.projects.get(id))
    }

    pub fn external_project(&self, name: &str) -> Option<&Project> {
        self.external.get(name).and_then(|id| self.projects.get(id))
    }

    pub fn open_files(&self) -> Vec<PathBuf> {
        self.records.open_files()
    }

    pub fn editor_version(&self, path: &Path) -> Option<i32> {
        self.records
            .get(path)
            .and_then(|r| r.open.as_ref())
            .map(|o| o.editor_version)
    }

    pub fn take_events(&mut self) -> Vec<ServiceEvent> {
        std::mem::take(&mut self.events)
    }

    /// When the earliest debounced operation becomes due
    pub fn next_deadline(&self) -> Option<Instant> {
        self.throttle.next_deadline()
    }

    pub fn has_pending_work(&self) -> bool {
        !self.throttle.is_empty()
    }

    /// The project answering queries for `path`: configured over external
    /// over inferred, lowest id first.
    pub fn default_project(&self, path: &Path) -> Option<ProjectId> {
        self.records
            .owners(path)
            .into_iter()
            .filter_map(|id| self.projects.get(&id))
            .filter(|p| p.policy().can_serve_files() && !p.is_closed())
            .min_by_key(|p| (serving_rank(p.kind()), p.id()))
            .map(Project::id)
    }

    // Editor events

    /// Open a file with editor content and give it a default project
    pub fn open_file(
        &mut self,
        path: &Path,
        text: &str,
        editor_version: i32,
        project_root: Option<PathBuf>,
    ) -> ProjectId {
        let path = normalize_path(path);
        let project_root = project_root.map(|r| normalize_path(&r));
        if self.records.open(&path, text, editor_version, project_root) {
            self.mark_changed_in_owners(&path);
        }
        let id = self.assign_project(&path);
        self.retire_unused();
        id
    }

    pub fn close_file(&mut self, path: &Path) -> Result<(), ServiceError> {
        let path = normalize_path(path);
        self.records.close(&path, self.parts.watcher.as_ref())?;
        // Content now comes from storage
        self.mark_changed_in_owners(&path);
        self.remove_inferred_root(&path);
        self.retire_unused();
        Ok(())
    }

    /// Apply an editor change; graph updates for the owning projects are
    /// debounced.
    pub fn edit_file(
        &mut self,
        path: &Path,
        editor_version: i32,
        changes: Vec<TextDocumentContentChangeEvent>,
    ) -> Result<FileSnapshot, ServiceError> {
        let path = normalize_path(path);
        let snapshot = self.records.edit(&path, editor_version, changes)?;
        self.mark_changed_in_owners(&path);
        Ok(snapshot)
    }

    /// Storage reported a change at `path`. Handled after the watch delay;
    /// repeated reports within the window collapse into one.
    pub fn on_file_event(&mut self, path: &Path) {
        let now = self.parts.clock.now();
        self.throttle.schedule(
            Throttled::FileEvent(normalize_path(path)),
            now,
            self.config.watch_event_delay,
        );
    }

    /// Run every debounced operation that is due. Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let now = self.parts.clock.now();
        let due = self.throttle.take_due(now);
        let mut updated = BTreeSet::new();

        for op in &due {
            match op {
                Throttled::FileEvent(path) => self.handle_file_event(path),
                Throttled::UpdateGraph(id) => {
                    match self.update_project(*id, &CancellationToken::new()) {
                        Ok(outcome) if outcome.changed => {
                            updated.insert(*id);
                        }
                        Ok(_) => {}
                        Err(Cancelled) => log::trace!("Background update of {} abandoned", id),
                    }
                }
            }
        }

        if !updated.is_empty() {
            let open_files: Vec<PathBuf> = self
                .records
                .open_files()
                .into_iter()
                .filter(|f| {
                    updated
                        .iter()
                        .filter_map(|id| self.projects.get(id))
                        .any(|p| p.contains(f))
                })
                .collect();
            if !open_files.is_empty() {
                self.events
                    .push(ServiceEvent::BackgroundProjectsUpdated { open_files });
            }
        }
        due.len()
    }

    // External projects and host configuration

    pub fn open_external_project(
        &mut self,
        name: &str,
        root_files: Vec<PathBuf>,
        options: CompilerOptions,
    ) -> ProjectId {
        let roots: Vec<PathBuf> = root_files.iter().map(|r| normalize_path(r)).collect();
        let id = match self.external.get(name).copied() {
            Some(id) => {
                if let Some(project) = self.projects.get_mut(&id) {
                    project.set_roots(roots);
                    project.set_options(options);
                }
                id
            }
            None => {
                let id = self.allocate_id();
                log::info!("Created external project {} ({})", name, id);
                self.projects.insert(
                    id,
                    Project::external(id, name.to_string(), roots, options),
                );
                self.external.insert(name.to_string(), id);
                id
            }
        };
        self.ensure_updated(id);

        let claimed: Vec<PathBuf> = self
            .records
            .open_files()
            .into_iter()
            .filter(|f| self.projects.get(&id).is_some_and(|p| p.contains(f)))
            .collect();
        for path in claimed {
            self.remove_inferred_root(&path);
        }
        self.retire_unused();
        id
    }

    pub fn close_external_project(&mut self, name: &str) -> Result<(), ServiceError> {
        let id = self
            .external
            .get(name)
            .copied()
            .ok_or_else(|| ServiceError::UnknownExternalProject(name.to_string()))?;
        let served = self.files_served_by(id);
        self.close_project(id);
        for path in served {
            self.assign_project(&path);
        }
        self.retire_unused();
        Ok(())
    }

    /// Keep a configured project alive without open files
    pub fn set_keep_alive(&mut self, config_path: &Path, keep_alive: bool) -> Result<(), ServiceError> {
        let config_path = normalize_path(config_path);
        let id = self
            .configured
            .get(&config_path)
            .copied()
            .ok_or_else(|| ServiceError::NoProject(config_path.clone()))?;
        if let Some(project) = self.projects.get_mut(&id) {
            project.set_keep_alive(keep_alive);
        }
        if !keep_alive {
            self.retire_unused();
        }
        Ok(())
    }

    /// Replace the service configuration and bring existing projects in line
    /// with it. Open files are re-homed when configuration file names change.
    pub fn update_config(&mut self, config: ServiceConfig) {
        if config == self.config {
            return;
        }
        let options_changed = config.inferred_options != self.config.inferred_options;
        let extensions_changed = config.source_extensions != self.config.source_extensions;
        let names_changed = config.config_file_names != self.config.config_file_names;
        if names_changed
            || config.config_lookup_cache_capacity != self.config.config_lookup_cache_capacity
        {
            self.config_lookup = ConfigLookupCache::new(config.config_lookup_cache_capacity);
        }
        self.config = config;
        self.config.log();

        let mut reload: Vec<ProjectId> = Vec::new();
        if options_changed {
            let options = self.config.inferred_options.clone();
            reload.extend(
                self.projects
                    .values_mut()
                    .filter(|p| p.kind() == ProjectKind::Inferred)
                    .filter_map(|p| p.set_options(options.clone()).then(|| p.id())),
            );
        }
        if extensions_changed {
            reload.extend(self.projects.values_mut().map(|p| {
                p.mark_resolution_changed();
                p.id()
            }));
        }
        for id in reload {
            self.schedule_update(id);
        }

        if names_changed {
            let stale: Vec<ProjectId> = self
                .configured
                .iter()
                .filter(|(path, _)| !self.config.is_config_file(path))
                .map(|(_, id)| *id)
                .collect();
            for id in stale {
                log::info!("Project {} no longer has a configuration file", id);
                self.close_project(id);
            }
            for path in self.records.open_files() {
                self.assign_project(&path);
            }
            self.rehome_open_files();
        }
    }

    // Queries

    /// Default project of `path`, brought up to date
    pub fn serving_project(
        &mut self,
        path: &Path,
        token: &CancellationToken,
    ) -> Result<ProjectId, ServiceError> {
        let path = normalize_path(path);
        let mut id = self
            .default_project(&path)
            .ok_or_else(|| ServiceError::NoProject(path.clone()))?;
        loop {
            self.update_project(id, token)?;
            // A reload may have handed the file to another project
            match self.default_project(&path) {
                Some(next) if next != id => id = next,
                Some(_) => return Ok(id),
                None => return Err(ServiceError::NoProject(path)),
            }
        }
    }

    pub fn syntactic_diagnostics(
        &mut self,
        path: &Path,
        token: &CancellationToken,
    ) -> Result<Vec<Diagnostic>, ServiceError> {
        let path = normalize_path(path);
        let id = self.serving_project(&path, token)?;
        let project = self
            .projects
            .get(&id)
            .ok_or_else(|| ServiceError::NoProject(path.clone()))?;
        Ok(project
            .syntactic_diagnostics(&path, self.parts.checker.as_ref())
            .unwrap_or_default())
    }

    pub fn semantic_diagnostics(
        &mut self,
        path: &Path,
        token: &CancellationToken,
    ) -> Result<Vec<Diagnostic>, ServiceError> {
        let path = normalize_path(path);
        let id = self.serving_project(&path, token)?;
        let project = self
            .projects
            .get_mut(&id)
            .ok_or_else(|| ServiceError::NoProject(path.clone()))?;
        Ok(project
            .semantic_diagnostics(&path, self.parts.checker.as_ref(), token)?
            .unwrap_or_default())
    }

    /// Syntactic followed by semantic diagnostics of one file
    pub fn get_diagnostics(
        &mut self,
        path: &Path,
        token: &CancellationToken,
    ) -> Result<Vec<Diagnostic>, ServiceError> {
        let mut diagnostics = self.syntactic_diagnostics(path, token)?;
        diagnostics.extend(self.semantic_diagnostics(path, token)?);
        Ok(diagnostics)
    }

    /// Diagnostics of every file in the default project of `path`
    pub fn project_diagnostics(
        &mut self,
        path: &Path,
        token: &CancellationToken,
    ) -> Result<BTreeMap<PathBuf, Vec<Diagnostic>>, ServiceError> {
        let path = normalize_path(path);
        let id = self.serving_project(&path, token)?;
        let project = self
            .projects
            .get_mut(&id)
            .ok_or_else(|| ServiceError::NoProject(path.clone()))?;
        Ok(project.project_diagnostics(self.parts.checker.as_ref(), token)?)
    }

    /// Exported names starting with `prefix` visible from the default
    /// project of `path` and its auto-import companion
    pub fn completions(
        &mut self,
        path: &Path,
        prefix: &str,
        token: &CancellationToken,
    ) -> Result<Vec<String>, ServiceError> {
        let path = normalize_path(path);
        let id = self.serving_project(&path, token)?;
        let (mut names, auxiliary) = match self.projects.get(&id) {
            Some(project) => (project.exported_names(prefix), project.auxiliary()),
            None => return Err(ServiceError::NoProject(path)),
        };
        if let Some(aux) = auxiliary {
            self.update_project(aux, token)?;
            if let Some(project) = self.projects.get(&aux) {
                names.extend(project.exported_names(prefix));
            }
        }
        Ok(names.into_iter().collect())
    }

    // Project management

    fn allocate_id(&mut self) -> ProjectId {
        let id = ProjectId(self.next_id);
        self.next_id += 1;
        id
    }

    fn schedule_update(&mut self, id: ProjectId) {
        let now = self.parts.clock.now();
        self.throttle
            .schedule(Throttled::UpdateGraph(id), now, self.config.graph_update_delay);
    }

    /// Update with a token nobody cancels
    fn ensure_updated(&mut self, id: ProjectId) {
        if self.update_project(id, &CancellationToken::new()).is_err() {
            log::trace!("Update of {} abandoned", id);
        }
    }

    fn update_project(
        &mut self,
        id: ProjectId,
        token: &CancellationToken,
    ) -> Result<GraphOutcome, Cancelled> {
        let Some(project) = self.projects.get_mut(&id) else {
            return Ok(GraphOutcome::default());
        };
        if !project.needs_update() {
            return Ok(GraphOutcome::default());
        }
        self.throttle.cancel(&Throttled::UpdateGraph(id));

        let config_path = project.config_path().map(Path::to_path_buf);
        let loading = config_path.is_some()
            && matches!(
                project.state(),
                ProjectState::Unresolved | ProjectState::Loading
            );
        if let (true, Some(config_path)) = (loading, &config_path) {
            self.events.push(ServiceEvent::ProjectLoadingStarted {
                project: id,
                reason: format!("loading {}", config_path.display()),
            });
        }

        let mut host = project_host(&mut self.records, &self.parts, &self.config);
        let outcome = match project.try_update_graph(&mut host, token) {
            Ok(outcome) => outcome,
            Err(cancelled) => {
                // Loading resumes on the next update; finished is reported then
                log::trace!("Graph update of {} abandoned", id);
                self.schedule_update(id);
                return Err(cancelled);
            }
        };
        if loading {
            self.events
                .push(ServiceEvent::ProjectLoadingFinished { project: id });
        }

        if outcome.config_loaded {
            if let Some(config_path) = config_path {
                let diagnostics = self
                    .projects
                    .get(&id)
                    .map(|p| p.config_diagnostics().to_vec())
                    .unwrap_or_default();
                self.events.push(ServiceEvent::ConfigDiagnostics {
                    project: id,
                    config_path,
                    diagnostics,
                });
            }
            self.sync_auxiliary(id);
            self.rehome_open_files();
        }
        Ok(outcome)
    }

    /// Create, replace or drop the auto-import companion of a configured
    /// project after its configuration loaded.
    fn sync_auxiliary(&mut self, host_id: ProjectId) {
        let Some(project) = self.projects.get(&host_id) else {
            return;
        };
        let roots = project.auto_import_roots().to_vec();
        let options = project.options().clone();
        let current = project.auxiliary();

        if let Some(aux_id) = current {
            let same_roots = self.projects.get(&aux_id).is_some_and(|aux| {
                matches!(
                    aux.policy(),
                    KindPolicy::AuxiliaryAutoImport { root_dirs, .. } if *root_dirs == roots
                )
            });
            if same_roots {
                if let Some(aux) = self.projects.get_mut(&aux_id) {
                    aux.set_options(options);
                }
                return;
            }
            self.close_project(aux_id);
        }

        let next = if roots.is_empty() {
            None
        } else {
            let aux_id = self.allocate_id();
            log::info!("Created auto-import project {} for {}", aux_id, host_id);
            self.projects
                .insert(aux_id, Project::auto_import(aux_id, host_id, roots, options));
            Some(aux_id)
        };
        if let Some(project) = self.projects.get_mut(&host_id) {
            project.set_auxiliary(next);
        }
    }

    fn close_project(&mut self, id: ProjectId) {
        let Some(mut project) = self.projects.remove(&id) else {
            return;
        };
        let mut host = project_host(&mut self.records, &self.parts, &self.config);
        project.close(&mut host);
        self.throttle.cancel(&Throttled::UpdateGraph(id));

        if let Some(config_path) = project.config_path() {
            self.configured.remove(config_path);
        }
        if let KindPolicy::External { name } = project.policy() {
            self.external.remove(name);
        }
        if let Some(aux) = project.auxiliary() {
            self.close_project(aux);
        }
        self.events.push(ServiceEvent::ProjectClosed {
            project: id,
            name: project.name(),
        });
    }

    fn configured_for(&mut self, config_path: &Path) -> ProjectId {
        if let Some(id) = self.configured.get(config_path) {
            return *id;
        }
        let id = self.allocate_id();
        log::info!("Created configured project {} for {}", id, config_path.display());
        self.projects
            .insert(id, Project::configured(id, config_path.to_path_buf()));
        self.configured.insert(config_path.to_path_buf(), id);
        id
    }

    fn inferred_for(&mut self, path: &Path) -> ProjectId {
        let hint = self
            .records
            .get(path)
            .and_then(|r| r.open.as_ref())
            .and_then(|o| o.project_root.clone());

        let shared = if self.config.single_inferred_project {
            self.projects
                .values()
                .find(|p| {
                    matches!(p.policy(), KindPolicy::Inferred { root_hint } if *root_hint == hint)
                })
                .map(Project::id)
        } else {
            None
        };
        let id = match shared {
            Some(id) => id,
            None => {
                let id = self.allocate_id();
                log::info!("Created inferred project {} for {}", id, path.display());
                let options = self.config.inferred_options.clone();
                self.projects
                    .insert(id, Project::inferred(id, hint, options));
                id
            }
        };
        if let Some(project) = self.projects.get_mut(&id) {
            project.add_root(path.to_path_buf());
        }
        self.ensure_updated(id);
        id
    }

    /// Find or create the default project of an open file: the nearest
    /// configuration above it, then any configured or external project
    /// already containing it, then an inferred project.
    fn assign_project(&mut self, path: &Path) -> ProjectId {
        let config_path = self.config_lookup.find(
            path,
            &self.config.config_file_names,
            self.parts.fs.as_ref(),
        );
        if let Some(config_path) = config_path {
            let id = self.configured_for(&config_path);
            self.ensure_updated(id);
            if self.projects.get(&id).is_some_and(|p| p.contains(path)) {
                self.remove_inferred_root(path);
                return id;
            }
        }

        let claimed = self.default_project(path).filter(|id| {
            self.projects
                .get(id)
                .is_some_and(|p| p.kind() != ProjectKind::Inferred)
        });
        if let Some(id) = claimed {
            self.remove_inferred_root(path);
            return id;
        }

        let existing = self
            .projects
            .values()
            .find(|p| p.kind() == ProjectKind::Inferred && p.is_root(path))
            .map(Project::id);
        match existing {
            Some(id) => id,
            None => self.inferred_for(path),
        }
    }

    /// Inferred roots are exactly the open files nobody else claims
    fn remove_inferred_root(&mut self, path: &Path) {
        let ids: Vec<ProjectId> = self
            .projects
            .values_mut()
            .filter(|p| p.kind() == ProjectKind::Inferred)
            .filter_map(|p| p.remove_root(path).then(|| p.id()))
            .collect();
        for id in ids {
            self.schedule_update(id);
        }
    }

    /// After a configuration reload: open files no project holds any more
    /// get a default project, and files a configured or external project
    /// now holds stop being inferred roots.
    fn rehome_open_files(&mut self) {
        if self.rehoming {
            self.rehome_again = true;
            return;
        }
        self.rehoming = true;
        loop {
            self.rehome_again = false;
            for path in self.records.open_files() {
                let claimed = self.projects.values().any(|p| {
                    matches!(p.kind(), ProjectKind::Configured | ProjectKind::External)
                        && !p.is_closed()
                        && p.contains(&path)
                });
                if claimed {
                    self.remove_inferred_root(&path);
                } else if self.default_project(&path).is_none() {
                    log::trace!("Re-homing {}", path.display());
                    self.assign_project(&path);
                }
            }
            if !self.rehome_again {
                break;
            }
        }
        self.rehoming = false;
        self.retire_unused();
    }

    fn mark_changed_in_owners(&mut self, path: &Path) {
        let ids: Vec<ProjectId> = self
            .records
            .owners(path)
            .into_iter()
            .filter(|id| {
                self.projects
                    .get_mut(id)
                    .is_some_and(|p| p.mark_file_changed(path))
            })
            .collect();
        for id in ids {
            self.schedule_update(id);
        }
    }

    fn files_served_by(&self, id: ProjectId) -> Vec<PathBuf> {
        self.records
            .open_files()
            .into_iter()
            .filter(|f| self.default_project(f) == Some(id))
            .collect()
    }

    /// Close projects nobody needs any more and drop orphaned file records
    fn retire_unused(&mut self) {
        let open = self.records.open_files();
        let retire: Vec<ProjectId> = self
            .projects
            .values()
            .filter(|p| match p.policy() {
                KindPolicy::Inferred { .. } => p.root_files().is_empty(),
                KindPolicy::Configured { .. } => {
                    p.policy().retire_when_unused() && !open.iter().any(|f| p.contains(f))
                }
                _ => false,
            })
            .map(Project::id)
            .collect();
        for id in retire {
            log::info!("Retiring unused project {}", id);
            self.close_project(id);
        }
        let dropped = self.records.collect_garbage();
        if !dropped.is_empty() {
            log::trace!("Dropped {} orphaned file records", dropped.len());
        }
    }

    // Storage events

    fn handle_file_event(&mut self, path: &Path) {
        if self.config.is_config_file(path) {
            self.config_lookup.invalidate();
            self.handle_config_event(path);
            return;
        }

        if self.records.mark_changed_on_disk(path) {
            self.mark_changed_in_owners(path);
        }
        if !self.config.is_source_file(path) {
            return;
        }

        // Creations and deletions can change include-derived root sets
        let exists = self.parts.fs.exists(path);
        let rescan: Vec<ProjectId> = self
            .projects
            .values_mut()
            .filter(|p| p.policy().scans(path) && exists != p.is_root(path))
            .map(|p| {
                p.mark_config_changed();
                p.id()
            })
            .collect();
        for id in rescan {
            self.schedule_update(id);
        }
    }

    fn handle_config_event(&mut self, config_path: &Path) {
        let exists = self.parts.fs.exists(config_path);
        match self.configured.get(config_path).copied() {
            Some(id) if exists => {
                log::info!("Configuration {} changed", config_path.display());
                if let Some(project) = self.projects.get_mut(&id) {
                    project.mark_config_changed();
                }
                self.schedule_update(id);
            }
            Some(id) => {
                log::info!("Configuration {} deleted", config_path.display());
                let served = self.files_served_by(id);
                self.close_project(id);
                for path in served {
                    self.assign_project(&path);
                }
                self.retire_unused();
            }
            None if exists => {
                let Some(dir) = config_path.parent() else {
                    return;
                };
                let loose: Vec<PathBuf> = self
                    .records
                    .open_files()
                    .into_iter()
                    .filter(|f| f.starts_with(dir))
                    .filter(|f| {
                        self.default_project(f)
                            .and_then(|id| self.projects.get(&id))
                            .map_or(true, |p| p.kind() == ProjectKind::Inferred)
                    })
                    .collect();
                if loose.is_empty() {
                    return;
                }
                log::info!(
                    "Configuration {} created; re-homing {} open files",
                    config_path.display(),
                    loose.len()
                );
                for path in loose {
                    self.assign_project(&path);
                }
                self.retire_unused();
            }
            None => {}
        }
    }
}
