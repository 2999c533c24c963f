//
// builder/mod.rs
//
// Incremental builder: per-file signatures over the import graph and the
// affected-file queue
//

pub mod graph;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexSet;
use tokio_util::sync::CancellationToken;

use crate::config::CompilerOptions;
use crate::error::{Cancelled, GraphInvariantError};
use crate::host::{Checker, ParsedTree, Signature};

pub use graph::{Components, DependencyGraph};

/// One import of a file after resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImport {
    pub specifier: String,
    /// `None` when the specifier could not be resolved at all
    pub target: Option<PathBuf>,
}

/// A file as handed to the builder by its project
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub tree: Arc<ParsedTree>,
    pub imports: Vec<ResolvedImport>,
}

impl SourceFile {
    fn same_input(&self, other: &SourceFile) -> bool {
        self.tree.version == other.tree.version
            && self.tree.settings_key == other.tree.settings_key
            && self.imports == other.imports
    }
}

/// Complete file set of a program, keyed by path
pub type ProgramFiles = BTreeMap<PathBuf, SourceFile>;

/// Read-only view of a program handed to the checker
#[derive(Clone, Copy)]
pub struct ProgramView<'a> {
    files: &'a ProgramFiles,
    options: &'a CompilerOptions,
}

impl<'a> ProgramView<'a> {
    pub fn new(files: &'a ProgramFiles, options: &'a CompilerOptions) -> Self {
        Self { files, options }
    }

    pub fn tree(&self, path: &Path) -> Option<&'a ParsedTree> {
        self.files.get(path).map(|f| f.tree.as_ref())
    }

    /// Target of `specifier` as imported by `from`
    pub fn resolve(&self, from: &Path, specifier: &str) -> Option<&'a Path> {
        self.files
            .get(from)?
            .imports
            .iter()
            .find(|i| i.specifier == specifier)?
            .target
            .as_deref()
    }

    pub fn options(&self) -> &'a CompilerOptions {
        self.options
    }

    pub fn files(&self) -> impl Iterator<Item = &'a Path> + 'a {
        self.files.keys().map(PathBuf::as_path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }
}

/// One step of the affected-file iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Affected {
    File(PathBuf),
    /// Options changed; every cached result of the program is stale
    Program,
}

/// What one committed update did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuilderUpdate {
    /// Files whose cached results became stale, each listed once
    pub stale: Vec<PathBuf>,
    /// Files no longer part of the program
    pub removed: Vec<PathBuf>,
    /// Number of signature computations performed
    pub signatures_computed: usize,
    pub program_changed: bool,
}

impl BuilderUpdate {
    pub fn is_empty(&self) -> bool {
        self.stale.is_empty() && self.removed.is_empty() && !self.program_changed
    }
}

/// Per-project incremental state.
///
/// `update` computes everything into locals and commits at the end, so a
/// cancelled update leaves the builder exactly as it was.
#[derive(Debug, Default)]
pub struct IncrementalBuilder {
    files: ProgramFiles,
    signatures: HashMap<PathBuf, Signature>,
    graph: DependencyGraph,
    options: Option<CompilerOptions>,
    pending: IndexSet<PathBuf>,
    program_pending: bool,
}

impl IncrementalBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(
        &mut self,
        program: ProgramFiles,
        options: &CompilerOptions,
        checker: &dyn Checker,
        token: &CancellationToken,
    ) -> Result<BuilderUpdate, Cancelled> {
        let options_changed = self.options.as_ref().is_some_and(|o| o != options);
        let mut graph = self.graph.clone();

        let removed: Vec<PathBuf> = self
            .files
            .keys()
            .filter(|p| !program.contains_key(*p))
            .cloned()
            .collect();
        for path in &removed {
            graph.remove_file(path);
        }

        let mut changed = Vec::new();
        for (path, source) in &program {
            let same = self
                .files
                .get(path)
                .map(|old| old.same_input(source))
                .unwrap_or(false);
            if same && !options_changed {
                continue;
            }
            if !same {
                let targets = source
                    .imports
                    .iter()
                    .filter_map(|i| i.target.clone())
                    .filter(|t| program.contains_key(t));
                graph.set_dependencies(path, targets);
            }
            changed.push(path.clone());
        }

        if token.is_cancelled() {
            return Err(Cancelled);
        }

        let view = ProgramView::new(&program, options);
        let components = graph.components(program.keys());
        let mut signatures: HashMap<PathBuf, Signature> = self
            .signatures
            .iter()
            .filter(|(p, _)| program.contains_key(*p))
            .map(|(p, s)| (p.clone(), *s))
            .collect();

        let mut stale: IndexSet<PathBuf> = IndexSet::new();
        let mut moved: HashSet<PathBuf> = HashSet::new();
        let mut queue: VecDeque<usize> = VecDeque::new();
        let mut computed = 0usize;

        // Changed files are always stale themselves; only a moved signature
        // lets the change escape the file.
        for path in &changed {
            if token.is_cancelled() {
                return Err(Cancelled);
            }
            let signature = checker.signature(&view, path);
            computed += 1;
            stale.insert(path.clone());
            if signatures.insert(path.clone(), signature) != Some(signature) {
                moved.insert(path.clone());
                if let Some(c) = components.component_of(path) {
                    queue.push_back(c);
                }
            }
        }

        // Propagate component by component; each component is processed once
        // and stops the flood when none of its signatures moved.
        let mut visited: HashSet<usize> = HashSet::new();
        while let Some(component) = queue.pop_front() {
            if !visited.insert(component) {
                continue;
            }
            if token.is_cancelled() {
                return Err(Cancelled);
            }
            let members = &components.members[component];
            let mut component_moved = false;
            for member in members {
                if moved.contains(member) {
                    component_moved = true;
                }
                if !stale.insert(member.clone()) {
                    continue;
                }
                let signature = checker.signature(&view, member);
                computed += 1;
                if signatures.insert(member.clone(), signature) != Some(signature) {
                    moved.insert(member.clone());
                    component_moved = true;
                }
            }
            if !component_moved {
                continue;
            }
            for member in members {
                for dependent in graph.get_dependents(member) {
                    match components.component_of(dependent) {
                        Some(c) if c != component && !visited.contains(&c) => queue.push_back(c),
                        _ => {}
                    }
                }
            }
        }

        log::trace!(
            "Builder update: {} changed, {} stale, {} removed, {} signatures computed",
            changed.len(),
            stale.len(),
            removed.len(),
            computed
        );

        // Commit
        self.files = program;
        self.signatures = signatures;
        self.graph = graph;
        self.options = Some(options.clone());
        for path in &removed {
            self.pending.shift_remove(path);
        }
        if options_changed {
            self.pending.clear();
            self.program_pending = true;
        }
        self.pending.extend(stale.iter().cloned());

        Ok(BuilderUpdate {
            stale: stale.into_iter().collect(),
            removed,
            signatures_computed: computed,
            program_changed: options_changed,
        })
    }

    /// Next stale file, or the program sentinel after an options change.
    pub fn next_affected(&mut self) -> Option<Affected> {
        if self.program_pending {
            self.program_pending = false;
            return Some(Affected::Program);
        }
        self.pending.shift_remove_index(0).map(Affected::File)
    }

    /// Put a file back at the front of the queue (its recomputation was
    /// abandoned).
    pub fn requeue(&mut self, path: PathBuf) {
        if self.files.contains_key(&path) {
            let (idx, _) = self.pending.insert_full(path);
            self.pending.move_index(idx, 0);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len() + usize::from(self.program_pending)
    }

    pub fn view<'a>(&'a self, options: &'a CompilerOptions) -> ProgramView<'a> {
        ProgramView::new(&self.files, options)
    }

    pub fn files(&self) -> &ProgramFiles {
        &self.files
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    pub fn signature(&self, path: &Path) -> Option<Signature> {
        self.signatures.get(path).copied()
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn verify(&self) -> Result<(), GraphInvariantError> {
        self.graph.verify()
    }

    #[cfg(test)]
    pub(crate) fn graph_mut(&mut self) -> &mut DependencyGraph {
        &mut self.graph
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::ParseSettings;
    use crate::host::SourceParser;
    use crate::lang::LineParser;
    use crate::paths::resolve_module;

    static VERSION: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

    pub fn tree(path: &Path, text: Option<&str>) -> Arc<ParsedTree> {
        let settings = ParseSettings::default();
        Arc::new(ParsedTree {
            path: path.to_path_buf(),
            version: VERSION.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            settings_key: settings.key(),
            missing: text.is_none(),
            syntax: LineParser.parse(path, text.unwrap_or(""), &settings),
        })
    }

    /// Program from `(name, text)` pairs under `/w`; imports of names not in
    /// the list become missing nodes.
    pub fn program(files: &[(&str, &str)]) -> ProgramFiles {
        let fs = crate::host::MemoryFileSystem::new();
        let exts = vec!["lm".to_string()];
        let mut out = ProgramFiles::new();
        let mut missing = Vec::new();
        for (name, text) in files {
            let path = PathBuf::from(format!("/w/{}.lm", name));
            let tree = tree(&path, Some(text));
            let imports = tree
                .syntax
                .module_references()
                .into_iter()
                .map(|r| {
                    let target = resolve_module(&path, &r.specifier, &exts, &[], &fs);
                    ResolvedImport {
                        specifier: r.specifier,
                        target,
                    }
                })
                .collect::<Vec<_>>();
            missing.extend(imports.iter().filter_map(|i| i.target.clone()));
            out.insert(path, SourceFile { tree, imports });
        }
        for path in missing {
            if !out.contains_key(&path) {
                let tree = tree(&path, None);
                out.insert(path, SourceFile { tree, imports: Vec::new() });
            }
        }
        out
    }

    /// Replace one file's text, keeping the other entries untouched
    pub fn with_edit(program: &ProgramFiles, name: &str, text: &str) -> ProgramFiles {
        let edited = self::program(&[(name, text)]);
        let mut out = program.clone();
        for (path, file) in edited {
            if path.file_stem().and_then(|s| s.to_str()) == Some(name) || !out.contains_key(&path) {
                out.insert(path, file);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::lang::LineChecker;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn p(name: &str) -> PathBuf {
        PathBuf::from(format!("/w/{}.lm", name))
    }

    fn build(program: ProgramFiles) -> IncrementalBuilder {
        let mut builder = IncrementalBuilder::new();
        builder
            .update(program, &CompilerOptions::default(), &LineChecker, &CancellationToken::new())
            .unwrap();
        while builder.next_affected().is_some() {}
        builder
    }

    fn apply(builder: &mut IncrementalBuilder, program: ProgramFiles) -> BuilderUpdate {
        builder
            .update(program, &CompilerOptions::default(), &LineChecker, &CancellationToken::new())
            .unwrap()
    }

    /// Counts signature computations per file
    #[derive(Default)]
    struct CountingChecker {
        calls: std::sync::Mutex<HashMap<PathBuf, usize>>,
        total: AtomicUsize,
    }

    impl Checker for CountingChecker {
        fn signature(&self, program: &ProgramView<'_>, file: &Path) -> Signature {
            self.total.fetch_add(1, Ordering::SeqCst);
            *self.calls.lock().unwrap().entry(file.to_path_buf()).or_default() += 1;
            LineChecker.signature(program, file)
        }

        fn semantic_diagnostics(
            &self,
            program: &ProgramView<'_>,
            file: &Path,
            token: &CancellationToken,
        ) -> Result<Vec<tower_lsp::lsp_types::Diagnostic>, Cancelled> {
            LineChecker.semantic_diagnostics(program, file, token)
        }
    }

    const C: &str = "export fn c(x) { x }";
    const B: &str = "use c from \"./c\"\nexport fn b(y) { c(y) }";
    const A: &str = "use b from \"./b\"\nfn main() { b(1) }";

    #[test]
    fn test_initial_build_marks_everything_stale() {
        let mut builder = IncrementalBuilder::new();
        let update = apply(&mut builder, program(&[("a", A), ("b", B), ("c", C)]));
        assert_eq!(update.stale.len(), 3);
        assert_eq!(builder.pending_count(), 3);
        assert!(builder.verify().is_ok());
        assert_eq!(builder.graph().get_dependents(&p("c")), vec![&p("b")]);
    }

    #[test]
    fn test_body_edit_does_not_propagate() {
        let base = program(&[("a", A), ("b", B), ("c", C)]);
        let mut builder = build(base.clone());
        let before = builder.signature(&p("c"));

        let update = apply(&mut builder, with_edit(&base, "c", "export fn c(x) { x * 2 }"));
        assert_eq!(update.stale, vec![p("c")]);
        assert_eq!(builder.signature(&p("c")), before);
        assert_eq!(builder.next_affected(), Some(Affected::File(p("c"))));
        assert_eq!(builder.next_affected(), None);
    }

    #[test]
    fn test_shape_change_propagates_transitively() {
        let base = program(&[("a", A), ("b", B), ("c", C)]);
        let mut builder = build(base.clone());

        let update = apply(&mut builder, with_edit(&base, "c", "export fn c(x, y) { x }"));
        assert_eq!(update.stale, vec![p("c"), p("b"), p("a")]);
    }

    #[test]
    fn test_propagation_stops_at_unchanged_signature() {
        // b imports c but consumes none of its shapes
        let b = "import \"./c\"\nexport fn b() {}";
        let base = program(&[("a", A), ("b", b), ("c", C)]);
        let mut builder = build(base.clone());

        let update = apply(&mut builder, with_edit(&base, "c", "export fn c(x, y) { x }"));
        assert_eq!(update.stale, vec![p("c"), p("b")]);
        assert!(!update.stale.contains(&p("a")));
    }

    #[test]
    fn test_unchanged_program_is_a_no_op() {
        let base = program(&[("a", A), ("b", B), ("c", C)]);
        let mut builder = build(base.clone());
        let update = apply(&mut builder, base);
        assert!(update.is_empty());
        assert_eq!(update.signatures_computed, 0);
    }

    #[test]
    fn test_cycle_members_are_stale_exactly_once() {
        let files = [
            ("x", "use y from \"./y\"\nexport fn x() {}"),
            ("y", "use z from \"./z\"\nexport fn y() {}"),
            ("z", "use x from \"./x\"\nexport fn z() {}"),
            ("top", "use x from \"./x\"\nfn main() {}"),
        ];
        let base = program(&files);
        let mut builder = build(base.clone());
        let checker = CountingChecker::default();

        let edited = with_edit(&base, "x", "use y from \"./y\"\nexport fn x(arg) {}");
        let update = builder
            .update(edited, &CompilerOptions::default(), &checker, &CancellationToken::new())
            .unwrap();

        let unique: HashSet<_> = update.stale.iter().collect();
        assert_eq!(unique.len(), update.stale.len());
        assert_eq!(update.stale.len(), 4);
        let calls = checker.calls.lock().unwrap();
        for name in ["x", "y", "z", "top"] {
            assert_eq!(calls.get(&p(name)), Some(&1), "{}", name);
        }
    }

    #[test]
    fn test_deleted_dependency_becomes_missing() {
        let base = program(&[("a", A), ("b", B), ("c", C)]);
        let mut builder = build(base.clone());

        let mut without_c = base.clone();
        without_c.insert(p("c"), SourceFile { tree: tree(&p("c"), None), imports: Vec::new() });
        let update = apply(&mut builder, without_c);

        assert_eq!(builder.signature(&p("c")), Some(Signature::Missing));
        assert!(builder.contains(&p("b")));
        assert!(update.stale.contains(&p("b")));
        assert!(update.stale.contains(&p("a")));
    }

    #[test]
    fn test_removed_file_leaves_queue_and_graph() {
        let base = program(&[("a", "fn main() {}"), ("b", "export fn b() {}")]);
        let mut builder = IncrementalBuilder::new();
        apply(&mut builder, base.clone());

        let mut smaller = base;
        smaller.remove(&p("b"));
        let update = apply(&mut builder, smaller);
        assert_eq!(update.removed, vec![p("b")]);
        assert!(!builder.contains(&p("b")));
        assert_eq!(builder.pending_count(), 1);
    }

    #[test]
    fn test_options_change_yields_program_sentinel_first() {
        let base = program(&[("a", A), ("b", B), ("c", C)]);
        let mut builder = build(base.clone());
        let strict = CompilerOptions {
            strict: true,
            ..Default::default()
        };
        let update = builder
            .update(base, &strict, &LineChecker, &CancellationToken::new())
            .unwrap();
        assert!(update.program_changed);
        assert_eq!(builder.next_affected(), Some(Affected::Program));
        let mut rest = Vec::new();
        while let Some(Affected::File(path)) = builder.next_affected() {
            rest.push(path);
        }
        assert_eq!(rest.len(), 3);
    }

    #[test]
    fn test_cancelled_update_leaves_state_untouched() {
        let base = program(&[("a", A), ("b", B), ("c", C)]);
        let mut builder = build(base.clone());
        let before = builder.signature(&p("c"));

        let token = CancellationToken::new();
        token.cancel();
        let result = builder.update(
            with_edit(&base, "c", "export fn c(x, y) { x }"),
            &CompilerOptions::default(),
            &LineChecker,
            &token,
        );
        assert_eq!(result, Err(Cancelled));
        assert_eq!(builder.signature(&p("c")), before);
        assert_eq!(builder.pending_count(), 0);
        assert!(builder.verify().is_ok());
    }

    #[test]
    fn test_requeue_puts_file_first() {
        let mut builder = IncrementalBuilder::new();
        apply(&mut builder, program(&[("a", "fn a() {}"), ("b", "fn b() {}")]));
        let Some(Affected::File(first)) = builder.next_affected() else {
            panic!("expected a file");
        };
        builder.requeue(first.clone());
        assert_eq!(builder.next_affected(), Some(Affected::File(first)));
    }
}
