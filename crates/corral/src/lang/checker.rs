//
// lang/checker.rs
//
// Signatures and semantic diagnostics for line modules
//

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types::{Diagnostic, DiagnosticSeverity};

use super::{error_diagnostic, Item, LineTree};
use crate::builder::ProgramView;
use crate::error::Cancelled;
use crate::host::{Checker, Signature};

/// [`Checker`] for the line module language.
///
/// A file's signature covers its own exported shapes, every shape it
/// re-exports through `export *`, and the shapes of the names it pulls in
/// with `use`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LineChecker;

fn line_tree<'a>(program: &ProgramView<'a>, file: &Path) -> Option<&'a LineTree> {
    let tree = program.tree(file)?;
    if tree.missing {
        return None;
    }
    tree.syntax.as_any().downcast_ref::<LineTree>()
}

/// Exported name -> shape, following `export *` chains.
fn visible_exports(program: &ProgramView<'_>, file: &Path) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let mut visited = HashSet::new();
    collect_exports(program, file, &mut visited, &mut out);
    out
}

fn collect_exports(
    program: &ProgramView<'_>,
    file: &Path,
    visited: &mut HashSet<PathBuf>,
    out: &mut BTreeMap<String, String>,
) {
    if !visited.insert(file.to_path_buf()) {
        return;
    }
    let Some(tree) = line_tree(program, file) else {
        return;
    };
    for decl in tree.exports() {
        out.entry(decl.name.clone())
            .or_insert_with(|| format!("{} {}", decl.kind.keyword(), decl.shape));
    }
    for item in &tree.items {
        if let Item::ReExport { specifier, .. } = item {
            if let Some(target) = program.resolve(file, specifier) {
                collect_exports(program, target, visited, out);
            }
        }
    }
}

fn module_exists(program: &ProgramView<'_>, target: Option<&Path>) -> bool {
    target
        .and_then(|t| program.tree(t))
        .map(|t| !t.missing)
        .unwrap_or(false)
}

impl Checker for LineChecker {
    fn signature(&self, program: &ProgramView<'_>, file: &Path) -> Signature {
        let Some(tree) = program.tree(file) else {
            return Signature::Missing;
        };
        if tree.missing {
            return Signature::Missing;
        }
        let mut hasher = DefaultHasher::new();
        let Some(lines) = tree.syntax.as_any().downcast_ref::<LineTree>() else {
            let mut names = tree.syntax.exported_names();
            names.sort();
            names.hash(&mut hasher);
            return Signature::Shape(hasher.finish());
        };

        // Own exports plus everything re-exported
        visible_exports(program, file).hash(&mut hasher);

        // Shapes consumed through `use`
        for item in &lines.items {
            if let Item::Use {
                names, specifier, ..
            } = item
            {
                let target = program.resolve(file, specifier);
                let exports = target
                    .map(|t| visible_exports(program, t))
                    .unwrap_or_default();
                specifier.hash(&mut hasher);
                for (name, _) in names {
                    name.hash(&mut hasher);
                    exports.get(name).hash(&mut hasher);
                }
            }
        }

        Signature::Shape(hasher.finish())
    }

    fn semantic_diagnostics(
        &self,
        program: &ProgramView<'_>,
        file: &Path,
        token: &CancellationToken,
    ) -> Result<Vec<Diagnostic>, Cancelled> {
        let Some(tree) = line_tree(program, file) else {
            return Ok(Vec::new());
        };
        let strict = program.options().strict;
        let mut diagnostics = Vec::new();
        let mut seen_exports = HashSet::new();

        for item in &tree.items {
            if token.is_cancelled() {
                return Err(Cancelled);
            }
            match item {
                Item::Import { specifier, range } => {
                    let target = program.resolve(file, specifier);
                    if !module_exists(program, target) {
                        diagnostics.push(error_diagnostic(
                            *range,
                            format!("Cannot find module '{}'", specifier),
                        ));
                    } else if strict {
                        let mut d = error_diagnostic(
                            *range,
                            format!("Import of '{}' has no bindings", specifier),
                        );
                        d.severity = Some(DiagnosticSeverity::WARNING);
                        diagnostics.push(d);
                    }
                }
                Item::ReExport { specifier, range } => {
                    if !module_exists(program, program.resolve(file, specifier)) {
                        diagnostics.push(error_diagnostic(
                            *range,
                            format!("Cannot find module '{}'", specifier),
                        ));
                    }
                }
                Item::Use {
                    names,
                    specifier,
                    range,
                } => {
                    let target = program.resolve(file, specifier);
                    if !module_exists(program, target) {
                        diagnostics.push(error_diagnostic(
                            *range,
                            format!("Cannot find module '{}'", specifier),
                        ));
                        continue;
                    }
                    let exports = target
                        .map(|t| visible_exports(program, t))
                        .unwrap_or_default();
                    for (name, name_range) in names {
                        if !exports.contains_key(name) {
                            diagnostics.push(error_diagnostic(
                                *name_range,
                                format!(
                                    "Module '{}' has no exported member '{}'",
                                    specifier, name
                                ),
                            ));
                        }
                    }
                }
                Item::Decl(decl) => {
                    if decl.exported && !seen_exports.insert(decl.name.as_str()) {
                        diagnostics.push(error_diagnostic(
                            decl.range,
                            format!("Duplicate export '{}'", decl.name),
                        ));
                    }
                }
            }
        }

        Ok(diagnostics)
    }
}
