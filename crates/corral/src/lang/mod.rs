//
// lang/mod.rs
//
// The line module language: one declaration per line, `.lm` files
//
// Grammar, per trimmed line:
//   import "<spec>"
//   use <name>[, <name>]* from "<spec>"
//   export * from "<spec>"
//   [export] fn|const|type <name><rest>
//   # comment
// Anything else is body text and never part of a file's shape.
//

mod checker;
mod project_file;

use std::any::Any;
use std::path::Path;

use tower_lsp::lsp_types::{Diagnostic, DiagnosticSeverity, Position, Range};

use crate::config::{ParseSettings, Target};
use crate::host::{ModuleReference, SourceParser, SyntaxTree};

pub use checker::LineChecker;
pub use project_file::JsonConfigResolver;

pub const DIAGNOSTIC_SOURCE: &str = "corral";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeclKind {
    Fn,
    Const,
    Type,
}

impl DeclKind {
    fn from_keyword(word: &str) -> Option<DeclKind> {
        match word {
            "fn" => Some(DeclKind::Fn),
            "const" => Some(DeclKind::Const),
            "type" => Some(DeclKind::Type),
            _ => None,
        }
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            DeclKind::Fn => "fn",
            DeclKind::Const => "const",
            DeclKind::Type => "type",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub kind: DeclKind,
    pub name: String,
    /// Externally visible part: the declaration up to `{` or `=`,
    /// whitespace-normalized
    pub shape: String,
    pub exported: bool,
    pub range: Range,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Import {
        specifier: String,
        range: Range,
    },
    Use {
        names: Vec<(String, Range)>,
        specifier: String,
        range: Range,
    },
    ReExport {
        specifier: String,
        range: Range,
    },
    Decl(Declaration),
}

impl Item {
    pub fn specifier(&self) -> Option<&str> {
        match self {
            Item::Import { specifier, .. }
            | Item::Use { specifier, .. }
            | Item::ReExport { specifier, .. } => Some(specifier),
            Item::Decl(_) => None,
        }
    }

    pub fn range(&self) -> Range {
        match self {
            Item::Import { range, .. } | Item::Use { range, .. } | Item::ReExport { range, .. } => {
                *range
            }
            Item::Decl(decl) => decl.range,
        }
    }
}

/// Parsed `.lm` file
#[derive(Debug, Clone, Default)]
pub struct LineTree {
    pub items: Vec<Item>,
    pub diagnostics: Vec<Diagnostic>,
}

impl LineTree {
    pub fn exports(&self) -> impl Iterator<Item = &Declaration> {
        self.items.iter().filter_map(|item| match item {
            Item::Decl(decl) if decl.exported => Some(decl),
            _ => None,
        })
    }
}

impl SyntaxTree for LineTree {
    fn module_references(&self) -> Vec<ModuleReference> {
        self.items
            .iter()
            .filter_map(|item| {
                item.specifier().map(|s| ModuleReference {
                    specifier: s.to_string(),
                    range: item.range(),
                })
            })
            .collect()
    }

    fn syntax_diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.clone()
    }

    fn exported_names(&self) -> Vec<String> {
        self.exports().map(|d| d.name.clone()).collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// [`SourceParser`] for the line module language
#[derive(Debug, Default, Clone, Copy)]
pub struct LineParser;

impl SourceParser for LineParser {
    fn parse(&self, _path: &Path, text: &str, settings: &ParseSettings) -> Box<dyn SyntaxTree> {
        Box::new(parse(text, settings))
    }
}

pub fn parse(text: &str, settings: &ParseSettings) -> LineTree {
    let mut tree = LineTree::default();

    for (idx, raw) in text.lines().enumerate() {
        let line = idx as u32;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let indent = utf16_len(raw) - utf16_len(raw.trim_start());
        let range = line_range(line, indent, trimmed);

        let (first, rest) = split_word(trimmed);
        let head_width = utf16_len(&trimmed[..trimmed.len() - rest.len()]);
        match first {
            "import" => match quoted(rest) {
                Some(specifier) => tree.items.push(Item::Import { specifier, range }),
                None => tree.error(range, "expected a quoted module specifier after 'import'"),
            },
            "use" => match parse_use(rest, line, indent + head_width) {
                Ok((names, specifier)) => tree.items.push(Item::Use {
                    names,
                    specifier,
                    range,
                }),
                Err(message) => tree.error(range, message),
            },
            "export" => {
                let (second, after) = split_word(rest);
                if second == "*" {
                    let (from, spec) = split_word(after);
                    match (from, quoted(spec)) {
                        ("from", Some(_)) if settings.target == Target::Legacy => {
                            tree.error(range, "'export *' is not supported by the legacy target")
                        }
                        ("from", Some(specifier)) => {
                            tree.items.push(Item::ReExport { specifier, range })
                        }
                        _ => tree.error(range, "expected 'export * from \"<module>\"'"),
                    }
                } else if let Some(kind) = DeclKind::from_keyword(second) {
                    tree.declare(kind, after, true, range);
                } else {
                    tree.error(range, "expected 'fn', 'const', 'type' or '*' after 'export'");
                }
            }
            word => {
                if let Some(kind) = DeclKind::from_keyword(word) {
                    tree.declare(kind, rest, false, range);
                }
            }
        }
    }

    tree
}

impl LineTree {
    fn error(&mut self, range: Range, message: impl Into<String>) {
        self.diagnostics.push(error_diagnostic(range, message));
    }

    fn declare(&mut self, kind: DeclKind, rest: &str, exported: bool, range: Range) {
        let head = rest
            .split(|c| c == '{' || c == '=')
            .next()
            .unwrap_or_default();
        let name: String = head
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        if !is_identifier(&name) {
            self.error(range, format!("expected a name after '{}'", kind.keyword()));
            return;
        }
        let shape = head.split_whitespace().collect::<Vec<_>>().join(" ");
        self.items.push(Item::Decl(Declaration {
            kind,
            name,
            shape,
            exported,
            range,
        }));
    }
}

fn parse_use(rest: &str, line: u32, offset: u32) -> Result<(Vec<(String, Range)>, String), String> {
    let Some(idx) = rest.find(" from ") else {
        return Err("expected 'use <names> from \"<module>\"'".to_string());
    };
    let specifier = quoted(&rest[idx + " from ".len()..])
        .ok_or_else(|| "expected a quoted module specifier after 'from'".to_string())?;

    let mut names = Vec::new();
    let mut col = offset;
    for part in rest[..idx].split(',') {
        let lead = utf16_len(part) - utf16_len(part.trim_start());
        let name = part.trim();
        if !is_identifier(name) {
            return Err(format!("'{}' is not a valid name", name));
        }
        let start = col + lead;
        names.push((
            name.to_string(),
            Range::new(
                Position::new(line, start),
                Position::new(line, start + utf16_len(name)),
            ),
        ));
        col += utf16_len(part) + 1;
    }
    Ok((names, specifier))
}

pub(crate) fn error_diagnostic(range: Range, message: impl Into<String>) -> Diagnostic {
    Diagnostic {
        range,
        severity: Some(DiagnosticSeverity::ERROR),
        source: Some(DIAGNOSTIC_SOURCE.to_string()),
        message: message.into(),
        ..Default::default()
    }
}

fn line_range(line: u32, indent: u32, trimmed: &str) -> Range {
    Range::new(
        Position::new(line, indent),
        Position::new(line, indent + utf16_len(trimmed)),
    )
}

/// Width in LSP columns
fn utf16_len(s: &str) -> u32 {
    s.chars().map(char::len_utf16).sum::<usize>() as u32
}

fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(idx) => (&s[..idx], s[idx..].trim_start()),
        None => (s, ""),
    }
}

fn quoted(s: &str) -> Option<String> {
    let s = s.trim();
    let inner = s.strip_prefix('"')?.strip_suffix('"')?;
    if inner.is_empty() || inner.contains('"') {
        return None;
    }
    Some(inner.to_string())
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => chars.all(|c| c.is_alphanumeric() || c == '_'),
        _ => false,
    }
}
