//
// snapshot.rs
//
// Immutable versioned views of file text
//

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ropey::Rope;
use tower_lsp::lsp_types::TextDocumentContentChangeEvent;

use crate::error::ServiceError;

/// Source of snapshot versions. Shared by every service in the process so a
/// `(path, version)` pair can never name two different texts, even when two
/// services share one tree cache.
static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

fn next_version() -> u64 {
    NEXT_VERSION.fetch_add(1, Ordering::Relaxed)
}

/// Immutable view of one file's text at one version.
///
/// A new edit produces a new snapshot; existing snapshots are never
/// mutated, so a query holding an old snapshot always sees consistent text.
#[derive(Debug, Clone)]
pub struct FileSnapshot {
    path: PathBuf,
    text: Arc<str>,
    version: u64,
    missing: bool,
}

impl FileSnapshot {
    pub fn new(path: impl Into<PathBuf>, text: impl Into<Arc<str>>) -> Self {
        Self {
            path: path.into(),
            text: text.into(),
            version: next_version(),
            missing: false,
        }
    }

    /// Marker for a file that could not be read. Behaves as an empty file.
    pub fn missing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            text: Arc::from(""),
            version: next_version(),
            missing: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_missing(&self) -> bool {
        self.missing
    }

    pub fn content_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.text.hash(&mut hasher);
        hasher.finish()
    }

    /// True when `text` is exactly this snapshot's content.
    pub fn has_text(&self, text: &str) -> bool {
        !self.missing && &*self.text == text
    }

    /// Apply editor changes in order, producing a new snapshot.
    pub fn with_changes(
        &self,
        changes: Vec<TextDocumentContentChangeEvent>,
    ) -> Result<FileSnapshot, ServiceError> {
        let mut contents = Rope::from_str(&self.text);
        for change in changes {
            apply_change_to_rope(&mut contents, change)
                .ok_or_else(|| ServiceError::InvalidRange(self.path.clone()))?;
        }
        Ok(FileSnapshot::new(self.path.clone(), contents.to_string()))
    }
}

/// Apply a single change to a Rope. Returns `None` when the range does not
/// lie inside the document.
fn apply_change_to_rope(contents: &mut Rope, change: TextDocumentContentChangeEvent) -> Option<()> {
    let Some(range) = change.range else {
        // Full document sync
        *contents = Rope::from_str(&change.text);
        return Some(());
    };

    let start_idx = position_to_char(contents, range.start.line, range.start.character)?;
    let end_idx = position_to_char(contents, range.end.line, range.end.character)?;
    if end_idx < start_idx {
        return None;
    }

    contents.remove(start_idx..end_idx);
    contents.insert(start_idx, &change.text);
    Some(())
}

fn position_to_char(contents: &Rope, line: u32, utf16_character: u32) -> Option<usize> {
    let line = line as usize;
    if line > contents.len_lines() {
        return None;
    }
    if line == contents.len_lines() {
        // Position just past the last line is the document end.
        return Some(contents.len_chars());
    }
    let line_text = contents.line(line).to_string();
    let char_offset = utf16_offset_to_char_offset(&line_text, utf16_character as usize);
    Some(contents.line_to_char(line) + char_offset)
}

fn utf16_offset_to_char_offset(line_text: &str, utf16_offset: usize) -> usize {
    let mut utf16_count = 0;
    let mut char_count = 0;

    for ch in line_text.chars() {
        if utf16_count >= utf16_offset || ch == '\n' || ch == '\r' {
            return char_count;
        }
        utf16_count += ch.len_utf16();
        char_count += 1;
    }
    char_count
}
