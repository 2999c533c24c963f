//! Deterministic fixture workspace generator for benchmarks and tests.
//!
//! Generates synthetic line-module workspaces: a `corral.json` plus
//! `module_N.lm` files where module `i` uses module `i + 1` along an import
//! chain of configurable depth.
//!
//! All output is deterministic, so benchmarks are reproducible.

use std::fmt::Write;
use std::path::Path;

use tempfile::TempDir;

use crate::host::MemoryFileSystem;

#[derive(Debug, Clone)]
pub struct FixtureConfig {
    pub file_count: usize,
    pub exports_per_file: usize,
    pub import_chain_depth: usize,
    pub body_lines_per_file: usize,
}

impl FixtureConfig {
    /// 10 files, 5 exports each, chain depth 3
    pub fn small() -> Self {
        Self {
            file_count: 10,
            exports_per_file: 5,
            import_chain_depth: 3,
            body_lines_per_file: 5,
        }
    }

    /// 50 files, 10 exports each, chain depth 10
    pub fn medium() -> Self {
        Self {
            file_count: 50,
            exports_per_file: 10,
            import_chain_depth: 10,
            body_lines_per_file: 10,
        }
    }

    /// 200 files, 20 exports each, chain depth 50
    pub fn large() -> Self {
        Self {
            file_count: 200,
            exports_per_file: 20,
            import_chain_depth: 50,
            body_lines_per_file: 20,
        }
    }
}

pub const CONFIG_FILE: &str = "corral.json";

pub fn module_name(index: usize) -> String {
    format!("module_{}.lm", index)
}

/// Text of module `index`
pub fn generate_module(index: usize, config: &FixtureConfig) -> String {
    let mut content = String::new();

    if index < config.import_chain_depth && index + 1 < config.file_count {
        // fmt::Write into a String cannot fail
        let _ = writeln!(
            content,
            "use f_{}_0 from \"./module_{}\"",
            index + 1,
            index + 1
        );
        content.push('\n');
    }

    for export in 0..config.exports_per_file {
        let _ = writeln!(content, "export fn f_{}_{}(x, y) {{", index, export);
        for line in 0..config.body_lines_per_file {
            let _ = writeln!(content, "  let v{} = x + y * {}", line, line + export);
        }
        let _ = writeln!(content, "}}");
    }
    content
}

pub fn create_fixture_workspace(config: &FixtureConfig) -> TempDir {
    let temp_dir = TempDir::new().expect("Failed to create temp directory for fixture workspace");
    write_fixture_workspace(temp_dir.path(), config);
    temp_dir
}

/// Write fixture files into an existing directory
pub fn write_fixture_workspace(dir: &Path, config: &FixtureConfig) {
    std::fs::write(dir.join(CONFIG_FILE), "{}")
        .unwrap_or_else(|e| panic!("Failed to write {}: {}", CONFIG_FILE, e));
    for i in 0..config.file_count {
        let filename = module_name(i);
        std::fs::write(dir.join(&filename), generate_module(i, config))
            .unwrap_or_else(|e| panic!("Failed to write fixture file {}: {}", filename, e));
    }
}

/// Same layout as [`write_fixture_workspace`], in memory
pub fn write_memory_workspace(fs: &MemoryFileSystem, dir: &Path, config: &FixtureConfig) {
    fs.write(dir.join(CONFIG_FILE), "{}");
    for i in 0..config.file_count {
        fs.write(dir.join(module_name(i)), generate_module(i, config));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParseSettings;
    use crate::lang::parse;

    #[test]
    fn test_deterministic_output() {
        let config = FixtureConfig::small();
        let ws1 = create_fixture_workspace(&config);
        let ws2 = create_fixture_workspace(&config);
        for i in 0..config.file_count {
            let a = std::fs::read_to_string(ws1.path().join(module_name(i))).unwrap();
            let b = std::fs::read_to_string(ws2.path().join(module_name(i))).unwrap();
            assert_eq!(a, b);
        }
        assert!(ws1.path().join(CONFIG_FILE).exists());
    }

    #[test]
    fn test_import_chain_structure() {
        let config = FixtureConfig {
            file_count: 4,
            exports_per_file: 1,
            import_chain_depth: 2,
            body_lines_per_file: 0,
        };
        assert!(generate_module(0, &config).contains("from \"./module_1\""));
        assert!(generate_module(1, &config).contains("from \"./module_2\""));
        assert!(!generate_module(2, &config).contains("use "));
        assert!(!generate_module(3, &config).contains("use "));
    }

    #[test]
    fn test_generated_modules_parse_cleanly() {
        let config = FixtureConfig::small();
        for i in 0..config.file_count {
            let tree = parse(&generate_module(i, &config), &ParseSettings::default());
            assert!(tree.diagnostics.is_empty(), "module {}: {:?}", i, tree.diagnostics);
            assert_eq!(tree.exports().count(), config.exports_per_file);
        }
    }
}
