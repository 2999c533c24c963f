//
// lang/project_file.rs
//
// JSON project configuration files
//

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::Deserialize;

use crate::config::CompilerOptions;
use crate::error::ConfigError;
use crate::host::{ConfigResolver, FileSystem, ResolvedConfig};
use crate::paths::normalize_path;

/// On-disk shape of a configuration file
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    extends: Option<String>,
    compiler_options: Option<CompilerOptions>,
    files: Option<Vec<String>>,
    include: Option<Vec<String>>,
    exclude: Option<Vec<String>>,
    auto_import_roots: Option<Vec<String>>,
    #[serde(flatten)]
    unknown: BTreeMap<String, serde_json::Value>,
}

/// File-list settings together with the directory they are relative to
#[derive(Debug, Clone)]
struct Scoped<T> {
    base: PathBuf,
    value: T,
}

#[derive(Debug, Default)]
struct Merged {
    options: CompilerOptions,
    files: Option<Scoped<Vec<String>>>,
    include: Option<Scoped<Vec<String>>>,
    exclude: Option<Scoped<Vec<String>>>,
    auto_import_roots: Vec<PathBuf>,
    errors: Vec<String>,
}

/// [`ConfigResolver`] for `corral.json` style files.
///
/// `include`/`exclude` are globs relative to the file that declares them.
/// Without `files` or `include`, every source file below the configuration
/// directory is a root.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonConfigResolver;

fn has_extension(path: &Path, source_extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| source_extensions.iter().any(|s| s == e))
}

impl JsonConfigResolver {
    fn load(
        &self,
        path: &Path,
        fs: &dyn FileSystem,
        chain: &mut HashSet<PathBuf>,
    ) -> Result<Merged, ConfigError> {
        if !chain.insert(path.to_path_buf()) {
            return Err(ConfigError::ExtendsCycle(path.to_path_buf()));
        }
        let text = fs.read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: ConfigFile = serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("/")).to_path_buf();

        let mut merged = match &file.extends {
            Some(parent) => {
                let parent_path = normalize_path(&base.join(parent));
                self.load(&parent_path, fs, chain)?
            }
            None => Merged::default(),
        };

        for key in file.unknown.keys() {
            merged
                .errors
                .push(format!("{}: unknown configuration key '{}'", path.display(), key));
        }
        if let Some(options) = &file.compiler_options {
            merged.options = merged.options.merged_with(options);
        }
        if let Some(files) = file.files {
            merged.files = Some(Scoped {
                base: base.clone(),
                value: files,
            });
        }
        if let Some(include) = file.include {
            merged.include = Some(Scoped {
                base: base.clone(),
                value: include,
            });
        }
        if let Some(exclude) = file.exclude {
            merged.exclude = Some(Scoped {
                base: base.clone(),
                value: exclude,
            });
        }
        if let Some(roots) = file.auto_import_roots {
            merged.auto_import_roots = roots
                .iter()
                .map(|r| normalize_path(&base.join(r)))
                .collect();
        }
        Ok(merged)
    }
}

fn build_globs(patterns: &[String], errors: &mut Vec<String>) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pat in patterns {
        let trimmed = pat.trim().trim_start_matches("./");
        if trimmed.is_empty() {
            continue;
        }
        let mut glob = GlobBuilder::new(trimmed);
        glob.literal_separator(true);
        if cfg!(windows) {
            glob.case_insensitive(true);
        }
        match glob.build() {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => errors.push(format!("invalid glob '{}': {}", trimmed, e)),
        }
    }
    builder.build().unwrap_or_else(|e| {
        errors.push(format!("invalid glob set: {}", e));
        GlobSet::empty()
    })
}

fn matches_scoped(set: &GlobSet, base: &Path, path: &Path) -> bool {
    path.strip_prefix(base)
        .map(|rel| set.is_match(rel))
        .unwrap_or(false)
}

impl ConfigResolver for JsonConfigResolver {
    fn resolve(
        &self,
        config_path: &Path,
        source_extensions: &[String],
        fs: &dyn FileSystem,
    ) -> Result<ResolvedConfig, ConfigError> {
        let mut chain = HashSet::new();
        let merged = self.load(config_path, fs, &mut chain)?;
        let config_dir = config_path
            .parent()
            .unwrap_or_else(|| Path::new("/"))
            .to_path_buf();
        let mut errors = merged.errors;
        let mut roots = BTreeSet::new();

        if let Some(files) = &merged.files {
            for f in &files.value {
                let path = normalize_path(&files.base.join(f));
                if fs.exists(&path) {
                    roots.insert(path);
                } else {
                    errors.push(format!("file '{}' not found", path.display()));
                }
            }
        }

        let include = match (&merged.include, &merged.files) {
            (Some(include), _) => Some(include.clone()),
            (None, None) => Some(Scoped {
                base: config_dir.clone(),
                value: vec!["**/*".to_string()],
            }),
            (None, Some(_)) => None,
        };
        if let Some(include) = include {
            let include_set = build_globs(&include.value, &mut errors);
            let exclude = merged
                .exclude
                .as_ref()
                .map(|e| (build_globs(&e.value, &mut errors), e.base.clone()));
            for path in fs.walk_files(&include.base) {
                if !has_extension(&path, source_extensions) || !matches_scoped(&include_set, &include.base, &path) {
                    continue;
                }
                if let Some((set, base)) = &exclude {
                    if matches_scoped(set, base, &path) {
                        continue;
                    }
                }
                roots.insert(path);
            }
        }

        Ok(ResolvedConfig {
            root_files: roots.into_iter().collect(),
            options: merged.options,
            errors,
            auto_import_roots: merged.auto_import_roots,
            watched_directories: vec![config_dir],
        })
    }
}
