//
// config.rs
//
// Service configuration and compiler options
//

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Language level a file is parsed at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Target {
    #[default]
    Modern,
    /// Rejects `export * from` re-exports
    Legacy,
}

/// The subset of compiler options that influences parsing.
///
/// Two projects whose options map to equal settings share parsed trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ParseSettings {
    pub target: Target,
}

/// Tree cache bucket discriminator derived from [`ParseSettings`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SettingsKey(pub u64);

impl ParseSettings {
    pub fn key(&self) -> SettingsKey {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        SettingsKey(hasher.finish())
    }
}

/// Options read from a configuration file's `compilerOptions` section.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompilerOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default)]
    pub strict: bool,
    /// Keys this engine does not understand
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl CompilerOptions {
    pub fn parse_settings(&self) -> ParseSettings {
        let target = match self.target.as_deref() {
            Some("legacy") => Target::Legacy,
            _ => Target::Modern,
        };
        ParseSettings { target }
    }

    /// Non-fatal problems with these options, one message each.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if let Some(target) = self.target.as_deref() {
            if target != "modern" && target != "legacy" {
                problems.push(format!("unknown target '{}', using 'modern'", target));
            }
        }
        for key in self.extra.keys() {
            problems.push(format!("unknown compiler option '{}'", key));
        }
        problems
    }

    /// Overlay `other` on top of `self` (used for `extends` chains).
    pub fn merged_with(&self, other: &CompilerOptions) -> CompilerOptions {
        let mut merged = self.clone();
        if other.target.is_some() {
            merged.target = other.target.clone();
        }
        merged.strict = merged.strict || other.strict;
        for (k, v) in &other.extra {
            merged.extra.insert(k.clone(), v.clone());
        }
        merged
    }
}

/// Project service configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    /// Debounce window for project graph updates
    pub graph_update_delay: Duration,
    /// Debounce window for file watch callbacks
    pub watch_event_delay: Duration,
    /// Delay before each file of an errors-check batch
    pub diagnostics_delay: Duration,
    /// Serve every loose file from one inferred project per project root
    pub single_inferred_project: bool,
    /// File names that mark a configured project
    pub config_file_names: Vec<String>,
    /// Extensions of source files, without the dot
    pub source_extensions: Vec<String>,
    /// Capacity of the per-directory configuration lookup cache
    pub config_lookup_cache_capacity: usize,
    /// Compiler options for inferred projects
    pub inferred_options: CompilerOptions,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            graph_update_delay: Duration::from_millis(250),
            watch_event_delay: Duration::from_millis(250),
            diagnostics_delay: Duration::from_millis(200),
            single_inferred_project: false,
            config_file_names: vec!["corral.json".to_string()],
            source_extensions: vec!["lm".to_string()],
            config_lookup_cache_capacity: 512,
            inferred_options: CompilerOptions::default(),
        }
    }
}

impl ServiceConfig {
    /// Parse the `corral` section of client settings.
    ///
    /// Returns `None` when the section is absent. Unrecognised or mistyped
    /// fields keep their defaults.
    pub fn from_json(settings: &serde_json::Value) -> Option<ServiceConfig> {
        let section = settings.get("corral")?;
        let mut config = ServiceConfig::default();

        if let Some(v) = section.get("graphUpdateDelayMs").and_then(|v| v.as_u64()) {
            config.graph_update_delay = Duration::from_millis(v);
        }
        if let Some(v) = section.get("watchEventDelayMs").and_then(|v| v.as_u64()) {
            config.watch_event_delay = Duration::from_millis(v);
        }
        if let Some(v) = section.get("diagnosticsDelayMs").and_then(|v| v.as_u64()) {
            config.diagnostics_delay = Duration::from_millis(v);
        }
        if let Some(v) = section
            .get("singleInferredProject")
            .and_then(|v| v.as_bool())
        {
            config.single_inferred_project = v;
        }
        if let Some(names) = string_list(section.get("configFileNames")) {
            if !names.is_empty() {
                config.config_file_names = names;
            }
        }
        if let Some(exts) = string_list(section.get("sourceExtensions")) {
            if !exts.is_empty() {
                config.source_extensions = exts
                    .into_iter()
                    .map(|e| e.trim_start_matches('.').to_string())
                    .collect();
            }
        }
        if let Some(v) = section
            .get("configLookupCacheCapacity")
            .and_then(|v| v.as_u64())
        {
            config.config_lookup_cache_capacity = v as usize;
        }
        if let Some(v) = section.get("inferredOptions") {
            match serde_json::from_value::<CompilerOptions>(v.clone()) {
                Ok(options) => config.inferred_options = options,
                Err(e) => log::warn!("Ignoring invalid corral.inferredOptions: {}", e),
            }
        }

        Some(config)
    }

    /// Log the effective configuration, one field per line
    pub fn log(&self) {
        log::info!("Service configuration:");
        log::info!("  graph_update_delay: {:?}", self.graph_update_delay);
        log::info!("  watch_event_delay: {:?}", self.watch_event_delay);
        log::info!("  diagnostics_delay: {:?}", self.diagnostics_delay);
        log::info!("  single_inferred_project: {}", self.single_inferred_project);
        log::info!("  config_file_names: {:?}", self.config_file_names);
        log::info!("  source_extensions: {:?}", self.source_extensions);
        log::info!(
            "  config_lookup_cache_capacity: {}",
            self.config_lookup_cache_capacity
        );
        log::info!("  inferred_options: {:?}", self.inferred_options);
    }

    pub fn is_source_file(&self, path: &std::path::Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.source_extensions.iter().any(|s| s == e))
            .unwrap_or(false)
    }

    pub fn is_config_file(&self, path: &std::path::Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .map(|n| self.config_file_names.iter().any(|c| c == n))
            .unwrap_or(false)
    }
}

fn string_list(value: Option<&serde_json::Value>) -> Option<Vec<String>> {
    let arr = value?.as_array()?;
    Some(
        arr.iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
    )
}
