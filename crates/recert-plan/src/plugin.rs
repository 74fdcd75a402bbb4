//! Statically linked plugin registry.
//!
//! Plugins are selected by `module` name from `[plugins.<name>]` tables and
//! initialized with their string-keyed `config`. Two modules ship built in:
//!
//! - `csv_lookup` ([`PluginKind::Assignment`]): extracts a key from file
//!   contents with a regex and maps it to an owner through a CSV table.
//! - `per_directory` ([`PluginKind::Strategy`]): one unit per leading directory.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use recert_core::{
    AssignmentOutcome, PluginConfig, PluginKind, RecertError, ReviewUnit, Verdict,
};
use regex::Regex;

/// Resolves assignees for the files of one review unit.
pub trait AssignmentPlugin: Send + Sync {
    /// Configure the plugin. Called once before any `resolve`.
    ///
    /// # Errors
    ///
    /// Returns [`RecertError::Plugin`] for missing or invalid settings.
    fn init(&mut self, config: &BTreeMap<String, String>) -> Result<(), RecertError>;

    /// Assignment for the given verdicts. An empty outcome means "no opinion".
    ///
    /// # Errors
    ///
    /// Returns [`RecertError::Plugin`] when the lookup itself fails.
    fn resolve(&self, verdicts: &[Verdict]) -> Result<AssignmentOutcome, RecertError>;
}

/// Groups stale verdicts into review units.
pub trait StrategyPlugin: Send + Sync {
    /// Configure the plugin. Called once before any `group`.
    ///
    /// # Errors
    ///
    /// Returns [`RecertError::Plugin`] for missing or invalid settings.
    fn init(&mut self, config: &BTreeMap<String, String>) -> Result<(), RecertError>;

    /// Partition `verdicts` (all stale) into units.
    ///
    /// # Errors
    ///
    /// Returns [`RecertError::Plugin`] if grouping fails.
    fn group(&self, verdicts: &[Verdict]) -> Result<Vec<ReviewUnit>, RecertError>;
}

/// Initialized plugins keyed by their configured name.
///
/// # Examples
///
/// ```
/// use std::collections::BTreeMap;
/// use recert_core::{PluginConfig, PluginKind};
/// use recert_plan::PluginRegistry;
///
/// let mut plugins = BTreeMap::new();
/// plugins.insert(
///     "dirs".to_string(),
///     PluginConfig {
///         enabled: true,
///         kind: PluginKind::Strategy,
///         module: "per_directory".into(),
///         config: BTreeMap::new(),
///     },
/// );
///
/// let registry = PluginRegistry::from_config(&plugins).unwrap();
/// assert!(registry.strategy("dirs").is_ok());
/// assert!(registry.assignment("dirs").is_err());
/// ```
#[derive(Default, Clone)]
pub struct PluginRegistry {
    assignment: HashMap<String, Arc<dyn AssignmentPlugin>>,
    strategy: HashMap<String, Arc<dyn StrategyPlugin>>,
}

impl PluginRegistry {
    /// Instantiate and initialize every enabled plugin.
    ///
    /// # Errors
    ///
    /// Returns [`RecertError::Config`] for an unknown module, a module used
    /// with the wrong kind, or a failing `init`.
    pub fn from_config(plugins: &BTreeMap<String, PluginConfig>) -> Result<Self, RecertError> {
        let mut registry = Self::default();
        for (name, cfg) in plugins {
            if !cfg.enabled {
                tracing::debug!(plugin = %name, "plugin disabled, skipping");
                continue;
            }
            let init_err =
                |e: RecertError| RecertError::Config(format!("plugin '{name}' failed to initialize: {e}"));
            match (cfg.kind, cfg.module.as_str()) {
                (PluginKind::Assignment, "csv_lookup") => {
                    let mut plugin = CsvLookup::default();
                    plugin.init(&cfg.config).map_err(init_err)?;
                    registry.register_assignment(name, Arc::new(plugin));
                }
                (PluginKind::Strategy, "per_directory") => {
                    let mut plugin = PerDirectory::default();
                    plugin.init(&cfg.config).map_err(init_err)?;
                    registry.register_strategy(name, Arc::new(plugin));
                }
                (kind, "csv_lookup" | "per_directory") => {
                    return Err(RecertError::Config(format!(
                        "plugin '{name}': module '{}' cannot be used as a {kind} plugin",
                        cfg.module
                    )));
                }
                (_, other) => {
                    return Err(RecertError::Config(format!(
                        "plugin '{name}': unknown module '{other}'"
                    )));
                }
            }
            tracing::info!(plugin = %name, module = %cfg.module, kind = %cfg.kind, "loaded plugin");
        }
        Ok(registry)
    }

    /// Register an already initialized assignment plugin.
    pub fn register_assignment(&mut self, name: &str, plugin: Arc<dyn AssignmentPlugin>) {
        self.assignment.insert(name.to_string(), plugin);
    }

    /// Register an already initialized strategy plugin.
    pub fn register_strategy(&mut self, name: &str, plugin: Arc<dyn StrategyPlugin>) {
        self.strategy.insert(name.to_string(), plugin);
    }

    /// Assignment plugin by configured name.
    ///
    /// # Errors
    ///
    /// Returns [`RecertError::Plugin`] if no such plugin is loaded.
    pub fn assignment(&self, name: &str) -> Result<Arc<dyn AssignmentPlugin>, RecertError> {
        self.assignment
            .get(name)
            .cloned()
            .ok_or_else(|| RecertError::Plugin(format!("assignment plugin '{name}' is not loaded")))
    }

    /// Strategy plugin by configured name.
    ///
    /// # Errors
    ///
    /// Returns [`RecertError::Plugin`] if no such plugin is loaded.
    pub fn strategy(&self, name: &str) -> Result<Arc<dyn StrategyPlugin>, RecertError> {
        self.strategy
            .get(name)
            .cloned()
            .ok_or_else(|| RecertError::Plugin(format!("strategy plugin '{name}' is not loaded")))
    }
}

fn required<'a>(config: &'a BTreeMap<String, String>, key: &str) -> Result<&'a str, RecertError> {
    config
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| RecertError::Plugin(format!("{key} is required")))
}

fn column(config: &BTreeMap<String, String>, key: &str) -> Result<usize, RecertError> {
    required(config, key)?
        .trim()
        .parse()
        .map_err(|e| RecertError::Plugin(format!("invalid {key}: {e}")))
}

/// Owner lookup through a CSV table keyed by a value found in the files.
#[derive(Debug, Default)]
pub struct CsvLookup {
    key_regex: Option<Regex>,
    repo_root: PathBuf,
    owners: HashMap<String, String>,
}

impl CsvLookup {
    fn extract_key(&self, verdicts: &[Verdict]) -> Option<String> {
        let regex = self.key_regex.as_ref()?;
        verdicts.iter().find_map(|v| {
            let path = self.repo_root.join(&v.file.path);
            match std::fs::read_to_string(&path) {
                Ok(content) => regex
                    .captures(&content)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string()),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to read file");
                    None
                }
            }
        })
    }
}

impl AssignmentPlugin for CsvLookup {
    fn init(&mut self, config: &BTreeMap<String, String>) -> Result<(), RecertError> {
        let csv_file = required(config, "csv_file")?;
        let key_regex = Regex::new(required(config, "key_regex")?)
            .map_err(|e| RecertError::Plugin(format!("invalid key_regex pattern: {e}")))?;
        let key_column = column(config, "key_column")?;
        let value_column = column(config, "value_column")?;

        let content = std::fs::read_to_string(csv_file)
            .map_err(|e| RecertError::Plugin(format!("failed to load CSV file {csv_file}: {e}")))?;
        let records: Vec<Vec<String>> = content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(split_csv_line)
            .collect();

        let Some(header) = records.first() else {
            return Err(RecertError::Plugin("CSV file is empty".into()));
        };
        for (name, col) in [("key_column", key_column), ("value_column", value_column)] {
            if col >= header.len() {
                return Err(RecertError::Plugin(format!(
                    "{name} {col} is out of range (header has {} columns)",
                    header.len()
                )));
            }
        }

        // The first row is a header unless it is the only row.
        let start = usize::from(records.len() > 1);
        let mut owners = HashMap::new();
        for record in &records[start..] {
            let (Some(key), Some(value)) = (record.get(key_column), record.get(value_column)) else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            if !key.is_empty() && !value.is_empty() {
                owners.insert(key.to_string(), value.to_string());
            }
        }
        if owners.is_empty() {
            return Err(RecertError::Plugin("no valid key-value pairs found in CSV".into()));
        }

        tracing::info!(entries = owners.len(), "loaded CSV owner table");
        self.key_regex = Some(key_regex);
        self.repo_root = PathBuf::from(config.get("repo_root").map_or(".", String::as_str));
        self.owners = owners;
        Ok(())
    }

    fn resolve(&self, verdicts: &[Verdict]) -> Result<AssignmentOutcome, RecertError> {
        let Some(key) = self.extract_key(verdicts) else {
            tracing::warn!("no lookup key found in files");
            return Ok(AssignmentOutcome::default());
        };
        match self.owners.get(&key) {
            Some(owner) => Ok(AssignmentOutcome::to(vec![owner.clone()])),
            None => {
                tracing::warn!(key = %key, "key not found in CSV");
                Ok(AssignmentOutcome::default())
            }
        }
    }
}

/// Split one CSV line, honouring double-quoted fields and `""` escapes.
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, in_quotes) {
            ('"', true) if chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            ('"', true) => in_quotes = false,
            ('"', false) if field.trim().is_empty() => {
                field.clear();
                in_quotes = true;
            }
            (',', false) => fields.push(std::mem::take(&mut field)),
            (c, _) => field.push(c),
        }
    }
    fields.push(field);
    fields
}

/// One unit per leading directory path, `depth` components deep.
#[derive(Debug)]
pub struct PerDirectory {
    depth: usize,
}

impl Default for PerDirectory {
    fn default() -> Self {
        Self { depth: 1 }
    }
}

impl PerDirectory {
    fn key(&self, path: &str) -> String {
        let mut dirs: Vec<&str> = path.split('/').collect();
        dirs.pop();
        dirs.truncate(self.depth);
        if dirs.is_empty() {
            "root".to_string()
        } else {
            dirs.join("/")
        }
    }
}

impl StrategyPlugin for PerDirectory {
    fn init(&mut self, config: &BTreeMap<String, String>) -> Result<(), RecertError> {
        if let Some(depth) = config.get("depth") {
            let depth: usize = depth
                .trim()
                .parse()
                .map_err(|e| RecertError::Plugin(format!("invalid depth: {e}")))?;
            if depth == 0 {
                return Err(RecertError::Plugin("depth must be at least 1".into()));
            }
            self.depth = depth;
        }
        Ok(())
    }

    fn group(&self, verdicts: &[Verdict]) -> Result<Vec<ReviewUnit>, RecertError> {
        let mut groups: BTreeMap<String, Vec<Verdict>> = BTreeMap::new();
        for v in verdicts {
            groups.entry(self.key(&v.file.path)).or_default().push(v.clone());
        }
        Ok(groups
            .into_iter()
            .map(|(dir, verdicts)| ReviewUnit::new(format!("dir-{dir}"), "per_directory", verdicts))
            .collect())
    }
}
