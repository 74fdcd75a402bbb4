use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::RecertError;

/// Top-level configuration loaded from `.recert.toml`.
///
/// Supports layered resolution: CLI flags > env vars > local config > defaults.
///
/// # Examples
///
/// ```
/// use recert_core::RecertConfig;
///
/// let config = RecertConfig::default();
/// assert_eq!(config.global.max_concurrent_prs, 1);
/// assert_eq!(config.global.default_base_branch, "main");
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecertConfig {
    /// Remote repository and hosting backend.
    #[serde(default)]
    pub repository: RepositoryConfig,
    /// Run-wide behavior.
    #[serde(default)]
    pub global: GlobalConfig,
    /// Recertification policies, matched in order.
    #[serde(default)]
    pub policies: Vec<Policy>,
    /// How stale files are grouped into pull requests.
    #[serde(default)]
    pub pr_strategy: PrStrategyConfig,
    /// How assignees and reviewers are chosen.
    #[serde(default)]
    pub assignment: AssignmentConfig,
    /// Statically linked plugins enabled by name.
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginConfig>,
    /// Pull request title and body rendering.
    #[serde(default)]
    pub pr_template: PrTemplateConfig,
    /// Audit trail settings.
    #[serde(default)]
    pub audit: AuditConfig,
}

impl RecertConfig {
    /// Load configuration from a TOML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`RecertError::Io`] if the file cannot be read, or
    /// [`RecertError::Toml`] if the content is not valid TOML.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use recert_core::RecertConfig;
    /// use std::path::Path;
    ///
    /// let config = RecertConfig::from_file(Path::new(".recert.toml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, RecertError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`RecertError::Toml`] if parsing fails.
    ///
    /// # Examples
    ///
    /// ```
    /// use recert_core::RecertConfig;
    ///
    /// let toml = r#"
    /// [[policies]]
    /// name = "terraform"
    /// include = ["**/*.tf"]
    /// interval_days = 90
    /// "#;
    /// let config = RecertConfig::from_toml(toml).unwrap();
    /// assert_eq!(config.policies[0].interval_days, 90);
    /// assert!(config.policies[0].enabled);
    /// ```
    pub fn from_toml(content: &str) -> Result<Self, RecertError> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    ///
    /// Glob syntax is checked later, when the policy set is compiled.
    ///
    /// # Errors
    ///
    /// Returns [`RecertError::Config`] describing the first violation.
    pub fn validate(&self) -> Result<(), RecertError> {
        if self.policies.is_empty() {
            return Err(RecertError::Config("at least one policy is required".into()));
        }

        let mut names = HashSet::new();
        for policy in &self.policies {
            if policy.name.trim().is_empty() {
                return Err(RecertError::Config("policy name must not be empty".into()));
            }
            if !names.insert(policy.name.as_str()) {
                return Err(RecertError::Config(format!(
                    "duplicate policy name '{}'",
                    policy.name
                )));
            }
            if policy.include.is_empty() {
                return Err(RecertError::Config(format!(
                    "policy '{}' has no include globs",
                    policy.name
                )));
            }
            if policy.interval_days < 1 {
                return Err(RecertError::Config(format!(
                    "policy '{}': interval_days must be at least 1",
                    policy.name
                )));
            }
        }

        if self.global.max_concurrent_prs < 1 {
            return Err(RecertError::Config(
                "global.max_concurrent_prs must be at least 1".into(),
            ));
        }
        if self.pr_strategy.max_files_per_pr == Some(0) {
            return Err(RecertError::Config(
                "pr_strategy.max_files_per_pr must be at least 1 when set".into(),
            ));
        }
        if self.pr_strategy.kind == GroupingKind::Plugin {
            self.require_plugin(self.pr_strategy.plugin.as_deref(), "pr_strategy")?;
        }

        if self.assignment.strategy == AssignmentStrategyKind::Plugin {
            self.require_plugin(self.assignment.plugin.as_deref(), "assignment")?;
        }
        for (i, rule) in self.assignment.rules.iter().enumerate() {
            match rule.strategy {
                AssignmentStrategyKind::Composite => {
                    return Err(RecertError::Config(format!(
                        "assignment.rules[{i}]: composite rules cannot nest"
                    )));
                }
                AssignmentStrategyKind::Plugin => {
                    self.require_plugin(rule.plugin.as_deref(), &format!("assignment.rules[{i}]"))?;
                }
                _ => {}
            }
        }

        if self.audit.enabled && !matches!(self.audit.storage.as_str(), "file" | "log") {
            return Err(RecertError::Config(format!(
                "unsupported audit storage '{}' (expected \"file\" or \"log\")",
                self.audit.storage
            )));
        }

        Ok(())
    }

    /// Check that every enabled policy can produce a commit.
    ///
    /// Pull requests carry the decorator rewrite as their only change, so a
    /// run that talks to a backend needs one on each enabled policy. Checks
    /// and dry runs do not.
    ///
    /// # Errors
    ///
    /// Returns [`RecertError::Config`] naming the first undecorated policy.
    pub fn require_decorators(&self) -> Result<(), RecertError> {
        let undecorated = self.policies.iter().find(|p| {
            p.enabled && !p.decorator.as_deref().is_some_and(|d| !d.trim().is_empty())
        });
        match undecorated {
            Some(policy) => Err(RecertError::Config(format!(
                "policy '{}' has no decorator; pull requests need one to commit",
                policy.name
            ))),
            None => Ok(()),
        }
    }

    fn require_plugin(&self, name: Option<&str>, section: &str) -> Result<(), RecertError> {
        let Some(name) = name else {
            return Err(RecertError::Config(format!(
                "{section}: plugin strategy requires a plugin name"
            )));
        };
        match self.plugins.get(name) {
            Some(p) if p.enabled => Ok(()),
            Some(_) => Err(RecertError::Config(format!(
                "{section}: plugin '{name}' is disabled"
            ))),
            None => Err(RecertError::Config(format!(
                "{section}: plugin '{name}' is not configured"
            ))),
        }
    }
}

/// Supported Git hosting backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// GitHub (git data API: blobs, trees, commits, refs).
    #[default]
    Github,
    /// Azure DevOps Repos (push API).
    Azure,
    /// GitLab (commit actions API).
    Gitlab,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Github => write!(f, "github"),
            ProviderKind::Azure => write!(f, "azure"),
            ProviderKind::Gitlab => write!(f, "gitlab"),
        }
    }
}

/// Remote repository settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Web URL of the repository.
    #[serde(default)]
    pub url: String,
    /// Hosting backend.
    #[serde(default)]
    pub provider: ProviderKind,
    /// Environment variable holding the access token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Override for the API base URL (GitHub Enterprise, self-hosted GitLab).
    pub api_base: Option<String>,
}

fn default_token_env() -> String {
    "RECERT_TOKEN".into()
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            provider: ProviderKind::default(),
            token_env: default_token_env(),
            api_base: None,
        }
    }
}

/// Run-wide behavior.
///
/// # Examples
///
/// ```
/// use recert_core::GlobalConfig;
///
/// let global = GlobalConfig::default();
/// assert!(!global.dry_run);
/// assert_eq!(global.commit_message, "Trigger recertification");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Evaluate, group, and render without touching the backend.
    #[serde(default)]
    pub dry_run: bool,
    /// Worker pool size for review units (default: 1, sequential).
    #[serde(default = "default_max_concurrent_prs")]
    pub max_concurrent_prs: usize,
    /// Target branch for pull requests (default: `main`).
    #[serde(default = "default_base_branch")]
    pub default_base_branch: String,
    /// Commit message used for recertification commits.
    #[serde(default = "default_commit_message")]
    pub commit_message: String,
}

fn default_max_concurrent_prs() -> usize {
    1
}

fn default_base_branch() -> String {
    "main".into()
}

fn default_commit_message() -> String {
    "Trigger recertification".into()
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            max_concurrent_prs: default_max_concurrent_prs(),
            default_base_branch: default_base_branch(),
            commit_message: default_commit_message(),
        }
    }
}

/// A named recertification policy.
///
/// # Examples
///
/// ```
/// use recert_core::Policy;
///
/// let policy = Policy::new("terraform", vec!["**/*.tf".into()], 90);
/// assert!(policy.enabled);
/// assert!(policy.exclude.is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Unique policy name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Include globs; a file must match at least one.
    pub include: Vec<String>,
    /// Exclude globs; a file matching any is skipped.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Days between recertifications.
    pub interval_days: u32,
    /// Disabled policies never match.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Marker line written at the top of recertified files; `{timestamp}` is substituted.
    pub decorator: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl Policy {
    /// An enabled policy with no excludes and no decorator.
    pub fn new(name: impl Into<String>, include: Vec<String>, interval_days: u32) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            include,
            exclude: Vec::new(),
            interval_days,
            enabled: true,
            decorator: None,
        }
    }
}

/// Grouping strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingKind {
    /// One pull request per file.
    PerFile,
    /// One pull request per matched policy.
    #[default]
    PerPattern,
    /// One pull request per last committer.
    PerCommitter,
    /// One pull request for everything.
    SinglePr,
    /// Delegate to a strategy plugin.
    Plugin,
}

impl GroupingKind {
    /// Configuration name of the strategy.
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupingKind::PerFile => "per_file",
            GroupingKind::PerPattern => "per_pattern",
            GroupingKind::PerCommitter => "per_committer",
            GroupingKind::SinglePr => "single_pr",
            GroupingKind::Plugin => "plugin",
        }
    }
}

/// Grouping settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrStrategyConfig {
    /// Strategy name.
    #[serde(default, rename = "type")]
    pub kind: GroupingKind,
    /// Split units larger than this into numbered parts.
    pub max_files_per_pr: Option<usize>,
    /// Plugin name when `type = "plugin"`.
    pub plugin: Option<String>,
}

/// Assignment strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategyKind {
    /// Always the fallback assignees.
    #[default]
    Static,
    /// The author of the most recently modified file.
    LastCommitter,
    /// Delegate to an assignment plugin.
    Plugin,
    /// First matching glob rule decides.
    Composite,
}

impl AssignmentStrategyKind {
    /// Configuration name of the strategy.
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStrategyKind::Static => "static",
            AssignmentStrategyKind::LastCommitter => "last_committer",
            AssignmentStrategyKind::Plugin => "plugin",
            AssignmentStrategyKind::Composite => "composite",
        }
    }
}

/// Assignment settings.
///
/// # Examples
///
/// ```
/// use recert_core::{AssignmentConfig, AssignmentStrategyKind};
///
/// let config = AssignmentConfig::default();
/// assert_eq!(config.strategy, AssignmentStrategyKind::Static);
/// assert!(config.fallback_assignees.is_empty());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssignmentConfig {
    /// Top-level strategy.
    #[serde(default)]
    pub strategy: AssignmentStrategyKind,
    /// Plugin name when `strategy = "plugin"`.
    pub plugin: Option<String>,
    /// Ordered rules for the composite strategy.
    #[serde(default)]
    pub rules: Vec<AssignmentRule>,
    /// Assignees used whenever a strategy yields nothing or fails.
    #[serde(default)]
    pub fallback_assignees: Vec<String>,
    /// Reviewers requested alongside the fallback assignees.
    #[serde(default)]
    pub fallback_reviewers: Vec<String>,
}

/// A composite assignment rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentRule {
    /// Glob tested against every file path in the unit.
    pub pattern: String,
    /// Strategy applied when the rule matches.
    pub strategy: AssignmentStrategyKind,
    /// Plugin name for `strategy = "plugin"`.
    pub plugin: Option<String>,
    /// Rule-specific fallback assignees.
    #[serde(default)]
    pub fallback_assignees: Vec<String>,
}

/// Plugin capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    /// Resolves assignees for a set of files.
    Assignment,
    /// Groups verdicts into review units.
    Strategy,
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginKind::Assignment => write!(f, "assignment"),
            PluginKind::Strategy => write!(f, "strategy"),
        }
    }
}

/// Configuration of one named plugin instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Disabled plugins are not instantiated.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Capability the plugin provides.
    pub kind: PluginKind,
    /// Built-in module implementing the plugin (e.g. `csv_lookup`).
    pub module: String,
    /// Module-specific settings passed to `init`.
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

/// Pull request rendering settings.
///
/// # Examples
///
/// ```
/// use recert_core::PrTemplateConfig;
///
/// let template = PrTemplateConfig::default();
/// assert!(template.title.contains("{pattern_name}"));
/// assert!(template.include_file_list);
/// assert_eq!(template.labels, vec!["recertification"]);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrTemplateConfig {
    /// Title template; supports `{pattern_name}`, `{file_count}`, `{unit_id}`, `{priority}`.
    #[serde(default = "default_title")]
    pub title: String,
    /// Render a table of files in the body.
    #[serde(default = "default_enabled")]
    pub include_file_list: bool,
    /// Render a review checklist in the body.
    #[serde(default)]
    pub include_checklist: bool,
    /// Extra instructions appended to the body.
    #[serde(default)]
    pub custom_instructions: String,
    /// Labels attached to every pull request.
    #[serde(default = "default_labels")]
    pub labels: Vec<String>,
}

fn default_title() -> String {
    "Recertify {pattern_name}: {file_count} file(s)".into()
}

fn default_labels() -> Vec<String> {
    vec!["recertification".into()]
}

impl Default for PrTemplateConfig {
    fn default() -> Self {
        Self {
            title: default_title(),
            include_file_list: true,
            include_checklist: false,
            custom_instructions: String::new(),
            labels: default_labels(),
        }
    }
}

/// Audit trail settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Record audit events.
    #[serde(default)]
    pub enabled: bool,
    /// Storage backend: `file` appends JSON lines under `directory`, `log`
    /// emits events through `tracing`.
    #[serde(default = "default_audit_storage")]
    pub storage: String,
    /// Directory for `audit-<date>.log` files.
    #[serde(default = "default_audit_directory")]
    pub directory: String,
}

fn default_audit_storage() -> String {
    "file".into()
}

fn default_audit_directory() -> String {
    "./audit".into()
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            storage: default_audit_storage(),
            directory: default_audit_directory(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r##"
[repository]
url = "https://github.com/acme/infra"
provider = "github"
token_env = "GITHUB_TOKEN"

[global]
dry_run = true
max_concurrent_prs = 4
default_base_branch = "develop"

[[policies]]
name = "terraform-prod"
include = ["terraform/prod/**/*.tf"]
exclude = ["**/*.generated.tf"]
interval_days = 90
decorator = "# Last Recertification: {timestamp}"

[[policies]]
name = "helm"
include = ["charts/**/*.yaml"]
interval_days = 180
enabled = false

[pr_strategy]
type = "per_committer"
max_files_per_pr = 10

[assignment]
strategy = "composite"
fallback_assignees = ["platform-team"]

[[assignment.rules]]
pattern = "terraform/prod/**"
strategy = "plugin"
plugin = "owners"

[plugins.owners]
kind = "assignment"
module = "csv_lookup"
config = { csv_file = "owners.csv", key_regex = "app = \"(.+)\"", key_column = "0", value_column = "1" }

[pr_template]
title = "Recert {pattern_name}"
include_checklist = true
labels = ["recert", "compliance"]
"##;

    #[test]
    fn default_config_has_expected_values() {
        let config = RecertConfig::default();
        assert_eq!(config.repository.provider, ProviderKind::Github);
        assert_eq!(config.repository.token_env, "RECERT_TOKEN");
        assert_eq!(config.global.max_concurrent_prs, 1);
        assert_eq!(config.pr_strategy.kind, GroupingKind::PerPattern);
        assert_eq!(config.assignment.strategy, AssignmentStrategyKind::Static);
        assert!(!config.audit.enabled);
        assert!(config.policies.is_empty());
    }

    #[test]
    fn parse_full_toml() {
        let config = RecertConfig::from_toml(FULL).unwrap();
        assert_eq!(config.repository.token_env, "GITHUB_TOKEN");
        assert!(config.global.dry_run);
        assert_eq!(config.global.max_concurrent_prs, 4);
        assert_eq!(config.policies.len(), 2);
        assert!(!config.policies[1].enabled);
        assert_eq!(
            config.policies[0].decorator.as_deref(),
            Some("# Last Recertification: {timestamp}")
        );
        assert_eq!(config.pr_strategy.kind, GroupingKind::PerCommitter);
        assert_eq!(config.pr_strategy.max_files_per_pr, Some(10));
        assert_eq!(config.assignment.rules.len(), 1);
        assert_eq!(config.plugins["owners"].kind, PluginKind::Assignment);
        assert_eq!(config.plugins["owners"].config["key_column"], "0");
        assert!(config.pr_template.include_checklist);
        config.validate().unwrap();
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let toml = r#"
[repository]
provider = "bitbucket"
"#;
        let err = RecertConfig::from_toml(toml).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        let toml = r#"
[pr_strategy]
type = "per_moon_phase"
"#;
        assert!(RecertConfig::from_toml(toml).is_err());
    }

    #[test]
    fn validate_rejects_duplicate_policy_names() {
        let mut config = RecertConfig::default();
        config.policies = vec![
            Policy::new("tf", vec!["*.tf".into()], 30),
            Policy::new("tf", vec!["**/*.tf".into()], 60),
        ];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate policy name"));
    }

    #[test]
    fn validate_rejects_zero_interval() {
        let mut config = RecertConfig::default();
        config.policies = vec![Policy::new("tf", vec!["*.tf".into()], 0)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_requires_configured_plugin() {
        let mut config = RecertConfig::default();
        config.policies = vec![Policy::new("tf", vec!["*.tf".into()], 30)];
        config.assignment.strategy = AssignmentStrategyKind::Plugin;
        config.assignment.plugin = Some("missing".into());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("not configured"));
    }

    #[test]
    fn validate_rejects_zero_max_files() {
        let mut config = RecertConfig::default();
        config.policies = vec![Policy::new("tf", vec!["*.tf".into()], 30)];
        config.pr_strategy.max_files_per_pr = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn require_decorators_names_the_undecorated_policy() {
        let mut config = RecertConfig::from_toml(FULL).unwrap();
        config.require_decorators().unwrap();

        config.policies[0].decorator = None;
        let err = config.require_decorators().unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("terraform-prod"));
        // validate() still accepts it: checks do not need a decorator.
        config.validate().unwrap();
    }

    #[test]
    fn require_decorators_skips_disabled_policies() {
        let mut config = RecertConfig::default();
        let mut disabled = Policy::new("old", vec!["*.tf".into()], 30);
        disabled.enabled = false;
        let mut live = Policy::new("tf", vec!["*.tf".into()], 30);
        live.decorator = Some("# ok {timestamp}".into());
        config.policies = vec![disabled, live];
        config.require_decorators().unwrap();
    }

    #[test]
    fn validate_accepts_log_audit_storage() {
        let mut config = RecertConfig::default();
        config.policies = vec![Policy::new("tf", vec!["*.tf".into()], 30)];
        config.audit.enabled = true;
        config.audit.storage = "log".into();
        config.validate().unwrap();

        config.audit.storage = "s3".into();
        assert!(config.validate().unwrap_err().is_config());
    }

    #[test]
    fn empty_toml_gives_defaults() {
        let config = RecertConfig::from_toml("").unwrap();
        assert_eq!(config.global.default_base_branch, "main");
        assert_eq!(config.pr_template.labels, vec!["recertification"]);
    }

    #[test]
    fn invalid_toml_returns_error() {
        assert!(RecertConfig::from_toml("{{invalid}}").is_err());
    }
}
