use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Metadata of the last commit that touched a file.
///
/// # Examples
///
/// ```
/// use recert_core::CommitMeta;
///
/// let commit = CommitMeta {
///     hash: "abc123".into(),
///     author: "alice".into(),
///     email: "alice@example.com".into(),
///     message: "tighten security group".into(),
/// };
/// assert_eq!(commit.author, "alice");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitMeta {
    /// Commit hash.
    pub hash: String,
    /// Author name.
    pub author: String,
    /// Author email.
    pub email: String,
    /// First line of the commit message.
    pub message: String,
}

/// A candidate file handed to the pipeline by the scanner.
///
/// `last_modified` and `commit` are filled by a history provider; both stay
/// `None` when the lookup failed, which routes the file toward recertification.
///
/// # Examples
///
/// ```
/// use recert_core::FileRecord;
///
/// let file = FileRecord::new("terraform/main.tf", 512);
/// assert!(file.last_modified.is_none());
/// assert_eq!(file.author(), None);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// Path relative to the repository root, `/` separated.
    pub path: String,
    /// File size in bytes.
    pub size: u64,
    /// Instant of the last commit touching this file.
    pub last_modified: Option<DateTime<Utc>>,
    /// The last commit touching this file.
    pub commit: Option<CommitMeta>,
}

impl FileRecord {
    /// Create an unenriched record; separators are normalized to `/`.
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into().replace('\\', "/"),
            size,
            last_modified: None,
            commit: None,
        }
    }

    /// Author of the last commit, if known and non-empty.
    pub fn author(&self) -> Option<&str> {
        self.commit
            .as_ref()
            .map(|c| c.author.as_str())
            .filter(|a| !a.is_empty())
    }
}

/// Recertification urgency of a file.
///
/// Ordered from least to most urgent.
///
/// # Examples
///
/// ```
/// use recert_core::Priority;
///
/// assert!(Priority::Critical > Priority::High);
/// assert_eq!(Priority::Medium.to_string(), "Medium");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Not due soon.
    Low,
    /// Approaching the threshold (>= 80% of the interval).
    Medium,
    /// Past the threshold.
    High,
    /// More than 1.5x past the threshold.
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "Low"),
            Priority::Medium => write!(f, "Medium"),
            Priority::High => write!(f, "High"),
            Priority::Critical => write!(f, "Critical"),
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Outcome of evaluating one file against its matched policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    /// The evaluated file.
    pub file: FileRecord,
    /// Name of the first enabled policy that matched the file.
    pub policy: String,
    /// Whole days elapsed since the last modification.
    pub days_since: i64,
    /// Recertification interval of the matched policy, in days.
    pub threshold: u32,
    /// Urgency derived from `days_since / threshold`.
    pub priority: Priority,
    /// Whether the file is due (`days_since >= threshold`).
    pub needs_recertification: bool,
    /// `last_modified + threshold` days.
    pub next_due: DateTime<Utc>,
}

/// A group of stale files materialized together as one pull request.
///
/// # Examples
///
/// ```
/// use recert_core::ReviewUnit;
///
/// let unit = ReviewUnit::new("all-files", "single_pr", vec![]);
/// assert_eq!(unit.branch(), "recert/all-files");
/// assert!(unit.highest_priority().is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewUnit {
    /// Strategy-derived identifier, the basis of the branch name.
    pub id: String,
    /// Name of the grouping strategy that produced the unit.
    pub strategy: String,
    /// Stale verdicts in this unit, in grouping order.
    pub verdicts: Vec<Verdict>,
    /// Resolved assignees.
    #[serde(default)]
    pub assignees: Vec<String>,
    /// Resolved reviewers.
    #[serde(default)]
    pub reviewers: Vec<String>,
}

impl ReviewUnit {
    /// Create a unit with no resolved assignment.
    pub fn new(id: impl Into<String>, strategy: impl Into<String>, verdicts: Vec<Verdict>) -> Self {
        Self {
            id: id.into(),
            strategy: strategy.into(),
            verdicts,
            assignees: Vec::new(),
            reviewers: Vec::new(),
        }
    }

    /// Deterministic branch name for this unit.
    pub fn branch(&self) -> String {
        branch_name(&self.id)
    }

    /// Most urgent priority among the unit's verdicts.
    pub fn highest_priority(&self) -> Option<Priority> {
        self.verdicts.iter().map(|v| v.priority).max()
    }

    /// Paths of the files in this unit, in order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.verdicts.iter().map(|v| v.file.path.as_str())
    }
}

/// Branch name for a review unit id: `recert/<id>`.
///
/// Each `/`-separated component is made a valid ref component: characters
/// git refuses become `-`, as do a leading `.`, a trailing `.`, `..`, `@{`,
/// and a `.lock` suffix. When that changes the id, the first 8 hex digits of
/// its SHA-256 are appended so distinct ids keep distinct branches.
///
/// # Examples
///
/// ```
/// use recert_core::branch_name;
///
/// assert_eq!(branch_name("pattern-terraform"), "recert/pattern-terraform");
/// assert_ne!(branch_name("author-Jane Doe"), branch_name("author-Jane-Doe"));
/// assert!(branch_name("author-Jane Doe").starts_with("recert/author-Jane-Doe-"));
/// ```
pub fn branch_name(unit_id: &str) -> String {
    let sanitized = unit_id
        .split('/')
        .map(ref_component)
        .collect::<Vec<_>>()
        .join("/");
    if sanitized == unit_id {
        return format!("recert/{sanitized}");
    }

    let digest = format!("{:x}", Sha256::digest(unit_id.as_bytes()));
    format!("recert/{sanitized}-{}", &digest[..8])
}

fn ref_component(component: &str) -> String {
    if component.is_empty() {
        return "-".into();
    }
    let mut out: String = component
        .chars()
        .map(|c| match c {
            ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\' => '-',
            c if c.is_control() => '-',
            c => c,
        })
        .collect();
    for forbidden in ["..", "@{"] {
        while out.contains(forbidden) {
            out = out.replace(forbidden, "-");
        }
    }
    if let Some(stem) = out.strip_suffix(".lock") {
        out = format!("{stem}-lock");
    }
    if out.starts_with('.') {
        out.replace_range(..1, "-");
    }
    if out.ends_with('.') {
        out.replace_range(out.len() - 1.., "-");
    }
    out
}

/// Who should look at a review unit.
///
/// # Examples
///
/// ```
/// use recert_core::AssignmentOutcome;
///
/// let outcome = AssignmentOutcome::to(vec!["platform-team".into()]);
/// assert_eq!(outcome.assignees, vec!["platform-team"]);
/// assert!(outcome.reviewers.is_empty());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentOutcome {
    /// Users assigned to the pull request.
    pub assignees: Vec<String>,
    /// Users asked to review the pull request.
    pub reviewers: Vec<String>,
    /// Owning team, when known.
    pub team: Option<String>,
    /// Priority of the unit as seen by the resolver.
    pub priority: Option<Priority>,
}

impl AssignmentOutcome {
    /// Outcome with only assignees set.
    pub fn to(assignees: Vec<String>) -> Self {
        Self {
            assignees,
            ..Self::default()
        }
    }
}

/// Kind of change applied to a single file in a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    /// Add a new file.
    Create,
    /// Replace the content of an existing file.
    Update,
    /// Remove a file.
    Delete,
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeAction::Create => write!(f, "create"),
            ChangeAction::Update => write!(f, "update"),
            ChangeAction::Delete => write!(f, "delete"),
        }
    }
}

/// A per-file content change carried by a commit.
///
/// # Examples
///
/// ```
/// use recert_core::{ChangeAction, FileChange};
///
/// let change = FileChange::update("main.tf", "# reviewed\n");
/// assert_eq!(change.action, ChangeAction::Update);
/// assert_eq!(change.content.as_deref(), Some("# reviewed\n"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    /// Path relative to the repository root.
    pub path: String,
    /// What to do with the file.
    pub action: ChangeAction,
    /// New content; `None` for deletions.
    pub content: Option<String>,
}

impl FileChange {
    /// An update of an existing file to `content`.
    pub fn update(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            action: ChangeAction::Update,
            content: Some(content.into()),
        }
    }
}

/// Everything a provider needs to open a pull request for one review unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrRequest {
    /// Pull request title.
    pub title: String,
    /// Pull request body (markdown).
    pub description: String,
    /// Head branch, `recert/<unit id>`.
    pub branch: String,
    /// Target branch.
    pub base_branch: String,
    /// Content changes committed to the head branch.
    pub changes: Vec<FileChange>,
    /// Users to assign.
    pub assignees: Vec<String>,
    /// Users to request reviews from.
    pub reviewers: Vec<String>,
    /// Labels to attach.
    pub labels: Vec<String>,
}

/// A pull request (or merge request) as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePr {
    /// Backend identifier used for follow-up calls.
    pub id: String,
    /// Web URL of the pull request.
    pub url: String,
    /// Human-facing number (GitHub number, GitLab IID, Azure id).
    pub number: u64,
    /// Backend state string (`open`, `opened`, `active`, ...).
    pub state: String,
    /// Creation instant, when reported.
    pub created_at: Option<DateTime<Utc>>,
}

/// Output format for command results.
///
/// # Examples
///
/// ```
/// use recert_core::OutputFormat;
///
/// let fmt: OutputFormat = "json".parse().unwrap();
/// assert_eq!(fmt, OutputFormat::Json);
///
/// let fmt: OutputFormat = "md".parse().unwrap();
/// assert_eq!(fmt, OutputFormat::Markdown);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable tables and summaries.
    #[default]
    Text,
    /// Machine-readable JSON with camelCase keys.
    Json,
    /// Markdown-formatted output.
    Markdown,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Markdown => write!(f, "markdown"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "markdown" | "md" => Ok(OutputFormat::Markdown),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}
