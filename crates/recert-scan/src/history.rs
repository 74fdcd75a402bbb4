//! Last-modification lookup via git2.
//!
//! [`GitHistory`] walks the history once at construction, newest first, and
//! keeps the first commit seen for every path. Lookups are then map reads, so
//! the provider is cheap to share across the enrichment stage.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use git2::{DiffOptions, Repository, Sort};
use recert_core::{CommitMeta, RecertError};

/// Supplies the last commit that touched a file.
pub trait HistoryProvider: Send + Sync {
    /// Instant and metadata of the most recent commit touching `path`.
    ///
    /// `path` is relative to the scan root, `/` separated.
    ///
    /// # Errors
    ///
    /// Returns [`RecertError::Git`] when no history is known for `path`.
    fn last_modification(&self, path: &str) -> Result<(DateTime<Utc>, CommitMeta), RecertError>;
}

/// History provider used when the scan root is not inside a git repository.
///
/// Every lookup fails, so every file is evaluated as never recertified.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHistory;

impl HistoryProvider for NoHistory {
    fn last_modification(&self, path: &str) -> Result<(DateTime<Utc>, CommitMeta), RecertError> {
        Err(RecertError::Git(format!("no history available for '{path}'")))
    }
}

/// Newest-first index of the commits in a local repository.
///
/// Merge commits are skipped so a change is attributed to the commit that
/// introduced it rather than to the merge.
///
/// # Examples
///
/// ```no_run
/// use std::path::Path;
/// use recert_scan::{GitHistory, HistoryProvider};
///
/// let history = GitHistory::open(Path::new(".")).unwrap();
/// let (when, commit) = history.last_modification("terraform/main.tf").unwrap();
/// println!("{when}: {} by {}", commit.message, commit.author);
/// ```
#[derive(Debug)]
pub struct GitHistory {
    index: HashMap<String, (DateTime<Utc>, CommitMeta)>,
    prefix: String,
}

impl GitHistory {
    /// Discover the repository containing `root` and index its history from HEAD.
    ///
    /// # Errors
    ///
    /// Returns [`RecertError::Git`] if no repository is found, HEAD cannot be
    /// resolved, or the walk fails.
    pub fn open(root: &Path) -> Result<Self, RecertError> {
        let repo = Repository::discover(root)
            .map_err(|e| RecertError::Git(format!("failed to open repository: {e}")))?;
        let prefix = scan_prefix(&repo, root)?;
        let index = build_index(&repo)?;
        tracing::debug!(paths = index.len(), prefix = %prefix, "indexed git history");
        Ok(Self { index, prefix })
    }

    /// Number of distinct paths with known history.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the repository has no indexed paths.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Location of the scan root inside the work tree: empty, or ending in `/`.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl HistoryProvider for GitHistory {
    fn last_modification(&self, path: &str) -> Result<(DateTime<Utc>, CommitMeta), RecertError> {
        let key = format!("{}{}", self.prefix, path.replace('\\', "/"));
        self.index
            .get(&key)
            .cloned()
            .ok_or_else(|| RecertError::Git(format!("no commit found for '{path}'")))
    }
}

/// Path of `root` inside the work tree, with a trailing `/` when non-empty.
fn scan_prefix(repo: &Repository, root: &Path) -> Result<String, RecertError> {
    let workdir = repo
        .workdir()
        .ok_or_else(|| RecertError::Git("bare repositories are not supported".into()))?;
    let workdir = workdir.canonicalize()?;
    let root = root.canonicalize()?;
    let relative = root
        .strip_prefix(&workdir)
        .map_err(|_| RecertError::Git(format!("{} is outside the work tree", root.display())))?
        .to_string_lossy()
        .replace('\\', "/");
    if relative.is_empty() {
        Ok(relative)
    } else {
        Ok(format!("{relative}/"))
    }
}

fn build_index(
    repo: &Repository,
) -> Result<HashMap<String, (DateTime<Utc>, CommitMeta)>, RecertError> {
    let mut revwalk = repo
        .revwalk()
        .map_err(|e| RecertError::Git(format!("failed to create revwalk: {e}")))?;
    revwalk
        .set_sorting(Sort::TIME)
        .map_err(|e| RecertError::Git(format!("failed to sort revwalk: {e}")))?;
    revwalk
        .push_head()
        .map_err(|e| RecertError::Git(format!("failed to push HEAD: {e}")))?;

    let mut index = HashMap::new();

    for oid_result in revwalk {
        let oid = oid_result.map_err(|e| RecertError::Git(format!("revwalk error: {e}")))?;
        let commit = repo
            .find_commit(oid)
            .map_err(|e| RecertError::Git(format!("failed to find commit: {e}")))?;

        if commit.parent_count() > 1 {
            continue;
        }

        let Some(when) = DateTime::<Utc>::from_timestamp(commit.time().seconds(), 0) else {
            continue;
        };

        let commit_tree = commit
            .tree()
            .map_err(|e| RecertError::Git(format!("failed to get commit tree: {e}")))?;
        let parent_tree = if commit.parent_count() > 0 {
            let parent = commit
                .parent(0)
                .map_err(|e| RecertError::Git(format!("failed to get parent: {e}")))?;
            Some(
                parent
                    .tree()
                    .map_err(|e| RecertError::Git(format!("failed to get parent tree: {e}")))?,
            )
        } else {
            None
        };

        let mut diff_opts = DiffOptions::new();
        let diff = repo
            .diff_tree_to_tree(parent_tree.as_ref(), Some(&commit_tree), Some(&mut diff_opts))
            .map_err(|e| RecertError::Git(format!("failed to compute diff: {e}")))?;

        let author = commit.author();
        let meta = CommitMeta {
            hash: oid.to_string(),
            author: author.name().unwrap_or("").to_string(),
            email: author.email().unwrap_or("").to_string(),
            message: commit
                .message()
                .unwrap_or("")
                .lines()
                .next()
                .unwrap_or("")
                .to_string(),
        };

        for delta in diff.deltas() {
            if delta.status() == git2::Delta::Deleted {
                continue;
            }
            let Some(path) = delta.new_file().path() else {
                continue;
            };
            let path = path.to_string_lossy().replace('\\', "/");
            index.entry(path).or_insert_with(|| (when, meta.clone()));
        }
    }

    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::{Signature, Time};
    use std::fs;

    fn commit_file(repo: &Repository, path: &str, content: &str, author: &str, secs: i64) {
        let root = repo.workdir().unwrap();
        let full = root.join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(&full, content).unwrap();

        let mut index = repo.index().unwrap();
        index.add_path(Path::new(path)).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();

        let sig = Signature::new(author, &format!("{author}@example.com"), &Time::new(secs, 0))
            .unwrap();
        let parents = match repo.head() {
            Ok(head) => vec![head.peel_to_commit().unwrap()],
            Err(_) => vec![],
        };
        let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, &format!("touch {path}"), &tree, &parent_refs)
            .unwrap();
    }

    #[test]
    fn newest_commit_wins() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        commit_file(&repo, "infra/main.tf", "a", "alice", 1_700_000_000);
        commit_file(&repo, "infra/vars.tf", "b", "bob", 1_700_100_000);
        commit_file(&repo, "infra/main.tf", "c", "carol", 1_700_200_000);

        let history = GitHistory::open(dir.path()).unwrap();
        assert_eq!(history.len(), 2);

        let (when, meta) = history.last_modification("infra/main.tf").unwrap();
        assert_eq!(when.timestamp(), 1_700_200_000);
        assert_eq!(meta.author, "carol");
        assert_eq!(meta.email, "carol@example.com");
        assert_eq!(meta.message, "touch infra/main.tf");

        let (_, meta) = history.last_modification("infra/vars.tf").unwrap();
        assert_eq!(meta.author, "bob");
    }

    #[test]
    fn unknown_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        commit_file(&repo, "main.tf", "a", "alice", 1_700_000_000);

        let history = GitHistory::open(dir.path()).unwrap();
        assert!(history.last_modification("missing.tf").is_err());
    }

    #[test]
    fn scan_root_below_workdir_is_prefixed() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        commit_file(&repo, "envs/prod/main.tf", "a", "alice", 1_700_000_000);

        let history = GitHistory::open(&dir.path().join("envs")).unwrap();
        let (_, meta) = history.last_modification("prod/main.tf").unwrap();
        assert_eq!(meta.author, "alice");
    }

    #[test]
    fn open_outside_repository_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = GitHistory::open(dir.path()).unwrap_err();
        assert!(matches!(err, RecertError::Git(_)));
    }

    #[test]
    fn no_history_always_fails() {
        assert!(NoHistory.last_modification("main.tf").is_err());
    }
}
