use std::path::Path;

use recert_core::{FileRecord, RecertError};

use crate::matcher::PolicySet;

/// Source of candidate files for a run.
pub trait Scanner: Send + Sync {
    /// Candidate files under `root` that match at least one enabled policy.
    ///
    /// Returned records carry path and size only; history is attached later.
    ///
    /// # Errors
    ///
    /// Returns an error if `root` cannot be walked at all.
    fn scan(&self, root: &Path, policies: &PolicySet) -> Result<Vec<FileRecord>, RecertError>;
}

/// Walks a local checkout, respecting `.gitignore`.
///
/// # Examples
///
/// ```no_run
/// use std::path::Path;
/// use recert_core::Policy;
/// use recert_scan::{FsScanner, PolicySet, Scanner};
///
/// let set = PolicySet::compile(&[Policy::new("tf", vec!["**/*.tf".into()], 90)]).unwrap();
/// let files = FsScanner::default().scan(Path::new("."), &set).unwrap();
/// for f in &files {
///     println!("{} ({} bytes)", f.path, f.size);
/// }
/// ```
#[derive(Debug, Clone)]
pub struct FsScanner {
    /// Include hidden files and directories.
    pub hidden: bool,
}

impl Default for FsScanner {
    fn default() -> Self {
        Self { hidden: true }
    }
}

impl Scanner for FsScanner {
    fn scan(&self, root: &Path, policies: &PolicySet) -> Result<Vec<FileRecord>, RecertError> {
        if !root.is_dir() {
            return Err(RecertError::FileNotFound(root.to_path_buf()));
        }

        let walker = ignore::WalkBuilder::new(root)
            .hidden(!self.hidden)
            .filter_entry(|e| e.file_name() != ".git")
            .build();
        let mut files = Vec::new();

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };

            let Some(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_file() {
                continue;
            }

            let path = entry.path();
            let relative = match path.strip_prefix(root) {
                Ok(r) => r.to_string_lossy().replace('\\', "/"),
                Err(_) => continue,
            };

            if policies.find(&relative).is_none() {
                continue;
            }

            let size = match entry.metadata() {
                Ok(m) => m.len(),
                Err(e) => {
                    tracing::warn!(path = %relative, error = %e, "failed to stat file");
                    continue;
                }
            };

            files.push(FileRecord::new(relative, size));
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        tracing::info!(root = %root.display(), files = files.len(), "scan complete");
        Ok(files)
    }
}
