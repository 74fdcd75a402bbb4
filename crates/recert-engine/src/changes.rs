//! File changes that mark a unit as recertified.
//!
//! A policy's `decorator` is a marker line written at the top of every file it
//! covers, e.g. `# recertified: {timestamp}`. Re-decorating a file replaces the
//! previous marker instead of stacking a new one on top.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use recert_core::{FileChange, RecertError, ReviewUnit};
use recert_scan::PolicySet;

const TIMESTAMP: &str = "{timestamp}";

/// Plan the changes committed for `unit`.
///
/// Files are read from `root`; `remote_prefix` is prepended to each path so
/// changes are addressed relative to the repository root. Files whose policy
/// has no decorator produce no change.
///
/// # Errors
///
/// Returns [`RecertError::Io`] if a decorated file cannot be read.
pub fn plan(
    root: &Path,
    remote_prefix: &str,
    unit: &ReviewUnit,
    policies: &PolicySet,
    now: DateTime<Utc>,
) -> Result<Vec<FileChange>, RecertError> {
    let stamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);
    let mut changes = Vec::new();

    for verdict in &unit.verdicts {
        let Some(decorator) = policies
            .get(&verdict.policy)
            .and_then(|p| p.decorator.as_deref())
            .filter(|d| !d.trim().is_empty())
        else {
            continue;
        };

        let content = std::fs::read_to_string(root.join(&verdict.file.path))?;
        let updated = decorate(&content, decorator, &stamp);
        tracing::debug!(file = %verdict.file.path, decorator, "prepared change");
        changes.push(FileChange::update(
            format!("{remote_prefix}{}", verdict.file.path),
            updated,
        ));
    }

    Ok(changes)
}

/// Prepend `decorator` to `content`, replacing a marker left by an earlier run.
///
/// # Examples
///
/// ```
/// use recert_engine::changes::decorate;
///
/// let once = decorate("resource {}\n", "# recertified {timestamp}", "2025-01-01T00:00:00Z");
/// assert_eq!(once, "# recertified 2025-01-01T00:00:00Z\nresource {}\n");
///
/// let twice = decorate(&once, "# recertified {timestamp}", "2025-06-01T00:00:00Z");
/// assert_eq!(twice, "# recertified 2025-06-01T00:00:00Z\nresource {}\n");
/// ```
pub fn decorate(content: &str, decorator: &str, timestamp: &str) -> String {
    let mut marker = decorator.replace(TIMESTAMP, timestamp);
    if !marker.ends_with('\n') {
        marker.push('\n');
    }
    format!("{marker}{}", strip_marker(content, decorator))
}

/// `content` without its leading marker lines, if it starts with one.
fn strip_marker<'a>(content: &'a str, decorator: &str) -> &'a str {
    let template = decorator.trim_end_matches(['\n', '\r']);
    let first_line = template.lines().next().unwrap_or_default();
    let prefix = first_line
        .split_once(TIMESTAMP)
        .map_or(first_line, |(before, _)| before);
    if prefix.trim().is_empty() || !content.starts_with(prefix) {
        return content;
    }

    let mut rest = content;
    for _ in 0..template.lines().count() {
        rest = match rest.split_once('\n') {
            Some((_, tail)) => tail,
            None => "",
        };
    }
    rest
}
