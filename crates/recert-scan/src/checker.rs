//! Staleness and priority evaluation.

use chrono::{DateTime, Duration, Utc};
use recert_core::{FileRecord, Policy, Priority, Verdict};

use crate::matcher::PolicySet;

/// Evaluate one file against its matched policy at instant `now`.
///
/// A file without a known modification instant is treated as last modified at
/// the Unix epoch, which always lands it in [`Priority::Critical`].
///
/// # Examples
///
/// ```
/// use chrono::{Duration, Utc};
/// use recert_core::{FileRecord, Policy, Priority};
/// use recert_scan::evaluate;
///
/// let now = Utc::now();
/// let mut file = FileRecord::new("main.tf", 10);
/// file.last_modified = Some(now - Duration::days(120));
///
/// let verdict = evaluate(&file, &Policy::new("tf", vec!["*.tf".into()], 100), now);
/// assert_eq!(verdict.days_since, 120);
/// assert!(verdict.needs_recertification);
/// assert_eq!(verdict.priority, Priority::High);
/// ```
pub fn evaluate(file: &FileRecord, policy: &Policy, now: DateTime<Utc>) -> Verdict {
    let last_modified = file.last_modified.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    let days_since = ((now - last_modified).num_hours() / 24).max(0);
    let threshold = policy.interval_days;
    let needs_recertification = days_since >= i64::from(threshold);

    Verdict {
        file: file.clone(),
        policy: policy.name.clone(),
        days_since,
        threshold,
        priority: priority_for(days_since, threshold),
        needs_recertification,
        next_due: last_modified + Duration::days(i64::from(threshold)),
    }
}

fn priority_for(days_since: i64, threshold: u32) -> Priority {
    if threshold == 0 {
        return Priority::Critical;
    }
    let ratio = days_since as f64 / f64::from(threshold);
    if ratio > 1.5 {
        Priority::Critical
    } else if ratio >= 1.0 {
        Priority::High
    } else if ratio >= 0.8 {
        Priority::Medium
    } else {
        Priority::Low
    }
}

/// Evaluates scanned files against a compiled [`PolicySet`].
///
/// # Examples
///
/// ```
/// use chrono::Utc;
/// use recert_core::{FileRecord, Policy};
/// use recert_scan::{Checker, PolicySet};
///
/// let set = PolicySet::compile(&[Policy::new("tf", vec!["**/*.tf".into()], 90)]).unwrap();
/// let files = vec![FileRecord::new("main.tf", 1), FileRecord::new("README.md", 1)];
///
/// let verdicts = Checker::new(&set).check(&files, Utc::now());
/// assert_eq!(verdicts.len(), 1);
/// ```
pub struct Checker<'a> {
    policies: &'a PolicySet,
}

impl<'a> Checker<'a> {
    /// Create a checker over `policies`.
    pub fn new(policies: &'a PolicySet) -> Self {
        Self { policies }
    }

    /// One verdict per file that matches an enabled policy, in input order.
    ///
    /// Files matching no policy are dropped.
    pub fn check(&self, files: &[FileRecord], now: DateTime<Utc>) -> Vec<Verdict> {
        files
            .iter()
            .filter_map(|file| match self.policies.find(&file.path) {
                Some(policy) => {
                    let verdict = evaluate(file, policy, now);
                    tracing::debug!(
                        path = %file.path,
                        policy = %policy.name,
                        days_since = verdict.days_since,
                        priority = %verdict.priority,
                        stale = verdict.needs_recertification,
                        "evaluated file"
                    );
                    Some(verdict)
                }
                None => {
                    tracing::debug!(path = %file.path, "no policy matches file");
                    None
                }
            })
            .collect()
    }
}
