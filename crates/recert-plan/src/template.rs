//! Pull request title and body rendering.

use std::fmt::Write;

use recert_core::{AssignmentOutcome, PrRequest, PrTemplateConfig, ReviewUnit};

/// Renders [`PrRequest`]s from review units.
///
/// # Examples
///
/// ```
/// use recert_core::{AssignmentOutcome, PrTemplateConfig, ReviewUnit};
/// use recert_plan::PrTemplate;
///
/// let template = PrTemplate::new(PrTemplateConfig::default());
/// let unit = ReviewUnit::new("all-files", "single_pr", vec![]);
/// let pr = template.render(&unit, &AssignmentOutcome::default(), "main");
///
/// assert_eq!(pr.branch, "recert/all-files");
/// assert_eq!(pr.base_branch, "main");
/// assert!(pr.description.starts_with("## Recertification Required"));
/// ```
#[derive(Debug, Clone)]
pub struct PrTemplate {
    config: PrTemplateConfig,
}

impl PrTemplate {
    /// Create a renderer for `config`.
    pub fn new(config: PrTemplateConfig) -> Self {
        Self { config }
    }

    /// Render the pull request for `unit`. Changes are left empty.
    pub fn render(&self, unit: &ReviewUnit, outcome: &AssignmentOutcome, base_branch: &str) -> PrRequest {
        PrRequest {
            title: self.title(unit, outcome),
            description: self.description(unit),
            branch: unit.branch(),
            base_branch: base_branch.to_string(),
            changes: Vec::new(),
            assignees: outcome.assignees.clone(),
            reviewers: outcome.reviewers.clone(),
            labels: self.config.labels.clone(),
        }
    }

    fn title(&self, unit: &ReviewUnit, outcome: &AssignmentOutcome) -> String {
        let pattern_name = unit
            .verdicts
            .first()
            .map_or("unknown", |v| v.policy.as_str());
        let priority = outcome
            .priority
            .or_else(|| unit.highest_priority())
            .map(|p| p.to_string())
            .unwrap_or_default();
        self.config
            .title
            .replace("{pattern_name}", pattern_name)
            .replace("{file_count}", &unit.verdicts.len().to_string())
            .replace("{unit_id}", &unit.id)
            .replace("{priority}", &priority)
    }

    fn description(&self, unit: &ReviewUnit) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "## Recertification Required");
        let _ = writeln!(out);
        let _ = writeln!(out, "The following infrastructure files are due for recertification.");
        let _ = writeln!(out);

        if self.config.include_file_list {
            let _ = writeln!(out, "### Files");
            let _ = writeln!(out);
            let _ = writeln!(out, "| Path | Last Modified | Author | Priority |");
            let _ = writeln!(out, "|---|---|---|---|");
            for v in &unit.verdicts {
                let modified = v
                    .file
                    .last_modified
                    .map_or_else(|| "unknown".to_string(), |t| t.format("%Y-%m-%d").to_string());
                let _ = writeln!(
                    out,
                    "| {} | {} | {} | {} |",
                    v.file.path,
                    modified,
                    v.file.author().unwrap_or("unknown"),
                    v.priority
                );
            }
            let _ = writeln!(out);
        }

        if self.config.include_checklist {
            let _ = writeln!(out, "### Checklist");
            let _ = writeln!(out);
            let _ = writeln!(out, "- [ ] Reviewed configuration for security compliance");
            let _ = writeln!(out, "- [ ] Verified ownership and necessity");
            let _ = writeln!(out, "- [ ] Approved for recertification");
            let _ = writeln!(out);
        }

        if !self.config.custom_instructions.is_empty() {
            let _ = writeln!(out, "### Instructions");
            let _ = writeln!(out);
            let _ = writeln!(out, "{}", self.config.custom_instructions);
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use recert_core::{CommitMeta, FileRecord, Priority, Verdict};

    fn unit() -> ReviewUnit {
        let mut file = FileRecord::new("terraform/main.tf", 10);
        file.last_modified = Some(Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap());
        file.commit = Some(CommitMeta {
            author: "alice".into(),
            ..CommitMeta::default()
        });
        let verdicts = vec![
            Verdict {
                file,
                policy: "terraform".into(),
                days_since: 200,
                threshold: 90,
                priority: Priority::Critical,
                needs_recertification: true,
                next_due: Utc::now(),
            },
            Verdict {
                file: FileRecord::new("terraform/vars.tf", 10),
                policy: "terraform".into(),
                days_since: 100,
                threshold: 90,
                priority: Priority::High,
                needs_recertification: true,
                next_due: Utc::now(),
            },
        ];
        ReviewUnit::new("pattern-terraform", "per_pattern", verdicts)
    }

    #[test]
    fn title_placeholders_are_substituted() {
        let template = PrTemplate::new(PrTemplateConfig {
            title: "[{priority}] {pattern_name}: {file_count} files ({unit_id})".into(),
            ..PrTemplateConfig::default()
        });
        let pr = template.render(&unit(), &AssignmentOutcome::default(), "main");
        assert_eq!(pr.title, "[Critical] terraform: 2 files (pattern-terraform)");
    }

    #[test]
    fn file_table_lists_every_file() {
        let template = PrTemplate::new(PrTemplateConfig::default());
        let pr = template.render(&unit(), &AssignmentOutcome::default(), "main");
        assert!(pr
            .description
            .contains("| terraform/main.tf | 2024-03-05 | alice | Critical |"));
        assert!(pr
            .description
            .contains("| terraform/vars.tf | unknown | unknown | High |"));
        assert!(!pr.description.contains("### Checklist"));
    }

    #[test]
    fn checklist_and_instructions_are_optional_sections() {
        let template = PrTemplate::new(PrTemplateConfig {
            include_file_list: false,
            include_checklist: true,
            custom_instructions: "Ping #infra when done.".into(),
            ..PrTemplateConfig::default()
        });
        let pr = template.render(&unit(), &AssignmentOutcome::default(), "develop");
        assert!(!pr.description.contains("### Files"));
        assert!(pr.description.contains("- [ ] Verified ownership and necessity"));
        assert!(pr.description.ends_with("Ping #infra when done.\n"));
        assert_eq!(pr.base_branch, "develop");
    }

    #[test]
    fn outcome_and_labels_are_carried() {
        let template = PrTemplate::new(PrTemplateConfig::default());
        let outcome = AssignmentOutcome {
            assignees: vec!["alice".into()],
            reviewers: vec!["security".into()],
            ..AssignmentOutcome::default()
        };
        let pr = template.render(&unit(), &outcome, "main");
        assert_eq!(pr.assignees, vec!["alice"]);
        assert_eq!(pr.reviewers, vec!["security"]);
        assert_eq!(pr.labels, vec!["recertification"]);
        assert_eq!(pr.branch, "recert/pattern-terraform");
        assert!(pr.changes.is_empty());
    }
}
