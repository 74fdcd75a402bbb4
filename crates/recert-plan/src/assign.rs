//! Reviewer assignment for review units.

use chrono::{DateTime, Utc};
use glob::Pattern;
use recert_core::{
    AssignmentConfig, AssignmentOutcome, AssignmentRule, AssignmentStrategyKind, RecertError,
    ReviewUnit,
};
use recert_scan::matcher::{compile_glob, glob_matches};

use crate::plugin::PluginRegistry;

/// Decides assignees and reviewers for a unit.
///
/// Every strategy ends in the configured fallback when it has nothing better:
/// an empty assignee list is filled from `fallback_assignees` and an empty
/// reviewer list from `fallback_reviewers`. Only plugin failures are errors.
///
/// # Examples
///
/// ```
/// use recert_core::{AssignmentConfig, ReviewUnit};
/// use recert_plan::{AssignmentResolver, PluginRegistry};
///
/// let config = AssignmentConfig {
///     fallback_assignees: vec!["platform-team".into()],
///     ..Default::default()
/// };
/// let resolver = AssignmentResolver::new(&config, PluginRegistry::default()).unwrap();
/// let outcome = resolver.resolve(&ReviewUnit::new("all-files", "single_pr", vec![])).unwrap();
/// assert_eq!(outcome.assignees, vec!["platform-team"]);
/// ```
pub struct AssignmentResolver {
    config: AssignmentConfig,
    rules: Vec<(Pattern, AssignmentRule)>,
    plugins: PluginRegistry,
}

impl AssignmentResolver {
    /// Compile composite rules and bind the plugin registry.
    ///
    /// # Errors
    ///
    /// Returns [`RecertError::Pattern`] for a malformed rule glob.
    pub fn new(config: &AssignmentConfig, plugins: PluginRegistry) -> Result<Self, RecertError> {
        let rules = config
            .rules
            .iter()
            .map(|rule| Ok((compile_glob(&rule.pattern)?, rule.clone())))
            .collect::<Result<Vec<_>, RecertError>>()?;
        Ok(Self {
            config: config.clone(),
            rules,
            plugins,
        })
    }

    /// Resolve who reviews `unit`.
    ///
    /// The outcome priority is the unit's highest verdict priority unless a
    /// plugin supplied one.
    ///
    /// # Errors
    ///
    /// Returns [`RecertError::Plugin`] when a plugin is missing or fails.
    pub fn resolve(&self, unit: &ReviewUnit) -> Result<AssignmentOutcome, RecertError> {
        let mut outcome = match self.config.strategy {
            AssignmentStrategyKind::Static => self.fallback(&[]),
            AssignmentStrategyKind::LastCommitter => self.last_committer(unit, &[]),
            AssignmentStrategyKind::Plugin => {
                let name = self.config.plugin.as_deref().ok_or_else(|| {
                    RecertError::Plugin("assignment strategy 'plugin' has no plugin name".into())
                })?;
                self.plugin(name, unit, &[])?
            }
            AssignmentStrategyKind::Composite => self.composite(unit)?,
        };

        if outcome.reviewers.is_empty() {
            outcome.reviewers = self.config.fallback_reviewers.clone();
        }
        if outcome.priority.is_none() {
            outcome.priority = unit.highest_priority();
        }

        tracing::debug!(
            unit = %unit.id,
            strategy = self.config.strategy.as_str(),
            assignees = ?outcome.assignees,
            reviewers = ?outcome.reviewers,
            "resolved assignment"
        );
        Ok(outcome)
    }

    fn composite(&self, unit: &ReviewUnit) -> Result<AssignmentOutcome, RecertError> {
        let matched = self
            .rules
            .iter()
            .find(|(pattern, _)| unit.paths().any(|p| glob_matches(pattern, p)));

        let Some((_, rule)) = matched else {
            tracing::debug!(unit = %unit.id, "no assignment rule matched, using fallback");
            return Ok(self.fallback(&[]));
        };

        match rule.strategy {
            AssignmentStrategyKind::Static => Ok(self.fallback(&rule.fallback_assignees)),
            AssignmentStrategyKind::LastCommitter => {
                Ok(self.last_committer(unit, &rule.fallback_assignees))
            }
            AssignmentStrategyKind::Plugin => {
                let name = rule.plugin.as_deref().ok_or_else(|| {
                    RecertError::Plugin(format!(
                        "assignment rule '{}' uses a plugin but names none",
                        rule.pattern
                    ))
                })?;
                self.plugin(name, unit, &rule.fallback_assignees)
            }
            AssignmentStrategyKind::Composite => {
                tracing::warn!(rule = %rule.pattern, "nested composite rule, using fallback");
                Ok(self.fallback(&rule.fallback_assignees))
            }
        }
    }

    /// Author of the most recently modified file that carries one.
    fn last_committer(&self, unit: &ReviewUnit, rule_fallback: &[String]) -> AssignmentOutcome {
        let mut latest: Option<(&str, Option<DateTime<Utc>>)> = None;
        for v in &unit.verdicts {
            let Some(author) = v.file.author() else {
                continue;
            };
            match latest {
                Some((_, when)) if v.file.last_modified <= when => {}
                _ => latest = Some((author, v.file.last_modified)),
            }
        }

        match latest {
            Some((author, _)) => AssignmentOutcome::to(vec![author.to_string()]),
            None => {
                tracing::debug!(unit = %unit.id, "no author metadata, using fallback");
                self.fallback(rule_fallback)
            }
        }
    }

    fn plugin(
        &self,
        name: &str,
        unit: &ReviewUnit,
        rule_fallback: &[String],
    ) -> Result<AssignmentOutcome, RecertError> {
        let plugin = self.plugins.assignment(name)?;
        let mut outcome = plugin
            .resolve(&unit.verdicts)
            .map_err(|e| RecertError::Plugin(format!("plugin '{name}' failed: {e}")))?;
        if outcome.assignees.is_empty() {
            outcome.assignees = self.fallback(rule_fallback).assignees;
        }
        Ok(outcome)
    }

    fn fallback(&self, rule_fallback: &[String]) -> AssignmentOutcome {
        let assignees = if rule_fallback.is_empty() {
            self.config.fallback_assignees.clone()
        } else {
            rule_fallback.to_vec()
        };
        AssignmentOutcome {
            assignees,
            reviewers: self.config.fallback_reviewers.clone(),
            ..AssignmentOutcome::default()
        }
    }
}
