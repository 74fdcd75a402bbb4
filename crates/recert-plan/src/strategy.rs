//! Grouping of stale verdicts into review units.
//!
//! Built-in strategies key units through a `BTreeMap`, so units come out
//! ordered by id and a run over the same input always yields the same plan.

use std::collections::BTreeMap;
use std::sync::Arc;

use recert_core::{GroupingKind, PrStrategyConfig, RecertError, ReviewUnit, Verdict};

use crate::plugin::{PluginRegistry, StrategyPlugin};

/// A configured grouping strategy.
///
/// # Examples
///
/// ```
/// use recert_core::{GroupingKind, PrStrategyConfig};
/// use recert_plan::{GroupingStrategy, PluginRegistry};
///
/// let config = PrStrategyConfig { kind: GroupingKind::SinglePr, ..Default::default() };
/// let strategy = GroupingStrategy::from_config(&config, &PluginRegistry::default()).unwrap();
/// assert!(strategy.group(&[]).unwrap().is_empty());
/// ```
pub struct GroupingStrategy {
    kind: GroupingKind,
    max_files_per_pr: Option<usize>,
    plugin: Option<Arc<dyn StrategyPlugin>>,
}

impl GroupingStrategy {
    /// Build the strategy named by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`RecertError::Config`] when `type = "plugin"` names no plugin
    /// or a plugin that is not loaded.
    pub fn from_config(
        config: &PrStrategyConfig,
        registry: &PluginRegistry,
    ) -> Result<Self, RecertError> {
        let plugin = match config.kind {
            GroupingKind::Plugin => {
                let name = config.plugin.as_deref().ok_or_else(|| {
                    RecertError::Config("pr_strategy: plugin strategy requires a plugin name".into())
                })?;
                Some(
                    registry
                        .strategy(name)
                        .map_err(|e| RecertError::Config(e.to_string()))?,
                )
            }
            _ => None,
        };
        Ok(Self {
            kind: config.kind,
            max_files_per_pr: config.max_files_per_pr.filter(|n| *n > 0),
            plugin,
        })
    }

    /// Group the stale verdicts of `verdicts` into units.
    ///
    /// Verdicts that do not need recertification are ignored. Units larger
    /// than `max_files_per_pr` are split into `<id>-part-<n>` chunks.
    ///
    /// # Errors
    ///
    /// Only the plugin strategy can fail; its error is returned as is.
    pub fn group(&self, verdicts: &[Verdict]) -> Result<Vec<ReviewUnit>, RecertError> {
        let stale: Vec<Verdict> = verdicts
            .iter()
            .filter(|v| v.needs_recertification)
            .cloned()
            .collect();
        tracing::debug!(
            strategy = self.kind.as_str(),
            total = verdicts.len(),
            stale = stale.len(),
            "grouping verdicts"
        );

        let units = match self.kind {
            GroupingKind::PerFile => {
                keyed(stale, "per_file", |v| format!("file-{}", v.file.path))
            }
            GroupingKind::PerPattern => {
                keyed(stale, "per_pattern", |v| format!("pattern-{}", v.policy))
            }
            GroupingKind::PerCommitter => keyed(stale, "per_committer", |v| {
                format!("author-{}", v.file.author().unwrap_or("unknown"))
            }),
            GroupingKind::SinglePr => {
                if stale.is_empty() {
                    Vec::new()
                } else {
                    vec![ReviewUnit::new("all-files", "single_pr", stale)]
                }
            }
            GroupingKind::Plugin => match &self.plugin {
                Some(plugin) => plugin.group(&stale)?,
                None => {
                    return Err(RecertError::Plugin("no strategy plugin loaded".into()));
                }
            },
        };

        let units = match self.max_files_per_pr {
            Some(max) => split(units, max),
            None => units,
        };
        tracing::info!(strategy = self.kind.as_str(), units = units.len(), "grouping complete");
        Ok(units)
    }
}

fn keyed(
    verdicts: Vec<Verdict>,
    strategy: &str,
    key: impl Fn(&Verdict) -> String,
) -> Vec<ReviewUnit> {
    let mut groups: BTreeMap<String, Vec<Verdict>> = BTreeMap::new();
    for v in verdicts {
        groups.entry(key(&v)).or_default().push(v);
    }
    groups
        .into_iter()
        .map(|(id, verdicts)| ReviewUnit::new(id, strategy, verdicts))
        .collect()
}

fn split(units: Vec<ReviewUnit>, max: usize) -> Vec<ReviewUnit> {
    let mut out = Vec::with_capacity(units.len());
    for unit in units {
        if unit.verdicts.len() <= max {
            out.push(unit);
            continue;
        }
        for (i, chunk) in unit.verdicts.chunks(max).enumerate() {
            out.push(ReviewUnit::new(
                format!("{}-part-{}", unit.id, i + 1),
                unit.strategy.clone(),
                chunk.to_vec(),
            ));
        }
    }
    out
}
