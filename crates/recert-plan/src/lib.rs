//! Review planning: grouping, assignment, and pull request rendering.
//!
//! Turns stale [`Verdict`](recert_core::Verdict)s into [`ReviewUnit`](recert_core::ReviewUnit)s,
//! decides who reviews each unit, and renders the pull request that will carry it.
//! Plugins extend grouping and assignment through a statically linked registry.

pub mod assign;
pub mod plugin;
pub mod strategy;
pub mod template;

pub use assign::AssignmentResolver;
pub use plugin::{AssignmentPlugin, PluginRegistry, StrategyPlugin};
pub use strategy::GroupingStrategy;
pub use template::PrTemplate;
