//! File discovery, history enrichment, and staleness evaluation.
//!
//! Finds candidate IaC files in a local checkout, attaches the last commit that
//! touched each one, matches them against recertification policies, and turns
//! every match into a [`Verdict`](recert_core::Verdict).

pub mod checker;
pub mod history;
pub mod matcher;
pub mod walker;

pub use checker::{evaluate, Checker};
pub use history::{GitHistory, HistoryProvider, NoHistory};
pub use matcher::PolicySet;
pub use walker::{FsScanner, Scanner};
