//! Core types, configuration, and error handling for the recertification engine.
//!
//! This crate provides the shared foundation used by all other recert crates:
//! - [`RecertError`]: unified error type using `thiserror`
//! - [`RecertConfig`]: configuration loaded from `.recert.toml`
//! - Pipeline types: [`FileRecord`], [`Verdict`], [`ReviewUnit`],
//!   [`AssignmentOutcome`], [`PrRequest`], [`RemotePr`]

mod config;
mod error;
mod types;

pub use config::{
    AssignmentConfig, AssignmentRule, AssignmentStrategyKind, AuditConfig, GlobalConfig,
    GroupingKind, PluginConfig, PluginKind, Policy, PrStrategyConfig, PrTemplateConfig,
    ProviderKind, RecertConfig, RepositoryConfig,
};
pub use error::RecertError;
pub use types::{
    branch_name, AssignmentOutcome, ChangeAction, CommitMeta, FileChange, FileRecord,
    OutputFormat, PrRequest, Priority, RemotePr, ReviewUnit, Verdict,
};

/// A convenience `Result` type for recert operations.
pub type Result<T> = std::result::Result<T, RecertError>;
