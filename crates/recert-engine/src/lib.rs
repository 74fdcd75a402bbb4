//! Recertification runs: orchestration, change planning, and the audit trail.
//!
//! [`Orchestrator`] wires the scan and plan crates to a
//! [`recert_provider::ProviderGateway`] and turns every stale unit into a
//! branch, a commit, and a pull request, skipping whatever already exists.

pub mod audit;
pub mod changes;
pub mod orchestrator;

pub use audit::{AuditEvent, AuditEventType, AuditSink, JsonlAuditSink, NullAuditSink, TracingAuditSink};
pub use orchestrator::{materialize, Materialized, Orchestrator, RunSummary, UnitFailure};
