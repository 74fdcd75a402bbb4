//! The recertification run.
//!
//! Scan, enrich, evaluate and group run once, in order. Each resulting unit is
//! then resolved, rendered, and materialized on a worker pool of
//! `global.max_concurrent_prs` tasks. A unit that fails is counted and audited
//! and the remaining units carry on.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use recert_core::{FileRecord, PrRequest, RecertConfig, RecertError, RemotePr, ReviewUnit};
use recert_plan::{AssignmentResolver, GroupingStrategy, PluginRegistry, PrTemplate};
use recert_provider::ProviderGateway;
use recert_scan::{Checker, FsScanner, HistoryProvider, NoHistory, PolicySet, Scanner};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audit::{self, AuditEventType, AuditSink, Auditor};
use crate::changes;

/// Counts and results of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    /// Files matched by a policy.
    pub scanned: usize,
    /// Verdicts produced (one per matched file).
    pub evaluated: usize,
    /// Verdicts that need recertification.
    pub stale: usize,
    pub units: usize,
    /// Units that finished without error: created, already open, or planned.
    pub processed: usize,
    pub failed: usize,
    /// Units never started because the run was cancelled.
    pub cancelled: usize,
    pub created: usize,
    pub already_open: usize,
    pub dry_run: usize,
    /// Pull requests opened by this run.
    pub prs: Vec<RemotePr>,
    /// Pull requests a dry run would have opened.
    pub planned: Vec<PrRequest>,
    pub failures: Vec<UnitFailure>,
}

/// A unit that could not be materialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitFailure {
    pub unit: String,
    pub error: String,
}

/// Result of [`materialize`] for a unit that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Materialized {
    Created(RemotePr),
    AlreadyOpen,
}

enum UnitOutcome {
    Materialized(Materialized),
    DryRun(PrRequest),
    Cancelled,
}

/// Drives a full run against one checkout.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use recert_core::RecertConfig;
/// use recert_engine::Orchestrator;
/// use recert_scan::GitHistory;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn demo() -> recert_core::Result<()> {
/// let config = RecertConfig::from_file(".recert.toml".as_ref())?;
/// let gateway = recert_provider::connect(&config.repository)?;
/// let history = GitHistory::open(".".as_ref())?;
/// let summary = Orchestrator::new(config, ".")?
///     .with_history(Arc::new(history))
///     .with_gateway(gateway)
///     .run(CancellationToken::new())
///     .await?;
/// println!("{} pull request(s) opened", summary.created);
/// # Ok(())
/// # }
/// ```
pub struct Orchestrator {
    config: RecertConfig,
    root: PathBuf,
    remote_prefix: String,
    scanner: Arc<dyn Scanner>,
    history: Arc<dyn HistoryProvider>,
    gateway: Option<Arc<dyn ProviderGateway>>,
    plugins: PluginRegistry,
    audit: Arc<dyn AuditSink>,
}

impl Orchestrator {
    /// Create an orchestrator for the checkout at `root`.
    ///
    /// Defaults: [`FsScanner`], [`NoHistory`], plugins from `config.plugins`,
    /// the audit sink selected by `config.audit`, and no gateway.
    ///
    /// # Errors
    ///
    /// Returns [`RecertError::Config`] if the configuration is invalid or a
    /// plugin cannot be initialized.
    pub fn new(config: RecertConfig, root: impl Into<PathBuf>) -> Result<Self, RecertError> {
        config.validate()?;
        let plugins = PluginRegistry::from_config(&config.plugins)?;
        let audit = audit::from_config(&config.audit);
        Ok(Self {
            config,
            root: root.into(),
            remote_prefix: String::new(),
            scanner: Arc::new(FsScanner::default()),
            history: Arc::new(NoHistory),
            gateway: None,
            plugins,
            audit,
        })
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn Scanner>) -> Self {
        self.scanner = scanner;
        self
    }

    pub fn with_history(mut self, history: Arc<dyn HistoryProvider>) -> Self {
        self.history = history;
        self
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn ProviderGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Replace the plugin registry, e.g. to add plugins not built from config.
    pub fn with_plugins(mut self, plugins: PluginRegistry) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Path of the scan root inside the remote repository, empty or ending in `/`.
    pub fn with_remote_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.remote_prefix = prefix.into();
        self
    }

    pub fn config(&self) -> &RecertConfig {
        &self.config
    }

    /// Run with the current time as the evaluation instant.
    ///
    /// # Errors
    ///
    /// See [`Orchestrator::run_at`].
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunSummary, RecertError> {
        self.run_at(Utc::now(), cancel).await
    }

    /// Run with `now` as the evaluation instant.
    ///
    /// Cancelling `cancel` stops units from starting; units already talking
    /// to the backend finish.
    ///
    /// # Errors
    ///
    /// Fails only before any unit starts: invalid globs or plugins, a scan
    /// error, a grouping plugin error, or, outside dry-run, a missing gateway
    /// or an enabled policy without a decorator.
    /// Unit failures are reported in the summary.
    pub async fn run_at(
        &self,
        now: DateTime<Utc>,
        cancel: CancellationToken,
    ) -> Result<RunSummary, RecertError> {
        let repository = Some(self.config.repository.url.clone()).filter(|u| !u.is_empty());
        let auditor = Auditor::new(Arc::clone(&self.audit), Uuid::new_v4(), repository);
        let dry_run = self.config.global.dry_run;

        tracing::info!(
            run_id = %auditor.run_id(),
            root = %self.root.display(),
            dry_run,
            "starting recertification run"
        );
        auditor.emit(
            AuditEventType::RunStart,
            "recertification run started",
            json!({ "root": self.root.display().to_string(), "dry_run": dry_run }),
        );

        let result = self.execute(now, &cancel, &auditor).await;
        match &result {
            Ok(summary) => {
                tracing::info!(
                    processed = summary.processed,
                    failed = summary.failed,
                    cancelled = summary.cancelled,
                    created = summary.created,
                    "run completed"
                );
                auditor.emit(
                    AuditEventType::RunEnd,
                    "recertification run finished",
                    json!({
                        "units": summary.units,
                        "processed": summary.processed,
                        "failed": summary.failed,
                        "cancelled": summary.cancelled,
                        "created": summary.created,
                    }),
                );
            }
            Err(e) => {
                tracing::error!(error = %e, "run aborted");
                auditor.emit_error(
                    AuditEventType::RunEnd,
                    "recertification run aborted",
                    Value::Null,
                    e,
                );
            }
        }
        result
    }

    async fn execute(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
        auditor: &Auditor,
    ) -> Result<RunSummary, RecertError> {
        let policies = PolicySet::compile(&self.config.policies)?;
        let strategy = GroupingStrategy::from_config(&self.config.pr_strategy, &self.plugins)?;
        let resolver = AssignmentResolver::new(&self.config.assignment, self.plugins.clone())?;
        let gateway = if self.config.global.dry_run {
            None
        } else {
            self.config.require_decorators()?;
            Some(self.gateway.clone().ok_or_else(|| {
                RecertError::Config("no provider gateway configured outside dry-run".into())
            })?)
        };

        let mut files = self.scanner.scan(&self.root, &policies)?;
        tracing::info!(count = files.len(), "scanned files");
        auditor.emit(
            AuditEventType::ScanComplete,
            format!("scanned {} file(s)", files.len()),
            json!({ "count": files.len() }),
        );

        self.enrich(&mut files);

        let verdicts = Checker::new(&policies).check(&files, now);
        let stale = verdicts.iter().filter(|v| v.needs_recertification).count();
        tracing::info!(evaluated = verdicts.len(), stale, "evaluated files");
        auditor.emit(
            AuditEventType::CheckComplete,
            format!("{stale} of {} file(s) need recertification", verdicts.len()),
            json!({ "evaluated": verdicts.len(), "stale": stale }),
        );

        let units = strategy.group(&verdicts)?;
        tracing::info!(count = units.len(), "created units");
        auditor.emit(
            AuditEventType::GroupComplete,
            format!("grouped into {} unit(s)", units.len()),
            json!({ "units": units.iter().map(|u| u.id.as_str()).collect::<Vec<_>>() }),
        );

        let mut summary = RunSummary {
            run_id: auditor.run_id(),
            scanned: files.len(),
            evaluated: verdicts.len(),
            stale,
            units: units.len(),
            ..RunSummary::default()
        };

        let ctx = Arc::new(UnitContext {
            policies,
            resolver,
            template: PrTemplate::new(self.config.pr_template.clone()),
            gateway,
            root: self.root.clone(),
            remote_prefix: self.remote_prefix.clone(),
            base_branch: self.config.global.default_base_branch.clone(),
            commit_message: self.config.global.commit_message.clone(),
            now,
            auditor: auditor.clone(),
        });

        let semaphore = Arc::new(Semaphore::new(self.config.global.max_concurrent_prs.max(1)));
        let mut set = JoinSet::new();
        let mut unit_ids: HashMap<task::Id, String> = HashMap::with_capacity(summary.units);
        for (idx, unit) in units.into_iter().enumerate() {
            let ctx = Arc::clone(&ctx);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let unit_id = unit.id.clone();
            let handle = set.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    () = cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let result = match permit {
                    Some(_permit) if !cancel.is_cancelled() => ctx.process(&unit).await,
                    _ => Ok(UnitOutcome::Cancelled),
                };
                ctx.report(&unit, &result);
                (idx, unit.id, result)
            });
            unit_ids.insert(handle.id(), unit_id);
        }

        let mut results = Vec::with_capacity(summary.units);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => {
                    let unit = unit_ids.remove(&e.id()).unwrap_or_default();
                    tracing::error!(unit = %unit, error = %e, "unit task did not complete");
                    auditor.emit_error(
                        AuditEventType::PrError,
                        format!("failed to process {unit}"),
                        json!({ "unit": unit }),
                        &e,
                    );
                    summary.failed += 1;
                    summary.failures.push(UnitFailure {
                        unit,
                        error: e.to_string(),
                    });
                }
            }
        }
        results.sort_by_key(|(idx, ..)| *idx);

        for (_, unit, result) in results {
            match result {
                Ok(UnitOutcome::Materialized(Materialized::Created(pr))) => {
                    summary.processed += 1;
                    summary.created += 1;
                    summary.prs.push(pr);
                }
                Ok(UnitOutcome::Materialized(Materialized::AlreadyOpen)) => {
                    summary.processed += 1;
                    summary.already_open += 1;
                }
                Ok(UnitOutcome::DryRun(request)) => {
                    summary.processed += 1;
                    summary.dry_run += 1;
                    summary.planned.push(request);
                }
                Ok(UnitOutcome::Cancelled) => summary.cancelled += 1,
                Err(e) => {
                    summary.failed += 1;
                    summary.failures.push(UnitFailure {
                        unit,
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(summary)
    }

    /// Attach last-commit data. Files without history keep no timestamp and
    /// are evaluated as never recertified.
    fn enrich(&self, files: &mut [FileRecord]) {
        let mut missing = 0usize;
        for file in files.iter_mut() {
            match self.history.last_modification(&file.path) {
                Ok((when, commit)) => {
                    file.last_modified = Some(when);
                    file.commit = Some(commit);
                }
                Err(e) => {
                    missing += 1;
                    tracing::debug!(file = %file.path, error = %e, "no history for file");
                }
            }
        }
        if missing > 0 {
            tracing::warn!(
                missing,
                total = files.len(),
                "files without history are treated as never recertified"
            );
        }
    }
}

/// State shared by every unit task of a run.
struct UnitContext {
    policies: PolicySet,
    resolver: AssignmentResolver,
    template: PrTemplate,
    gateway: Option<Arc<dyn ProviderGateway>>,
    root: PathBuf,
    remote_prefix: String,
    base_branch: String,
    commit_message: String,
    now: DateTime<Utc>,
    auditor: Auditor,
}

impl UnitContext {
    async fn process(&self, unit: &ReviewUnit) -> Result<UnitOutcome, RecertError> {
        tracing::debug!(
            unit = %unit.id,
            strategy = %unit.strategy,
            files = unit.verdicts.len(),
            "processing unit"
        );
        let outcome = self.resolver.resolve(unit)?;
        let mut request = self.template.render(unit, &outcome, &self.base_branch);

        let Some(gateway) = self.gateway.as_deref() else {
            tracing::info!(
                unit = %unit.id,
                title = %request.title,
                branch = %request.branch,
                assignees = ?request.assignees,
                "dry run: would create pull request"
            );
            return Ok(UnitOutcome::DryRun(request));
        };

        request.changes = changes::plan(
            &self.root,
            &self.remote_prefix,
            unit,
            &self.policies,
            self.now,
        )?;
        let materialized = materialize(gateway, &request, &self.commit_message).await?;
        Ok(UnitOutcome::Materialized(materialized))
    }

    fn report(&self, unit: &ReviewUnit, result: &Result<UnitOutcome, RecertError>) {
        let branch = unit.branch();
        match result {
            Ok(UnitOutcome::Materialized(Materialized::Created(pr))) => {
                tracing::info!(unit = %unit.id, url = %pr.url, number = pr.number, "created pull request");
                self.auditor.emit(
                    AuditEventType::PrCreated,
                    format!("created pull request for {}", unit.id),
                    json!({ "unit": unit.id, "branch": branch, "url": pr.url, "number": pr.number }),
                );
            }
            Ok(UnitOutcome::Materialized(Materialized::AlreadyOpen)) => {
                tracing::info!(unit = %unit.id, branch = %branch, "pull request already open");
                self.auditor.emit(
                    AuditEventType::PrSkipped,
                    format!("pull request for {} already open", unit.id),
                    json!({ "unit": unit.id, "branch": branch, "reason": "already_open" }),
                );
            }
            Ok(UnitOutcome::DryRun(request)) => {
                self.auditor.emit(
                    AuditEventType::PrSkipped,
                    format!("dry run: would create {}", request.title),
                    json!({ "unit": unit.id, "branch": branch, "reason": "dry_run" }),
                );
            }
            Ok(UnitOutcome::Cancelled) => {
                tracing::debug!(unit = %unit.id, "unit not started: run cancelled");
                self.auditor.emit(
                    AuditEventType::PrSkipped,
                    format!("{} not started: run cancelled", unit.id),
                    json!({ "unit": unit.id, "reason": "cancelled" }),
                );
            }
            Err(e) => {
                tracing::error!(unit = %unit.id, error = %e, "failed to process unit");
                self.auditor.emit_error(
                    AuditEventType::PrError,
                    format!("failed to process {}", unit.id),
                    json!({ "unit": unit.id, "branch": branch }),
                    e,
                );
            }
        }
    }
}

/// Make `request` exist on the backend, creating only what is missing.
///
/// 1. If the branch exists and a pull request from it into the base is
///    open, stop.
/// 2. Otherwise create the branch if it is absent and commit the changes.
///    A branch left behind by an earlier failed attempt gets the commit too,
///    so a pull request is never opened on a branch without it.
/// 3. Open the pull request, then assign, request reviewers and label it.
///    Failures in these follow-ups are logged only.
///
/// Running this twice against an unchanged backend performs the two
/// existence checks and nothing else the second time.
///
/// # Errors
///
/// Returns [`RecertError::NothingToCommit`] when a pull request would be
/// opened without changes, and any gateway error from the existence checks,
/// branch, commit, or pull request creation.
pub async fn materialize(
    gateway: &dyn ProviderGateway,
    request: &PrRequest,
    commit_message: &str,
) -> Result<Materialized, RecertError> {
    let branch = request.branch.as_str();
    let base = request.base_branch.as_str();

    let branch_existed = gateway.branch_exists(branch).await?;
    if branch_existed && gateway.pull_request_exists(branch, base).await? {
        return Ok(Materialized::AlreadyOpen);
    }
    if request.changes.is_empty() {
        return Err(RecertError::NothingToCommit(branch.to_string()));
    }

    if branch_existed {
        tracing::debug!(branch, "branch exists without a pull request, committing onto it");
    } else {
        gateway.ensure_branch(branch, base).await?;
    }
    let commit = gateway
        .create_commit(branch, commit_message, &request.changes)
        .await?;
    tracing::debug!(branch, commit = %commit, files = request.changes.len(), "committed changes");

    let pr = gateway.ensure_pull_request(request).await?;
    if let Err(e) = gateway.assign(&pr, &request.assignees).await {
        tracing::warn!(number = pr.number, error = %e, "failed to assign pull request");
    }
    if let Err(e) = gateway.request_reviewers(&pr, &request.reviewers).await {
        tracing::warn!(number = pr.number, error = %e, "failed to request reviewers");
    }
    if let Err(e) = gateway.add_labels(&pr, &request.labels).await {
        tracing::warn!(number = pr.number, error = %e, "failed to add labels");
    }
    Ok(Materialized::Created(pr))
}
