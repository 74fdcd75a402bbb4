//! Orchestrator behaviour against an in-memory backend that records every call.

use std::collections::HashSet;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use recert_core::{FileChange, PrRequest, RecertConfig, RecertError, RemotePr};
use recert_engine::{
    materialize, AuditEvent, AuditEventType, JsonlAuditSink, Materialized, Orchestrator,
};
use recert_provider::ProviderGateway;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const CHECKS: [&str; 2] = ["branch_exists", "find_pull_request"];

#[derive(Default)]
struct Remote {
    branches: HashSet<String>,
    commits: Vec<(String, Vec<FileChange>)>,
    prs: Vec<(String, RemotePr)>,
    calls: Vec<String>,
}

#[derive(Default)]
struct RecordingGateway {
    remote: Mutex<Remote>,
    failing_branches: HashSet<String>,
    panicking_branches: HashSet<String>,
    failing_labels: bool,
    /// Number of upcoming `create_commit` calls that fail.
    failing_commits: AtomicUsize,
    /// Number of upcoming `ensure_pull_request` calls that fail.
    failing_prs: AtomicUsize,
}

/// Consume one pending failure from `counter`, if any.
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl RecordingGateway {
    fn failing_on(branch: &str) -> Self {
        Self {
            failing_branches: HashSet::from([branch.to_string()]),
            ..Self::default()
        }
    }

    fn record(&self, call: &str) {
        self.remote.lock().unwrap().calls.push(call.to_string());
    }

    fn calls(&self) -> Vec<String> {
        self.remote.lock().unwrap().calls.clone()
    }

    fn mutations(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| !CHECKS.contains(&c.as_str()))
            .count()
    }

    fn branch_count(&self) -> usize {
        self.remote.lock().unwrap().branches.len()
    }

    fn commit_count(&self) -> usize {
        self.remote.lock().unwrap().commits.len()
    }

    fn pr_heads(&self) -> Vec<String> {
        let mut heads: Vec<String> = self
            .remote
            .lock()
            .unwrap()
            .prs
            .iter()
            .map(|(head, _)| head.clone())
            .collect();
        heads.sort();
        heads
    }

    fn seed(&self, branch: &str, with_pr: bool) {
        let mut remote = self.remote.lock().unwrap();
        remote.branches.insert(branch.to_string());
        if with_pr {
            let number = remote.prs.len() as u64 + 1;
            remote.prs.push((branch.to_string(), pr(number)));
        }
    }
}

fn pr(number: u64) -> RemotePr {
    RemotePr {
        id: number.to_string(),
        url: format!("https://git.example.com/acme/infra/pull/{number}"),
        number,
        state: "open".into(),
        created_at: None,
    }
}

#[async_trait]
impl ProviderGateway for RecordingGateway {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool, RecertError> {
        self.record("branch_exists");
        Ok(self.remote.lock().unwrap().branches.contains(branch))
    }

    async fn ensure_branch(&self, branch: &str, _base: &str) -> Result<(), RecertError> {
        self.record("ensure_branch");
        if self.failing_branches.contains(branch) {
            return Err(RecertError::provider("recording", format!("cannot create {branch}")));
        }
        if self.panicking_branches.contains(branch) {
            panic!("backend crashed on {branch}");
        }
        self.remote.lock().unwrap().branches.insert(branch.to_string());
        Ok(())
    }

    async fn create_commit(
        &self,
        branch: &str,
        _message: &str,
        changes: &[FileChange],
    ) -> Result<String, RecertError> {
        self.record("create_commit");
        if take_failure(&self.failing_commits) {
            return Err(RecertError::provider("recording", "503 service unavailable"));
        }
        let mut remote = self.remote.lock().unwrap();
        remote.commits.push((branch.to_string(), changes.to_vec()));
        Ok(format!("sha{}", remote.commits.len()))
    }

    async fn find_pull_request(
        &self,
        head: &str,
        _base: &str,
    ) -> Result<Option<RemotePr>, RecertError> {
        self.record("find_pull_request");
        let remote = self.remote.lock().unwrap();
        Ok(remote
            .prs
            .iter()
            .find(|(h, _)| h == head)
            .map(|(_, pr)| pr.clone()))
    }

    async fn ensure_pull_request(&self, request: &PrRequest) -> Result<RemotePr, RecertError> {
        self.record("ensure_pull_request");
        if take_failure(&self.failing_prs) {
            return Err(RecertError::provider("recording", "502 bad gateway"));
        }
        let mut remote = self.remote.lock().unwrap();
        let created = pr(remote.prs.len() as u64 + 1);
        remote.prs.push((request.branch.clone(), created.clone()));
        Ok(created)
    }

    async fn assign(&self, _pr: &RemotePr, _assignees: &[String]) -> Result<(), RecertError> {
        self.record("assign");
        Ok(())
    }

    async fn request_reviewers(
        &self,
        _pr: &RemotePr,
        _reviewers: &[String],
    ) -> Result<(), RecertError> {
        self.record("request_reviewers");
        Ok(())
    }

    async fn add_labels(&self, _pr: &RemotePr, _labels: &[String]) -> Result<(), RecertError> {
        self.record("add_labels");
        if self.failing_labels {
            return Err(RecertError::provider("recording", "labels are locked"));
        }
        Ok(())
    }

    async fn add_comment(&self, _pr: &RemotePr, _body: &str) -> Result<(), RecertError> {
        self.record("add_comment");
        Ok(())
    }
}

const CONFIG: &str = r##"
[repository]
url = "https://github.com/acme/infra"

[[policies]]
name = "terraform"
include = ["*.tf"]
interval_days = 90
decorator = "# recertified {timestamp}"

[pr_strategy]
type = "per_file"

[assignment]
strategy = "static"
fallback_assignees = ["infra-team"]
"##;

/// A checkout with three never-committed Terraform files.
fn checkout() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for name in ["a.tf", "b.tf", "c.tf"] {
        fs::write(dir.path().join(name), format!("# {name}\nresource \"null\" \"x\" {{}}\n"))
            .unwrap();
    }
    dir
}

fn config() -> RecertConfig {
    RecertConfig::from_toml(CONFIG).unwrap()
}

fn orchestrator(dir: &TempDir, config: RecertConfig, gateway: &Arc<RecordingGateway>) -> Orchestrator {
    Orchestrator::new(config, dir.path())
        .unwrap()
        .with_gateway(Arc::clone(gateway) as Arc<dyn ProviderGateway>)
}

fn request(branch: &str) -> PrRequest {
    PrRequest {
        title: "Recertify terraform: 1 file(s)".into(),
        branch: branch.into(),
        base_branch: "main".into(),
        changes: vec![FileChange::update("a.tf", "# recertified\n")],
        labels: vec!["recertification".into()],
        ..PrRequest::default()
    }
}

#[tokio::test]
async fn run_creates_one_pr_per_unit() {
    let dir = checkout();
    let gateway = Arc::new(RecordingGateway::default());
    let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();

    let summary = orchestrator(&dir, config(), &gateway)
        .run_at(now, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.scanned, 3);
    assert_eq!(summary.stale, 3);
    assert_eq!(summary.units, 3);
    assert_eq!(summary.created, 3);
    assert_eq!(summary.processed, 3);
    assert_eq!(summary.failed, 0);
    assert_eq!(
        gateway.pr_heads(),
        vec!["recert/file-a.tf", "recert/file-b.tf", "recert/file-c.tf"]
    );

    let remote = gateway.remote.lock().unwrap();
    let (branch, changes) = remote
        .commits
        .iter()
        .find(|(b, _)| b == "recert/file-a.tf")
        .unwrap();
    assert_eq!(branch, "recert/file-a.tf");
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].path, "a.tf");
    assert!(changes[0]
        .content
        .as_deref()
        .unwrap()
        .starts_with("# recertified 2025-06-01T12:00:00Z\n# a.tf\n"));
}

#[tokio::test]
async fn second_run_changes_nothing() {
    let dir = checkout();
    let gateway = Arc::new(RecordingGateway::default());
    let orchestrator = orchestrator(&dir, config(), &gateway);

    let first = orchestrator.run(CancellationToken::new()).await.unwrap();
    assert_eq!(first.created, 3);
    let mutations = gateway.mutations();

    let second = orchestrator.run(CancellationToken::new()).await.unwrap();
    assert_eq!(second.created, 0);
    assert_eq!(second.already_open, 3);
    assert_eq!(second.processed, 3);

    assert_eq!(gateway.branch_count(), 3);
    assert_eq!(gateway.commit_count(), 3);
    assert_eq!(gateway.pr_heads().len(), 3);
    assert_eq!(gateway.mutations(), mutations);
}

#[tokio::test]
async fn existing_branch_and_pr_only_checks() {
    let gateway = RecordingGateway::default();
    gateway.seed("recert/file-a.tf", true);

    let result = materialize(&gateway, &request("recert/file-a.tf"), "Trigger recertification")
        .await
        .unwrap();

    assert_eq!(result, Materialized::AlreadyOpen);
    assert_eq!(gateway.calls(), vec!["branch_exists", "find_pull_request"]);
    assert_eq!(gateway.mutations(), 0);
}

#[tokio::test]
async fn existing_branch_without_pr_is_committed_before_opening() {
    let gateway = RecordingGateway::default();
    gateway.seed("recert/file-a.tf", false);

    let result = materialize(&gateway, &request("recert/file-a.tf"), "Trigger recertification")
        .await
        .unwrap();

    assert!(matches!(result, Materialized::Created(_)));
    assert_eq!(gateway.commit_count(), 1);
    let calls = gateway.calls();
    assert!(!calls.contains(&"ensure_branch".to_string()));
    let commit = calls.iter().position(|c| c == "create_commit").unwrap();
    let open = calls.iter().position(|c| c == "ensure_pull_request").unwrap();
    assert!(commit < open);
}

#[tokio::test]
async fn failed_commit_is_retried_on_the_next_attempt() {
    let gateway = RecordingGateway {
        failing_commits: AtomicUsize::new(1),
        ..RecordingGateway::default()
    };
    let req = request("recert/file-a.tf");

    let err = materialize(&gateway, &req, "Trigger recertification")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("503"));
    // The branch was created but holds no commit and no pull request.
    assert_eq!(gateway.branch_count(), 1);
    assert_eq!(gateway.commit_count(), 0);
    assert!(gateway.pr_heads().is_empty());

    let result = materialize(&gateway, &req, "Trigger recertification").await.unwrap();
    assert!(matches!(result, Materialized::Created(_)));
    assert_eq!(gateway.branch_count(), 1);
    assert_eq!(gateway.commit_count(), 1);
    assert_eq!(gateway.pr_heads(), vec!["recert/file-a.tf"]);

    let third = materialize(&gateway, &req, "Trigger recertification").await.unwrap();
    assert_eq!(third, Materialized::AlreadyOpen);
    assert_eq!(gateway.commit_count(), 1);
}

#[tokio::test]
async fn failed_pull_request_is_opened_by_the_next_run() {
    let dir = checkout();
    let gateway = Arc::new(RecordingGateway {
        failing_prs: AtomicUsize::new(1),
        ..RecordingGateway::default()
    });
    let orchestrator = orchestrator(&dir, config(), &gateway);

    let first = orchestrator.run(CancellationToken::new()).await.unwrap();
    assert_eq!(first.failed, 1);
    assert_eq!(first.created, 2);
    assert!(first.failures[0].error.contains("502"));
    let failed_unit = first.failures[0].unit.clone();

    let second = orchestrator.run(CancellationToken::new()).await.unwrap();
    assert_eq!(second.failed, 0);
    assert_eq!(second.created, 1);
    assert_eq!(second.already_open, 2);
    assert_eq!(
        second.prs[0].url,
        "https://git.example.com/acme/infra/pull/3"
    );
    assert_eq!(
        gateway.pr_heads(),
        vec!["recert/file-a.tf", "recert/file-b.tf", "recert/file-c.tf"]
    );
    // Every pull request sits on a branch carrying at least one commit.
    let remote = gateway.remote.lock().unwrap();
    for (head, _) in &remote.prs {
        assert!(remote.commits.iter().any(|(b, _)| b == head), "{head} has no commit");
    }
    assert_eq!(remote.branches.len(), 3);
    let retried = format!("recert/{failed_unit}");
    assert_eq!(remote.commits.iter().filter(|(b, _)| *b == retried).count(), 2);
}

#[tokio::test]
async fn materialize_twice_is_idempotent() {
    let gateway = RecordingGateway::default();
    let req = request("recert/all-files");

    let first = materialize(&gateway, &req, "Trigger recertification").await.unwrap();
    let second = materialize(&gateway, &req, "Trigger recertification").await.unwrap();

    assert!(matches!(first, Materialized::Created(_)));
    assert_eq!(second, Materialized::AlreadyOpen);
    assert_eq!(gateway.branch_count(), 1);
    assert_eq!(gateway.commit_count(), 1);
    assert_eq!(gateway.pr_heads(), vec!["recert/all-files"]);
}

#[tokio::test]
async fn missing_branch_without_changes_is_refused() {
    let gateway = RecordingGateway::default();
    let mut req = request("recert/file-a.tf");
    req.changes.clear();

    let err = materialize(&gateway, &req, "Trigger recertification")
        .await
        .unwrap_err();

    assert!(matches!(err, RecertError::NothingToCommit(_)));
    assert_eq!(gateway.calls(), vec!["branch_exists"]);
}

#[tokio::test]
async fn follow_up_failures_do_not_fail_the_unit() {
    let gateway = RecordingGateway {
        failing_labels: true,
        ..RecordingGateway::default()
    };

    let result = materialize(&gateway, &request("recert/file-a.tf"), "Trigger recertification")
        .await
        .unwrap();

    assert!(matches!(result, Materialized::Created(_)));
    assert!(gateway.calls().contains(&"add_labels".to_string()));
}

#[tokio::test]
async fn failing_unit_does_not_stop_the_others() {
    let dir = checkout();
    let gateway = Arc::new(RecordingGateway::failing_on("recert/file-b.tf"));
    let mut config = config();
    config.global.max_concurrent_prs = 2;

    let summary = orchestrator(&dir, config, &gateway)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.units, 3);
    assert_eq!(summary.created, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.failures[0].unit, "file-b.tf");
    assert!(summary.failures[0].error.contains("cannot create recert/file-b.tf"));
    assert_eq!(gateway.pr_heads(), vec!["recert/file-a.tf", "recert/file-c.tf"]);
}

#[tokio::test]
async fn undecorated_policy_is_rejected_before_any_unit() {
    let dir = checkout();
    let gateway = Arc::new(RecordingGateway::default());
    let mut config = config();
    config.policies[0].decorator = None;

    let err = orchestrator(&dir, config, &gateway)
        .run(CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.is_config());
    assert!(err.to_string().contains("'terraform' has no decorator"));
    assert!(gateway.calls().is_empty());
}

#[tokio::test]
async fn undecorated_policy_still_plans_a_dry_run() {
    let dir = checkout();
    let gateway = Arc::new(RecordingGateway::default());
    let mut config = config();
    config.policies[0].decorator = None;
    config.global.dry_run = true;

    let summary = orchestrator(&dir, config, &gateway)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.dry_run, 3);
    assert_eq!(summary.failed, 0);
}

#[tokio::test]
async fn panicking_unit_is_reported_by_id() {
    let dir = checkout();
    let gateway = Arc::new(RecordingGateway {
        panicking_branches: HashSet::from(["recert/file-b.tf".to_string()]),
        ..RecordingGateway::default()
    });

    let summary = orchestrator(&dir, config(), &gateway)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.created, 2);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].unit, "file-b.tf");
    assert!(summary.failures[0].error.contains("panicked"));
}

#[tokio::test]
async fn dry_run_makes_no_gateway_calls() {
    let dir = checkout();
    let gateway = Arc::new(RecordingGateway::default());
    let mut config = config();
    config.global.dry_run = true;

    let summary = orchestrator(&dir, config, &gateway)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.dry_run, 3);
    assert_eq!(summary.processed, 3);
    assert_eq!(summary.planned.len(), 3);
    assert_eq!(summary.planned[0].branch, "recert/file-a.tf");
    assert_eq!(summary.planned[0].assignees, vec!["infra-team"]);
    assert!(summary.planned[0].changes.is_empty());
    assert!(gateway.calls().is_empty());
}

#[tokio::test]
async fn dry_run_needs_no_gateway() {
    let dir = checkout();
    let mut config = config();
    config.global.dry_run = true;

    let summary = Orchestrator::new(config, dir.path())
        .unwrap()
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.dry_run, 3);
}

#[tokio::test]
async fn missing_gateway_is_a_config_error() {
    let dir = checkout();
    let err = Orchestrator::new(config(), dir.path())
        .unwrap()
        .run(CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_config());
}

#[tokio::test]
async fn cancelled_run_starts_no_units() {
    let dir = checkout();
    let gateway = Arc::new(RecordingGateway::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = orchestrator(&dir, config(), &gateway).run(cancel).await.unwrap();

    assert_eq!(summary.units, 3);
    assert_eq!(summary.cancelled, 3);
    assert_eq!(summary.processed, 0);
    assert!(gateway.calls().is_empty());
}

#[tokio::test]
async fn audit_log_records_the_run() {
    let dir = checkout();
    let audit_dir = tempfile::tempdir().unwrap();
    let gateway = Arc::new(RecordingGateway::failing_on("recert/file-c.tf"));
    let sink = Arc::new(JsonlAuditSink::new(audit_dir.path()));

    let summary = orchestrator(&dir, config(), &gateway)
        .with_audit(Arc::clone(&sink) as Arc<dyn recert_engine::AuditSink>)
        .run(CancellationToken::new())
        .await
        .unwrap();

    let mut events: Vec<AuditEvent> = Vec::new();
    for entry in fs::read_dir(audit_dir.path()).unwrap() {
        let content = fs::read_to_string(entry.unwrap().path()).unwrap();
        events.extend(content.lines().map(|l| serde_json::from_str::<AuditEvent>(l).unwrap()));
    }
    events.sort_by_key(|e| e.timestamp);
    let kinds: Vec<AuditEventType> = events.iter().map(|e| e.event_type).collect();

    assert_eq!(kinds.first(), Some(&AuditEventType::RunStart));
    assert_eq!(kinds.last(), Some(&AuditEventType::RunEnd));
    assert!(kinds.contains(&AuditEventType::ScanComplete));
    assert!(kinds.contains(&AuditEventType::CheckComplete));
    assert!(kinds.contains(&AuditEventType::GroupComplete));
    assert_eq!(kinds.iter().filter(|k| **k == AuditEventType::PrCreated).count(), 2);

    let error = events
        .iter()
        .find(|e| e.event_type == AuditEventType::PrError)
        .unwrap();
    assert!(error.error.as_deref().unwrap().contains("recert/file-c.tf"));
    assert!(events.iter().all(|e| e.run_id == summary.run_id));
    assert_eq!(
        events[0].repository.as_deref(),
        Some("https://github.com/acme/infra")
    );
}
