use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use miette::{Context, IntoDiagnostic, Result};
use recert_core::{OutputFormat, Priority, RecertConfig, Verdict};
use recert_engine::{Orchestrator, RunSummary};
use recert_scan::{Checker, FsScanner, GitHistory, HistoryProvider, NoHistory, PolicySet, Scanner};
use tokio_util::sync::CancellationToken;

const CONFIG_FILE: &str = ".recert.toml";

#[derive(Parser)]
#[command(
    name = "recert",
    version,
    about = "Recertify stale Infrastructure-as-Code files through pull requests",
    long_about = "Recert finds IaC files that nobody has reviewed within their policy interval,\n\
                   groups them, assigns owners, and opens one pull request per group on\n\
                   GitHub, Azure DevOps, or GitLab. Existing branches and pull requests are\n\
                   reused, so running it on a schedule is safe.\n\n\
                   Examples:\n  \
                     recert init                     Create a .recert.toml config file\n  \
                     recert check                    List files due for recertification\n  \
                     recert check --fail-on high     Fail CI when High or Critical files exist\n  \
                     recert run --dry-run            Show the pull requests a run would open\n  \
                     recert run                      Open recertification pull requests"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (default: .recert.toml)
    #[arg(long, global = true, env = "RECERT_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(
        long,
        global = true,
        default_value = "text",
        long_help = "Output format for command results.\n\n\
                       Formats:\n  \
                         text      Human-readable tables and summaries (default)\n  \
                         json      Machine-readable JSON with camelCase keys\n  \
                         markdown  GitHub-flavored Markdown"
    )]
    format: OutputFormat,

    /// Enable debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Log line format (logs go to stderr; RECERT_LOG overrides the level)
    #[arg(long, global = true, default_value = "text")]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Command {
    /// Open pull requests for files due for recertification
    #[command(long_about = "Open pull requests for files due for recertification.\n\n\
        Scans the checkout, reads last-commit dates from git, groups stale files\n\
        by the configured strategy, and materializes one branch, commit, and pull\n\
        request per group. The provider token is read from the environment\n\
        variable named by repository.token_env (default: RECERT_TOKEN).\n\n\
        Examples:\n  recert run --dry-run\n  recert run --path infra --max-concurrent 4")]
    Run {
        /// Checkout to scan (default: current directory)
        #[arg(long, default_value = ".")]
        path: PathBuf,

        /// Plan pull requests without contacting the provider
        #[arg(long)]
        dry_run: bool,

        /// Number of units materialized in parallel (overrides global.max_concurrent_prs)
        #[arg(long)]
        max_concurrent: Option<usize>,
    },
    /// List files and their recertification status
    #[command(long_about = "List files and their recertification status.\n\n\
        Evaluates every file matched by a policy against its interval and prints\n\
        the stale ones, most urgent first. Never contacts the provider.\n\n\
        Examples:\n  recert check\n  recert check --all --format json\n  recert check --fail-on critical")]
    Check {
        /// Checkout to scan (default: current directory)
        #[arg(long, default_value = ".")]
        path: PathBuf,

        /// Include files that are not yet due
        #[arg(long)]
        all: bool,

        /// Exit with non-zero code if a stale file has this priority or higher
        #[arg(
            long,
            long_help = "Exit with non-zero code if a stale file has this priority or higher.\n\n\
                Priority ranking: critical > high > medium > low.\n\
                Useful in CI pipelines to block merges while reviews are overdue."
        )]
        fail_on: Option<Priority>,
    },
    /// Create a default .recert.toml configuration file
    #[command(long_about = "Create a default .recert.toml configuration file.\n\n\
        Generates a commented template with all available options.\n\
        Fails if .recert.toml already exists.")]
    Init,
    /// Generate shell completion scripts
    #[command(hide = true)]
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per line
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .build(),
        )
    }))
    .into_diagnostic()?;
    human_panic::setup_panic!();

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format)?;

    match cli.command {
        None => {
            Cli::command().print_help().into_diagnostic()?;
        }
        Some(Command::Run {
            path,
            dry_run,
            max_concurrent,
        }) => {
            let mut config = load_config(cli.config.as_deref())?;
            if dry_run {
                config.global.dry_run = true;
            }
            if let Some(n) = max_concurrent {
                config.global.max_concurrent_prs = n;
            }

            let (history, prefix) = open_history(&path);
            let mut orchestrator = Orchestrator::new(config, path.clone())?
                .with_history(history)
                .with_remote_prefix(prefix);
            if !orchestrator.config().global.dry_run {
                orchestrator.config().require_decorators()?;
                let gateway = recert_provider::connect(&orchestrator.config().repository)
                    .wrap_err("failed to connect to the provider (use --dry-run to plan offline)")?;
                orchestrator = orchestrator.with_gateway(gateway);
            }

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupted: no new units will start");
                    on_interrupt.cancel();
                }
            });

            let summary = orchestrator.run(cancel).await?;
            print!("{}", render_summary(&summary, cli.format)?);
            if summary.failed > 0 {
                std::process::exit(1);
            }
        }
        Some(Command::Check {
            path,
            all,
            fail_on,
        }) => {
            let config = load_config(cli.config.as_deref())?;
            config.validate()?;
            let policies = PolicySet::compile(&config.policies)?;

            let mut files = FsScanner::default().scan(&path, &policies)?;
            let (history, _) = open_history(&path);
            for file in &mut files {
                if let Ok((when, commit)) = history.last_modification(&file.path) {
                    file.last_modified = Some(when);
                    file.commit = Some(commit);
                }
            }

            let mut verdicts = Checker::new(&policies).check(&files, Utc::now());
            let evaluated = verdicts.len();
            if !all {
                verdicts.retain(|v| v.needs_recertification);
            }
            verdicts.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(b.days_since.cmp(&a.days_since))
                    .then(a.file.path.cmp(&b.file.path))
            });
            print!("{}", render_verdicts(&verdicts, evaluated, cli.format)?);

            if let Some(threshold) = fail_on {
                let blocking = verdicts
                    .iter()
                    .filter(|v| v.needs_recertification && v.priority >= threshold)
                    .count();
                if blocking > 0 {
                    eprintln!("{blocking} file(s) at {threshold} priority or higher are overdue");
                    std::process::exit(1);
                }
            }
        }
        Some(Command::Init) => {
            let path = Path::new(CONFIG_FILE);
            if path.exists() {
                miette::bail!("{CONFIG_FILE} already exists");
            }
            std::fs::write(path, DEFAULT_CONFIG).into_diagnostic()?;
            println!("Created {CONFIG_FILE} with default configuration");
        }
        Some(Command::Completions { shell }) => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "recert", &mut std::io::stdout());
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool, format: LogFormat) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_env("RECERT_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| miette::miette!("failed to initialize logging: {e}"))
}

fn load_config(explicit: Option<&Path>) -> Result<RecertConfig> {
    let path = explicit.unwrap_or_else(|| Path::new(CONFIG_FILE));
    if explicit.is_none() && !path.exists() {
        miette::bail!("no {CONFIG_FILE} found. Run `recert init` to create one");
    }
    RecertConfig::from_file(path).wrap_err_with(|| format!("failed to load {}", path.display()))
}

/// History for `path`, and its location inside the repository.
///
/// Outside a git repository every file is treated as never recertified.
fn open_history(path: &Path) -> (Arc<dyn HistoryProvider>, String) {
    match GitHistory::open(path) {
        Ok(history) => {
            let prefix = history.prefix().to_string();
            (Arc::new(history), prefix)
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "no git history: every file is treated as never recertified"
            );
            (Arc::new(NoHistory), String::new())
        }
    }
}

fn render_verdicts(verdicts: &[Verdict], evaluated: usize, format: OutputFormat) -> Result<String> {
    let stale = verdicts.iter().filter(|v| v.needs_recertification).count();
    let mut out = String::new();
    match format {
        OutputFormat::Json => {
            out = serde_json::to_string_pretty(verdicts).into_diagnostic()?;
            out.push('\n');
        }
        OutputFormat::Markdown => {
            let _ = writeln!(out, "## Recertification status\n");
            let _ = writeln!(out, "{stale} of {evaluated} file(s) need recertification.\n");
            if !verdicts.is_empty() {
                let _ = writeln!(out, "| Priority | Days | Due | Policy | File |");
                let _ = writeln!(out, "|----------|------|-----|--------|------|");
                for v in verdicts {
                    let _ = writeln!(
                        out,
                        "| {} | {} | {} | {} | `{}` |",
                        v.priority,
                        v.days_since,
                        v.next_due.format("%Y-%m-%d"),
                        v.policy,
                        v.file.path
                    );
                }
            }
        }
        OutputFormat::Text => {
            if !verdicts.is_empty() {
                let width = verdicts.iter().map(|v| v.policy.len()).max().unwrap_or(6).max(6);
                let _ = writeln!(out, "{:<9} {:>6}  {:<10}  {:<width$}  FILE", "PRIORITY", "DAYS", "DUE", "POLICY");
                for v in verdicts {
                    let _ = writeln!(
                        out,
                        "{:<9} {:>6}  {:<10}  {:<width$}  {}",
                        v.priority.to_string(),
                        v.days_since,
                        v.next_due.format("%Y-%m-%d").to_string(),
                        v.policy,
                        v.file.path
                    );
                }
                let _ = writeln!(out);
            }
            let _ = writeln!(out, "{stale} of {evaluated} file(s) need recertification");
        }
    }
    Ok(out)
}

fn render_summary(summary: &RunSummary, format: OutputFormat) -> Result<String> {
    let mut out = String::new();
    match format {
        OutputFormat::Json => {
            out = serde_json::to_string_pretty(summary).into_diagnostic()?;
            out.push('\n');
        }
        OutputFormat::Markdown => {
            let _ = writeln!(out, "## Recertification run `{}`\n", summary.run_id);
            let _ = writeln!(out, "| Files | Stale | Units | Created | Already open | Dry run | Failed | Cancelled |");
            let _ = writeln!(out, "|-------|-------|-------|---------|--------------|---------|--------|-----------|");
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} | {} | {} | {} |",
                summary.scanned,
                summary.stale,
                summary.units,
                summary.created,
                summary.already_open,
                summary.dry_run,
                summary.failed,
                summary.cancelled
            );
            if !summary.prs.is_empty() {
                let _ = writeln!(out, "\n### Pull requests\n");
                for pr in &summary.prs {
                    let _ = writeln!(out, "- [#{}]({})", pr.number, pr.url);
                }
            }
            if !summary.planned.is_empty() {
                let _ = writeln!(out, "\n### Planned\n");
                for request in &summary.planned {
                    let _ = writeln!(out, "- **{}** (`{}`)", request.title, request.branch);
                }
            }
            if !summary.failures.is_empty() {
                let _ = writeln!(out, "\n### Failures\n");
                for failure in &summary.failures {
                    let _ = writeln!(out, "- `{}`: {}", failure.unit, failure.error);
                }
            }
        }
        OutputFormat::Text => {
            for request in &summary.planned {
                let _ = writeln!(out, "would open: {} ({})", request.title, request.branch);
                if !request.assignees.is_empty() {
                    let _ = writeln!(out, "  assignees: {}", request.assignees.join(", "));
                }
            }
            for pr in &summary.prs {
                let _ = writeln!(out, "opened #{}: {}", pr.number, pr.url);
            }
            for failure in &summary.failures {
                let _ = writeln!(out, "failed {}: {}", failure.unit, failure.error);
            }
            let _ = writeln!(
                out,
                "{} stale of {} file(s), {} unit(s): {} created, {} already open, {} planned, {} failed, {} cancelled",
                summary.stale,
                summary.scanned,
                summary.units,
                summary.created,
                summary.already_open,
                summary.dry_run,
                summary.failed,
                summary.cancelled
            );
        }
    }
    Ok(out)
}

const DEFAULT_CONFIG: &str = r##"# Recert configuration

[repository]
url = "https://github.com/your-org/your-infra"
# github, azure, or gitlab
provider = "github"
# Environment variable holding the access token
token_env = "RECERT_TOKEN"
# api_base = "https://github.example.com/api/v3"

[global]
dry_run = false
max_concurrent_prs = 1
default_base_branch = "main"
commit_message = "Trigger recertification"

[[policies]]
name = "terraform"
description = "Terraform modules and stacks"
include = ["**/*.tf", "**/*.tfvars"]
exclude = ["**/.terraform/**"]
interval_days = 180
# Marker written at the top of each file in the recertification commit
decorator = "# Last recertified: {timestamp}"

[pr_strategy]
# per_file, per_pattern, per_committer, single_pr, or plugin
type = "per_pattern"
# max_files_per_pr = 20

[assignment]
# static, last_committer, plugin, or composite
strategy = "last_committer"
fallback_assignees = ["platform-team"]
fallback_reviewers = []

# [[assignment.rules]]
# pattern = "network/**"
# strategy = "static"
# fallback_assignees = ["network-team"]

# [plugins.owners]
# kind = "assignment"
# module = "csv_lookup"
# [plugins.owners.config]
# csv_file = "owners.csv"
# key_regex = 'app\s*=\s*"([^"]+)"'
# key_column = "0"
# value_column = "1"

[pr_template]
title = "Recertify {pattern_name}: {file_count} file(s)"
include_file_list = true
include_checklist = true
labels = ["recertification"]

[audit]
enabled = false
# file (JSON lines under directory) or log (through the logger)
storage = "file"
directory = "./audit"
"##;
