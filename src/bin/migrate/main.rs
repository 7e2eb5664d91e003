//! migrate - operator CLI for pgshift
//!
//! Every command loads the configuration, wires an orchestrator, performs
//! one operation and exits. Exit codes follow the error taxonomy: 0 on
//! success, 75 transient, 65 validation, 70 fatal, 78 configuration.
#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use colored::{ColoredString, Colorize};
use tracing::{debug, warn};

use pgshift::bootstrap::Orchestrator;
use pgshift::config::{Config, LogFormat};
use pgshift::coordinator::{CancelOutcome, JobStatus, ReconcileReport};
use pgshift::error::{EXIT_CONFIG, EXIT_FATAL};
use pgshift::job::{JobSpec, JobState, MigrationJob};
use pgshift::MigrationError;

/// migrate - zero-downtime PostgreSQL migrations
#[derive(Parser, Debug)]
#[command(name = "migrate")]
#[command(author, version, about = "Move PostgreSQL tables onto a new cluster without downtime")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (TOML)
    #[arg(
        short = 'c',
        long = "config",
        value_name = "FILE",
        env = "PGSHIFT_CONFIG",
        default_value = "pgshift.toml",
        global = true
    )]
    config: PathBuf,

    /// Log level: trace, debug, info, warn, error (overrides config file)
    #[arg(
        short = 'l',
        long = "log-level",
        value_name = "LEVEL",
        env = "PGSHIFT_LOG_LEVEL",
        global = true
    )]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a job spec and drive it until Synced (or Completed with auto_cutover)
    Start {
        /// Job spec file (TOML)
        #[arg(long, value_name = "FILE")]
        job: PathBuf,
    },

    /// Show one job, or every known job
    Status {
        /// Job id
        #[arg(long)]
        job: Option<String>,

        /// Print the full record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run the cutover of a Synced job, or finish an interrupted one
    Cutover {
        /// Job id
        #[arg(long)]
        job: String,
    },

    /// Roll a job back onto its source
    Rollback {
        /// Job id
        #[arg(long)]
        job: String,
    },

    /// Cancel a Syncing or Synced job
    Cancel {
        /// Job id
        #[arg(long)]
        job: String,
    },

    /// Start another attempt of a rolled-back or failed job
    Retry {
        /// Job id
        #[arg(long)]
        job: String,
    },

    /// Sweep orphaned slots and resume unfinished jobs
    Reconcile {
        /// Only sweep; do not drive any job
        #[arg(long)]
        no_resume: bool,
    },

    /// Delete the target cluster's primary and measure the promotion
    FailoverTest {
        /// Connection name of the migrated cluster
        #[arg(long)]
        target: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            return ExitCode::from(EXIT_CONFIG as u8);
        }
    };
    if let Some(ref level) = cli.log_level {
        config.logging.level = level.clone();
    }
    init_logging(&config);

    let orchestrator = match Orchestrator::from_config(config).await {
        Ok(orchestrator) => orchestrator,
        Err(e) => return report_error(&e),
    };

    let code = match run(&orchestrator, cli.command).await {
        Ok(code) => code,
        Err(e) => match e.downcast_ref::<MigrationError>() {
            Some(err) => report_error(err),
            None => {
                eprintln!("{} {:#}", "error:".red().bold(), e);
                ExitCode::FAILURE
            }
        },
    };
    orchestrator.shutdown().await;
    code
}

fn init_logging(config: &Config) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn report_error(err: &MigrationError) -> ExitCode {
    eprintln!(
        "{} [{}] {}",
        "error:".red().bold(),
        err.class().to_string().dimmed(),
        err
    );
    ExitCode::from(err.exit_code() as u8)
}

async fn run(orchestrator: &Orchestrator, command: Commands) -> anyhow::Result<ExitCode> {
    match command {
        Commands::Start { job } => cmd_start(orchestrator, &job).await,
        Commands::Status { job, json } => cmd_status(orchestrator, job.as_deref(), json).await,
        Commands::Cutover { job } => {
            println!("{} Cutting over {}...", "→".cyan().bold(), job.yellow());
            let job = orchestrator.coordinator.cutover(&job).await?;
            Ok(finish(&job))
        }
        Commands::Rollback { job } => {
            println!("{} Rolling back {}...", "→".cyan().bold(), job.yellow());
            let job = orchestrator.coordinator.rollback(&job).await?;
            print_job(&job);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Cancel { job } => cmd_cancel(orchestrator, &job).await,
        Commands::Retry { job } => {
            sweep(orchestrator).await;
            println!("{} Retrying {}...", "→".cyan().bold(), job.yellow());
            let job = orchestrator.coordinator.retry(&job).await?;
            Ok(finish(&job))
        }
        Commands::Reconcile { no_resume } => {
            let report = orchestrator.coordinator.reconcile(!no_resume).await?;
            print_reconcile(&report);
            Ok(if report.errors.is_empty() && report.sweep.errors.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EXIT_FATAL as u8)
            })
        }
        Commands::FailoverTest { target } => cmd_failover(orchestrator, &target).await,
    }
}

// ── Start ────────────────────────────────────────────────────────────

async fn cmd_start(orchestrator: &Orchestrator, path: &Path) -> anyhow::Result<ExitCode> {
    let spec = JobSpec::from_file(path).map_err(MigrationError::from)?;
    sweep(orchestrator).await;

    println!(
        "{} Starting {} ({} → {}, {} tables)...",
        "→".cyan().bold(),
        spec.id.yellow(),
        spec.source.yellow(),
        spec.target.yellow(),
        spec.tables.len()
    );
    let job = orchestrator.coordinator.start(spec).await?;
    Ok(finish(&job))
}

async fn sweep(orchestrator: &Orchestrator) {
    let report = orchestrator.coordinator.sweep_orphans().await;
    for slot in &report.torn_down {
        println!("  {} removed orphaned slot {}", "✓".green(), slot);
    }
    for (what, reason) in &report.errors {
        warn!(%what, %reason, "orphan sweep incomplete");
    }
}

/// Print a job and map its state to an exit code.
fn finish(job: &MigrationJob) -> ExitCode {
    print_job(job);
    match job.state {
        JobState::Failed => {
            let code = job
                .last_error
                .as_ref()
                .map(|e| e.class.exit_code())
                .unwrap_or(EXIT_FATAL);
            ExitCode::from(code as u8)
        }
        JobState::RolledBack => ExitCode::from(EXIT_FATAL as u8),
        _ => ExitCode::SUCCESS,
    }
}

// ── Status ───────────────────────────────────────────────────────────

async fn cmd_status(
    orchestrator: &Orchestrator,
    job: Option<&str>,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let Some(id) = job else {
        let jobs = orchestrator.coordinator.list().await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&jobs)?);
            return Ok(ExitCode::SUCCESS);
        }
        if jobs.is_empty() {
            println!("{}", "No jobs.".dimmed());
        }
        for job in &jobs {
            println!(
                "  {:24} {:24} attempt {:<3} {}",
                job.id(),
                paint(job.state),
                job.attempt,
                job.updated_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed()
            );
        }
        return Ok(ExitCode::SUCCESS);
    };

    let status = orchestrator.coordinator.status(id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status.job)?);
    } else {
        print_status(&status);
    }
    Ok(ExitCode::SUCCESS)
}

fn print_status(status: &JobStatus) {
    let job = &status.job;
    print_job(job);

    println!("{}", "Coordination".bold().underline());
    match status.lease {
        Some(ref lease) => println!(
            "  Lease:        {} until {}",
            lease.owner,
            lease.expires_at.format("%H:%M:%S")
        ),
        None => println!("  Lease:        {}", "free".dimmed()),
    }
    println!(
        "  Primary:      {}",
        status.primary_write.as_deref().unwrap_or("-")
    );
    if status.cancel_requested {
        println!("  Cancel:       {}", "requested".yellow());
    }
    if status.archived {
        println!("  Record:       {}", "archived".dimmed());
    }
    println!();

    if let Some(ref snapshot) = job.snapshot {
        println!("{}", "Snapshot".bold().underline());
        println!("  Key:          {}", snapshot.key);
        println!("  LSN:          {}", snapshot.consistent_lsn);
        println!("  Size:         {}", format_bytes(snapshot.bytes));
        println!();
    }

    if let Some(ref handle) = job.replication {
        println!("{}", "Replication".bold().underline());
        println!("  Slot:         {}", handle.slot);
        println!("  Subscription: {}", handle.subscription);
        println!(
            "  Confirmed:    {}",
            handle
                .last_confirmed_lsn
                .map(|l| l.to_string())
                .unwrap_or_else(|| "-".into())
        );
        println!(
            "  Lag:          {}",
            match (handle.last_lag_bytes, handle.last_lag_ms) {
                (Some(bytes), Some(ms)) => format!("{} (~{ms}ms)", format_bytes(bytes)),
                (Some(bytes), None) => format_bytes(bytes),
                _ => "unknown".to_string(),
            }
        );
        println!();
    }

    if let Some(check) = job.latest_check() {
        println!("{}", "Last Check".bold().underline());
        println!(
            "  Result:       {}",
            if check.passed {
                "passed".green()
            } else {
                "failed".red()
            }
        );
        println!("  At:           {}", check.checked_at.to_rfc3339());
        for table in &check.tables {
            let mark = if table.passed { "✓".green() } else { "✗".red() };
            println!(
                "  {} {:30} rows {}/{} drift {}",
                mark,
                table.table,
                table
                    .source_rows
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "?".into()),
                table
                    .target_rows
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "?".into()),
                table.row_drift
            );
        }
        println!();
    }

    if let Some(ref cutover) = job.cutover {
        println!("{}", "Cutover".bold().underline());
        println!("  Started:      {}", cutover.started_at.to_rfc3339());
        println!(
            "  Last step:    {}",
            cutover
                .last_step
                .map(|s| format!("{s:?}"))
                .unwrap_or_else(|| "-".into())
        );
        println!();
    }
}

fn print_job(job: &MigrationJob) {
    println!();
    println!("{}", "Job".bold().underline());
    println!("  Id:           {}", job.id());
    println!("  State:        {}", paint(job.state));
    println!("  Attempt:      {}", job.attempt);
    println!("  Tables:       {}", job.spec.tables.join(", "));
    if let Some(last) = job.transitions.last() {
        println!("  Reason:       {}", last.reason.dimmed());
    }
    if let Some(ref err) = job.last_error {
        println!(
            "  Last error:   [{}] {} ({})",
            err.class,
            err.message.red(),
            err.state
        );
    }
    if job.requires_operator {
        println!("  {}", "Operator attention required".red().bold());
    }
    println!();
}

fn paint(state: JobState) -> ColoredString {
    let text = state.to_string();
    match state {
        JobState::Completed | JobState::Synced => text.green().bold(),
        JobState::Failed => text.red().bold(),
        JobState::RolledBack => text.yellow().bold(),
        JobState::CutoverInProgress => text.magenta().bold(),
        _ => text.cyan(),
    }
}

// ── Cancel ───────────────────────────────────────────────────────────

async fn cmd_cancel(orchestrator: &Orchestrator, id: &str) -> anyhow::Result<ExitCode> {
    match orchestrator.coordinator.cancel(id).await? {
        CancelOutcome::Applied(job) => {
            println!("{} {} cancelled", "✓".green().bold(), id.yellow());
            print_job(&job);
        }
        CancelOutcome::Requested { owner } => {
            println!(
                "{} cancel requested; {} will stop {} at its next poll",
                "→".cyan().bold(),
                owner,
                id.yellow()
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

// ── Reconcile ────────────────────────────────────────────────────────

fn print_reconcile(report: &ReconcileReport) {
    let sweep = &report.sweep;
    println!("{}", "Slot Sweep".bold().underline());
    println!("  Inspected:    {}", sweep.inspected.len());
    println!("  Kept:         {}", sweep.kept.len());
    for slot in &sweep.torn_down {
        println!("  {} removed {}", "✓".green(), slot);
    }
    for (slot, reason) in &sweep.skipped {
        println!("  {} skipped {} ({})", "⚠".yellow(), slot, reason.dimmed());
    }
    for (what, reason) in &sweep.errors {
        println!("  {} {} {}", "✗".red(), what, reason.dimmed());
    }
    println!();

    if report.resumed.is_empty() && report.busy.is_empty() && report.errors.is_empty() {
        return;
    }
    println!("{}", "Jobs".bold().underline());
    for (id, state) in &report.resumed {
        println!("  {:24} {}", id, paint(*state));
    }
    for id in &report.busy {
        println!("  {:24} {}", id, "held by another process".dimmed());
    }
    for (id, reason) in &report.errors {
        println!("  {:24} {}", id, reason.red());
    }
    println!();
}

// ── Failover drill ───────────────────────────────────────────────────

async fn cmd_failover(orchestrator: &Orchestrator, target: &str) -> anyhow::Result<ExitCode> {
    orchestrator.coordinator.check_failover_allowed(target).await?;
    let Some(harness) = orchestrator.failover_harness() else {
        anyhow::bail!("cluster.base_url is not configured");
    };

    println!(
        "{} Deleting the primary of {} and waiting for promotion...",
        "→".cyan().bold(),
        target.yellow()
    );
    let report = harness
        .simulate_primary_loss(target)
        .await
        .map_err(MigrationError::from)?;
    debug!(?report, "failover drill report");

    println!();
    println!("{}", "Failover Drill".bold().underline());
    println!("  Deleted:      {}", report.deleted_primary);
    println!(
        "  Promoted:     {}",
        report.new_primary.as_deref().unwrap_or("none")
    );
    println!(
        "  Time:         {}",
        report
            .time_to_new_primary
            .map(|d| format!("{:.1}s", d.as_secs_f64()))
            .unwrap_or_else(|| "-".into())
    );
    println!(
        "  SLA ({}s):    {}",
        report.sla.as_secs(),
        if report.within_sla {
            "met".green()
        } else {
            "missed".red()
        }
    );
    println!(
        "  Write:        {}",
        if report.write_accepted {
            "accepted".green()
        } else {
            "refused".red()
        }
    );
    println!();

    Ok(if report.within_sla && report.write_accepted {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_FATAL as u8)
    })
}

// ── Helpers ──────────────────────────────────────────────────────────

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
