//! ledger-migrate CLI - bulk migration of accounting records.

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use ledger_migrate::{Config, IntegrityReport, IntegrityStatus, MigrateError, Orchestrator, ProgressSink};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "ledger-migrate")]
#[command(about = "Bulk migration of accounting records from a rate-limited source API")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "migration.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Print progress updates as JSON lines to stderr
    #[arg(long)]
    progress: bool,

    /// Override the first posting date (YYYY-MM-DD)
    #[arg(long, global = true)]
    from: Option<NaiveDate>,

    /// Override the last posting date (YYYY-MM-DD)
    #[arg(long, global = true)]
    to: Option<NaiveDate>,

    /// Override records per batch
    #[arg(long, global = true)]
    batch_size: Option<usize>,

    /// Override number of workers
    #[arg(long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a migration
    Run {
        /// Simulate the import without writing to the target
        #[arg(long)]
        dry_run: bool,
    },

    /// Validate the configuration and a sample of source records
    Validate,

    /// Sample the source and recommend a fetch strategy
    Estimate,

    /// Check integrity of migrated records in the target
    Verify,

    /// Undo the mutations tracked by a checkpoint file
    Rollback {
        /// Checkpoint file written by a previous run
        #[arg(long)]
        checkpoint: PathBuf,

        /// Reason recorded with the rollback
        #[arg(long, default_value = "manual rollback")]
        reason: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| MigrateError::Config(e.to_string()))?;

    let mut config = Config::load(&cli.config)?;
    if let Some(from) = cli.from {
        config.migration.date_from = Some(from);
    }
    if let Some(to) = cli.to {
        config.migration.date_to = Some(to);
    }
    if let Some(batch_size) = cli.batch_size {
        config.migration.batch_size = Some(batch_size);
    }
    if let Some(workers) = cli.workers {
        config.migration.workers = Some(workers);
    }
    if let Commands::Run { dry_run: true } = cli.command {
        config.migration.dry_run = true;
    }
    config.validate()?;
    let config = config.with_auto_tuning();
    info!("Loaded configuration from {:?}", cli.config);

    // Setup signal handling for graceful shutdown (SIGINT and SIGTERM)
    let cancel_token = setup_signal_handler().await?;
    let mut orchestrator = Orchestrator::from_config(config)?.with_cancellation(cancel_token);

    match cli.command {
        Commands::Run { .. } => {
            if cli.progress {
                orchestrator = orchestrator.with_progress(spawn_progress_printer());
            }

            let report = orchestrator.run().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                let status_msg = if report.dry_run { "Dry run completed!" } else { "Migration completed!" };
                println!("\n{}", status_msg);
                println!("  Run ID: {}", report.run_id);
                println!("  Scope: {}", report.scope);
                println!("  Period: {} to {}", report.date_from, report.date_to);
                println!("  Duration: {:.2}s", report.duration_secs);
                println!(
                    "  Records: {} imported, {} skipped, {} failed",
                    report.import.records.succeeded,
                    report.import.records.skipped,
                    report.import.records.failed
                );
                println!(
                    "  API calls: {} ({} records fetched)",
                    report.import.api_calls, report.import.fetched_records
                );
                if report.import.failed_chunks > 0 {
                    println!("  Failed chunks: {}", report.import.failed_chunks);
                }
                if let Some(simulation) = &report.dry_run_report {
                    println!(
                        "  Would create: {}, would fail: {}, would skip: {}",
                        simulation.summary.would_succeed,
                        simulation.summary.would_fail,
                        simulation.summary.would_skip
                    );
                    println!(
                        "  Financial impact: debit {}, credit {}",
                        simulation.financial_impact.total_debit,
                        simulation.financial_impact.total_credit
                    );
                }
                if let Some(integrity) = &report.integrity {
                    print_integrity(integrity);
                }
                println!("  Output: {}", report.output_dir.display());
            }

            if let Some(integrity) = report.integrity.as_ref().filter(|r| r.status == IntegrityStatus::Failed) {
                return Err(MigrateError::IntegrityViolation(format!(
                    "{} issue(s) found after import",
                    integrity.total_issues
                )));
            }
            if report.import.failed_chunks > 0 {
                return Err(MigrateError::critical(
                    "import",
                    format!("{} chunk(s) could not be imported", report.import.failed_chunks),
                ));
            }
        }

        Commands::Validate => {
            let report = orchestrator.prevalidate().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Prevalidation of {} to {}:", report.sample_from, report.sample_to);
                println!("  Sampled records: {}", report.sampled_records);
                println!("  Passed: {}", report.summary.passed);
                println!("  Failed: {}", report.summary.failed);
                println!("  Unknown record types: {}", report.unknown_records);
                if !report.missing_accounts.is_empty() {
                    println!("  Unmapped accounts: {}", report.missing_accounts.join(", "));
                }
                for recommendation in &report.recommendations {
                    println!("  [{:?}] {}", recommendation.priority, recommendation.message);
                }
            }

            if !report.passed {
                return Err(MigrateError::validation(
                    "prevalidation",
                    format!(
                        "{:.1}% of sampled records failed ({} unmapped account role(s))",
                        report.summary.failure_rate(),
                        report.missing_accounts.len()
                    ),
                ));
            }
            if !cli.output_json {
                println!("Validation completed successfully");
            }
        }

        Commands::Estimate => {
            let estimate = orchestrator.estimate().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&estimate)?);
            } else {
                println!("Fetch strategy: {}", estimate.strategy.as_str());
                println!(
                    "  Sample: {} records over {} days{}",
                    estimate.sample_records,
                    estimate.sample_days,
                    if estimate.sample_truncated { " (truncated)" } else { "" }
                );
                println!("  Records per day: {:.1}", estimate.records_per_day);
                println!(
                    "  Estimated total: {:.0} over {} days",
                    estimate.estimated_total, estimate.total_days
                );
                println!(
                    "  Chunks: {} of ~{:.1} days",
                    estimate.estimated_chunks, estimate.average_chunk_days
                );
            }
        }

        Commands::Verify => {
            let report = orchestrator.verify().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_integrity(&report);
            }

            if report.status == IntegrityStatus::Failed {
                return Err(MigrateError::IntegrityViolation(format!(
                    "{} issue(s) found",
                    report.total_issues
                )));
            }
        }

        Commands::Rollback { checkpoint, reason } => {
            let report = orchestrator.rollback_checkpoint(&checkpoint, &reason).await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Rollback of checkpoint {}:", report.checkpoint_id);
                for step in &report.steps {
                    println!("  {:?} {} {}", step.action, step.entity, step.id);
                    if let Some(err) = &step.error {
                        println!("    Error: {}", err);
                    }
                }
                println!("  Success: {}", report.success);
            }

            if !report.success {
                return Err(MigrateError::critical(
                    "rollback",
                    format!("{} undo step(s) failed", report.failures().count()),
                ));
            }
        }
    }

    Ok(())
}

fn print_integrity(report: &IntegrityReport) {
    println!("Integrity: {:?} ({} issue(s))", report.status, report.total_issues);
    for check in &report.checks {
        println!(
            "  {} {}",
            if check.passed { "OK  " } else { "FAIL" },
            check.check
        );
        for issue in check.issues.iter().take(5) {
            println!("    {} {} {}: {}", issue.issue_type, issue.entity, issue.record, issue.detail);
        }
    }
}

/// Forward progress events to stderr as JSON lines.
fn spawn_progress_printer() -> ProgressSink {
    let (tx, mut rx) = mpsc::channel(1024);
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                eprintln!("{}", line);
            }
        }
    });
    ProgressSink::new(tx)
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
async fn setup_signal_handler() -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => eprintln!("\nReceived SIGINT. Rolling back and shutting down..."),
            _ = sigterm.recv() => eprintln!("\nReceived SIGTERM. Rolling back and shutting down..."),
        }
        token.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
async fn setup_signal_handler() -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Rolling back and shutting down...");
            token.cancel();
        }
    });

    Ok(cancel_token)
}
