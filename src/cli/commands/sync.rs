//! Sync command implementations: sync, verify, queue.

use colored::Colorize;

use crate::cli::QueueCommands;
use crate::error::Result;
use crate::sync::{PassReport, SyncOutcome};

use super::{print_json, runtime, CommandContext, Globals};

/// Execute `recall sync`.
///
/// # Errors
///
/// Returns `Connectivity` when offline or no endpoint is configured.
pub fn sync(globals: Globals<'_>) -> Result<()> {
    let mut ctx = CommandContext::open(globals)?;
    let run = runtime()?.block_on(async {
        let mut session = ctx.session()?;
        session.sync().await
    })?;

    if globals.json {
        return print_json(&run);
    }

    print_pass("Push", &run.report.push);
    print_pass("Pull", &run.report.pull);
    if run.acknowledged > 0 {
        println!("  {} queued review(s) covered by push", run.acknowledged);
    }
    if let Some(flush) = &run.flush {
        print_flush(flush);
    }
    Ok(())
}

/// Execute `recall verify`.
///
/// # Errors
///
/// Returns `Connectivity` when offline or no endpoint is configured.
pub fn verify(globals: Globals<'_>) -> Result<()> {
    let mut ctx = CommandContext::open(globals)?;
    let report = runtime()?.block_on(async {
        let mut session = ctx.session()?;
        session.verify_items().await
    })?;

    if globals.json {
        return print_json(&report);
    }

    if report.verified.is_empty() && report.rejected.is_empty() {
        println!("No unverified passages.");
    }
    for reference in &report.verified {
        println!("{} {reference}", "✓".green());
    }
    for rejection in &report.rejected {
        println!("{} {rejection}", "✗".red());
    }
    if report.aborted {
        println!("{}", "Remote became unreachable; run `recall verify` again later".yellow());
    }
    Ok(())
}

/// Execute `recall queue ...`.
///
/// # Errors
///
/// Returns `Connectivity` for `flush` when offline.
pub fn queue(command: &QueueCommands, globals: Globals<'_>) -> Result<()> {
    let mut ctx = CommandContext::open(globals)?;

    match command {
        QueueCommands::Status => {
            let snapshot = ctx.session()?.queue_status()?;
            if globals.json {
                return print_json(&snapshot);
            }
            println!(
                "Pending: {}  Processing: {}  Failed: {}",
                snapshot.pending, snapshot.processing, snapshot.failed
            );
            for op in &snapshot.operations {
                let error = op.last_error.as_deref().unwrap_or("");
                println!(
                    "  {}  {:<16} {:<10} retries={} {}",
                    op.id,
                    op.operation.kind(),
                    op.status.as_str(),
                    op.retry_count,
                    error.dimmed()
                );
            }
        }
        QueueCommands::Flush { force } => {
            let outcome = runtime()?.block_on(async {
                let mut session = ctx.session()?;
                session.flush_queue(*force).await
            })?;
            if globals.json {
                return print_json(&outcome);
            }
            match &outcome {
                Some(flush) => print_flush(flush),
                None => println!("Nothing to flush."),
            }
        }
        QueueCommands::ClearFailed => {
            let cleared = ctx.session()?.clear_failed()?;
            if globals.json {
                return print_json(&serde_json::json!({ "cleared": cleared }));
            }
            println!("Cleared {cleared} failed operation(s).");
        }
    }
    Ok(())
}

fn print_pass(label: &str, report: &PassReport) {
    let status = if report.is_clean() {
        "ok".green()
    } else if report.aborted {
        "aborted".red()
    } else {
        "incomplete".yellow()
    };
    println!(
        "{label}: {status}  synced={} skipped={} failed={}",
        report.synced, report.skipped, report.failed
    );
    for error in &report.errors {
        println!("  {}", error.dimmed());
    }
}

fn print_flush(outcome: &SyncOutcome) {
    match outcome {
        SyncOutcome::Batched(summary) => println!(
            "Queue: batch {} sent, {} ok, {} requeued, {} dropped",
            &summary.batch_id[..summary.batch_id.len().min(12)],
            summary.successful,
            summary.requeued,
            summary.dropped
        ),
        SyncOutcome::Individual { results } => {
            println!("Queue: {} sent, {} ok", results.len(), outcome.successful());
            for result in results.iter().filter(|r| !r.success) {
                println!(
                    "  {} {} -> {}",
                    result.kind,
                    result.error.as_deref().unwrap_or("failed").dimmed(),
                    result.status.as_str()
                );
            }
        }
    }
}
