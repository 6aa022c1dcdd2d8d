//! Passage commands: add, review, archive, resume, due, list, history.

use colored::Colorize;

use crate::cli::{AddArgs, ReviewArgs};
use crate::error::Result;
use crate::session::{WriteAction, WriteOutcome};
use crate::storage::DueEntry;

use super::{print_json, runtime, CommandContext, Globals};

/// Execute `recall add`.
///
/// # Errors
///
/// Returns duplicate, validation and manual-text errors from the write path.
pub fn add(args: &AddArgs, globals: Globals<'_>) -> Result<()> {
    let mut ctx = CommandContext::open(globals)?;
    let outcome = runtime()?.block_on(async {
        let mut session = ctx.session()?;
        session.add_item(&args.reference, args.text.as_deref()).await
    })?;
    print_write(&outcome, globals.json)
}

/// Execute `recall review`.
///
/// # Errors
///
/// Returns `NotFound` if the passage is not being reviewed.
pub fn review(args: &ReviewArgs, globals: Globals<'_>) -> Result<()> {
    let mut ctx = CommandContext::open(globals)?;
    let report = runtime()?.block_on(async {
        let mut session = ctx.session()?;
        session
            .record_review(&args.reference, !args.failed, args.duration)
            .await
    })?;

    if globals.json {
        return print_json(&report);
    }

    let verdict = if report.event.succeeded {
        "✓".green()
    } else {
        "✗".red()
    };
    println!("{verdict} {}", report.item.canonical_reference.bold());
    if !report.event.counted && report.event.succeeded {
        println!("  {}", "Not due yet; practice recorded without advancing".dimmed());
    }
    println!(
        "  Phase: {} ({})  Streak: {} (best {})  Next due: {}",
        report.progress.phase,
        report.progress.phase_progress_count,
        report.progress.current_streak,
        report.progress.best_streak,
        report.progress.next_due_date
    );
    if let Some(warning) = &report.warning {
        println!("  {} {warning}", "warning:".yellow());
    }
    Ok(())
}

/// Execute `recall archive`.
///
/// # Errors
///
/// Returns `NotFound` if the passage is not being reviewed.
pub fn archive(reference: &str, globals: Globals<'_>) -> Result<()> {
    let mut ctx = CommandContext::open(globals)?;
    let outcome = runtime()?.block_on(async {
        let mut session = ctx.session()?;
        session.archive_item(reference).await
    })?;
    print_write(&outcome, globals.json)
}

/// Execute `recall resume`.
///
/// # Errors
///
/// Returns `Duplicate` if already active, `NotFound` if never tracked.
pub fn resume(reference: &str, globals: Globals<'_>) -> Result<()> {
    let mut ctx = CommandContext::open(globals)?;
    let outcome = runtime()?.block_on(async {
        let mut session = ctx.session()?;
        session.resume(reference).await
    })?;
    print_write(&outcome, globals.json)
}

/// Execute `recall due`.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn due(globals: Globals<'_>) -> Result<()> {
    let mut ctx = CommandContext::open(globals)?;
    let entries = ctx.session()?.due_today()?;

    if globals.json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("Nothing due today.");
        return Ok(());
    }
    println!("{}", format!("Due today ({})", entries.len()).bold());
    for entry in &entries {
        print_entry(entry);
    }
    Ok(())
}

/// Execute `recall list`.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn list(include_archived: bool, globals: Globals<'_>) -> Result<()> {
    let mut ctx = CommandContext::open(globals)?;
    let entries = ctx.session()?.list(include_archived)?;

    if globals.json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("No passages tracked. Add one with: recall add \"John 3:16\"");
        return Ok(());
    }
    for entry in &entries {
        print_entry(entry);
    }
    Ok(())
}

/// Execute `recall history`.
///
/// # Errors
///
/// Returns `NotFound` if the passage was never tracked.
pub fn history(reference: &str, limit: u32, globals: Globals<'_>) -> Result<()> {
    let mut ctx = CommandContext::open(globals)?;
    let report = ctx.session()?.history(reference, limit)?;

    if globals.json {
        return print_json(&report);
    }

    println!("{}", report.item.canonical_reference.bold());
    for entry in &report.entries {
        let at = chrono::DateTime::from_timestamp_millis(entry.at)
            .map_or_else(|| entry.at.to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string());
        let change = entry.change.as_str();
        match &entry.detail {
            Some(detail) => println!("  {at}  {change:<12} {} {detail}", entry.actor.dimmed()),
            None => println!("  {at}  {change:<12} {}", entry.actor.dimmed()),
        }
    }
    Ok(())
}

fn print_write(outcome: &WriteOutcome, json: bool) -> Result<()> {
    if json {
        return print_json(outcome);
    }

    let verb = match outcome.action {
        WriteAction::Created | WriteAction::Mirrored => "Added",
        WriteAction::Manual => "Added (unverified)",
        WriteAction::Reactivated => "Resumed",
        WriteAction::Archived => "Archived",
    };
    println!("{} {}", verb.green(), outcome.item.canonical_reference.bold());
    if outcome.action != WriteAction::Archived {
        println!("  Next due: {}", outcome.progress.next_due_date);
    }
    if let Some(warning) = &outcome.warning {
        println!("  {} {warning}", "warning:".yellow());
    }
    Ok(())
}

fn print_entry(entry: &DueEntry) {
    let reference = if entry.progress.archived {
        entry.item.canonical_reference.dimmed()
    } else {
        entry.item.canonical_reference.bold()
    };
    let marker = if entry.item.verified { "" } else { " (unverified)" };
    println!(
        "  {reference}{marker}  [{}]  {}  due {}",
        entry.progress.phase,
        entry.item.source_translation,
        entry.progress.next_due_date
    );
}
