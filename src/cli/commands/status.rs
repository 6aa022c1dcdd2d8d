//! Status command implementation.

use colored::Colorize;

use crate::error::Result;

use super::{print_json, CommandContext, Globals};

/// Execute status command.
///
/// # Errors
///
/// Returns `NotInitialized` or `NoOwner` when there is nothing to report on.
pub fn execute(globals: Globals<'_>) -> Result<()> {
    let mut ctx = CommandContext::open(globals)?;
    let status = ctx.session()?.status()?;

    if globals.json {
        return print_json(&status);
    }

    println!("Recall Status");
    println!("=============");
    println!();
    println!("Owner: {}", status.owner_id.bold());
    println!();
    println!("Passages:   {}", status.counts.active);
    println!("  Due today:  {}", status.counts.due_today);
    println!("  Archived:   {}", status.counts.archived);
    if status.counts.unverified_items > 0 {
        println!(
            "  Unverified: {}",
            status.counts.unverified_items.to_string().yellow()
        );
    }
    println!("Reviews:    {}", status.counts.review_events);
    println!();
    println!(
        "Queue: {} pending, {} failed",
        status.queue.pending, status.queue.failed
    );

    let format_mark = |mark: Option<i64>| {
        mark.and_then(chrono::DateTime::from_timestamp_millis)
            .map_or_else(|| "never".to_string(), |t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
    };
    println!("Last push: {}", format_mark(status.watermarks.push));
    println!("Last pull: {}", format_mark(status.watermarks.pull));
    Ok(())
}
