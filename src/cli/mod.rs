//! CLI definitions using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

pub mod commands;

/// Recall - memorize passages on a spaced schedule, synced across devices
#[derive(Parser, Debug)]
#[command(name = "recall", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Database path (default: ~/.recall/data/recall.db)
    #[arg(long, global = true, env = "RECALL_DB")]
    pub db: Option<PathBuf>,

    /// Owner whose collection to act on
    #[arg(long, global = true, env = "RECALL_OWNER")]
    pub owner: Option<String>,

    /// Never contact the remote; changes wait for the next sync
    #[arg(long, global = true)]
    pub offline: bool,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the local database and settings file
    Init(InitArgs),

    /// Print version information
    Version,

    /// Start memorizing a passage
    Add(AddArgs),

    /// Record a review of a passage
    Review(ReviewArgs),

    /// Stop reviewing a passage (history is kept)
    Archive {
        /// Reference, e.g. "John 3:16" or "jn 3:16"
        reference: String,
    },

    /// Restart an archived passage from the beginning
    Resume {
        /// Reference, e.g. "John 3:16" or "jn 3:16"
        reference: String,
    },

    /// Show passages due today
    Due,

    /// List tracked passages
    List {
        /// Include archived passages
        #[arg(long, short)]
        all: bool,
    },

    /// Show how a passage's progress changed over time
    History {
        /// Reference, e.g. "John 3:16" or "jn 3:16"
        reference: String,

        /// Maximum number of entries
        #[arg(long, short, default_value_t = 20)]
        limit: u32,
    },

    /// Push local changes and pull remote ones
    Sync,

    /// Confirm manually entered passages against the lookup service
    Verify,

    /// Inspect or flush the offline write queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Show collection, queue and sync status
    Status,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Supported shells for completions.
#[derive(clap::ValueEnum, Clone, Debug)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Remote endpoint to sync with
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Default translation for new passages
    #[arg(long)]
    pub translation: Option<String>,

    /// Owner timezone as minutes east of UTC (e.g. -300 for UTC-5)
    #[arg(long, allow_hyphen_values = true)]
    pub utc_offset: Option<i32>,

    /// Reinitialize even if the database exists
    #[arg(long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Reference, e.g. "John 3:16" or "jn 3:16"
    pub reference: String,

    /// Passage text, used when the lookup service is unreachable
    #[arg(long)]
    pub text: Option<String>,
}

#[derive(Args, Debug)]
pub struct ReviewArgs {
    /// Reference, e.g. "John 3:16" or "jn 3:16"
    pub reference: String,

    /// Record a failed recall (default: success)
    #[arg(long)]
    pub failed: bool,

    /// Seconds spent on the review
    #[arg(long)]
    pub duration: Option<u32>,
}

#[derive(Subcommand, Debug)]
pub enum QueueCommands {
    /// Show pending and failed operations
    Status,

    /// Send queued reviews to the remote
    Flush {
        /// Flush even below the size and age thresholds
        #[arg(long)]
        force: bool,
    },

    /// Remove operations that exhausted their retries
    ClearFailed,
}
