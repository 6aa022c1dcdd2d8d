//! Recall CLI entry point.

use clap::Parser;
use recall::cli::commands::{self, Globals};
use recall::cli::{Cli, Commands};
use recall::error::Error;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    // Set up tracing based on verbosity
    init_tracing(cli.verbose, cli.quiet);

    // Resolve effective JSON mode: --json OR non-TTY stdout
    let json = cli.json || !std::io::IsTerminal::is_terminal(&std::io::stdout());

    match run(&cli, json) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if json {
                eprintln!("{}", e.to_structured_json());
            } else if !cli.quiet {
                if let Some(hint) = e.hint() {
                    eprintln!("Error: {e}\n  Hint: {hint}");
                } else {
                    eprintln!("Error: {e}");
                }
            }
            ExitCode::from(e.exit_code())
        }
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    use tracing_subscriber::EnvFilter;

    if quiet {
        return;
    }

    // Honor RUST_LOG if set, otherwise use verbosity flag
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbose {
            0 => EnvFilter::new("warn"),
            1 => EnvFilter::new("info"),
            2 => EnvFilter::new("debug,rusqlite=info,hyper=info,reqwest=info"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn run(cli: &Cli, json: bool) -> Result<(), Error> {
    let globals = Globals {
        db: cli.db.as_ref(),
        owner: cli.owner.as_deref(),
        offline: cli.offline,
        json,
    };

    match &cli.command {
        Commands::Init(args) => commands::init::execute(args, cli.db.as_ref(), cli.owner.as_deref(), json),
        Commands::Version => commands::version::execute(cli.db.as_ref(), json),

        // Passages
        Commands::Add(args) => commands::item::add(args, globals),
        Commands::Review(args) => commands::item::review(args, globals),
        Commands::Archive { reference } => commands::item::archive(reference, globals),
        Commands::Resume { reference } => commands::item::resume(reference, globals),
        Commands::Due => commands::item::due(globals),
        Commands::List { all } => commands::item::list(*all, globals),
        Commands::History { reference, limit } => commands::item::history(reference, *limit, globals),

        // Sync
        Commands::Sync => commands::sync::sync(globals),
        Commands::Verify => commands::sync::verify(globals),
        Commands::Queue { command } => commands::sync::queue(command, globals),

        Commands::Status => commands::status::execute(globals),

        // Shell completions
        Commands::Completions { shell } => commands::completions::execute(shell),
    }
}
