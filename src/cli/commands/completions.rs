//! Shell completions command implementation.

use crate::cli::{Cli, Shell};
use crate::error::Result;
use clap::CommandFactory;
use clap_complete::{generate, shells};
use std::io;

/// Generate shell completions for the specified shell.
pub fn execute(shell: &Shell) -> Result<()> {
    let mut cmd = Cli::command();
    let out = &mut io::stdout();

    match shell {
        Shell::Bash => generate(shells::Bash, &mut cmd, "recall", out),
        Shell::Zsh => generate(shells::Zsh, &mut cmd, "recall", out),
        Shell::Fish => generate(shells::Fish, &mut cmd, "recall", out),
        Shell::PowerShell => generate(shells::PowerShell, &mut cmd, "recall", out),
        Shell::Elvish => generate(shells::Elvish, &mut cmd, "recall", out),
    }

    Ok(())
}
