//! Version command implementation.

use crate::config::{resolve_config_path, resolve_db_path};
use crate::error::Result;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Serialize)]
struct VersionOutput {
    version: &'static str,
    build: &'static str,
    database: Option<PathBuf>,
    config: Option<PathBuf>,
}

/// Execute the version command, including where data would be read from.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn execute(db_path: Option<&PathBuf>, json: bool) -> Result<()> {
    let output = VersionOutput {
        version: env!("CARGO_PKG_VERSION"),
        build: if cfg!(debug_assertions) { "dev" } else { "release" },
        database: resolve_db_path(db_path.map(PathBuf::as_path)),
        config: resolve_config_path(),
    };

    if json {
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    println!("recall version {} ({})", output.version, output.build);
    let show = |path: &Option<PathBuf>| path.as_ref().map_or_else(|| "unknown".to_string(), |p| p.display().to_string());
    println!("  Database: {}", show(&output.database));
    println!("  Config:   {}", show(&output.config));
    Ok(())
}
