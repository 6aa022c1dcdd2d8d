//! Create the local database and settings file.
//!
//! `recall init` creates `~/.recall/data/recall.db` (or the `--db` /
//! `RECALL_DB` / test-mode path) with the current schema, and writes
//! `~/.recall/config.json` with whatever owner, endpoint and defaults were
//! given. Existing settings are kept unless a flag replaces them.

use crate::cli::InitArgs;
use crate::config::{resolve_config_path, resolve_db_path, SyncSettings};
use crate::error::{Error, Result};
use crate::storage::SqliteStorage;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Serialize)]
struct InitOutput {
    database: PathBuf,
    config: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    owner_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    endpoint: Option<String>,
}

/// Execute the init command.
///
/// # Errors
///
/// Returns `AlreadyInitialized` if the database exists and `--force` was
/// not given, or an error if the database or settings cannot be written.
pub fn execute(args: &InitArgs, db_path: Option<&PathBuf>, owner: Option<&str>, json: bool) -> Result<()> {
    let db_path = resolve_db_path(db_path.map(PathBuf::as_path))
        .ok_or_else(|| Error::Config("Could not determine the Recall data directory".to_string()))?;
    let config_path = resolve_config_path()
        .ok_or_else(|| Error::Config("Could not determine the Recall config path".to_string()))?;

    let output = initialize(args, db_path, config_path, owner)?;

    if json {
        println!("{}", serde_json::to_string(&output)?);
    } else {
        println!("Initialized Recall");
        println!("  Database: {}", output.database.display());
        println!("  Config:   {}", output.config.display());
        match &output.owner_id {
            Some(owner) => println!("  Owner:    {owner}"),
            None => println!("\nNext: set an owner with 'recall init --owner <id> --force' or RECALL_OWNER."),
        }
        if output.endpoint.is_none() {
            println!("  No remote endpoint configured; working offline.");
        }
    }

    Ok(())
}

fn initialize(args: &InitArgs, db_path: PathBuf, config_path: PathBuf, owner: Option<&str>) -> Result<InitOutput> {
    if db_path.exists() && !args.force {
        return Err(Error::AlreadyInitialized { path: db_path });
    }
    // Opening applies the schema and migrations; existing data is kept
    SqliteStorage::open(&db_path)?;

    let mut settings = SyncSettings::load(&config_path)?;
    if let Some(owner) = owner {
        settings.owner_id = Some(owner.to_string());
    }
    if let Some(endpoint) = &args.endpoint {
        settings.endpoint = Some(endpoint.clone());
    }
    if let Some(translation) = &args.translation {
        settings.default_translation.clone_from(translation);
    }
    if let Some(minutes) = args.utc_offset {
        settings.utc_offset_minutes = minutes;
    }
    // Validate before writing
    settings.offset()?;
    settings.save(&config_path)?;

    Ok(InitOutput {
        database: db_path,
        config: config_path,
        owner_id: settings.owner_id,
        endpoint: settings.endpoint,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args(force: bool) -> InitArgs {
        InitArgs {
            endpoint: None,
            translation: Some("ESV".into()),
            utc_offset: Some(60),
            force,
        }
    }

    #[test]
    fn test_init_creates_database_and_settings() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("data").join("recall.db");
        let config = dir.path().join("config.json");

        let output = initialize(&args(false), db.clone(), config.clone(), Some("owner_1")).unwrap();
        assert_eq!(output.owner_id.as_deref(), Some("owner_1"));
        assert!(db.exists());

        let settings = SyncSettings::load(&config).unwrap();
        assert_eq!(settings.owner_id.as_deref(), Some("owner_1"));
        assert_eq!(settings.default_translation, "ESV");
        assert_eq!(settings.utc_offset_minutes, 60);
    }

    #[test]
    fn test_init_fails_if_already_initialized() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("recall.db");
        let config = dir.path().join("config.json");
        initialize(&args(false), db.clone(), config.clone(), None).unwrap();

        let result = initialize(&args(false), db.clone(), config.clone(), None);
        assert!(matches!(result, Err(Error::AlreadyInitialized { .. })));

        // --force keeps the data and rewrites settings
        assert!(initialize(&args(true), db, config, Some("owner_2")).is_ok());
    }
}
