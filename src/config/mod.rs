//! Configuration management.
//!
//! This module resolves where Recall keeps its data, which owner a command
//! acts for, and loads the sync settings file.
//!
//! # Layout
//!
//! - **Database**: `~/.recall/data/recall.db`
//! - **Settings**: `~/.recall/config.json` (see [`SyncSettings`])
//!
//! Everything can be redirected with flags or environment variables, which
//! is how tests keep away from real data.

mod settings;

pub use settings::{SyncSettings, DEFAULT_TIMEOUT_MS};

use crate::error::{Error, Result};

use std::path::{Path, PathBuf};

/// Get the global Recall directory (`~/.recall/`).
#[must_use]
pub fn global_recall_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|b| b.home_dir().join(".recall"))
}

/// Check if test mode is enabled.
///
/// Test mode is enabled by setting `RECALL_TEST_DB=1` (or any non-empty value).
/// This redirects all database operations to an isolated test database.
#[must_use]
pub fn is_test_mode() -> bool {
    std::env::var("RECALL_TEST_DB").is_ok_and(|v| is_truthy(&v))
}

fn is_truthy(value: &str) -> bool {
    !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false")
}

/// Get the test database path (`~/.recall/test/recall.db`).
#[must_use]
pub fn test_db_path() -> Option<PathBuf> {
    global_recall_dir().map(|dir| dir.join("test").join("recall.db"))
}

/// Resolve the database path.
///
/// Priority:
/// 1. If `explicit_path` is provided, use it directly
/// 2. `RECALL_TEST_DB` environment variable → uses test database
/// 3. `RECALL_DB` environment variable
/// 4. Global location: `~/.recall/data/recall.db`
#[must_use]
pub fn resolve_db_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return Some(path.to_path_buf());
    }

    if is_test_mode() {
        return test_db_path();
    }

    if let Ok(db_path) = std::env::var("RECALL_DB") {
        if !db_path.trim().is_empty() {
            return Some(PathBuf::from(db_path));
        }
    }

    global_recall_dir().map(|dir| dir.join("data").join("recall.db"))
}

/// Resolve the settings file path.
///
/// `RECALL_CONFIG` overrides the default `~/.recall/config.json`.
#[must_use]
pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("RECALL_CONFIG") {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    global_recall_dir().map(|dir| dir.join("config.json"))
}

/// Load settings from the resolved config path, with environment overrides.
///
/// # Errors
///
/// Returns `Config` if the file exists but cannot be parsed.
pub fn load_settings() -> Result<SyncSettings> {
    match resolve_config_path() {
        Some(path) => SyncSettings::load(&path),
        None => Ok(SyncSettings::default().with_env_overrides()),
    }
}

/// Resolve the owner every command acts for.
///
/// Priority:
/// 1. Explicit `--owner` flag
/// 2. `RECALL_OWNER` environment variable
/// 3. `owner_id` in the settings file
/// 4. `NoOwner` error
pub fn resolve_owner(explicit_owner: Option<&str>, settings: &SyncSettings) -> Result<String> {
    if let Some(owner) = explicit_owner.map(str::trim).filter(|o| !o.is_empty()) {
        return Ok(owner.to_string());
    }

    if let Ok(owner) = std::env::var("RECALL_OWNER") {
        if !owner.trim().is_empty() {
            return Ok(owner.trim().to_string());
        }
    }

    settings
        .owner_id
        .as_deref()
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .ok_or(Error::NoOwner)
}
