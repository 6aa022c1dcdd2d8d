//! Command implementations.

pub mod completions;
pub mod init;
pub mod item;
pub mod status;
pub mod sync;
pub mod version;

use std::path::PathBuf;

use tracing::debug;

use crate::config::{load_settings, resolve_db_path, resolve_owner};
use crate::error::{Error, Result};
use crate::remote::HttpRemote;
use crate::session::{OwnerSession, SessionOptions};
use crate::storage::SqliteStorage;
use crate::sync::TracingObserver;

/// Flags shared by every owner-scoped command.
#[derive(Debug, Clone, Copy)]
pub struct Globals<'a> {
    pub db: Option<&'a PathBuf>,
    pub owner: Option<&'a str>,
    pub offline: bool,
    pub json: bool,
}

/// Everything an owner-scoped command needs, opened once per invocation.
pub struct CommandContext {
    storage: SqliteStorage,
    remote: Option<HttpRemote>,
    owner_id: String,
    options: SessionOptions,
}

impl CommandContext {
    /// Open the database, load settings and resolve the owner.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` if the database does not exist, `NoOwner`
    /// if no owner can be resolved, or a config error.
    pub fn open(globals: Globals<'_>) -> Result<Self> {
        let db_path = resolve_db_path(globals.db.map(PathBuf::as_path)).ok_or(Error::NotInitialized)?;
        if !db_path.exists() {
            return Err(Error::NotInitialized);
        }

        let settings = load_settings()?;
        let owner_id = resolve_owner(globals.owner, &settings)?;
        let options = settings.session_options()?;

        let remote = match (&settings.endpoint, globals.offline) {
            (Some(endpoint), false) => Some(HttpRemote::new(endpoint, settings.token.clone(), settings.timeout())),
            _ => None,
        };
        debug!(db = %db_path.display(), owner = %owner_id, online = remote.is_some(), "Opened command context");

        Ok(Self {
            storage: SqliteStorage::open(&db_path)?,
            remote,
            owner_id,
            options,
        })
    }

    /// Session over this context's store and remote.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be opened.
    pub fn session(&mut self) -> Result<OwnerSession<'_, HttpRemote>> {
        OwnerSession::new(
            &mut self.storage,
            self.remote.as_ref(),
            TracingObserver,
            &self.owner_id,
            self.options.clone(),
        )
    }
}

/// Build the per-invocation async runtime.
///
/// # Errors
///
/// Returns an error if the runtime cannot be created.
pub fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().map_err(|e| Error::Other(format!("Failed to create async runtime: {e}")))
}

/// Print a serializable value as one line of JSON.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}
