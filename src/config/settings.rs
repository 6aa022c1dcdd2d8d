//! Sync settings file.
//!
//! `~/.recall/config.json` holds the remote endpoint, the owner's defaults
//! and every sync tunable. A missing file means defaults; unknown keys are
//! ignored so older binaries can read newer files. `RECALL_ENDPOINT` and
//! `RECALL_TOKEN` override the file.

use std::fs;
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::Duration;

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::scheduler::PhaseThresholds;
use crate::session::{SessionOptions, DEFAULT_TRANSLATION};
use crate::sync::{MergePolicy, QueueSettings, SyncConfig, DEFAULT_DEDUP_WINDOW_MS, DEFAULT_GRACE_WINDOW_MS};

/// Default request timeout for the remote (ms).
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Contents of `config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Owner used when neither `--owner` nor `RECALL_OWNER` is given
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,

    /// Base URL of the remote; no endpoint means offline
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Bearer token sent with every remote request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    pub timeout_ms: u64,
    pub default_translation: String,

    /// Owner's timezone as minutes east of UTC
    pub utc_offset_minutes: i32,

    pub grace_window_ms: i64,
    pub dedup_window_ms: i64,
    pub queue: QueueSettings,
    pub thresholds: PhaseThresholds,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            owner_id: None,
            endpoint: None,
            token: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            default_translation: DEFAULT_TRANSLATION.to_string(),
            utc_offset_minutes: 0,
            grace_window_ms: DEFAULT_GRACE_WINDOW_MS,
            dedup_window_ms: DEFAULT_DEDUP_WINDOW_MS,
            queue: QueueSettings::default(),
            thresholds: PhaseThresholds::default(),
        }
    }
}

impl SyncSettings {
    /// Load settings from `path`, falling back to defaults when the file
    /// does not exist, then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let settings = match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No settings file, using defaults");
                Self::default()
            }
            Err(e) => return Err(Error::Config(format!("{}: {e}", path.display()))),
        };
        Ok(settings.with_env_overrides())
    }

    /// Apply `RECALL_ENDPOINT` and `RECALL_TOKEN`.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(endpoint) = non_empty_env("RECALL_ENDPOINT") {
            self.endpoint = Some(endpoint);
        }
        if let Some(token) = non_empty_env("RECALL_TOKEN") {
            self.token = Some(token);
        }
        self
    }

    /// Write settings to `path`, readable only by the current user since
    /// the file may hold a token.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(path)?;
        file.write_all(json.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    /// The owner's timezone.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the offset is outside ±24 hours.
    pub fn offset(&self) -> Result<FixedOffset> {
        self.utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| Error::Config(format!("utc_offset_minutes out of range: {}", self.utc_offset_minutes)))
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Session tunables derived from these settings.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the timezone offset is invalid.
    pub fn session_options(&self) -> Result<SessionOptions> {
        Ok(SessionOptions {
            translation: self.default_translation.clone(),
            offset: self.offset()?,
            thresholds: self.thresholds,
            sync: SyncConfig {
                merge: MergePolicy {
                    grace_window_ms: self.grace_window_ms,
                },
                dedup_window_ms: self.dedup_window_ms,
            },
            queue: self.queue,
        })
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_means_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = SyncSettings::load(&dir.path().join("config.json")).unwrap();
        assert_eq!(settings.queue, QueueSettings::default());
        assert_eq!(settings.grace_window_ms, DEFAULT_GRACE_WINDOW_MS);
        assert_eq!(settings.default_translation, DEFAULT_TRANSLATION);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"owner_id":"owner_1","utc_offset_minutes":-300,"queue":{"size_threshold":10}}"#,
        )
        .unwrap();

        let settings = SyncSettings::load(&path).unwrap();
        assert_eq!(settings.owner_id.as_deref(), Some("owner_1"));
        assert_eq!(settings.queue.size_threshold, 10);
        assert_eq!(settings.queue.max_retries, 3);
        assert_eq!(settings.thresholds, PhaseThresholds::default());
        assert_eq!(settings.offset().unwrap().local_minus_utc(), -300 * 60);
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let settings = SyncSettings {
            owner_id: Some("owner_1".into()),
            dedup_window_ms: 5_000,
            ..SyncSettings::default()
        };
        settings.save(&path).unwrap();

        let loaded = SyncSettings::load(&path).unwrap();
        assert_eq!(loaded.owner_id, settings.owner_id);
        assert_eq!(loaded.dedup_window_ms, 5_000);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(SyncSettings::load(&path).unwrap_err(), Error::Config(_)));
    }

    #[test]
    fn test_invalid_offset_rejected() {
        let settings = SyncSettings {
            utc_offset_minutes: 24 * 60 + 1,
            ..SyncSettings::default()
        };
        assert!(settings.offset().is_err());
        assert!(settings.session_options().is_err());
    }
}
