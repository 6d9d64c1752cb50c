//! Daemon configuration.
//!
//! # Storage layout
//!
//! ```text
//! ~/.livemap/
//!   config.yaml   (mode 0600; optional, every field has a default)
//! ```
//!
//! # API pattern
//!
//! Same as every other file-backed helper in the workspace:
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::UserId;

pub const DEFAULT_COLOR: &str = "#8d81f2";

// ---------------------------------------------------------------------------
// Access rules
// ---------------------------------------------------------------------------

/// Rank-relative permission for editing markers someone else created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    /// Only markers the caller created.
    #[default]
    Own,
    /// Own markers plus markers created by lower grades of the caller's job.
    LowerRank,
    /// Like `LowerRank`, including the caller's own grade.
    SameRank,
    /// Every marker of a job the caller can see.
    Any,
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessLevel::Own => write!(f, "own"),
            AccessLevel::LowerRank => write!(f, "lower_rank"),
            AccessLevel::SameRank => write!(f, "same_rank"),
            AccessLevel::Any => write!(f, "any"),
        }
    }
}

/// What callers of one job (at or above `min_grade`) may see and do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    pub job: String,
    #[serde(default)]
    pub min_grade: i32,
    /// Jobs whose markers are visible.
    #[serde(default)]
    pub marker_jobs: Vec<String>,
    /// Job → highest grade whose users are visible.
    #[serde(default)]
    pub user_jobs: BTreeMap<String, i32>,
    #[serde(default)]
    pub marker_access: AccessLevel,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Root of `config.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivemapConfig {
    /// Tracker reconciliation period.
    pub refresh_interval_ms: u64,
    /// Per-stream resync period.
    pub stream_refresh_interval_ms: u64,
    pub user_chunk_size: usize,
    pub marker_chunk_size: usize,
    /// Pause between two chunks of the same delta.
    pub chunk_pause_ms: u64,
    /// Entities updated more recently than this are never removed.
    pub stale_grace_secs: u64,
    /// How far back the location query looks.
    pub location_window_secs: u64,
    /// How long an expired marker keeps being reported for eviction.
    pub marker_expiry_lookback_secs: u64,
    /// Jobs whose users are tracked at all.
    pub visible_jobs: Vec<String>,
    pub default_color: String,
    /// Off-duty callers only see themselves (superusers are exempt).
    pub require_on_duty: bool,
    /// Broker inbound queue.
    pub broker_capacity: usize,
    /// Per-stream broker buffer; overflow drops the newest event.
    pub subscriber_buffer: usize,
    pub access: Vec<AccessRule>,
    pub superusers: Vec<UserId>,
}

impl Default for LivemapConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: 2_000,
            stream_refresh_interval_ms: 3_500,
            user_chunk_size: 20,
            marker_chunk_size: 75,
            chunk_pause_ms: 5,
            stale_grace_secs: 30,
            location_window_secs: 4 * 60 * 60,
            marker_expiry_lookback_secs: 60 * 60,
            visible_jobs: vec![],
            default_color: DEFAULT_COLOR.to_string(),
            require_on_duty: true,
            broker_capacity: 256,
            subscriber_buffer: 32,
            access: vec![],
            superusers: vec![],
        }
    }
}

impl LivemapConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn stream_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.stream_refresh_interval_ms)
    }

    pub fn chunk_pause(&self) -> Duration {
        Duration::from_millis(self.chunk_pause_ms)
    }

    pub fn stale_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_grace_secs as i64)
    }

    pub fn location_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.location_window_secs as i64)
    }

    pub fn marker_expiry_lookback(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.marker_expiry_lookback_secs as i64)
    }

    /// Reject values that would make the daemon misbehave instead of failing late.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.refresh_interval_ms == 0 {
            return Err(invalid("refresh_interval_ms", "must be greater than zero"));
        }
        if self.stream_refresh_interval_ms == 0 {
            return Err(invalid(
                "stream_refresh_interval_ms",
                "must be greater than zero",
            ));
        }
        if self.user_chunk_size == 0 {
            return Err(invalid("user_chunk_size", "must be greater than zero"));
        }
        if self.marker_chunk_size == 0 {
            return Err(invalid("marker_chunk_size", "must be greater than zero"));
        }
        if self.broker_capacity == 0 || self.subscriber_buffer == 0 {
            return Err(invalid(
                "broker_capacity",
                "broker queues must hold at least one event",
            ));
        }
        // Job names are the first segment of `job.grade.id` keys.
        for job in self
            .visible_jobs
            .iter()
            .chain(self.access.iter().map(|rule| &rule.job))
        {
            if job.is_empty() || job.contains('.') {
                return Err(invalid("visible_jobs", format!("bad job name '{job}'")));
            }
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

/// `<home>/.livemap/config.yaml`: pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    home.join(".livemap").join("config.yaml")
}

/// Load the config, falling back to defaults when the file does not exist.
///
/// Returns `ConfigError::Parse` (with path + line context) on malformed YAML
/// and `ConfigError::Invalid` when a value fails [`LivemapConfig::validate`].
pub fn load_at(home: &Path) -> Result<LivemapConfig, ConfigError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Ok(LivemapConfig::default());
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    let config: LivemapConfig =
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })?;
    config.validate()?;
    Ok(config)
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<LivemapConfig, ConfigError> {
    load_at(&home()?)
}

/// Atomically save the config.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_at(home: &Path, config: &LivemapConfig) -> Result<(), ConfigError> {
    let path = config_path_at(home);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    }
    let tmp = path.with_file_name("config.yaml.tmp");
    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&tmp, yaml).map_err(|e| io_err(&tmp, e))?;
    set_file_permissions(&tmp)?;
    std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
    Ok(())
}

/// `save_at` convenience wrapper.
pub fn save(config: &LivemapConfig) -> Result<(), ConfigError> {
    save_at(&home()?, config)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.into(),
        source,
    }
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
