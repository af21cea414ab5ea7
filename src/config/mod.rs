//! Configuration
//!
//! TOML-backed configuration with built-in defaults. Every field has a
//! default so an empty file (or no file at all) yields a working embedded
//! setup: stub authorities, no mediator address (callers embedding the
//! in-memory backend inject it explicitly), and production poll
//! intervals.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Which implementation backs an authority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthorityMode {
    /// Permissive stub: grants access, returns empty metadata
    #[default]
    Stub,
    /// Remote authority service supplied by the embedding application
    Remote,
}

/// Secret cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediatorConfig {
    /// `host:port` of the cache daemon; absent means not configured
    pub address: Option<String>,
    /// Connect and per-operation timeout
    pub connect_timeout_seconds: u64,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            address: None,
            connect_timeout_seconds: 5,
        }
    }
}

/// Scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum concurrently running jobs
    pub max_concurrency: usize,
    /// Dispatcher tick interval in milliseconds
    pub tick_ms: u64,
    /// Permission authority selection, fixed at construction
    pub permission_authority: AuthorityMode,
    /// Resource authority selection, fixed at construction
    pub resource_authority: AuthorityMode,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            tick_ms: 500,
            permission_authority: AuthorityMode::Stub,
            resource_authority: AuthorityMode::Stub,
        }
    }
}

/// Client poller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerSettings {
    /// Interval between request polls, milliseconds
    pub request_poll_ms: u64,
    /// Ceiling after which a pending request is reported but not failed,
    /// milliseconds
    pub request_ceiling_ms: u64,
    /// Interval between job-start polls, milliseconds
    pub start_poll_ms: u64,
    /// Lines fetched per tail page
    pub tail_page_lines: usize,
    /// Sleep between tail polls on a short page, milliseconds
    pub tail_poll_ms: u64,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            request_poll_ms: 2_000,
            request_ceiling_ms: 60_000,
            start_poll_ms: 2_000,
            tail_page_lines: 100,
            tail_poll_ms: 500,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GateConfig {
    /// Directory job artifacts are spooled under
    pub spool_dir: Option<PathBuf>,
    /// Secret cache settings
    pub mediator: MediatorConfig,
    /// Scheduler settings
    pub scheduler: SchedulerConfig,
    /// Client poller settings
    pub poller: PollerSettings,
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl GateConfig {
    /// Load configuration from a TOML file, falling back to built-in
    /// defaults for anything the file does not set
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
