use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::core::{Result, SyncError};
use crate::protocol::server::DEFAULT_MAX_FRAME;

/// Settings of the protocol server and the sync scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address the protocol server binds to
    pub host: String,

    /// Port of the protocol server; 0 picks a free one
    pub port: u16,

    /// Steady-state pause between sync passes, in seconds
    pub sync_interval_secs: u64,

    /// A sync lock held longer than `sync_interval * stale_lock_multiple` is reset
    pub stale_lock_multiple: u32,

    /// Rows per commit of batched client loads
    pub batch_size: usize,

    /// Route table file (operation code to handler chain), reloaded on change
    pub routes_path: PathBuf,

    /// Market segments acknowledged without being stored
    pub skip_market_segments: Vec<String>,

    /// JSON lines file receiving CRM upserts when no CRM is connected
    pub sink_path: PathBuf,

    /// Largest accepted request document, in bytes
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 14_777,
            sync_interval_secs: 60,
            stale_lock_multiple: 18,
            batch_size: 100,
            routes_path: PathBuf::from("routes.toml"),
            skip_market_segments: Vec::new(),
            sink_path: PathBuf::from("crm-upserts.jsonl"),
            max_frame_bytes: DEFAULT_MAX_FRAME,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| SyncError::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a TOML config file. Relative paths inside it are resolved against the
    /// file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("cannot read config {}: {}", path.display(), e)))?;
        let mut config = Self::parse(&text)?;
        if let Some(dir) = path.parent() {
            for p in [&mut config.routes_path, &mut config.sink_path] {
                if p.is_relative() {
                    *p = dir.join(&*p);
                }
            }
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(SyncError::Config("host must not be empty".into()));
        }
        if self.sync_interval_secs == 0 {
            return Err(SyncError::Config("sync_interval_secs must be at least 1".into()));
        }
        if self.stale_lock_multiple == 0 {
            return Err(SyncError::Config("stale_lock_multiple must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(SyncError::Config("batch_size must be at least 1".into()));
        }
        if self.max_frame_bytes == 0 {
            return Err(SyncError::Config("max_frame_bytes must be at least 1".into()));
        }
        Ok(())
    }

    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval_secs = interval.as_secs().max(1);
        self
    }

    pub fn stale_lock_multiple(mut self, multiple: u32) -> Self {
        self.stale_lock_multiple = multiple;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn routes_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.routes_path = path.into();
        self
    }

    pub fn skip_market_segments(mut self, segments: Vec<String>) -> Self {
        self.skip_market_segments = segments;
        self
    }

    pub fn sink_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.sink_path = path.into();
        self
    }

    pub fn max_frame_bytes(mut self, bytes: usize) -> Self {
        self.max_frame_bytes = bytes;
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
