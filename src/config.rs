//! Gateway and orchestration configuration

use crate::orchestrator::AttemptSchedule;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the gateways and the orchestrator
///
/// Stored as JSON. Missing fields fall back to their defaults.
///
/// # Example
/// ```rust,no_run
/// use portmap::config::Config;
///
/// // Load config (returns default if file doesn't exist)
/// let config = Config::load("portmap.json").expect("Failed to load");
/// let schedule = config.attempt_schedule();
/// println!("{} rounds, {:?} total", schedule.len(), schedule.total());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of send/wait rounds per orchestration
    pub attempts: u32,
    /// Wait of the first round in milliseconds; each later round doubles it
    pub base_delay_ms: u64,
    /// Deadline for allocating ids and creating sockets, in milliseconds
    pub provisioning_timeout_ms: u64,
    /// Concurrent TCP connections allowed per destination authority
    pub tcp_max_connections_per_authority: usize,
    /// Largest datagram the UDP gateway will receive
    pub max_datagram_size: usize,
    /// Bytes requested per read from a TCP connection or process output stream
    pub read_chunk_size: usize,
    /// How long a cancelled process monitor waits for its readers to finish
    pub reader_join_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            attempts: 4,
            base_delay_ms: 250,
            provisioning_timeout_ms: 1000,
            tcp_max_connections_per_authority: 3,
            max_datagram_size: 1500,
            read_chunk_size: 4096,
            reader_join_timeout_ms: 1000,
        }
    }
}

impl Config {
    /// Load config from a JSON file
    ///
    /// Returns the defaults if the file doesn't exist or is empty.
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        if data.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Self = serde_json::from_str(&data)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;

        Ok(config)
    }

    /// Save config to a JSON file, creating parent directories
    pub fn save<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("Failed to create config directory: {}", e)))?;
        }

        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .map_err(|e| Error::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Reject values that would make the gateways useless
    pub fn validate(&self) -> Result<()> {
        if self.attempts == 0 {
            return Err(Error::Config("attempts must be at least 1".to_string()));
        }
        if self.base_delay_ms == 0 {
            return Err(Error::Config("base_delay_ms must be positive".to_string()));
        }
        if self.tcp_max_connections_per_authority == 0 {
            return Err(Error::Config(
                "tcp_max_connections_per_authority must be at least 1".to_string(),
            ));
        }
        if self.max_datagram_size == 0 || self.read_chunk_size == 0 {
            return Err(Error::Config("buffer sizes must be positive".to_string()));
        }
        Ok(())
    }

    /// Exponential schedule built from `attempts` and `base_delay_ms`
    pub fn attempt_schedule(&self) -> AttemptSchedule {
        AttemptSchedule::exponential(self.attempts as usize, self.base_delay())
    }

    /// First-round wait as a duration
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Provisioning deadline as a duration
    pub fn provisioning_timeout(&self) -> Duration {
        Duration::from_millis(self.provisioning_timeout_ms)
    }

    /// Reader join deadline as a duration
    pub fn reader_join_timeout(&self) -> Duration {
        Duration::from_millis(self.reader_join_timeout_ms)
    }
}
