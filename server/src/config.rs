//! Server configuration handling.
//!
//! Configuration comes from a YAML file, overridden by `DAQHIST_*`
//! environment variables, overridden in turn by command-line flags (the
//! flags are applied in `main`). Missing file or unparsable content falls
//! back to defaults with a warning rather than refusing to start.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use daqhist_session::Configuration;

/// Historian server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for client connections
    pub listen: String,
    /// Root directory of the trace store
    pub data_dir: String,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Per-session engine settings
    pub session: SessionConfig,
}

/// Engine settings exposed through the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Outbound buffer count per session
    pub max_buffers: usize,
    /// Initial capacity of each outbound buffer, bytes
    pub buffer_capacity: usize,
    /// Backlog byte ceiling before emission stops
    pub max_queued_bytes: u64,
    /// Backlog frame-count ceiling before emission stops
    pub max_queued_count: u32,
    /// Moderated-download threshold in bytes; 0 disables moderation
    pub moderated_rate: u64,
    /// Whether large payloads are split into segments
    pub segmentation: bool,
    /// Default per-tick segment ceiling, bytes
    pub segment_ceiling: u64,
    /// Keepalive silence interval, seconds
    pub keepalive_interval_secs: u64,
    /// Unauthenticated connection timeout, seconds
    pub login_timeout_secs: u64,
    /// Grace period after failed authentication, seconds
    pub auth_fail_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7654".to_string(),
            data_dir: "./daqdata".to_string(),
            log_level: "info".to_string(),
            session: SessionConfig::default(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        let engine = Configuration::default();
        Self {
            max_buffers: engine.max_buffers,
            buffer_capacity: engine.buffer_capacity,
            max_queued_bytes: engine.max_queued_bytes,
            max_queued_count: engine.max_queued_count,
            moderated_rate: engine.moderated_rate.unwrap_or(0),
            segmentation: engine.segmentation,
            segment_ceiling: engine.segment_ceiling,
            keepalive_interval_secs: engine.keepalive_interval.as_secs(),
            login_timeout_secs: engine.login_timeout.as_secs(),
            auth_fail_grace_secs: engine.auth_fail_grace.as_secs(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a file, then apply environment overrides.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        if let Ok(content) = std::fs::read_to_string(&config_path) {
            match serde_yaml::from_str::<ServerConfig>(&content) {
                Ok(parsed) => {
                    config = parsed;
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(err) => {
                    warn!(
                        "Failed to parse config file {:?} ({err}), using defaults",
                        config_path.as_ref()
                    );
                }
            }
        } else {
            warn!(
                "Config file {:?} not found, using defaults",
                config_path.as_ref()
            );
        }

        config.apply_environment_overrides();
        Ok(config)
    }

    fn apply_environment_overrides(&mut self) {
        if let Ok(listen) = std::env::var("DAQHIST_LISTEN") {
            info!("Listen address overridden by environment: {listen}");
            self.listen = listen;
        }
        if let Ok(data_dir) = std::env::var("DAQHIST_DATA_DIR") {
            info!("Data directory overridden by environment: {data_dir}");
            self.data_dir = data_dir;
        }
        if let Ok(log_level) = std::env::var("DAQHIST_LOG_LEVEL") {
            self.log_level = log_level;
        }
    }

    /// Derive the engine configuration for one session.
    pub fn engine_config(&self) -> Configuration {
        let s = &self.session;
        Configuration {
            max_buffers: s.max_buffers,
            buffer_capacity: s.buffer_capacity,
            max_queued_bytes: s.max_queued_bytes,
            max_queued_count: s.max_queued_count,
            moderated_rate: (s.moderated_rate > 0).then_some(s.moderated_rate),
            segmentation: s.segmentation,
            segment_ceiling: s.segment_ceiling,
            keepalive_interval: Duration::from_secs(s.keepalive_interval_secs),
            login_timeout: Duration::from_secs(s.login_timeout_secs),
            auth_fail_grace: Duration::from_secs(s.auth_fail_grace_secs),
            ..Configuration::default()
        }
    }
}
