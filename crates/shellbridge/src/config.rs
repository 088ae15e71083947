//! Gateway configuration loaded from TOML.
//!
//! ```toml
//! listen = "0.0.0.0:3001"
//! ws_path = "/ws"
//!
//! [ssh]
//! connect_timeout_secs = 20
//!
//! [transfer]
//! chunk_size = 65536
//!
//! [[devices]]
//! uuid = "3b1f..."
//! host = "db.internal"
//! auth = { type = "password", user = "root", password = "..." }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::DEFAULT_OUTBOUND_CAPACITY;
use crate::device::DeviceRecord;
use crate::{Error, Result};

/// Top-level gateway configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Socket address the websocket server binds to.
    pub listen: String,
    /// HTTP path of the websocket upgrade route.
    pub ws_path: String,
    /// Root under which per-download staging directories are created.
    pub staging_dir: PathBuf,
    /// Capacity of each client's outbound event queue.
    pub outbound_queue: usize,
    pub ssh: SshOptions,
    pub transfer: TransferOptions,
    pub devices: Vec<DeviceRecord>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3001".to_string(),
            ws_path: "/ws".to_string(),
            staging_dir: std::env::temp_dir().join("shellbridge"),
            outbound_queue: DEFAULT_OUTBOUND_CAPACITY,
            ssh: SshOptions::default(),
            transfer: TransferOptions::default(),
            devices: Vec::new(),
        }
    }
}

/// SSH connection and terminal options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshOptions {
    /// Upper bound on the connect + handshake + auth attempt.
    pub connect_timeout_secs: u64,
    /// Terminal type requested for the PTY.
    pub term: String,
    pub default_rows: u32,
    pub default_cols: u32,
    /// PTY pixel height, kept unchanged across resizes.
    pub pixel_height: u32,
    /// PTY pixel width, kept unchanged across resizes.
    pub pixel_width: u32,
}

impl SshOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 20,
            term: "xterm-256color".to_string(),
            default_rows: 24,
            default_cols: 80,
            pixel_height: 480,
            pixel_width: 640,
        }
    }
}

/// Download streaming options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferOptions {
    /// Maximum bytes per `download:chunk` event.
    pub chunk_size: usize,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
        }
    }
}

impl GatewayConfig {
    /// Reads and validates a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let config = Self::from_toml_str(&text)?;
        debug!(path = %path.display(), devices = config.devices.len(), "Configuration loaded");
        Ok(config)
    }

    /// Parses and validates configuration text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.transfer.chunk_size == 0 {
            return Err(Error::Configuration(
                "transfer.chunk_size must be greater than zero".into(),
            ));
        }
        if self.ssh.connect_timeout_secs == 0 {
            return Err(Error::Configuration(
                "ssh.connect_timeout_secs must be greater than zero".into(),
            ));
        }
        if !self.ws_path.starts_with('/') {
            return Err(Error::Configuration(format!(
                "ws_path must start with '/': {}",
                self.ws_path
            )));
        }
        if self.ssh.default_rows == 0 || self.ssh.default_cols == 0 {
            return Err(Error::Configuration(
                "terminal dimensions must be positive".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.uuid.as_str()) {
                return Err(Error::Configuration(format!(
                    "duplicate device uuid: {}",
                    device.uuid
                )));
            }
        }
        Ok(())
    }
}
