//! Device directory: device UUID → host and credentials.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// A managed device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub uuid: String,
    /// Hostname or IPv4 literal.
    pub host: String,
}

/// How to authenticate against a device.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthMethod {
    /// Username + password.
    Password { password: String },
    /// Private key, inline PEM or a path to one.
    Key {
        #[serde(default)]
        private_key: Option<String>,
        #[serde(default)]
        private_key_path: Option<PathBuf>,
        #[serde(default)]
        passphrase: Option<String>,
    },
    /// `none` auth, falling back to keyboard-interactive.
    None,
}

impl AuthMethod {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Password { .. } => "password",
            Self::Key { .. } => "publickey",
            Self::None => "none",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password { .. } => f.debug_struct("Password").finish_non_exhaustive(),
            Self::Key {
                private_key_path, ..
            } => f
                .debug_struct("Key")
                .field("private_key_path", private_key_path)
                .finish_non_exhaustive(),
            Self::None => f.write_str("None"),
        }
    }
}

/// Credentials for a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAuth {
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(flatten)]
    pub method: AuthMethod,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

/// A `[[devices]]` entry of the gateway configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub uuid: String,
    pub host: String,
    #[serde(default)]
    pub auth: Option<DeviceAuth>,
}

/// Source of device records and credentials.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn find_device(&self, uuid: &str) -> Option<Device>;

    async fn find_auth(&self, uuid: &str) -> Option<DeviceAuth>;
}

/// In-memory directory built from configuration.
#[derive(Debug, Default, Clone)]
pub struct StaticDeviceDirectory {
    records: HashMap<String, DeviceRecord>,
}

impl StaticDeviceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = DeviceRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|record| (record.uuid.clone(), record))
                .collect(),
        }
    }

    /// Adds or replaces a device.
    pub fn insert(&mut self, record: DeviceRecord) {
        self.records.insert(record.uuid.clone(), record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl DeviceDirectory for StaticDeviceDirectory {
    async fn find_device(&self, uuid: &str) -> Option<Device> {
        self.records.get(uuid).map(|record| Device {
            uuid: record.uuid.clone(),
            host: record.host.clone(),
        })
    }

    async fn find_auth(&self, uuid: &str) -> Option<DeviceAuth> {
        self.records.get(uuid)?.auth.clone()
    }
}
