#![forbid(unsafe_code)]
// Allow pedantic lints for early-stage API ergonomics.
#![allow(clippy::doc_markdown)]
#![allow(clippy::nursery)]
#![allow(clippy::pedantic)]

//! # Shellbridge
//!
//! A gateway that gives browser clients interactive shell and file-system
//! access to managed devices over SSH.
//!
//! Browser clients speak a framed JSON event protocol over a websocket.
//! Shellbridge bridges those events onto byte-stream protocols:
//! - an interactive PTY shell channel per shell session
//! - the SFTP subsystem for directory listing, file operations and downloads
//!
//! ## Features
//!
//! - **Per-client multi-session model**: one websocket may own many device sessions
//! - **Idempotent teardown**: explicit close, client disconnect, remote end/close/error
//!   and stream errors all converge on a single release of each connection
//! - **Cached SFTP subsystem**: created lazily once per session
//! - **Chunked downloads**: files are staged locally and streamed with
//!   metadata/chunk/complete framing
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use shellbridge::{GatewayAdapter, GatewayConfig, RusshConnector, StaticDeviceDirectory};
//!
//! #[tokio::main]
//! async fn main() -> shellbridge::Result<()> {
//!     let config = GatewayConfig::load("shellbridge.toml")?;
//!     let directory = Arc::new(StaticDeviceDirectory::from_records(config.devices.clone()));
//!     let adapter = Arc::new(GatewayAdapter::from_config(
//!         &config,
//!         directory,
//!         Arc::new(RusshConnector::new()),
//!     ));
//!     shellbridge::gateway::serve(&config, adapter).await
//! }
//! ```

use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod client;
pub mod config;
pub mod connection;
pub mod device;
pub mod gateway;
pub mod protocol;
pub mod session;
pub mod sftp;
pub mod shell;
pub mod transfer;

pub use client::ClientHandle;
pub use config::{GatewayConfig, SshOptions, TransferOptions};
pub use connection::{
    ConnectParams, ConnectionFactory, Connector, Established, FileTransfer, HostResolver,
    PtyRequest, RemoteAttrs, RemoteConnection, RemoteEntry, RemoteTermination, RusshConnector,
    ShellChannel, ShellInput, ShellOutput, ShellWriter, SystemResolver, TerminalGeometry,
    resolve_host,
};
pub use device::{AuthMethod, Device, DeviceAuth, DeviceDirectory, DeviceRecord, StaticDeviceDirectory};
pub use gateway::GatewayAdapter;
pub use protocol::{Channel, Reply, ServerEvent, StatusKind, StatusMessage, TransferEvent};
pub use session::{ManagedSession, SessionId, SessionRegistry, ShutdownListener, ShutdownSignal};
pub use sftp::{SftpSession, SftpSessionController};
pub use shell::{ShellSession, ShellSessionController, ShellState, classify_connection_error};
pub use transfer::{FileStreamer, TransferSummary};

// -----------------------------------------------------------------------------
// Client Identity
// -----------------------------------------------------------------------------

/// Identifier of one connected transport peer (one websocket).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Creates a client id from an arbitrary string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random client id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

// -----------------------------------------------------------------------------
// Error Types
// -----------------------------------------------------------------------------

/// Errors that can occur while bridging clients to device sessions.
///
/// Connection-establishment variants carry the human-readable text that is
/// shown to clients, so `to_string()` is already the classified message for
/// [`HostResolution`](Error::HostResolution) and
/// [`ConnectionTimeout`](Error::ConnectionTimeout).
///
/// # Recovery Strategies
///
/// | Error Variant | Recovery Strategy |
/// |--------------|-------------------|
/// | [`DeviceNotFound`](Error::DeviceNotFound) | Check the device UUID sent by the client |
/// | [`AuthNotFound`](Error::AuthNotFound) | Configure credentials for the device |
/// | [`HostResolution`](Error::HostResolution) | Check the device hostname / DNS |
/// | [`AuthenticationFailure`](Error::AuthenticationFailure) | Fix device credentials |
/// | [`ConnectionTimeout`](Error::ConnectionTimeout) | Device unreachable, retry later |
/// | [`ShellAllocation`](Error::ShellAllocation) | Session is torn down, client may retry |
/// | [`SubsystemUnavailable`](Error::SubsystemUnavailable) | Device has no SFTP server |
/// | [`ProtocolOperation`](Error::ProtocolOperation) | Reported to the requesting operation only |
/// | [`InvalidRequest`](Error::InvalidRequest) | Client sent malformed fields |
#[derive(Error, Debug)]
pub enum Error {
    /// No device is registered under the requested UUID.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// The device exists but has no credentials.
    #[error("no credentials configured for device: {0}")]
    AuthNotFound(String),

    /// The device hostname could not be resolved to an IPv4 address.
    #[error("Host not found: {hostname}")]
    HostResolution {
        /// The hostname that failed to resolve.
        hostname: String,
    },

    /// The device rejected every authentication attempt.
    #[error("Authentication failure")]
    AuthenticationFailure,

    /// The handshake did not complete within the connect timeout.
    #[error("Connection Timeout")]
    ConnectionTimeout,

    /// The device refused to allocate a PTY shell.
    #[error("shell allocation failed: {0}")]
    ShellAllocation(String),

    /// The SFTP subsystem could not be started.
    #[error("SFTP subsystem unavailable: {0}")]
    SubsystemUnavailable(String),

    /// A remote file operation (list, mkdir, rename, chmod, delete, fetch) failed.
    #[error("{0}")]
    ProtocolOperation(String),

    /// A local file to stream does not exist.
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// Reading a local or remote stream failed midway.
    #[error("stream read error: {0}")]
    StreamRead(String),

    /// The shell stream was already closed.
    #[error("shell stream closed")]
    StreamClosed,

    /// The session was torn down while an operation was in flight.
    #[error("session closed")]
    SessionClosed,

    /// The client connection went away while events were being delivered.
    #[error("client disconnected")]
    ClientDisconnected,

    /// The client owns no session on the addressed channel.
    #[error("No active session")]
    NoActiveSession,

    /// A request carried missing or mistyped fields.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Underlying russh library error.
    #[error("russh error: {0}")]
    Russh(#[from] russh::Error),

    /// Key loading error from russh-keys.
    #[error("key loading error: {0}")]
    KeyLoad(#[from] russh_keys::Error),

    /// Gateway configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Address parse error.
    #[error("address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    /// JSON encoding or decoding error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns the wire-level category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DeviceNotFound(_) => ErrorKind::DeviceNotFound,
            Self::AuthNotFound(_) => ErrorKind::AuthNotFound,
            Self::HostResolution { .. } => ErrorKind::HostResolutionError,
            Self::AuthenticationFailure => ErrorKind::AuthenticationFailure,
            Self::ConnectionTimeout => ErrorKind::ConnectionTimeout,
            Self::ShellAllocation(_) => ErrorKind::ShellAllocationError,
            Self::SubsystemUnavailable(_) => ErrorKind::SubsystemUnavailable,
            Self::ProtocolOperation(_) => ErrorKind::ProtocolOperationError,
            Self::FileNotFound(_) => ErrorKind::FileNotFound,
            Self::StreamRead(_) | Self::StreamClosed => ErrorKind::StreamReadError,
            Self::NoActiveSession | Self::SessionClosed => ErrorKind::NoActiveSession,
            Self::InvalidRequest(_) | Self::Json(_) => ErrorKind::InvalidRequest,
            Self::ClientDisconnected
            | Self::Io(_)
            | Self::Russh(_)
            | Self::KeyLoad(_)
            | Self::Configuration(_)
            | Self::AddrParse(_) => ErrorKind::Internal,
        }
    }
}

/// Serializable error category sent to clients next to the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    DeviceNotFound,
    AuthNotFound,
    HostResolutionError,
    AuthenticationFailure,
    ConnectionTimeout,
    ShellAllocationError,
    SubsystemUnavailable,
    ProtocolOperationError,
    FileNotFound,
    StreamReadError,
    NoActiveSession,
    InvalidRequest,
    Internal,
}

/// A specialized [`Result`] type for shellbridge operations.
pub type Result<T> = std::result::Result<T, Error>;

// -----------------------------------------------------------------------------
// Prelude
// -----------------------------------------------------------------------------

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{
        Channel, ClientHandle, ClientId, ConnectionFactory, Error, ErrorKind, GatewayAdapter,
        GatewayConfig, Reply, Result, ServerEvent, SessionId, SessionRegistry,
        SftpSessionController, ShellSessionController, StatusKind, StatusMessage,
    };
}
