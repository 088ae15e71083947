//! Outbound SSH connections to devices.
//!
//! The transport sits behind two seams:
//! - [`Connector`] opens and authenticates a connection from [`ConnectParams`]
//! - [`RemoteConnection`] is a live, authenticated connection that can open a
//!   PTY shell or the SFTP subsystem
//!
//! [`ConnectionFactory`] composes device lookup, host resolution and a bounded
//! connect attempt on top of a `Connector`. The production connector is
//! [`RusshConnector`].

mod ssh;

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::device::{DeviceAuth, DeviceDirectory};
use crate::{Error, Result};

pub use ssh::RusshConnector;

/// Default bound on one connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

// -----------------------------------------------------------------------------
// Host resolution
// -----------------------------------------------------------------------------

/// IPv4 name lookup.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn lookup_ipv4(&self, hostname: &str) -> io::Result<Vec<Ipv4Addr>>;
}

/// Resolver backed by the system resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn lookup_ipv4(&self, hostname: &str) -> io::Result<Vec<Ipv4Addr>> {
        let addrs = tokio::net::lookup_host((hostname, 0)).await?;
        Ok(addrs
            .filter_map(|addr| match addr.ip() {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .collect())
    }
}

/// Resolves a device hostname to a single IPv4 address.
///
/// A dotted-quad literal is returned as is without consulting the resolver.
pub async fn resolve_host(resolver: &dyn HostResolver, hostname: &str) -> Result<String> {
    if hostname.parse::<Ipv4Addr>().is_ok() {
        return Ok(hostname.to_string());
    }

    let not_found = || Error::HostResolution {
        hostname: hostname.to_string(),
    };
    match resolver.lookup_ipv4(hostname).await {
        Ok(addrs) => {
            let addr = addrs.first().ok_or_else(not_found)?;
            debug!(hostname, address = %addr, "Resolved device host");
            Ok(addr.to_string())
        }
        Err(err) => {
            warn!(hostname, error = %err, "Host resolution failed");
            Err(not_found())
        }
    }
}

// -----------------------------------------------------------------------------
// Connection seams
// -----------------------------------------------------------------------------

/// Everything a connector needs for one attempt.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub device_uuid: String,
    /// Hostname as registered for the device.
    pub hostname: String,
    /// Resolved IPv4 address.
    pub address: String,
    pub port: u16,
    pub auth: DeviceAuth,
}

/// Opens authenticated connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn RemoteConnection>>;
}

/// How a connection ended from the device's side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteTermination {
    /// The device ended the connection or stream (EOF).
    End,
    /// The transport closed.
    Close,
    /// The transport failed.
    Error(String),
}

impl RemoteTermination {
    /// Status text for a channel prefix such as `"SSH"` or `"SFTP"`.
    pub fn status_message(&self, prefix: &str) -> String {
        match self {
            Self::End => format!("{prefix} CONNECTION ENDED"),
            Self::Close => format!("{prefix} CONNECTION CLOSED"),
            Self::Error(message) => message.clone(),
        }
    }
}

/// PTY dimensions. Rows/cols are characters, height/width pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalGeometry {
    pub rows: u32,
    pub cols: u32,
    pub height: u32,
    pub width: u32,
}

/// Parameters of a PTY shell request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub geometry: TerminalGeometry,
}

/// A live, authenticated connection to one device.
#[async_trait]
pub trait RemoteConnection: Send + Sync {
    /// Authentication banner sent by the server, if any.
    fn banner(&self) -> Option<String>;

    /// Opens an interactive PTY shell.
    async fn open_shell(&self, pty: &PtyRequest) -> Result<ShellChannel>;

    /// Starts the SFTP subsystem.
    async fn open_sftp(&self) -> Result<Arc<dyn FileTransfer>>;

    /// Resolves when the connection terminates. Safe to call repeatedly and
    /// from several tasks.
    async fn closed(&self) -> RemoteTermination;

    /// Closes the connection. Idempotent.
    async fn close(&self);
}

// -----------------------------------------------------------------------------
// Shell streams
// -----------------------------------------------------------------------------

/// Input to a shell stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellInput {
    Data(Vec<u8>),
    Resize(TerminalGeometry),
    /// Send EOF and close the channel.
    End,
}

/// Output of a shell stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellOutput {
    Data(Vec<u8>),
    /// Diagnostic output (stderr).
    Stderr(Vec<u8>),
    /// The remote end sent EOF.
    Eof,
    /// The channel closed.
    Closed,
    /// The channel failed.
    Error(String),
}

/// Writing half of a shell stream. Writes are queued in order and never block.
#[derive(Debug, Clone)]
pub struct ShellWriter {
    tx: mpsc::UnboundedSender<ShellInput>,
}

impl ShellWriter {
    pub fn new(tx: mpsc::UnboundedSender<ShellInput>) -> Self {
        Self { tx }
    }

    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.send(ShellInput::Data(data.to_vec()))
    }

    pub fn resize(&self, geometry: TerminalGeometry) -> Result<()> {
        self.send(ShellInput::Resize(geometry))
    }

    /// Ends the stream. Ending an already closed stream is not an error.
    pub fn end(&self) {
        let _ = self.tx.send(ShellInput::End);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, input: ShellInput) -> Result<()> {
        self.tx.send(input).map_err(|_| Error::StreamClosed)
    }
}

/// An open PTY shell: a writer plus the ordered output of the channel.
#[derive(Debug)]
pub struct ShellChannel {
    pub writer: ShellWriter,
    pub output: mpsc::Receiver<ShellOutput>,
}

// -----------------------------------------------------------------------------
// File transfer
// -----------------------------------------------------------------------------

pub const S_IFMT: u32 = 0o170_000;
pub const S_IFSOCK: u32 = 0o140_000;
pub const S_IFLNK: u32 = 0o120_000;
pub const S_IFREG: u32 = 0o100_000;
pub const S_IFBLK: u32 = 0o060_000;
pub const S_IFDIR: u32 = 0o040_000;
pub const S_IFCHR: u32 = 0o020_000;
pub const S_IFIFO: u32 = 0o010_000;

/// Remote file attributes. Missing fields are reported as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteAttrs {
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl RemoteAttrs {
    pub fn file_type(&self) -> u32 {
        self.mode & S_IFMT
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.file_type() == S_IFREG
    }
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub filename: String,
    /// `ls -l` style line when the server provides one.
    pub longname: Option<String>,
    pub attrs: RemoteAttrs,
}

/// SFTP subsystem operations.
#[async_trait]
pub trait FileTransfer: Send + Sync {
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>>;

    /// Creates a single directory level.
    async fn mkdir(&self, path: &str) -> Result<()>;

    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    async fn chmod(&self, path: &str, mode: u32) -> Result<()>;

    /// Removes an empty directory.
    async fn rmdir(&self, path: &str) -> Result<()>;

    async fn unlink(&self, path: &str) -> Result<()>;

    async fn stat(&self, path: &str) -> Result<RemoteAttrs>;

    /// Streams a remote file into `local`. Returns the number of bytes copied.
    async fn fetch(&self, remote: &str, local: &Path) -> Result<u64>;

    async fn close(&self);
}

// -----------------------------------------------------------------------------
// Factory
// -----------------------------------------------------------------------------

/// A connection plus the address it was made to.
pub struct Established {
    pub connection: Arc<dyn RemoteConnection>,
    pub host: String,
}

/// Builds authenticated device connections.
pub struct ConnectionFactory {
    directory: Arc<dyn DeviceDirectory>,
    resolver: Arc<dyn HostResolver>,
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
}

impl ConnectionFactory {
    pub fn new(directory: Arc<dyn DeviceDirectory>, connector: Arc<dyn Connector>) -> Self {
        Self {
            directory,
            resolver: Arc::new(SystemResolver),
            connector,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Looks up, resolves, connects and authenticates. One attempt, no retry.
    pub async fn connect(&self, device_uuid: &str) -> Result<Established> {
        let device = self
            .directory
            .find_device(device_uuid)
            .await
            .ok_or_else(|| Error::DeviceNotFound(device_uuid.to_string()))?;
        let auth = self
            .directory
            .find_auth(device_uuid)
            .await
            .ok_or_else(|| Error::AuthNotFound(device_uuid.to_string()))?;

        let address = resolve_host(self.resolver.as_ref(), &device.host).await?;
        let params = ConnectParams {
            device_uuid: device.uuid.clone(),
            hostname: device.host.clone(),
            address: address.clone(),
            port: auth.port,
            auth,
        };

        debug!(
            device_uuid,
            address = %params.address,
            port = params.port,
            method = params.auth.method.name(),
            "Connecting to device"
        );
        let connection = tokio::time::timeout(self.connect_timeout, self.connector.connect(&params))
            .await
            .map_err(|_| Error::ConnectionTimeout)??;

        info!(device_uuid, host = %address, "Device connection established");
        Ok(Established {
            connection,
            host: address,
        })
    }
}
