//! SFTP sessions: directory listing, file operations and downloads.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::client::ClientHandle;
use crate::connection::{
    ConnectionFactory, FileTransfer, RemoteConnection, RemoteEntry, S_IFBLK, S_IFCHR, S_IFDIR,
    S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK,
};
use crate::protocol::{Channel, DirEntry, ServerEvent, StatusMessage, TransferEvent};
use crate::session::{ManagedSession, SessionId, SessionInfo, SessionRegistry, ShutdownSignal};
use crate::transfer::{FileStreamer, TransferSummary};
use crate::{ClientId, Error, Result};

/// Status text once an SFTP session is up.
pub const SFTP_ESTABLISHED: &str = "SFTP CONNECTION ESTABLISHED";

// -----------------------------------------------------------------------------
// Session
// -----------------------------------------------------------------------------

/// One SFTP session. The subsystem is started on first use and cached.
pub struct SftpSession {
    id: SessionId,
    client: ClientHandle,
    device_uuid: String,
    host: String,
    connection: Arc<dyn RemoteConnection>,
    subsystem: tokio::sync::Mutex<Option<Arc<dyn FileTransfer>>>,
    shutdown: ShutdownSignal,
    started_at: Instant,
}

impl SftpSession {
    pub fn new(
        id: SessionId,
        client: ClientHandle,
        device_uuid: String,
        host: String,
        connection: Arc<dyn RemoteConnection>,
    ) -> Self {
        Self {
            id,
            client,
            device_uuid,
            host,
            connection,
            subsystem: tokio::sync::Mutex::new(None),
            shutdown: ShutdownSignal::new(),
            started_at: Instant::now(),
        }
    }

    pub fn device_uuid(&self) -> &str {
        &self.device_uuid
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the cached subsystem handle, starting it on first use.
    pub async fn file_transfer(&self) -> Result<Arc<dyn FileTransfer>> {
        let mut slot = self.subsystem.lock().await;
        if self.shutdown.is_signaled() {
            return Err(Error::SessionClosed);
        }
        if let Some(handle) = slot.as_ref() {
            return Ok(Arc::clone(handle));
        }

        let handle = self.connection.open_sftp().await.map_err(|err| match err {
            Error::SubsystemUnavailable(_) => err,
            other => Error::SubsystemUnavailable(other.to_string()),
        })?;
        if self.shutdown.is_signaled() {
            handle.close().await;
            return Err(Error::SessionClosed);
        }

        debug!(session_id = %self.id, "SFTP subsystem cached");
        *slot = Some(Arc::clone(&handle));
        Ok(handle)
    }
}

#[async_trait]
impl ManagedSession for SftpSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn client_id(&self) -> &ClientId {
        self.client.id()
    }

    fn info(&self) -> SessionInfo {
        SessionInfo::new(
            self.id,
            self.client.id().clone(),
            self.device_uuid.clone(),
            self.host.clone(),
            self.started_at,
        )
    }

    fn is_orphaned(&self) -> bool {
        !self.client.is_connected()
    }

    async fn teardown(&self) {
        self.shutdown.signal();

        // An initialization in flight holds the slot; it fails once the
        // connection is gone, so close the connection before waiting on it.
        let cached = match self.subsystem.try_lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(handle) = cached {
            handle.close().await;
        }
        self.connection.close().await;
        if let Some(handle) = self.subsystem.lock().await.take() {
            handle.close().await;
        }
        debug!(session_id = %self.id, device_uuid = %self.device_uuid, "SFTP session torn down");
    }
}

// -----------------------------------------------------------------------------
// Listing normalization
// -----------------------------------------------------------------------------

impl From<RemoteEntry> for DirEntry {
    fn from(entry: RemoteEntry) -> Self {
        let attrs = entry.attrs;
        let kind = attrs.mode & S_IFMT;
        let longname = entry
            .longname
            .filter(|line| !line.is_empty())
            .unwrap_or_else(|| long_listing(&entry.filename, &attrs));
        Self {
            longname,
            filename: entry.filename,
            size: attrs.size,
            mode: attrs.mode,
            uid: attrs.uid,
            gid: attrs.gid,
            is_file: kind == S_IFREG,
            is_dir: kind == S_IFDIR,
            is_symbolic_link: kind == S_IFLNK,
            is_block_device: kind == S_IFBLK,
            is_character_device: kind == S_IFCHR,
            is_fifo: kind == S_IFIFO,
            is_socket: kind == S_IFSOCK,
        }
    }
}

/// Renders `drwxr-xr-x` style permissions.
pub fn permission_string(mode: u32) -> String {
    let type_char = match mode & S_IFMT {
        S_IFDIR => 'd',
        S_IFLNK => 'l',
        S_IFBLK => 'b',
        S_IFCHR => 'c',
        S_IFIFO => 'p',
        S_IFSOCK => 's',
        _ => '-',
    };
    let mut out = String::with_capacity(10);
    out.push(type_char);
    for (shift, special, special_char) in [(6, 0o4000, 's'), (3, 0o2000, 's'), (0, 0o1000, 't')] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        let exec = bits & 0o1 != 0;
        out.push(match (mode & special != 0, exec) {
            (true, true) => special_char,
            (true, false) => special_char.to_ascii_uppercase(),
            (false, true) => 'x',
            (false, false) => '-',
        });
    }
    out
}

fn long_listing(filename: &str, attrs: &crate::connection::RemoteAttrs) -> String {
    format!(
        "{} 1 {} {} {:>8} {}",
        permission_string(attrs.mode),
        attrs.uid,
        attrs.gid,
        attrs.size,
        filename
    )
}

fn require_path<'a>(path: &'a str, message: &str) -> Result<&'a str> {
    if path.trim().is_empty() {
        Err(Error::InvalidRequest(message.to_string()))
    } else {
        Ok(path)
    }
}

// -----------------------------------------------------------------------------
// Controller
// -----------------------------------------------------------------------------

/// Starts SFTP sessions and runs file operations on them.
pub struct SftpSessionController {
    factory: Arc<ConnectionFactory>,
    registry: Arc<SessionRegistry<SftpSession>>,
    staging_root: PathBuf,
    streamer: FileStreamer,
}

impl SftpSessionController {
    pub fn new(
        factory: Arc<ConnectionFactory>,
        registry: Arc<SessionRegistry<SftpSession>>,
        staging_root: impl Into<PathBuf>,
        streamer: FileStreamer,
    ) -> Self {
        Self {
            factory,
            registry,
            staging_root: staging_root.into(),
            streamer,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry<SftpSession>> {
        &self.registry
    }

    /// Connects to a device and registers an SFTP session for `client`.
    pub async fn start_session(&self, client: &ClientHandle, device_uuid: &str) -> Result<SessionId> {
        info!(client_id = %client.id(), device_uuid, "Starting SFTP session");

        let established = match self.factory.connect(device_uuid).await {
            Ok(established) => established,
            Err(err) => {
                let message = crate::shell::classify_connection_error(&err, client.origin());
                error!(client_id = %client.id(), device_uuid, error = %err, "Failed to create SFTP session");
                client
                    .status(Channel::Sftp, StatusMessage::disconnect(message))
                    .await;
                return Err(err);
            }
        };

        let Some(session) = self.registry.create_session(client.id(), |id| {
            SftpSession::new(
                id,
                client.clone(),
                device_uuid.to_string(),
                established.host.clone(),
                Arc::clone(&established.connection),
            )
        }) else {
            info!(client_id = %client.id(), device_uuid, "Client left during connect, dropping SFTP connection");
            established.connection.close().await;
            return Err(Error::ClientDisconnected);
        };

        client
            .status(Channel::Sftp, StatusMessage::ok(SFTP_ESTABLISHED))
            .await;
        tokio::spawn(watch_termination(
            Arc::clone(&self.registry),
            Arc::clone(&session),
        ));
        Ok(session.id)
    }

    /// Lists a directory in one batch.
    pub async fn list_directory(&self, client: &ClientHandle, path: &str) -> Result<Vec<DirEntry>> {
        let path = require_path(path, "Invalid directory path")?;
        let transfer = self.file_transfer(client).await?;
        let entries = transfer.read_dir(path).await.map_err(|err| {
            warn!(client_id = %client.id(), path, error = %err, "Directory listing failed");
            err
        })?;
        debug!(client_id = %client.id(), path, entries = entries.len(), "Directory listed");
        Ok(entries.into_iter().map(DirEntry::from).collect())
    }

    /// Creates one directory level.
    pub async fn mkdir(&self, client: &ClientHandle, path: &str) -> Result<()> {
        let path = require_path(path, "Invalid directory path")?;
        self.file_transfer(client).await?.mkdir(path).await?;
        info!(client_id = %client.id(), path, "Directory created");
        Ok(())
    }

    pub async fn rename(&self, client: &ClientHandle, old_path: &str, new_path: &str) -> Result<()> {
        let old_path = require_path(old_path, "Missing oldPath or newPath")?;
        let new_path = require_path(new_path, "Missing oldPath or newPath")?;
        self.file_transfer(client)
            .await?
            .rename(old_path, new_path)
            .await?;
        info!(client_id = %client.id(), old_path, new_path, "Path renamed");
        Ok(())
    }

    pub async fn chmod(&self, client: &ClientHandle, path: &str, mode: u32) -> Result<()> {
        let path = require_path(path, "Missing path or mode (e.g., 0o755)")?;
        if mode > 0o7777 {
            return Err(Error::InvalidRequest(format!("mode out of range: {mode:o}")));
        }
        self.file_transfer(client).await?.chmod(path, mode).await?;
        info!(client_id = %client.id(), path, mode = %format!("{mode:o}"), "Permissions changed");
        Ok(())
    }

    /// Removes an empty directory (`is_dir`) or a file.
    pub async fn delete(&self, client: &ClientHandle, path: &str, is_dir: bool) -> Result<()> {
        let path = require_path(path, "Invalid delete request (path and isDir are required)")?;
        let transfer = self.file_transfer(client).await?;
        if is_dir {
            transfer.rmdir(path).await?;
        } else {
            transfer.unlink(path).await?;
        }
        info!(client_id = %client.id(), path, is_dir, "Path deleted");
        Ok(())
    }

    /// Fetches a remote file into a fresh staging directory and streams it to
    /// the client. Every failure is reported as a `download:error` event.
    pub async fn download(&self, client: &ClientHandle, path: &str) -> Result<TransferSummary> {
        match self.stage_and_stream(client, path).await {
            Ok(summary) => Ok(summary),
            Err(err @ (Error::FileNotFound(_) | Error::StreamRead(_) | Error::ClientDisconnected)) => {
                // Already reported by the streamer.
                Err(err)
            }
            Err(err) => {
                warn!(client_id = %client.id(), path, error = %err, "Download failed");
                client
                    .emit(ServerEvent::Transfer(TransferEvent::Error {
                        message: err.to_string(),
                    }))
                    .await;
                Err(err)
            }
        }
    }

    async fn stage_and_stream(&self, client: &ClientHandle, path: &str) -> Result<TransferSummary> {
        let path = require_path(path, "Missing remotePath")?;
        let filename = Path::new(path)
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| Error::InvalidRequest("Invalid path".to_string()))?
            .to_string();

        let transfer = self.file_transfer(client).await?;
        let attrs = transfer.stat(path).await?;
        if attrs.is_dir() {
            return Err(Error::ProtocolOperation(
                "Cannot download a directory".to_string(),
            ));
        }

        let staging = create_staging_dir(&self.staging_root, staging_name).await?;
        debug!(client_id = %client.id(), path, staging = %staging.display(), "Staging download");

        let result = async {
            let bytes = transfer.fetch(path, &staging.join(&filename)).await?;
            debug!(path, bytes, "Remote file fetched");
            self.streamer.send_file(client, &staging, &filename).await
        }
        .await;

        if let Err(err) = tokio::fs::remove_dir_all(&staging).await {
            warn!(staging = %staging.display(), error = %err, "Failed to remove staging directory");
        }
        result
    }

    /// Closes the addressed session (or the client's first one).
    pub async fn close_session(
        &self,
        client: &ClientHandle,
        session_id: Option<SessionId>,
    ) -> Result<()> {
        let session = self.session_for(client, session_id)?;
        self.registry.close_session(session.id).await;
        Ok(())
    }

    pub async fn close_client_sessions(&self, client_id: &ClientId) -> usize {
        self.registry.close_all_for_client(client_id).await
    }

    fn session_for(
        &self,
        client: &ClientHandle,
        session_id: Option<SessionId>,
    ) -> Result<Arc<SftpSession>> {
        match session_id {
            Some(id) => self.registry.owned_by(client.id(), id),
            None => self.registry.first_session_of(client.id()),
        }
        .ok_or(Error::NoActiveSession)
    }

    async fn file_transfer(&self, client: &ClientHandle) -> Result<Arc<dyn FileTransfer>> {
        self.session_for(client, None)?.file_transfer().await
    }
}

/// Attempts at a fresh staging name before giving up.
const STAGING_ATTEMPTS: usize = 16;

fn staging_name() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// Creates a staging directory no other download holds. An existing name is
/// never reused.
async fn create_staging_dir(root: &Path, mut next_name: impl FnMut() -> String) -> Result<PathBuf> {
    tokio::fs::create_dir_all(root).await?;
    for _ in 0..STAGING_ATTEMPTS {
        let candidate = root.join(next_name());
        match tokio::fs::create_dir(&candidate).await {
            Ok(()) => return Ok(candidate),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!(staging = %candidate.display(), "Staging name taken, retrying");
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(Error::Io(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        "no free staging directory name",
    )))
}

/// Tears the session down when the connection ends from the device's side.
async fn watch_termination(registry: Arc<SessionRegistry<SftpSession>>, session: Arc<SftpSession>) {
    let mut shutdown = session.shutdown.subscribe();
    let termination = tokio::select! {
        biased;
        () = shutdown.wait() => return,
        termination = session.connection.closed() => termination,
    };

    info!(session_id = %session.id, termination = ?termination, "SFTP connection terminated");
    if registry.close_session(session.id).await {
        session
            .client
            .status(
                Channel::Sftp,
                StatusMessage::disconnect(termination.status_message("SFTP")),
            )
            .await;
    }
}
