//! Interactive PTY shell sessions.
//!
//! A shell session moves through `Connecting → Ready → Streaming → Closed`.
//! One forwarder task per session owns the output receiver, so output reaches
//! the client in the order the device produced it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::client::ClientHandle;
use crate::config::SshOptions;
use crate::connection::{
    ConnectionFactory, PtyRequest, RemoteConnection, RemoteTermination, ShellChannel, ShellOutput,
    ShellWriter, TerminalGeometry,
};
use crate::protocol::{Channel, ServerEvent, StartSession, StatusMessage};
use crate::session::{ManagedSession, SessionId, SessionInfo, SessionRegistry, ShutdownSignal};
use crate::{ClientId, Error, Result};

/// Status text once a shell session is up.
pub const SSH_ESTABLISHED: &str = "SSH CONNECTION ESTABLISHED";

/// Lifecycle of a shell session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellState {
    Connecting,
    Ready,
    Streaming,
    Closed,
}

/// Maps a connection failure to the text shown to the client.
pub fn classify_connection_error(err: &Error, origin: Option<SocketAddr>) -> String {
    match err {
        Error::AuthenticationFailure => match origin {
            Some(addr) => format!("Authentication failure from={addr}"),
            None => "Authentication failure".to_string(),
        },
        Error::HostResolution { hostname } => format!("Host not found: {hostname}"),
        Error::ConnectionTimeout => "Connection Timeout".to_string(),
        Error::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => {
            "Connection Timeout".to_string()
        }
        other => other.to_string(),
    }
}

// -----------------------------------------------------------------------------
// Session
// -----------------------------------------------------------------------------

/// One shell session.
pub struct ShellSession {
    id: SessionId,
    client: ClientHandle,
    device_uuid: String,
    host: String,
    connection: Arc<dyn RemoteConnection>,
    geometry: Mutex<TerminalGeometry>,
    state: Mutex<ShellState>,
    writer: Mutex<Option<ShellWriter>>,
    shutdown: ShutdownSignal,
    started_at: Instant,
}

impl ShellSession {
    pub fn new(
        id: SessionId,
        client: ClientHandle,
        device_uuid: String,
        host: String,
        connection: Arc<dyn RemoteConnection>,
        geometry: TerminalGeometry,
    ) -> Self {
        Self {
            id,
            client,
            device_uuid,
            host,
            connection,
            geometry: Mutex::new(geometry),
            state: Mutex::new(ShellState::Connecting),
            writer: Mutex::new(None),
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

    pub fn state(&self) -> ShellState {
        *self.state.lock()
    }

    pub fn geometry(&self) -> TerminalGeometry {
        *self.geometry.lock()
    }

    fn mark_ready(&self) {
        let mut state = self.state.lock();
        if *state == ShellState::Connecting {
            *state = ShellState::Ready;
        }
    }

    /// Attaches the shell stream. Returns `false` (and ends the stream) if the
    /// session closed while the shell was being allocated.
    fn attach(&self, writer: ShellWriter) -> bool {
        let mut state = self.state.lock();
        if *state == ShellState::Closed {
            writer.end();
            return false;
        }
        *self.writer.lock() = Some(writer);
        *state = ShellState::Streaming;
        true
    }

    fn writer(&self) -> Option<ShellWriter> {
        self.writer.lock().clone()
    }

    /// Stores new character dimensions, keeping the pixel size.
    fn resize(&self, rows: u32, cols: u32) -> TerminalGeometry {
        let mut geometry = self.geometry.lock();
        geometry.rows = rows;
        geometry.cols = cols;
        *geometry
    }
}

#[async_trait]
impl ManagedSession for ShellSession {
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
        let writer = {
            let mut state = self.state.lock();
            *state = ShellState::Closed;
            self.writer.lock().take()
        };
        if let Some(writer) = writer {
            writer.end();
        }
        self.connection.close().await;
        debug!(session_id = %self.id, device_uuid = %self.device_uuid, "Shell session torn down");
    }
}

// -----------------------------------------------------------------------------
// Controller
// -----------------------------------------------------------------------------

/// Starts, drives and closes shell sessions.
pub struct ShellSessionController {
    factory: Arc<ConnectionFactory>,
    registry: Arc<SessionRegistry<ShellSession>>,
    options: SshOptions,
}

impl ShellSessionController {
    pub fn new(
        factory: Arc<ConnectionFactory>,
        registry: Arc<SessionRegistry<ShellSession>>,
        options: SshOptions,
    ) -> Self {
        Self {
            factory,
            registry,
            options,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry<ShellSession>> {
        &self.registry
    }

    /// Connects to a device and opens a PTY shell for `client`.
    pub async fn start_session(
        &self,
        client: &ClientHandle,
        request: StartSession,
    ) -> Result<SessionId> {
        let geometry = TerminalGeometry {
            rows: request.rows.unwrap_or(self.options.default_rows),
            cols: request.cols.unwrap_or(self.options.default_cols),
            height: self.options.pixel_height,
            width: self.options.pixel_width,
        };
        info!(client_id = %client.id(), device_uuid = %request.device_uuid, "Starting shell session");

        let established = match self.factory.connect(&request.device_uuid).await {
            Ok(established) => established,
            Err(err) => {
                let message = classify_connection_error(&err, client.origin());
                error!(
                    client_id = %client.id(),
                    device_uuid = %request.device_uuid,
                    error = %err,
                    "Failed to create SSH session"
                );
                client
                    .status(Channel::Shell, StatusMessage::disconnect(message))
                    .await;
                return Err(err);
            }
        };

        let Some(session) = self.registry.create_session(client.id(), |id| {
            ShellSession::new(
                id,
                client.clone(),
                request.device_uuid.clone(),
                established.host.clone(),
                Arc::clone(&established.connection),
                geometry,
            )
        }) else {
            info!(
                client_id = %client.id(),
                device_uuid = %request.device_uuid,
                "Client left during connect, dropping shell connection"
            );
            established.connection.close().await;
            return Err(Error::ClientDisconnected);
        };
        session.mark_ready();

        client
            .status(Channel::Shell, StatusMessage::ok(SSH_ESTABLISHED))
            .await;
        if let Some(banner) = session.connection.banner() {
            client
                .emit(ServerEvent::ShellData(to_terminal_newlines(&banner)))
                .await;
        }
        client
            .emit(ServerEvent::ShellData(format!(
                "Connected to device: {} on {}!\r\n---\r\n",
                session.device_uuid, session.host
            )))
            .await;

        let pty = PtyRequest {
            term: self.options.term.clone(),
            geometry,
        };
        let ShellChannel { writer, output } = match session.connection.open_shell(&pty).await {
            Ok(channel) => channel,
            Err(err) => {
                error!(session_id = %session.id, error = %err, "Shell allocation failed");
                self.registry.close_session(session.id).await;
                client
                    .status(Channel::Shell, StatusMessage::error(err.to_string()))
                    .await;
                return Err(err);
            }
        };

        if !session.attach(writer) {
            return Err(Error::SessionClosed);
        }
        tokio::spawn(forward_output(
            Arc::clone(&self.registry),
            Arc::clone(&session),
            output,
        ));

        info!(
            session_id = %session.id,
            client_id = %client.id(),
            rows = geometry.rows,
            cols = geometry.cols,
            "Shell session streaming"
        );
        Ok(session.id)
    }

    /// Writes client keystrokes to the addressed session, or the client's
    /// first session when no id is given.
    pub fn send_data(&self, client: &ClientHandle, data: &str, session_id: Option<SessionId>) {
        let Some(session) = self.resolve(client.id(), session_id) else {
            warn!(client_id = %client.id(), "No shell session for input, dropping");
            return;
        };
        let Some(writer) = session.writer() else {
            warn!(session_id = %session.id, "No active stream found for session");
            return;
        };
        if let Err(err) = writer.write(data.as_bytes()) {
            warn!(session_id = %session.id, error = %err, "Dropping input for closed stream");
        }
    }

    /// Updates the terminal size. Returns the new geometry, or `None` when the
    /// client has no such session.
    pub fn resize(
        &self,
        client: &ClientHandle,
        rows: u32,
        cols: u32,
        session_id: Option<SessionId>,
    ) -> Option<TerminalGeometry> {
        let Some(session) = self.resolve(client.id(), session_id) else {
            warn!(client_id = %client.id(), "No shell session to resize");
            return None;
        };
        let geometry = session.resize(rows, cols);
        match session.writer() {
            Some(writer) => {
                if let Err(err) = writer.resize(geometry) {
                    warn!(session_id = %session.id, error = %err, "Resize on closed stream");
                }
            }
            None => debug!(session_id = %session.id, "Stored geometry for session without stream"),
        }
        Some(geometry)
    }

    /// Closes the addressed session (or the client's first one).
    pub async fn close_session(
        &self,
        client: &ClientHandle,
        session_id: Option<SessionId>,
    ) -> Result<()> {
        let session = self
            .resolve(client.id(), session_id)
            .ok_or(Error::NoActiveSession)?;
        self.registry.close_session(session.id).await;
        Ok(())
    }

    /// Closes every shell session of a client.
    pub async fn close_client_sessions(&self, client_id: &ClientId) -> usize {
        self.registry.close_all_for_client(client_id).await
    }

    fn resolve(&self, client_id: &ClientId, session_id: Option<SessionId>) -> Option<Arc<ShellSession>> {
        match session_id {
            Some(id) => self.registry.owned_by(client_id, id),
            None => self.registry.first_session_of(client_id),
        }
    }
}

/// Server banners use bare `\n`; terminals want `\r\n`.
fn to_terminal_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', "\r\n")
}

/// Pumps shell output to the client until the stream or connection ends, the
/// client goes away, or teardown starts elsewhere.
async fn forward_output(
    registry: Arc<SessionRegistry<ShellSession>>,
    session: Arc<ShellSession>,
    mut output: mpsc::Receiver<ShellOutput>,
) {
    let mut shutdown = session.shutdown.subscribe();
    let mut decoder = Utf8Decoder::default();

    let termination = loop {
        tokio::select! {
            biased;
            () = shutdown.wait() => return,
            chunk = output.recv() => match chunk {
                Some(ShellOutput::Data(bytes)) => {
                    let text = decoder.decode(&bytes);
                    if !text.is_empty() && !session.client.emit(ServerEvent::ShellData(text)).await {
                        info!(session_id = %session.id, "Client gone, closing shell session");
                        registry.close_session(session.id).await;
                        return;
                    }
                }
                Some(ShellOutput::Stderr(bytes)) => {
                    warn!(
                        session_id = %session.id,
                        stderr = %String::from_utf8_lossy(&bytes),
                        "Shell stderr"
                    );
                }
                Some(ShellOutput::Eof) => break RemoteTermination::End,
                Some(ShellOutput::Closed) | None => break RemoteTermination::Close,
                Some(ShellOutput::Error(message)) => break RemoteTermination::Error(message),
            },
            termination = session.connection.closed() => break termination,
        }
    };

    let tail = decoder.finish();
    if !tail.is_empty() {
        session.client.emit(ServerEvent::ShellData(tail)).await;
    }

    info!(session_id = %session.id, termination = ?termination, "Shell stream terminated");
    if registry.close_session(session.id).await {
        session
            .client
            .status(
                Channel::Shell,
                StatusMessage::disconnect(termination.status_message("SSH")),
            )
            .await;
    }
}

// -----------------------------------------------------------------------------
// UTF-8 decoding
// -----------------------------------------------------------------------------

/// Incremental UTF-8 decoder that keeps multi-byte sequences split across
/// chunk boundaries intact. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        Some(invalid) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + invalid);
                        }
                        None => {
                            // Incomplete sequence at the end: keep it for the next chunk.
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Flushes whatever is left, replacing an incomplete sequence.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
