//! russh client backend.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use russh::client::{self, DisconnectReason, Handle, KeyboardInteractiveAuthResponse, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::FileAttributes;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use super::{
    ConnectParams, Connector, FileTransfer, PtyRequest, RemoteAttrs, RemoteConnection,
    RemoteEntry, RemoteTermination, ShellChannel, ShellInput, ShellOutput, ShellWriter,
};
use crate::device::AuthMethod;
use crate::{Error, Result};

/// Output chunks buffered per shell before the pump waits on the forwarder.
const SHELL_OUTPUT_BUFFER: usize = 256;

/// Connects to devices with russh.
pub struct RusshConnector {
    config: Arc<client::Config>,
}

impl RusshConnector {
    pub fn new() -> Self {
        Self::with_config(client::Config::default())
    }

    pub fn with_config(config: client::Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl Default for RusshConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for RusshConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn RemoteConnection>> {
        let (termination_tx, termination_rx) = watch::channel(None);
        let banner = Arc::new(Mutex::new(None));
        let handler = ClientHandler {
            device_uuid: params.device_uuid.clone(),
            banner: Arc::clone(&banner),
            termination: termination_tx,
        };

        let mut handle = client::connect(
            Arc::clone(&self.config),
            (params.address.as_str(), params.port),
            handler,
        )
        .await?;

        authenticate(&mut handle, params).await?;
        info!(
            device_uuid = %params.device_uuid,
            user = %params.auth.user,
            method = params.auth.method.name(),
            "Authenticated to device"
        );

        Ok(Arc::new(RusshConnection {
            device_uuid: params.device_uuid.clone(),
            handle,
            banner,
            termination: termination_rx,
        }))
    }
}

// -----------------------------------------------------------------------------
// Client handler
// -----------------------------------------------------------------------------

struct ClientHandler {
    device_uuid: String,
    banner: Arc<Mutex<Option<String>>>,
    termination: watch::Sender<Option<RemoteTermination>>,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        debug!(
            device_uuid = %self.device_uuid,
            fingerprint = %server_public_key.fingerprint(),
            "Accepting server host key"
        );
        Ok(true)
    }

    async fn auth_banner(
        &mut self,
        banner: &str,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        trace!(device_uuid = %self.device_uuid, "Received auth banner");
        self.banner
            .lock()
            .get_or_insert_with(String::new)
            .push_str(banner);
        Ok(())
    }

    async fn disconnected(
        &mut self,
        reason: DisconnectReason<Self::Error>,
    ) -> std::result::Result<(), Self::Error> {
        let termination = termination_for(reason);
        debug!(device_uuid = %self.device_uuid, termination = ?termination, "Session task ended");
        self.record(termination);
        Ok(())
    }
}

impl ClientHandler {
    /// Stores the first termination seen; later ones are ignored.
    fn record(&self, termination: RemoteTermination) {
        self.termination.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(termination);
                true
            } else {
                false
            }
        });
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        // The handler lives as long as the session task.
        self.record(RemoteTermination::Close);
    }
}

/// A device-sent disconnect ends the connection; a bare EOF closes it; any
/// other transport failure carries its error text.
fn termination_for(reason: DisconnectReason<russh::Error>) -> RemoteTermination {
    match reason {
        DisconnectReason::ReceivedDisconnect(_) => RemoteTermination::End,
        DisconnectReason::Error(russh::Error::Disconnect) => RemoteTermination::Close,
        DisconnectReason::Error(err) => RemoteTermination::Error(err.to_string()),
    }
}

async fn authenticate(handle: &mut Handle<ClientHandler>, params: &ConnectParams) -> Result<()> {
    let user = params.auth.user.clone();
    let accepted = match &params.auth.method {
        AuthMethod::Password { password } => {
            handle.authenticate_password(user, password.as_str()).await?
        }
        AuthMethod::Key {
            private_key,
            private_key_path,
            passphrase,
        } => {
            let pem = match (private_key, private_key_path) {
                (Some(pem), _) => pem.clone(),
                (None, Some(path)) => tokio::fs::read_to_string(path).await?,
                (None, None) => {
                    return Err(Error::Configuration(format!(
                        "device {} uses key auth without a key",
                        params.device_uuid
                    )));
                }
            };
            let key_pair = russh_keys::decode_secret_key(&pem, passphrase.as_deref())?;
            handle
                .authenticate_publickey(user, Arc::new(key_pair))
                .await?
        }
        AuthMethod::None => {
            handle.authenticate_none(user.clone()).await?
                || keyboard_interactive(handle, &user, &params.device_uuid).await?
        }
    };

    if accepted {
        Ok(())
    } else {
        warn!(device_uuid = %params.device_uuid, user = %params.auth.user, "Authentication rejected");
        Err(Error::AuthenticationFailure)
    }
}

/// Starts keyboard-interactive auth. Prompts are logged, never answered.
async fn keyboard_interactive(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    device_uuid: &str,
) -> Result<bool> {
    let response = handle
        .authenticate_keyboard_interactive_start(user, None::<String>)
        .await?;
    match response {
        KeyboardInteractiveAuthResponse::Success => Ok(true),
        KeyboardInteractiveAuthResponse::Failure => Ok(false),
        KeyboardInteractiveAuthResponse::InfoRequest {
            name,
            instructions,
            prompts,
        } => {
            info!(
                device_uuid,
                name = %name,
                instructions = %instructions,
                prompts = prompts.len(),
                "Keyboard-interactive challenge left unanswered"
            );
            Ok(false)
        }
    }
}

// -----------------------------------------------------------------------------
// Connection
// -----------------------------------------------------------------------------

struct RusshConnection {
    device_uuid: String,
    handle: Handle<ClientHandler>,
    banner: Arc<Mutex<Option<String>>>,
    termination: watch::Receiver<Option<RemoteTermination>>,
}

#[async_trait]
impl RemoteConnection for RusshConnection {
    fn banner(&self) -> Option<String> {
        self.banner.lock().clone()
    }

    async fn open_shell(&self, pty: &PtyRequest) -> Result<ShellChannel> {
        let shell_error = |e: russh::Error| Error::ShellAllocation(e.to_string());

        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(shell_error)?;
        let g = pty.geometry;
        channel
            .request_pty(true, &pty.term, g.cols, g.rows, g.width, g.height, &[])
            .await
            .map_err(shell_error)?;
        await_reply(&mut channel, "pty-req")
            .await
            .map_err(Error::ShellAllocation)?;
        channel.request_shell(true).await.map_err(shell_error)?;
        await_reply(&mut channel, "shell")
            .await
            .map_err(Error::ShellAllocation)?;

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::channel(SHELL_OUTPUT_BUFFER);
        tokio::spawn(pump_shell(
            self.device_uuid.clone(),
            channel,
            input_rx,
            output_tx,
        ));

        debug!(device_uuid = %self.device_uuid, rows = g.rows, cols = g.cols, "PTY shell opened");
        Ok(ShellChannel {
            writer: ShellWriter::new(input_tx),
            output: output_rx,
        })
    }

    async fn open_sftp(&self) -> Result<Arc<dyn FileTransfer>> {
        let subsystem_error = |e: russh::Error| Error::SubsystemUnavailable(e.to_string());

        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(subsystem_error)?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(subsystem_error)?;
        await_reply(&mut channel, "sftp")
            .await
            .map_err(Error::SubsystemUnavailable)?;

        let session = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| Error::SubsystemUnavailable(e.to_string()))?;
        debug!(device_uuid = %self.device_uuid, "SFTP subsystem started");
        Ok(Arc::new(RusshFileTransfer { session }))
    }

    async fn closed(&self) -> RemoteTermination {
        let mut termination = self.termination.clone();
        match termination.wait_for(Option::is_some).await {
            Ok(state) => state.clone().unwrap_or(RemoteTermination::Close),
            Err(_) => RemoteTermination::Close,
        }
    }

    async fn close(&self) {
        if self.termination.borrow().is_some() {
            return;
        }
        if let Err(err) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!(device_uuid = %self.device_uuid, error = %err, "Disconnect failed");
        }
    }
}

/// Waits for the success/failure reply to a channel request.
async fn await_reply(channel: &mut Channel<Msg>, request: &str) -> std::result::Result<(), String> {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => return Ok(()),
            Some(ChannelMsg::Failure) => return Err(format!("{request} request refused")),
            Some(ChannelMsg::Close) | None => {
                return Err(format!("channel closed before {request} reply"));
            }
            Some(other) => trace!(?other, request, "Ignoring message while awaiting reply"),
        }
    }
}

/// Owns the shell channel: forwards queued input and publishes output in order.
async fn pump_shell(
    device_uuid: String,
    mut channel: Channel<Msg>,
    mut input: mpsc::UnboundedReceiver<ShellInput>,
    output: mpsc::Sender<ShellOutput>,
) {
    loop {
        tokio::select! {
            command = input.recv() => match command {
                Some(ShellInput::Data(bytes)) => {
                    if let Err(err) = channel.data(&bytes[..]).await {
                        let _ = output.send(ShellOutput::Error(err.to_string())).await;
                        break;
                    }
                }
                Some(ShellInput::Resize(g)) => {
                    if let Err(err) = channel.window_change(g.cols, g.rows, g.width, g.height).await {
                        warn!(device_uuid = %device_uuid, error = %err, "Window change failed");
                    }
                }
                Some(ShellInput::End) | None => {
                    let _ = channel.eof().await;
                    let _ = channel.close().await;
                    break;
                }
            },
            message = channel.wait() => match message {
                Some(ChannelMsg::Data { data }) => {
                    if output.send(ShellOutput::Data(data.to_vec())).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    trace!(device_uuid = %device_uuid, ext, "Shell stderr");
                    let _ = output.send(ShellOutput::Stderr(data.to_vec())).await;
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!(device_uuid = %device_uuid, exit_status, "Shell exited");
                }
                Some(ChannelMsg::Eof) => {
                    let _ = output.send(ShellOutput::Eof).await;
                }
                Some(ChannelMsg::Close) | None => {
                    let _ = output.send(ShellOutput::Closed).await;
                    break;
                }
                Some(other) => trace!(device_uuid = %device_uuid, ?other, "Ignoring channel message"),
            },
        }
    }
    trace!(device_uuid = %device_uuid, "Shell pump finished");
}

// -----------------------------------------------------------------------------
// SFTP
// -----------------------------------------------------------------------------

struct RusshFileTransfer {
    session: SftpSession,
}

fn operation_error(err: impl std::fmt::Display) -> Error {
    Error::ProtocolOperation(err.to_string())
}

impl From<&FileAttributes> for RemoteAttrs {
    fn from(attrs: &FileAttributes) -> Self {
        Self {
            size: attrs.size.unwrap_or(0),
            mode: attrs.permissions.unwrap_or(0),
            uid: attrs.uid.unwrap_or(0),
            gid: attrs.gid.unwrap_or(0),
        }
    }
}

#[async_trait]
impl FileTransfer for RusshFileTransfer {
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let entries = self.session.read_dir(path).await.map_err(operation_error)?;
        Ok(entries
            .map(|entry| RemoteEntry {
                filename: entry.file_name(),
                longname: None,
                attrs: RemoteAttrs::from(&entry.metadata()),
            })
            .collect())
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        self.session.create_dir(path).await.map_err(operation_error)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.session.rename(from, to).await.map_err(operation_error)
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let attrs = FileAttributes {
            permissions: Some(mode),
            ..FileAttributes::default()
        };
        self.session
            .set_metadata(path, attrs)
            .await
            .map_err(operation_error)
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        self.session.remove_dir(path).await.map_err(operation_error)
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        self.session.remove_file(path).await.map_err(operation_error)
    }

    async fn stat(&self, path: &str) -> Result<RemoteAttrs> {
        let attrs = self.session.metadata(path).await.map_err(operation_error)?;
        Ok(RemoteAttrs::from(&attrs))
    }

    async fn fetch(&self, remote: &str, local: &Path) -> Result<u64> {
        let mut source = self.session.open(remote).await.map_err(operation_error)?;
        let mut target = tokio::fs::File::create(local).await?;
        let copied = tokio::io::copy(&mut source, &mut target)
            .await
            .map_err(operation_error)?;
        target.flush().await?;
        Ok(copied)
    }

    async fn close(&self) {
        if let Err(err) = self.session.close().await {
            trace!(error = %err, "SFTP session close failed");
        }
    }
}
