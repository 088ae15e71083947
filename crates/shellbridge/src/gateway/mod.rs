//! Transport boundary: decodes client frames and dispatches them to the shell
//! and SFTP controllers.
//!
//! Shell input and resize are applied inline, in the order the client sent
//! them. Every other request runs on its own task so one slow device never
//! stalls the client's other sessions.

mod server;

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::client::ClientHandle;
use crate::config::GatewayConfig;
use crate::connection::{ConnectionFactory, Connector};
use crate::device::DeviceDirectory;
use crate::protocol::{
    Channel, DirListing, InboundFrame, Reply, ServerEvent, ShellRequest, SftpRequest,
    StatusMessage, TransferEvent, events,
};
use crate::session::SessionRegistry;
use crate::sftp::SftpSessionController;
use crate::shell::ShellSessionController;
use crate::transfer::FileStreamer;
use crate::{Error, Result};

pub use server::{AppState, router, serve};

/// Routes client frames to the session controllers.
pub struct GatewayAdapter {
    shell: Arc<ShellSessionController>,
    sftp: Arc<SftpSessionController>,
}

impl GatewayAdapter {
    pub fn new(shell: Arc<ShellSessionController>, sftp: Arc<SftpSessionController>) -> Self {
        Self { shell, sftp }
    }

    /// Wires controllers, registries and the connection factory from
    /// configuration.
    pub fn from_config(
        config: &GatewayConfig,
        directory: Arc<dyn DeviceDirectory>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let factory = Arc::new(
            ConnectionFactory::new(directory, connector)
                .with_connect_timeout(config.ssh.connect_timeout()),
        );
        Self::with_factory(config, factory)
    }

    /// Like [`from_config`](Self::from_config) with a prebuilt factory.
    pub fn with_factory(config: &GatewayConfig, factory: Arc<ConnectionFactory>) -> Self {
        let shell = ShellSessionController::new(
            Arc::clone(&factory),
            Arc::new(SessionRegistry::new("ssh")),
            config.ssh.clone(),
        );
        let sftp = SftpSessionController::new(
            factory,
            Arc::new(SessionRegistry::new("sftp")),
            config.staging_dir.clone(),
            FileStreamer::new(config.transfer.chunk_size),
        );
        Self::new(Arc::new(shell), Arc::new(sftp))
    }

    pub fn shell(&self) -> &Arc<ShellSessionController> {
        &self.shell
    }

    pub fn sftp(&self) -> &Arc<SftpSessionController> {
        &self.sftp
    }

    pub fn on_connect(&self, client: &ClientHandle) {
        info!(client_id = %client.id(), origin = ?client.origin(), "Client connected");
    }

    /// Closes every session the client owns on both channels. Starts still
    /// connecting are refused once they finish.
    pub async fn on_disconnect(&self, client: &ClientHandle) {
        client.close();
        let shell_closed = self.shell.close_client_sessions(client.id()).await;
        let sftp_closed = self.sftp.close_client_sessions(client.id()).await;
        info!(
            client_id = %client.id(),
            shell_closed,
            sftp_closed,
            "Client disconnected"
        );
    }

    /// Closes every session of every client.
    pub async fn shutdown(&self) {
        let shell_closed = self.shell.registry().close_all().await;
        let sftp_closed = self.sftp.registry().close_all().await;
        info!(shell_closed, sftp_closed, "All sessions closed");
    }

    /// Handles one decoded frame. Shell input and resize complete before this
    /// returns; everything else is spawned.
    pub async fn dispatch(self: &Arc<Self>, client: &ClientHandle, frame: InboundFrame) {
        let inline = frame.channel == Channel::Shell
            && matches!(frame.event.as_str(), events::NEW_DATA | events::SCREEN_RESIZE);
        if inline {
            self.handle(client, frame).await;
            return;
        }

        let channel = frame.channel;
        let event = frame.event.clone();
        let adapter = Arc::clone(self);
        let client = client.clone();
        let task = {
            let client = client.clone();
            tokio::spawn(async move { adapter.handle(&client, frame).await })
        };
        tokio::spawn(async move {
            match task.await {
                Err(err) if err.is_panic() => {
                    let message = panic_message(err.into_panic());
                    error!(
                        client_id = %client.id(),
                        channel = channel.as_str(),
                        event = %event,
                        panic = %message,
                        "Request handler panicked"
                    );
                    client.status(channel, StatusMessage::error(message)).await;
                }
                _ => {}
            }
        });
    }

    /// Handles one decoded frame to completion.
    pub async fn handle(&self, client: &ClientHandle, frame: InboundFrame) {
        let InboundFrame {
            channel,
            event,
            id,
            data,
        } = frame;
        debug!(client_id = %client.id(), channel = channel.as_str(), event = %event, "Frame received");

        match channel {
            Channel::Shell => self.handle_shell(client, &event, id, &data).await,
            Channel::Sftp => self.handle_sftp(client, &event, id, &data).await,
        }
    }

    /// Reports a frame that could not be decoded.
    pub async fn on_malformed(&self, client: &ClientHandle, raw: &str, err: &serde_json::Error) {
        let channel = serde_json::from_str::<Value>(raw)
            .ok()
            .and_then(|value| value.get("channel").cloned())
            .and_then(|channel| serde_json::from_value(channel).ok())
            .unwrap_or(Channel::Shell);
        warn!(client_id = %client.id(), error = %err, "Malformed frame");
        client
            .status(
                channel,
                StatusMessage::error(Error::InvalidRequest(err.to_string()).to_string()),
            )
            .await;
    }

    async fn handle_shell(&self, client: &ClientHandle, event: &str, id: Option<u64>, data: &Value) {
        let request = match ShellRequest::parse(event, data) {
            Ok(request) => request,
            Err(err) => return reject(client, Channel::Shell, event, id, &err).await,
        };

        match request {
            ShellRequest::StartSession(start) => {
                let result = self.shell.start_session(client, start).await;
                client
                    .reply(Channel::Shell, event, id, Reply::from(result))
                    .await;
            }
            ShellRequest::Input { data, session_id } => {
                self.shell.send_data(client, &data, session_id);
            }
            ShellRequest::Resize {
                rows,
                cols,
                session_id,
            } => {
                self.shell.resize(client, rows, cols, session_id);
            }
            ShellRequest::Close { session_id } => {
                let result = self.shell.close_session(client, session_id).await;
                client
                    .reply(Channel::Shell, event, id, Reply::from(result))
                    .await;
            }
        }
    }

    async fn handle_sftp(&self, client: &ClientHandle, event: &str, id: Option<u64>, data: &Value) {
        let request = match SftpRequest::parse(event, data) {
            Ok(request) => request,
            Err(err) => return reject(client, Channel::Sftp, event, id, &err).await,
        };

        let result: Result<()> = match request {
            SftpRequest::StartSession(start) => {
                let result = self.sftp.start_session(client, &start.device_uuid).await;
                client
                    .reply(Channel::Sftp, event, id, Reply::from(result))
                    .await;
                return;
            }
            SftpRequest::ReadDir { path } => {
                let result = self.sftp.list_directory(client, &path).await;
                let listing = result.map(|list| (path, list));
                client
                    .emit(ServerEvent::DirListing(DirListing::from(listing)))
                    .await;
                return;
            }
            SftpRequest::Download { path } => {
                // Outcomes are reported on the download events.
                let _ = self.sftp.download(client, &path).await;
                return;
            }
            SftpRequest::Mkdir { path } => self.sftp.mkdir(client, &path).await,
            SftpRequest::Rename { old_path, new_path } => {
                self.sftp.rename(client, &old_path, &new_path).await
            }
            SftpRequest::Chmod { path, mode } => self.sftp.chmod(client, &path, mode).await,
            SftpRequest::Delete { path, is_dir } => self.sftp.delete(client, &path, is_dir).await,
            SftpRequest::Close { session_id } => {
                self.sftp.close_session(client, session_id).await
            }
        };

        if let Err(err) = &result {
            warn!(client_id = %client.id(), event, error = %err, "SFTP operation failed");
        }
        client
            .reply(Channel::Sftp, event, id, Reply::from(result))
            .await;
    }
}

/// Text of a panic payload, when it carries one.
fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_string(),
            Err(_) => "request handler panicked".to_string(),
        },
    }
}

/// Sends a validation failure back on the route the event normally answers on.
async fn reject(client: &ClientHandle, channel: Channel, event: &str, id: Option<u64>, err: &Error) {
    warn!(client_id = %client.id(), channel = channel.as_str(), event, error = %err, "Request rejected");
    let has_reply = match channel {
        Channel::Shell => matches!(event, events::START_SESSION | events::CLOSE_SESSION),
        Channel::Sftp => matches!(
            event,
            events::START_SESSION
                | events::CLOSE_SESSION
                | events::MKDIR
                | events::RENAME
                | events::CHMOD
                | events::DELETE
        ),
    };
    match (channel, event) {
        (Channel::Sftp, events::READ_DIR) => {
            client
                .emit(ServerEvent::DirListing(DirListing::Error {
                    message: err.to_string(),
                }))
                .await;
        }
        (Channel::Sftp, events::DOWNLOAD) => {
            client
                .emit(ServerEvent::Transfer(TransferEvent::Error {
                    message: err.to_string(),
                }))
                .await;
        }
        _ if has_reply => {
            client.reply(channel, event, id, Reply::from(err)).await;
        }
        _ => {
            client
                .status(channel, StatusMessage::error(err.to_string()))
                .await;
        }
    }
}
