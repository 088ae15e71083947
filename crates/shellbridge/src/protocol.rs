//! Wire protocol between browser clients and the gateway.
//!
//! Every websocket message is a JSON frame:
//!
//! ```json
//! { "channel": "ssh", "event": "start-session", "id": 7, "data": { "deviceUuid": "..." } }
//! ```
//!
//! Request/response events echo the inbound `id` on their reply frame. Pushed
//! events (`status`, `new-data`, `read-dir`, `download:*`) carry no id.

use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::SessionId;
use crate::{Error, ErrorKind, Result};

/// Event names used on both channels.
pub mod events {
    pub const START_SESSION: &str = "start-session";
    pub const NEW_DATA: &str = "new-data";
    pub const SCREEN_RESIZE: &str = "screen-resize";
    pub const STATUS: &str = "status";
    pub const CLOSE_SESSION: &str = "close-session";
    pub const READ_DIR: &str = "read-dir";
    pub const MKDIR: &str = "mkdir";
    pub const RENAME: &str = "rename";
    pub const CHMOD: &str = "chmod";
    pub const DELETE: &str = "delete";
    pub const DOWNLOAD: &str = "download";
    pub const DOWNLOAD_METADATA: &str = "download:metadata";
    pub const DOWNLOAD_CHUNK: &str = "download:chunk";
    pub const DOWNLOAD_COMPLETE: &str = "download:complete";
    pub const DOWNLOAD_NOT_FOUND: &str = "download:not-found";
    pub const DOWNLOAD_ERROR: &str = "download:error";
}

/// Largest permission value accepted by `chmod`.
pub const MAX_MODE: u64 = 0o7777;

/// Event namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Interactive shell sessions.
    #[serde(rename = "ssh")]
    Shell,
    /// File-system sessions.
    #[serde(rename = "sftp")]
    Sftp,
}

impl Channel {
    /// Returns the wire name of the channel.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shell => "ssh",
            Self::Sftp => "sftp",
        }
    }
}

// -----------------------------------------------------------------------------
// Status and replies
// -----------------------------------------------------------------------------

/// Status code carried by `status` pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusKind {
    Ok,
    Error,
    Disconnect,
}

/// Payload of a `status` push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusMessage {
    pub status: StatusKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusMessage {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: StatusKind::Ok,
            message: Some(message.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: StatusKind::Error,
            message: Some(message.into()),
        }
    }

    pub fn disconnect(message: impl Into<String>) -> Self {
        Self {
            status: StatusKind::Disconnect,
            message: Some(message.into()),
        }
    }
}

/// Result of a request/response event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reply {
    Ok {
        #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl Reply {
    /// A plain success reply.
    pub fn ok() -> Self {
        Self::Ok { session_id: None }
    }

    /// A success reply naming a freshly started session.
    pub fn started(session_id: SessionId) -> Self {
        Self::Ok {
            session_id: Some(session_id),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

impl From<&Error> for Reply {
    fn from(err: &Error) -> Self {
        Self::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<Result<()>> for Reply {
    fn from(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(err) => Self::from(&err),
        }
    }
}

impl From<Result<SessionId>> for Reply {
    fn from(result: Result<SessionId>) -> Self {
        match result {
            Ok(id) => Self::started(id),
            Err(err) => Self::from(&err),
        }
    }
}

// -----------------------------------------------------------------------------
// Directory listings
// -----------------------------------------------------------------------------

/// Normalized directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    pub filename: String,
    pub longname: String,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub is_file: bool,
    pub is_dir: bool,
    pub is_symbolic_link: bool,
    pub is_block_device: bool,
    pub is_character_device: bool,
    #[serde(rename = "isFIFO")]
    pub is_fifo: bool,
    pub is_socket: bool,
}

/// Payload of a `read-dir` push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DirListing {
    Ok { path: String, list: Vec<DirEntry> },
    Error { message: String },
}

impl From<Result<(String, Vec<DirEntry>)>> for DirListing {
    fn from(result: Result<(String, Vec<DirEntry>)>) -> Self {
        match result {
            Ok((path, list)) => Self::Ok { path, list },
            Err(err) => Self::Error {
                message: err.to_string(),
            },
        }
    }
}

// -----------------------------------------------------------------------------
// Transfers
// -----------------------------------------------------------------------------

/// One step of a file download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Metadata { filename: String, size: u64 },
    Chunk(Vec<u8>),
    Complete { filename: String },
    NotFound { path: PathBuf },
    Error { message: String },
}

impl TransferEvent {
    /// Returns the wire event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Metadata { .. } => events::DOWNLOAD_METADATA,
            Self::Chunk(_) => events::DOWNLOAD_CHUNK,
            Self::Complete { .. } => events::DOWNLOAD_COMPLETE,
            Self::NotFound { .. } => events::DOWNLOAD_NOT_FOUND,
            Self::Error { .. } => events::DOWNLOAD_ERROR,
        }
    }

    fn payload(&self) -> Value {
        match self {
            Self::Metadata { filename, size } => {
                serde_json::json!({ "filename": filename, "size": size })
            }
            Self::Chunk(bytes) => Value::String(BASE64.encode(bytes)),
            Self::Complete { filename } => serde_json::json!({ "filename": filename }),
            Self::NotFound { path } => serde_json::json!({ "path": path.display().to_string() }),
            Self::Error { message } => serde_json::json!({ "message": message }),
        }
    }
}

// -----------------------------------------------------------------------------
// Frames
// -----------------------------------------------------------------------------

/// Anything the gateway sends to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Shell output text.
    ShellData(String),
    /// Connection status on a channel.
    Status {
        channel: Channel,
        status: StatusMessage,
    },
    /// Result of a `read-dir` request.
    DirListing(DirListing),
    /// Download framing.
    Transfer(TransferEvent),
    /// Reply to a request/response event.
    Reply {
        channel: Channel,
        event: String,
        id: Option<u64>,
        reply: Reply,
    },
}

impl ServerEvent {
    pub fn status(channel: Channel, status: StatusMessage) -> Self {
        Self::Status { channel, status }
    }
}

/// Inbound websocket frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundFrame {
    pub channel: Channel,
    pub event: String,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub data: Value,
}

/// Outbound websocket frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundFrame {
    pub channel: Channel,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub data: Value,
}

impl From<ServerEvent> for OutboundFrame {
    fn from(event: ServerEvent) -> Self {
        match event {
            ServerEvent::ShellData(text) => Self {
                channel: Channel::Shell,
                event: events::NEW_DATA.to_string(),
                id: None,
                data: Value::String(text),
            },
            ServerEvent::Status { channel, status } => Self {
                channel,
                event: events::STATUS.to_string(),
                id: None,
                data: to_value(&status),
            },
            ServerEvent::DirListing(listing) => Self {
                channel: Channel::Sftp,
                event: events::READ_DIR.to_string(),
                id: None,
                data: to_value(&listing),
            },
            ServerEvent::Transfer(transfer) => Self {
                channel: Channel::Sftp,
                event: transfer.event_name().to_string(),
                id: None,
                data: transfer.payload(),
            },
            ServerEvent::Reply {
                channel,
                event,
                id,
                reply,
            } => Self {
                channel,
                event,
                id,
                data: to_value(&reply),
            },
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

// -----------------------------------------------------------------------------
// Requests
// -----------------------------------------------------------------------------

/// Parameters of a `start-session` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartSession {
    pub device_uuid: String,
    pub rows: Option<u32>,
    pub cols: Option<u32>,
}

/// Requests on the `ssh` channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellRequest {
    StartSession(StartSession),
    Input {
        data: String,
        session_id: Option<SessionId>,
    },
    Resize {
        rows: u32,
        cols: u32,
        session_id: Option<SessionId>,
    },
    Close {
        session_id: Option<SessionId>,
    },
}

impl ShellRequest {
    /// Decodes and validates a shell-channel request.
    pub fn parse(event: &str, data: &Value) -> Result<Self> {
        match event {
            events::START_SESSION => Ok(Self::StartSession(parse_start_session(data)?)),
            events::NEW_DATA => match data {
                Value::String(text) => Ok(Self::Input {
                    data: text.clone(),
                    session_id: None,
                }),
                Value::Object(_) => Ok(Self::Input {
                    data: required_string(data, "data")?,
                    session_id: optional_session_id(data)?,
                }),
                _ => Err(invalid("new-data expects text")),
            },
            events::SCREEN_RESIZE => Ok(Self::Resize {
                rows: required_dimension(data, "rows")?,
                cols: required_dimension(data, "cols")?,
                session_id: optional_session_id(data)?,
            }),
            events::CLOSE_SESSION => Ok(Self::Close {
                session_id: optional_session_id(data)?,
            }),
            other => Err(invalid(format!("unknown ssh event: {other}"))),
        }
    }
}

/// Requests on the `sftp` channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SftpRequest {
    StartSession(StartSession),
    ReadDir { path: String },
    Mkdir { path: String },
    Rename { old_path: String, new_path: String },
    Chmod { path: String, mode: u32 },
    Delete { path: String, is_dir: bool },
    Download { path: String },
    Close { session_id: Option<SessionId> },
}

impl SftpRequest {
    /// Decodes and validates an sftp-channel request.
    pub fn parse(event: &str, data: &Value) -> Result<Self> {
        match event {
            events::START_SESSION => Ok(Self::StartSession(parse_start_session(data)?)),
            events::READ_DIR => Ok(Self::ReadDir {
                path: required_path(data, "path", "Invalid directory path")?,
            }),
            events::MKDIR => Ok(Self::Mkdir {
                path: required_path(data, "path", "Invalid directory path")?,
            }),
            events::RENAME => {
                let old_path = required_path(data, "oldPath", "Missing oldPath or newPath")?;
                let new_path = required_path(data, "newPath", "Missing oldPath or newPath")?;
                Ok(Self::Rename { old_path, new_path })
            }
            events::CHMOD => {
                let path = required_path(data, "path", "Missing path or mode (e.g., 0o755)")?;
                let mode = data
                    .get("mode")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| invalid("Missing path or mode (e.g., 0o755)"))?;
                if mode > MAX_MODE {
                    return Err(invalid(format!("mode out of range: {mode:o}")));
                }
                Ok(Self::Chmod {
                    path,
                    mode: mode as u32,
                })
            }
            events::DELETE => {
                const MESSAGE: &str = "Invalid delete request (path and isDir are required)";
                let path = required_path(data, "path", MESSAGE)?;
                let is_dir = data
                    .get("isDir")
                    .and_then(Value::as_bool)
                    .ok_or_else(|| invalid(MESSAGE))?;
                Ok(Self::Delete { path, is_dir })
            }
            events::DOWNLOAD => Ok(Self::Download {
                path: required_path(data, "path", "Missing remotePath")?,
            }),
            events::CLOSE_SESSION => Ok(Self::Close {
                session_id: optional_session_id(data)?,
            }),
            other => Err(invalid(format!("unknown sftp event: {other}"))),
        }
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidRequest(message.into())
}

fn parse_start_session(data: &Value) -> Result<StartSession> {
    let device_uuid = match data {
        Value::String(uuid) => uuid.clone(),
        _ => required_string(data, "deviceUuid")?,
    };
    if device_uuid.trim().is_empty() {
        return Err(invalid("deviceUuid is required"));
    }
    Ok(StartSession {
        device_uuid,
        rows: optional_dimension(data, "rows")?,
        cols: optional_dimension(data, "cols")?,
    })
}

fn required_string(data: &Value, field: &str) -> Result<String> {
    data.get(field)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| invalid(format!("{field} is required")))
}

fn required_path(data: &Value, field: &str, message: &str) -> Result<String> {
    match data.get(field).and_then(Value::as_str) {
        Some(path) if !path.trim().is_empty() => Ok(path.to_owned()),
        _ => Err(invalid(message)),
    }
}

fn optional_dimension(data: &Value, field: &str) -> Result<Option<u32>> {
    match data.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .filter(|v| *v > 0 && *v <= u64::from(u16::MAX))
            .map(|v| Some(v as u32))
            .ok_or_else(|| invalid(format!("{field} must be a positive integer"))),
    }
}

fn required_dimension(data: &Value, field: &str) -> Result<u32> {
    optional_dimension(data, field)?.ok_or_else(|| invalid(format!("{field} is required")))
}

fn optional_session_id(data: &Value) -> Result<Option<SessionId>> {
    match data.get("sessionId") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(raw)) => raw
            .parse()
            .map(Some)
            .map_err(|_| invalid(format!("malformed sessionId: {raw}"))),
        Some(_) => Err(invalid("sessionId must be a string")),
    }
}
