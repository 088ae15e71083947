//! Session bookkeeping shared by the shell and SFTP controllers.
//!
//! This module provides:
//! - Unique session ids (UUID v4)
//! - A per-session shutdown signal that stops background tasks
//! - A registry mapping clients to their ordered sessions with idempotent teardown
//!
//! # Example
//!
//! ```rust,ignore
//! use shellbridge::session::SessionRegistry;
//!
//! let registry = SessionRegistry::<ShellSession>::new("ssh");
//!
//! // Register a session built around a fresh id; `None` once the client is gone
//! let Some(session) = registry.create_session(client.id(), |id| ShellSession::new(id, ...)) else {
//!     return;
//! };
//!
//! // Any number of close triggers release the connection exactly once
//! registry.close_session(session.id()).await;
//! registry.close_all_for_client(client.id()).await;
//! ```

mod handle;
mod registry;

pub use handle::{SessionId, SessionInfo, ShutdownListener, ShutdownSignal};
pub use registry::{ManagedSession, SessionRegistry};
