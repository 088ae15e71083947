//! Session identity and shutdown signaling.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::ClientId;

/// Unique identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generates a fresh random session id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Shutdown signal owned by a session.
///
/// Background tasks subscribe to it and stop once the session starts tearing
/// down, whichever trigger caused the teardown.
#[derive(Debug)]
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Raises the signal. Returns `true` only for the call that raised it.
    pub fn signal(&self) -> bool {
        self.tx.send_if_modified(|raised| {
            if *raised {
                false
            } else {
                *raised = true;
                true
            }
        })
    }

    pub fn is_signaled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Returns a listener that resolves once the signal is raised.
    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a [`ShutdownSignal`].
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Waits until the signal is raised or its session is dropped.
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|raised| *raised).await;
    }
}

/// Information about an active session (snapshot for inspection/logging).
#[derive(Clone, Debug)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: SessionId,
    /// Owning client.
    pub client_id: ClientId,
    /// Device the session is connected to.
    pub device_uuid: String,
    /// Resolved device address.
    pub host: String,
    /// When the session was established.
    pub started_at: SystemTime,
    /// Total session duration.
    pub duration: Duration,
}

impl SessionInfo {
    pub fn new(
        id: SessionId,
        client_id: ClientId,
        device_uuid: String,
        host: String,
        started_at: Instant,
    ) -> Self {
        let duration = started_at.elapsed();
        Self {
            id,
            client_id,
            device_uuid,
            host,
            started_at: SystemTime::now() - duration,
            duration,
        }
    }
}
