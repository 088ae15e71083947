//! Handle to one connected browser client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tracing::trace;

use crate::ClientId;
use crate::protocol::{Channel, Reply, ServerEvent, StatusMessage};

/// Default capacity of a client's outbound event queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Cloneable handle used by controllers to push events to a client.
///
/// The queue is bounded, so producers (shell forwarders, file streamers) slow
/// down to the pace of the websocket writer instead of buffering without limit.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ClientId,
    origin: Option<SocketAddr>,
    tx: mpsc::Sender<ServerEvent>,
    /// Shared by every clone; set once the transport is gone.
    closed: Arc<AtomicBool>,
}

impl ClientHandle {
    pub fn new(id: ClientId, origin: Option<SocketAddr>, tx: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            id,
            origin,
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Creates a handle with a fresh id and returns the receiving end of its
    /// outbound queue.
    pub fn channel(
        origin: Option<SocketAddr>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(ClientId::generate(), origin, tx), rx)
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Remote address of the client's transport, when known.
    pub fn origin(&self) -> Option<SocketAddr> {
        self.origin
    }

    /// Returns `true` until the client is closed or its queue's receiver is
    /// dropped.
    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    /// Marks the client closed for every clone of this handle. Queued events
    /// are still delivered; sessions can no longer be registered for it.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Queues an event. Returns `false` if the client has gone away.
    pub async fn emit(&self, event: ServerEvent) -> bool {
        match self.tx.send(event).await {
            Ok(()) => true,
            Err(_) => {
                trace!(client_id = %self.id, "Dropping event for disconnected client");
                false
            }
        }
    }

    /// Pushes a `status` event on a channel.
    pub async fn status(&self, channel: Channel, status: StatusMessage) -> bool {
        self.emit(ServerEvent::status(channel, status)).await
    }

    /// Replies to a request/response event.
    pub async fn reply(&self, channel: Channel, event: &str, id: Option<u64>, reply: Reply) -> bool {
        self.emit(ServerEvent::Reply {
            channel,
            event: event.to_string(),
            id,
            reply,
        })
        .await
    }
}
