//! Registry of live sessions indexed by id and by owning client.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::handle::{SessionId, SessionInfo};
use crate::ClientId;

/// A session kind the registry can own.
#[async_trait]
pub trait ManagedSession: Send + Sync + 'static {
    /// Returns the session id.
    fn id(&self) -> SessionId;

    /// Returns the owning client.
    fn client_id(&self) -> &ClientId;

    /// Returns a snapshot for inspection and logging.
    fn info(&self) -> SessionInfo;

    /// Returns `true` once the owning client is gone. The registry refuses
    /// such sessions.
    fn is_orphaned(&self) -> bool {
        false
    }

    /// Releases the session's resources: ends any open stream and closes the
    /// connection. Called exactly once, by whichever close trigger removed the
    /// session from the registry.
    async fn teardown(&self);
}

struct Inner<S> {
    sessions: HashMap<SessionId, Arc<S>>,
    /// Session ids per client, in creation order.
    clients: HashMap<ClientId, Vec<SessionId>>,
}

/// Owns the client → sessions and session id → session mappings.
///
/// The mutex is never held across an await. Removal happens under the lock and
/// teardown after it, so a session is torn down by exactly one caller no matter
/// how many close triggers race.
pub struct SessionRegistry<S> {
    name: &'static str,
    inner: Mutex<Inner<S>>,
}

impl<S: ManagedSession> SessionRegistry<S> {
    /// Creates an empty registry. `name` tags log events (e.g. `"ssh"`).
    pub fn new(name: &'static str) -> Self {
        debug!(registry = name, "Session registry initialized");
        Self {
            name,
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                clients: HashMap::new(),
            }),
        }
    }

    /// Registers a session built around a fresh id and appends it to the
    /// client's ordered session list.
    ///
    /// Returns `None` without registering when the built session is already
    /// orphaned. The check runs under the lock, so a client marked closed
    /// before [`close_all_for_client`](Self::close_all_for_client) never gains
    /// a session that call misses.
    pub fn create_session<F>(&self, client_id: &ClientId, build: F) -> Option<Arc<S>>
    where
        F: FnOnce(SessionId) -> S,
    {
        let mut inner = self.inner.lock();
        let id = loop {
            let candidate = SessionId::generate();
            if !inner.sessions.contains_key(&candidate) {
                break candidate;
            }
        };

        let session = Arc::new(build(id));
        debug_assert_eq!(session.client_id(), client_id);
        if session.is_orphaned() {
            warn!(
                registry = self.name,
                session_id = %id,
                client_id = %client_id,
                "Refusing session for disconnected client"
            );
            return None;
        }

        inner.sessions.insert(id, Arc::clone(&session));
        let client_sessions = inner.clients.entry(client_id.clone()).or_default();
        client_sessions.push(id);
        let client_total = client_sessions.len();

        info!(
            registry = self.name,
            session_id = %id,
            client_id = %client_id,
            client_sessions = client_total,
            total_sessions = inner.sessions.len(),
            "Session created"
        );
        Some(session)
    }

    /// Looks up a session by id.
    pub fn get(&self, id: SessionId) -> Option<Arc<S>> {
        self.inner.lock().sessions.get(&id).cloned()
    }

    /// Returns the client's session ids in creation order.
    pub fn sessions_of(&self, client_id: &ClientId) -> Vec<SessionId> {
        self.inner
            .lock()
            .clients
            .get(client_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the client's first-created live session.
    pub fn first_session_of(&self, client_id: &ClientId) -> Option<Arc<S>> {
        let inner = self.inner.lock();
        inner
            .clients
            .get(client_id)?
            .iter()
            .find_map(|id| inner.sessions.get(id).cloned())
    }

    /// Looks up a session, but only if `client_id` owns it.
    pub fn owned_by(&self, client_id: &ClientId, id: SessionId) -> Option<Arc<S>> {
        self.get(id).filter(|s| s.client_id() == client_id)
    }

    /// Closes one session. Returns `false` when the id is unknown or the
    /// session was already closed.
    pub async fn close_session(&self, id: SessionId) -> bool {
        let Some(session) = self.detach(id) else {
            debug!(registry = self.name, session_id = %id, "Close requested for unknown session");
            return false;
        };

        session.teardown().await;

        let info = session.info();
        info!(
            registry = self.name,
            session_id = %id,
            client_id = %info.client_id,
            device_uuid = %info.device_uuid,
            duration_secs = info.duration.as_secs(),
            remaining_sessions = self.session_count(),
            "Session closed"
        );
        true
    }

    /// Closes every session of a client. Returns how many this call closed.
    pub async fn close_all_for_client(&self, client_id: &ClientId) -> usize {
        let ids = self.sessions_of(client_id);
        let mut closed = 0;
        for id in ids {
            if self.close_session(id).await {
                closed += 1;
            }
        }
        self.inner.lock().clients.remove(client_id);

        if closed > 0 {
            info!(
                registry = self.name,
                client_id = %client_id,
                closed,
                "Client sessions closed"
            );
        }
        closed
    }

    /// Closes every session of every client.
    pub async fn close_all(&self) -> usize {
        let ids: Vec<SessionId> = self.inner.lock().sessions.keys().copied().collect();
        info!(registry = self.name, session_count = ids.len(), "Closing all sessions");

        let mut closed = 0;
        for id in ids {
            if self.close_session(id).await {
                closed += 1;
            }
        }
        closed
    }

    /// Returns information about all live sessions.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<S>> = self.inner.lock().sessions.values().cloned().collect();
        sessions.iter().map(|s| s.info()).collect()
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn client_count(&self) -> usize {
        self.inner.lock().clients.len()
    }

    fn detach(&self, id: SessionId) -> Option<Arc<S>> {
        let mut inner = self.inner.lock();
        let session = inner.sessions.remove(&id)?;
        let client_id = session.client_id().clone();
        if let Some(ids) = inner.clients.get_mut(&client_id) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                inner.clients.remove(&client_id);
            }
        }
        Some(session)
    }
}
