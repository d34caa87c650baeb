use crate::protocol::ServerMessage;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// State for a single live connection. The registry owns the handle; the
/// waiting pool and session table only ever refer to it by connection id.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub connection_id: String,
    /// Optional external P2P signaling identity announced via `register`.
    pub peer_ref: Option<String>,
    pub tx: mpsc::UnboundedSender<ServerMessage>,
    pub connected_at: DateTime<Utc>,
}

impl ConnectionHandle {
    pub fn new(connection_id: String, tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            connection_id,
            peer_ref: None,
            tx,
            connected_at: Utc::now(),
        }
    }

    /// Identifier shown to other participants.
    pub fn public_id(&self) -> &str {
        self.peer_ref.as_deref().unwrap_or(&self.connection_id)
    }
}

/// Single source of truth for which endpoints are still reachable.
pub struct ConnectionRegistry {
    connections: DashMap<String, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Register a connection. A colliding identifier replaces the previous
    /// connection: the old side is told and its handle is returned so the
    /// caller can run full teardown for it.
    pub fn register(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let replaced = self.connections.insert(handle.connection_id.clone(), handle);
        if let Some(old) = &replaced {
            info!(connection_id = %old.connection_id, "replacing connection with duplicate identifier");
            let _ = old.tx.send(ServerMessage::Error {
                message: "connection replaced by a newer connection".to_string(),
            });
        }
        replaced
    }

    /// Record a connection's external peer identity. Any other live
    /// connection already claiming the same identity is replaced, mirroring
    /// `register`'s duplicate policy.
    pub fn claim_peer_ref(&self, connection_id: &str, peer_ref: String) -> Option<ConnectionHandle> {
        let stale: Option<String> = self
            .connections
            .iter()
            .find(|entry| {
                entry.key() != connection_id && entry.peer_ref.as_deref() == Some(peer_ref.as_str())
            })
            .map(|entry| entry.key().clone());

        let replaced = stale.and_then(|id| {
            info!(connection_id = %id, peer_ref = %peer_ref, "replacing connection with duplicate peer identity");
            let removed = self.connections.remove(&id).map(|(_, handle)| handle);
            if let Some(old) = &removed {
                let _ = old.tx.send(ServerMessage::Error {
                    message: "connection replaced by a newer connection".to_string(),
                });
            }
            removed
        });

        if let Some(mut entry) = self.connections.get_mut(connection_id) {
            entry.peer_ref = Some(peer_ref);
        }
        replaced
    }

    pub fn remove(&self, connection_id: &str) -> Option<ConnectionHandle> {
        self.connections.remove(connection_id).map(|(_, handle)| handle)
    }

    /// A connection is reachable while it is registered and its outbound
    /// channel is still open.
    pub fn is_reachable(&self, connection_id: &str) -> bool {
        self.connections
            .get(connection_id)
            .map(|entry| !entry.tx.is_closed())
            .unwrap_or(false)
    }

    /// Deliver a message to one connection. Returns false when the target is
    /// gone; callers decide whether that is worth logging.
    pub fn send(&self, connection_id: &str, message: ServerMessage) -> bool {
        match self.connections.get(connection_id) {
            Some(entry) => entry.tx.send(message).is_ok(),
            None => {
                debug!(connection_id = %connection_id, "dropping message for unknown connection");
                false
            }
        }
    }

    pub fn public_id(&self, connection_id: &str) -> Option<String> {
        self.connections
            .get(connection_id)
            .map(|entry| entry.public_id().to_string())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
