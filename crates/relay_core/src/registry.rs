use std::{collections::HashMap, sync::Arc};

use shared::domain::{ConnectionId, UserId};
use tokio::sync::RwLock;
use tracing::info;

use crate::writer::ConnectionWriter;

/// Maps each online user to the writer of their single live connection.
///
/// The lock is held only for the map operation itself; nothing awaits
/// network I/O while holding it.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<UserId, ConnectionWriter>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `user_id` to `writer`. A previous binding is replaced, told to
    /// close, and returned.
    pub async fn register(
        &self,
        user_id: UserId,
        writer: ConnectionWriter,
    ) -> Option<ConnectionWriter> {
        let connection_id = writer.connection_id();
        let (displaced, online) = {
            let mut connections = self.connections.write().await;
            let displaced = connections.insert(user_id, writer);
            (displaced, connections.len())
        };

        if let Some(previous) = &displaced {
            if previous.connection_id() != connection_id {
                previous.close();
                info!(
                    %user_id,
                    %connection_id,
                    displaced_connection_id = %previous.connection_id(),
                    "replaced existing connection"
                );
            }
        }
        info!(%user_id, %connection_id, online, "connection registered");
        displaced
    }

    /// Removes the binding only if it still belongs to `connection_id`, so a
    /// late cleanup from a replaced connection cannot evict its successor.
    pub async fn unregister(&self, user_id: UserId, connection_id: ConnectionId) -> bool {
        let (removed, online) = {
            let mut connections = self.connections.write().await;
            let removed = match connections.get(&user_id) {
                Some(current) if current.connection_id() == connection_id => {
                    connections.remove(&user_id);
                    true
                }
                _ => false,
            };
            (removed, connections.len())
        };

        if removed {
            info!(%user_id, %connection_id, online, "connection unregistered");
        }
        removed
    }

    pub async fn lookup(&self, user_id: UserId) -> Option<ConnectionWriter> {
        self.connections.read().await.get(&user_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
