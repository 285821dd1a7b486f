//! In-memory registry of live connections.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use convoy_domain::{now_millis, Event};

use crate::connection::Connection;

pub type ConnectionHandler = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    on_connection: Mutex<Vec<ConnectionHandler>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoke `handler` for every future connection.
    pub fn on_connection(&self, handler: impl Fn(&Arc<Connection>) + Send + Sync + 'static) {
        self.on_connection.lock().push(Arc::new(handler));
    }

    pub fn register(&self, connection: Arc<Connection>) {
        tracing::info!(connection_id = %connection.connection_id, "connection registered");
        self.connections
            .write()
            .insert(connection.connection_id.clone(), connection.clone());
        for handler in self.on_connection.lock().clone() {
            handler(&connection);
        }
    }

    pub fn remove(&self, connection_id: &str) -> Option<Arc<Connection>> {
        let removed = self.connections.write().remove(connection_id);
        if removed.is_some() {
            tracing::info!(connection_id = %connection_id, "connection removed");
        }
        removed
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections.read().get(connection_id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Best-effort plain send to every connection.
    pub fn broadcast(&self, event: &Event) {
        for connection in self.list() {
            connection.send_event(event);
        }
    }

    /// Ask connections silent for more than `timeout_ms` to close.
    pub fn prune_stale(&self, timeout_ms: i64) -> usize {
        let now = now_millis();
        let stale: Vec<Arc<Connection>> = self
            .list()
            .into_iter()
            .filter(|c| now - c.last_seen() > timeout_ms)
            .collect();
        for connection in &stale {
            tracing::warn!(
                connection_id = %connection.connection_id,
                "closing stale connection"
            );
            connection.request_close();
        }
        stale.len()
    }
}
