//! Builder for [`ConvoyClient`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::client::{ClientInner, ConvoyClient};
use crate::reconnect::ReconnectBackoff;
use crate::storage::{KvStorage, MemoryStorage};
use crate::types::ClientError;

const CLIENT_ID_KEY: &str = "convoy.clientId";

pub struct ConvoyClientBuilder {
    url: Option<String>,
    storage: Option<Arc<dyn KvStorage>>,
    base_client_id: Option<String>,
    instance_id: Option<String>,
    connection_timeout: Duration,
    backoff: ReconnectBackoff,
}

impl Default for ConvoyClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConvoyClientBuilder {
    pub fn new() -> Self {
        Self {
            url: None,
            storage: None,
            base_client_id: None,
            instance_id: None,
            connection_timeout: Duration::from_secs(4),
            backoff: ReconnectBackoff::default(),
        }
    }

    /// WebSocket URL of the server (required).
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Key/value storage for identity and cursors. Defaults to
    /// in-memory (no resume across process restarts).
    pub fn storage(mut self, storage: Arc<dyn KvStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Override the persisted base client id.
    pub fn base_client_id(mut self, id: impl Into<String>) -> Self {
        self.base_client_id = Some(id.into());
        self
    }

    /// Override the per-process instance id (the "tab" id).
    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn backoff(mut self, backoff: ReconnectBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn build(self) -> Result<ConvoyClient, ClientError> {
        let url = self
            .url
            .ok_or_else(|| ClientError::Other("url is required".into()))?;
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));

        // Stable base id: explicit, else persisted, else minted once.
        let base_client_id = match self.base_client_id {
            Some(id) => id,
            None => match storage.get(CLIENT_ID_KEY) {
                Some(id) => id,
                None => {
                    let id = uuid::Uuid::new_v4().to_string();
                    storage.set(CLIENT_ID_KEY, &id);
                    id
                }
            },
        };

        let instance_id = self.instance_id.unwrap_or_else(|| {
            uuid::Uuid::new_v4()
                .to_string()
                .chars()
                .take(8)
                .collect::<String>()
        });

        Ok(ConvoyClient {
            inner: Arc::new(ClientInner {
                url,
                base_client_id,
                instance_id,
                connection_timeout: self.connection_timeout,
                backoff: self.backoff,
                storage,
                topics: Mutex::new(HashSet::new()),
                outbound: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                on_message: Mutex::new(Vec::new()),
                on_open: Mutex::new(Vec::new()),
                on_close: Mutex::new(Vec::new()),
                on_error: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
            }),
        })
    }
}
