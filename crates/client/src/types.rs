//! Client error and handler types.

use std::sync::Arc;

use convoy_domain::Event;

/// Errors surfaced by the client run loop and request API.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("client shut down")]
    Shutdown,

    #[error("reconnect attempts exhausted after {0} tries")]
    ReconnectExhausted(u32),

    #[error("not connected")]
    NotConnected,

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;
pub type OpenHandler = Arc<dyn Fn() + Send + Sync>;
pub type CloseHandler = Arc<dyn Fn() + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&str) + Send + Sync>;
