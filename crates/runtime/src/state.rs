//! Shared application state handed to every subsystem.

use std::sync::Arc;

use convoy_bus::EventBus;
use convoy_domain::Config;
use convoy_engine::AgentEngine;
use convoy_queue::TopicQueue;
use convoy_sessions::SessionStore;

use crate::agents::AgentRuntime;
use crate::registry::ConnectionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub bus: EventBus,
    pub engine: Arc<AgentEngine>,
    pub queue: Arc<TopicQueue>,
    pub sessions: Arc<SessionStore>,
    pub agents: Arc<AgentRuntime>,
    pub connections: Arc<ConnectionRegistry>,
    /// Signalled once on shutdown; the HTTP listener and background
    /// tasks watch it.
    pub shutdown: Arc<tokio::sync::Notify>,
}
