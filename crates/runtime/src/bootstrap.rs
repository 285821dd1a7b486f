//! AppState construction and background-task spawning.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use convoy_bus::EventBus;
use convoy_domain::config::{Config, ConfigSeverity};
use convoy_engine::{agent_pipeline, AgentEngine};
use convoy_queue::TopicQueue;
use convoy_sessions::SessionStore;

use crate::agents::AgentRuntime;
use crate::commands::register_command_handlers;
use crate::delivery::wire_event_flow;
use crate::registry::ConnectionRegistry;
use crate::state::AppState;

/// Validate the config, open storage, and wire every subsystem into a
/// ready [`AppState`].
pub fn build_app_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    validate(&config)?;

    let state_path = &config.storage.state_path;
    std::fs::create_dir_all(state_path)
        .with_context(|| format!("creating state dir {}", state_path.display()))?;

    let queue = Arc::new(
        TopicQueue::open(&state_path.join("queue.db"), config.queue.clone())
            .context("opening queue store")?,
    );
    tracing::info!(path = %state_path.join("queue.db").display(), "queue ready");

    let sessions = Arc::new(
        SessionStore::open(&state_path.join("sessions.db")).context("opening session store")?,
    );

    Ok(assemble(config, queue, sessions))
}

/// Fully in-memory state for tests and embedding.
pub fn build_in_memory_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    validate(&config)?;
    let queue = Arc::new(TopicQueue::in_memory(config.queue.clone())?);
    let sessions = Arc::new(SessionStore::open_in_memory()?);
    Ok(assemble(config, queue, sessions))
}

fn validate(config: &Config) -> anyhow::Result<()> {
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    let errors = issues
        .iter()
        .filter(|i| i.severity == ConfigSeverity::Error)
        .count();
    if errors > 0 {
        anyhow::bail!("config validation failed with {errors} error(s)");
    }
    Ok(())
}

fn assemble(config: Arc<Config>, queue: Arc<TopicQueue>, sessions: Arc<SessionStore>) -> AppState {
    let bus = EventBus::new();
    let engine = Arc::new(
        AgentEngine::new(agent_pipeline()).with_max_depth(config.engine.max_depth),
    );
    let connections = Arc::new(ConnectionRegistry::new());
    let agents = Arc::new(AgentRuntime::new(
        bus.clone(),
        engine.clone(),
        sessions.clone(),
    ));

    wire_event_flow(&bus, &queue, &sessions, &agents);
    register_command_handlers(&bus, &agents, &sessions);
    tracing::info!("event flow wired");

    AppState {
        config,
        bus,
        engine,
        queue,
        sessions,
        agents,
        connections,
        shutdown: Arc::new(tokio::sync::Notify::new()),
    }
}

/// Spawn the long-running maintenance tasks: periodic queue cleanup
/// and stale-connection pruning.
pub fn spawn_background_tasks(state: &AppState) {
    state.queue.start_cleanup_task();

    let heartbeat_ms = state.config.server.heartbeat_interval_ms;
    if heartbeat_ms > 0 {
        let connections = state.connections.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(heartbeat_ms));
            interval.tick().await;
            loop {
                interval.tick().await;
                connections.prune_stale(heartbeat_ms as i64 * 3);
            }
        });
    }
    tracing::info!("background tasks spawned");
}
