//! Agent lifecycle and driver ingress.
//!
//! Ownership chain: a session is created *before* its agent and owns
//! that agent's message collection; an agent belongs to exactly one
//! container; disposing a container destroys all its agents. The turn
//! id is assigned here, at user-message ingress, and stamped onto every
//! stream fragment the driver forwards until the turn closes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use convoy_bus::EventBus;
use convoy_domain::event::{AgentLifecycle, ErrorMessage, SessionLifecycle};
use convoy_domain::{Error, Event, EventContext, EventIntent, EventPayload, Result};
use convoy_engine::AgentEngine;
use convoy_sessions::SessionStore;

#[derive(Debug, Clone)]
pub struct AgentHandle {
    pub agent_id: String,
    pub session_id: String,
    pub container_id: String,
}

struct AgentRecord {
    session_id: String,
    container_id: String,
    current_turn: Option<String>,
}

pub struct AgentRuntime {
    bus: EventBus,
    engine: Arc<AgentEngine>,
    sessions: Arc<SessionStore>,
    agents: RwLock<HashMap<String, AgentRecord>>,
    by_session: RwLock<HashMap<String, String>>,
    containers: RwLock<HashMap<String, HashSet<String>>>,
}

impl AgentRuntime {
    pub fn new(bus: EventBus, engine: Arc<AgentEngine>, sessions: Arc<SessionStore>) -> Self {
        Self {
            bus,
            engine,
            sessions,
            agents: RwLock::new(HashMap::new()),
            by_session: RwLock::new(HashMap::new()),
            containers: RwLock::new(HashMap::new()),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Load the image, create-or-reuse the container, create the
    /// session *first*, then the agent, and register it in the
    /// container's registry.
    pub fn run_agent(&self, image_id: &str, container_id: Option<&str>) -> Result<AgentHandle> {
        let image = self
            .sessions
            .get_image(image_id)?
            .ok_or_else(|| Error::NotFound(format!("image {image_id}")))?;

        let container = match container_id {
            Some(id) => self
                .sessions
                .get_container(id)?
                .ok_or_else(|| Error::NotFound(format!("container {id}")))?,
            None => self.sessions.create_container(Some(&image.config))?,
        };

        let session = self
            .sessions
            .create_session(&image.image_id, &container.container_id, None)?;
        let agent_id = uuid::Uuid::new_v4().to_string();

        self.agents.write().insert(
            agent_id.clone(),
            AgentRecord {
                session_id: session.session_id.clone(),
                container_id: container.container_id.clone(),
                current_turn: None,
            },
        );
        self.by_session
            .write()
            .insert(session.session_id.clone(), agent_id.clone());
        self.containers
            .write()
            .entry(container.container_id.clone())
            .or_default()
            .insert(agent_id.clone());

        let context = EventContext::for_agent(&agent_id)
            .with_session(&session.session_id)
            .with_container(&container.container_id);
        self.bus.emit(Event::new(
            EventPayload::SessionCreated(SessionLifecycle {
                session_id: session.session_id.clone(),
                title: session.title.clone(),
            }),
            context.clone(),
        ));
        self.bus.emit(Event::new(
            EventPayload::AgentStarted(AgentLifecycle {
                agent_id: agent_id.clone(),
            }),
            context,
        ));

        tracing::info!(
            agent_id = %agent_id,
            session_id = %session.session_id,
            container_id = %container.container_id,
            image_id = %image_id,
            "agent running"
        );

        Ok(AgentHandle {
            agent_id,
            session_id: session.session_id,
            container_id: container.container_id,
        })
    }

    /// Re-attach a fresh agent to an existing session (a resumed
    /// conversation), reusing the session's container.
    pub fn resume_session(&self, session_id: &str) -> Result<AgentHandle> {
        if self.agent_for_session(session_id).is_some() {
            return Err(Error::Validation(format!(
                "session {session_id} already has an agent"
            )));
        }
        let session = self
            .sessions
            .get_session(session_id)?
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;

        let agent_id = uuid::Uuid::new_v4().to_string();
        self.agents.write().insert(
            agent_id.clone(),
            AgentRecord {
                session_id: session.session_id.clone(),
                container_id: session.container_id.clone(),
                current_turn: None,
            },
        );
        self.by_session
            .write()
            .insert(session.session_id.clone(), agent_id.clone());
        self.containers
            .write()
            .entry(session.container_id.clone())
            .or_default()
            .insert(agent_id.clone());
        self.sessions.touch_session(session_id)?;

        let context = EventContext::for_agent(&agent_id)
            .with_session(&session.session_id)
            .with_container(&session.container_id);
        self.bus.emit(Event::new(
            EventPayload::SessionResumed(SessionLifecycle {
                session_id: session.session_id.clone(),
                title: session.title.clone(),
            }),
            context.clone(),
        ));
        self.bus.emit(Event::new(
            EventPayload::AgentStarted(AgentLifecycle {
                agent_id: agent_id.clone(),
            }),
            context,
        ));

        Ok(AgentHandle {
            agent_id,
            session_id: session.session_id,
            container_id: session.container_id,
        })
    }

    /// Destroy a session outright: its agent (if any), its record and
    /// its message history.
    pub fn destroy_session(&self, session_id: &str) -> Result<bool> {
        if let Some(agent_id) = self.agent_for_session(session_id) {
            self.interrupt(&agent_id);
            self.destroy_agent(&agent_id);
        }
        let deleted = self.sessions.delete_session(session_id)?;
        if deleted {
            self.bus.emit(Event::new(
                EventPayload::SessionDestroyed(SessionLifecycle {
                    session_id: session_id.to_owned(),
                    title: None,
                }),
                EventContext::default().with_session(session_id),
            ));
        }
        Ok(deleted)
    }

    pub fn agent_for_session(&self, session_id: &str) -> Option<String> {
        self.by_session.read().get(session_id).cloned()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.read().len()
    }

    /// Destroy one agent: engine state dropped, registries cleaned,
    /// `agent_destroyed` emitted. The session record (and its message
    /// history) stays.
    pub fn destroy_agent(&self, agent_id: &str) -> bool {
        let Some(record) = self.agents.write().remove(agent_id) else {
            return false;
        };
        self.by_session.write().remove(&record.session_id);
        if let Some(agents) = self.containers.write().get_mut(&record.container_id) {
            agents.remove(agent_id);
        }
        self.engine.remove_agent(agent_id);

        self.bus.emit(Event::new(
            EventPayload::AgentDestroyed(AgentLifecycle {
                agent_id: agent_id.to_owned(),
            }),
            EventContext::for_agent(agent_id)
                .with_session(&record.session_id)
                .with_container(&record.container_id),
        ));
        true
    }

    /// Dispose a container: interrupt and destroy every agent it owns,
    /// then drop the container record. Returns the number of agents
    /// destroyed.
    pub fn dispose_container(&self, container_id: &str) -> Result<usize> {
        let agents: Vec<String> = self
            .containers
            .write()
            .remove(container_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();

        for agent_id in &agents {
            self.interrupt(agent_id);
            self.destroy_agent(agent_id);
        }
        self.sessions.delete_container(container_id)?;

        tracing::info!(
            container_id = %container_id,
            agents = agents.len(),
            "container disposed"
        );
        Ok(agents.len())
    }

    // ── Ingress ──────────────────────────────────────────────────────

    /// Route an inbound `user_message` request into the engine. The
    /// turn id is allocated here if the client did not supply one, and
    /// becomes the agent's current turn until a terminal stop.
    pub fn handle_user_message(&self, event: &Event) {
        let Some(session_id) = event.context.session_id.clone() else {
            self.emit_error("user_message without sessionId", event);
            return;
        };
        let Some(agent_id) = self.agent_for_session(&session_id) else {
            self.emit_error(&format!("no agent for session {session_id}"), event);
            return;
        };

        let turn_id = event
            .context
            .turn_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let container_id = {
            let mut agents = self.agents.write();
            let Some(record) = agents.get_mut(&agent_id) else {
                return;
            };
            record.current_turn = Some(turn_id.clone());
            record.container_id.clone()
        };

        let mut tagged = event.clone();
        tagged.context.agent_id = Some(agent_id.clone());
        tagged.context.container_id = Some(container_id);
        tagged.context.turn_id = Some(turn_id);

        for output in self.engine.process(&agent_id, tagged) {
            self.bus.emit(output);
        }
    }

    /// Feed one driver stream fragment through the engine. Context the
    /// driver left out (agent, session, container, current turn) is
    /// stamped on before processing.
    pub fn ingest_stream(&self, agent_id: &str, mut event: Event) {
        let context = {
            let agents = self.agents.read();
            let Some(record) = agents.get(agent_id) else {
                tracing::warn!(agent_id = %agent_id, "stream fragment for unknown agent");
                return;
            };
            (
                record.session_id.clone(),
                record.container_id.clone(),
                record.current_turn.clone(),
            )
        };

        event.context.agent_id = Some(agent_id.to_owned());
        event.context.session_id.get_or_insert(context.0);
        event.context.container_id.get_or_insert(context.1);
        if event.context.turn_id.is_none() {
            event.context.turn_id = context.2;
        }

        let terminal = matches!(
            &event.payload,
            EventPayload::MessageStop(stop) if stop.stop_reason.is_terminal()
        );

        for output in self.engine.process(agent_id, event) {
            self.bus.emit(output);
        }

        if terminal {
            if let Some(record) = self.agents.write().get_mut(agent_id) {
                record.current_turn = None;
            }
        }
    }

    /// Pump a driver's bounded stream channel through the engine until
    /// the channel closes or the token cancels. Channel capacity is the
    /// backpressure on the driver.
    pub fn spawn_driver_pump(
        self: &Arc<Self>,
        agent_id: String,
        mut stream: mpsc::Receiver<Event>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let runtime = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = stream.recv() => event,
                    _ = cancel.cancelled() => {
                        tracing::debug!(agent_id = %agent_id, "driver pump cancelled");
                        break;
                    }
                };
                let Some(event) = event else { break };
                runtime.ingest_stream(&agent_id, event);
            }
        })
    }

    /// Interrupt an in-flight turn. Idempotent; queue entries already
    /// appended stay.
    pub fn interrupt(&self, agent_id: &str) -> bool {
        let context = {
            let mut agents = self.agents.write();
            let Some(record) = agents.get_mut(agent_id) else {
                return false;
            };
            record.current_turn = None;
            EventContext::for_agent(agent_id)
                .with_session(&record.session_id)
                .with_container(&record.container_id)
        };

        for mut output in self.engine.interrupt(agent_id) {
            output.context.session_id = context.session_id.clone();
            output.context.container_id = context.container_id.clone();
            self.bus.emit(output);
        }
        true
    }

    fn emit_error(&self, message: &str, source: &Event) {
        tracing::warn!(event_type = %source.kind(), "{message}");
        self.bus.emit(Event::new(
            EventPayload::ErrorMessage(ErrorMessage {
                message: message.to_owned(),
                detail: None,
            }),
            source.context.clone(),
        ));
    }
}

/// True for the raw client `user_message` request the runtime must
/// route into an engine (completed user messages are notifications and
/// pass straight to the queue).
pub fn is_user_message_request(event: &Event) -> bool {
    matches!(event.payload, EventPayload::UserMessage(_)) && event.intent == EventIntent::Request
}
