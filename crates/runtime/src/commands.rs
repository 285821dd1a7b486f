//! Built-in command handlers: the request/response surface clients
//! drive over the bus (directly or through the transport).
//!
//! Every handler answers a `*_request` with the matching `*_response`
//! carrying the same `requestId`; failures answer with an
//! error-category response so pending `request()` calls reject instead
//! of timing out.

use std::sync::Arc;

use serde_json::{json, Value};

use convoy_bus::EventBus;
use convoy_domain::{Event, EventCategory, EventContext, EventPayload};
use convoy_sessions::SessionStore;

use crate::agents::AgentRuntime;

pub fn register_command_handlers(
    bus: &EventBus,
    agents: &Arc<AgentRuntime>,
    sessions: &Arc<SessionStore>,
) {
    // agent_run_request {imageId, containerId?} → {agentId, sessionId,
    // containerId}
    {
        let bus2 = bus.clone();
        let agents = agents.clone();
        bus.on_command("agent_run_request", move |event| {
            let Some(request_id) = event.request_id().map(str::to_owned) else {
                return Ok(());
            };
            let data = event.payload.data_value();
            let Some(image_id) = data.get("imageId").and_then(Value::as_str) else {
                respond_error(&bus2, "agent_run_response", &request_id, "imageId required");
                return Ok(());
            };
            let container_id = data.get("containerId").and_then(Value::as_str);

            match agents.run_agent(image_id, container_id) {
                Ok(handle) => {
                    bus2.emit(Event::command_response(
                        "agent_run_response",
                        &request_id,
                        json!({
                            "agentId": handle.agent_id,
                            "sessionId": handle.session_id,
                            "containerId": handle.container_id,
                        }),
                        // No session in the context: the response must
                        // route over the global topic — the requester
                        // cannot subscribe to a session it has not
                        // learned about yet.
                        EventContext::for_agent(&handle.agent_id)
                            .with_container(&handle.container_id),
                    ));
                }
                Err(error) => {
                    respond_error(&bus2, "agent_run_response", &request_id, &error.to_string());
                }
            }
            Ok(())
        });
    }

    // agent_interrupt_request {agentId} → {interrupted}
    {
        let bus2 = bus.clone();
        let agents = agents.clone();
        bus.on_command("agent_interrupt_request", move |event| {
            let Some(request_id) = event.request_id().map(str::to_owned) else {
                return Ok(());
            };
            let data = event.payload.data_value();
            let Some(agent_id) = data.get("agentId").and_then(Value::as_str) else {
                respond_error(
                    &bus2,
                    "agent_interrupt_response",
                    &request_id,
                    "agentId required",
                );
                return Ok(());
            };
            let interrupted = agents.interrupt(agent_id);
            bus2.emit(Event::command_response(
                "agent_interrupt_response",
                &request_id,
                json!({"interrupted": interrupted}),
                EventContext::for_agent(agent_id),
            ));
            Ok(())
        });
    }

    // container_dispose_request {containerId} → {destroyedAgents}
    {
        let bus2 = bus.clone();
        let agents = agents.clone();
        bus.on_command("container_dispose_request", move |event| {
            let Some(request_id) = event.request_id().map(str::to_owned) else {
                return Ok(());
            };
            let data = event.payload.data_value();
            let Some(container_id) = data.get("containerId").and_then(Value::as_str) else {
                respond_error(
                    &bus2,
                    "container_dispose_response",
                    &request_id,
                    "containerId required",
                );
                return Ok(());
            };
            match agents.dispose_container(container_id) {
                Ok(count) => bus2.emit(Event::command_response(
                    "container_dispose_response",
                    &request_id,
                    json!({"destroyedAgents": count}),
                    EventContext::default().with_container(container_id),
                )),
                Err(error) => respond_error(
                    &bus2,
                    "container_dispose_response",
                    &request_id,
                    &error.to_string(),
                ),
            }
            Ok(())
        });
    }

    // session_list_request {} → {sessions: [...]}
    {
        let bus2 = bus.clone();
        let sessions = sessions.clone();
        bus.on_command("session_list_request", move |event| {
            let Some(request_id) = event.request_id().map(str::to_owned) else {
                return Ok(());
            };
            let list = sessions.list_sessions()?;
            bus2.emit(Event::command_response(
                "session_list_response",
                &request_id,
                json!({"sessions": list}),
                EventContext::default(),
            ));
            Ok(())
        });
    }
}

/// Error-category response: resolves the pending request as a failure.
fn respond_error(bus: &EventBus, name: &str, request_id: &str, message: &str) {
    let mut event = Event::command_response(
        name,
        request_id,
        json!({"error": message}),
        EventContext::default(),
    );
    event.category = EventCategory::Error;
    bus.emit(event);
}

/// Only used by tests and embedders that want to inspect responses
/// without a transport round trip.
pub fn response_data(event: &Event) -> Value {
    match &event.payload {
        EventPayload::CommandResponse { data, .. } => data.clone(),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_domain::Error;
    use convoy_engine::{agent_pipeline, AgentEngine};
    use convoy_sessions::{ImageKind, ImageRecord};
    use std::time::Duration;

    fn fixture() -> (EventBus, Arc<AgentRuntime>, Arc<SessionStore>) {
        let bus = EventBus::new();
        let engine = Arc::new(AgentEngine::new(agent_pipeline()));
        let sessions = Arc::new(SessionStore::open_in_memory().unwrap());
        sessions
            .insert_image(&ImageRecord {
                image_id: "img1".into(),
                kind: ImageKind::Base,
                definition_name: "assistant".into(),
                parent_image_id: None,
                definition: json!({}),
                config: json!({}),
                messages: vec![],
                created_at: 1,
            })
            .unwrap();
        let agents = Arc::new(AgentRuntime::new(bus.clone(), engine, sessions.clone()));
        register_command_handlers(&bus, &agents, &sessions);
        (bus, agents, sessions)
    }

    #[tokio::test]
    async fn agent_run_round_trip() {
        let (bus, agents, sessions) = fixture();

        let response = bus
            .request(
                "agent_run_request",
                json!({"imageId": "img1"}),
                EventContext::default(),
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        let data = response_data(&response);
        let session_id = data["sessionId"].as_str().unwrap();
        assert!(sessions.get_session(session_id).unwrap().is_some());
        assert_eq!(agents.agent_count(), 1);
    }

    #[tokio::test]
    async fn agent_run_with_bad_image_rejects() {
        let (bus, _agents, _sessions) = fixture();

        let result = bus
            .request(
                "agent_run_request",
                json!({"imageId": "missing"}),
                EventContext::default(),
                Duration::from_secs(1),
            )
            .await;
        assert!(matches!(result, Err(Error::Other(_))));
    }

    #[tokio::test]
    async fn interrupt_round_trip() {
        let (bus, agents, _sessions) = fixture();
        let handle = agents.run_agent("img1", None).unwrap();

        let response = bus
            .request(
                "agent_interrupt_request",
                json!({"agentId": handle.agent_id}),
                EventContext::default(),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(response_data(&response)["interrupted"], json!(true));
    }

    #[tokio::test]
    async fn session_list_round_trip() {
        let (bus, agents, _sessions) = fixture();
        agents.run_agent("img1", None).unwrap();
        agents.run_agent("img1", None).unwrap();

        let response = bus
            .request(
                "session_list_request",
                json!({}),
                EventContext::default(),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(
            response_data(&response)["sessions"]
                .as_array()
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn container_dispose_round_trip() {
        let (bus, agents, _sessions) = fixture();
        let handle = agents.run_agent("img1", None).unwrap();

        let response = bus
            .request(
                "container_dispose_request",
                json!({"containerId": handle.container_id}),
                EventContext::default(),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(response_data(&response)["destroyedAgents"], json!(1));
        assert_eq!(agents.agent_count(), 0);
    }
}
