//! Record types for the session data model.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use convoy_domain::{Event, EventPayload};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub image_id: String,
    pub container_id: String,
    pub title: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
    Base,
    Derived,
}

impl ImageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageKind::Base => "base",
            ImageKind::Derived => "derived",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "base" => Some(ImageKind::Base),
            "derived" => Some(ImageKind::Derived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub image_id: String,
    pub kind: ImageKind,
    pub definition_name: String,
    pub parent_image_id: Option<String>,
    pub definition: Value,
    pub config: Value,
    /// Seed messages baked into the image (e.g. a system preamble).
    pub messages: Vec<Value>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub container_id: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub config: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: String,
    pub session_id: String,
    pub role: String,
    pub subtype: Option<String>,
    pub content: Value,
    pub timestamp: i64,
}

impl MessageRecord {
    /// Project a message-category event into a persistable record.
    /// Non-message events (and user messages still missing an id)
    /// yield `None`.
    pub fn from_event(event: &Event, session_id: &str) -> Option<Self> {
        let (message_id, role, subtype) = match &event.payload {
            EventPayload::UserMessage(m) => (m.id.clone()?, "user", None),
            EventPayload::AssistantMessage(m) => (m.id.clone(), "assistant", None),
            EventPayload::ToolCallMessage(m) => (m.id.clone(), "assistant", Some("tool_call")),
            EventPayload::ToolResultMessage(m) => (m.id.clone(), "tool", Some("tool_result")),
            _ => return None,
        };
        Some(Self {
            message_id,
            session_id: session_id.to_owned(),
            role: role.to_owned(),
            subtype: subtype.map(str::to_owned),
            content: event.payload.data_value(),
            timestamp: event.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_domain::event::{AssistantMessage, StateChange, ToolCallMessage, UserMessage};
    use convoy_domain::{EventContext, LifecycleState, StopReason};
    use serde_json::json;

    fn ctx() -> EventContext {
        EventContext::for_agent("a1").with_session("s1")
    }

    #[test]
    fn user_message_maps_to_user_role() {
        let event = Event::at(
            EventPayload::UserMessage(UserMessage {
                id: Some("m1".into()),
                content: "hi".into(),
            }),
            5,
            ctx(),
        );
        let record = MessageRecord::from_event(&event, "s1").unwrap();
        assert_eq!(record.message_id, "m1");
        assert_eq!(record.role, "user");
        assert_eq!(record.subtype, None);
        assert_eq!(record.content["content"], json!("hi"));
    }

    #[test]
    fn tool_call_maps_to_assistant_subtype() {
        let event = Event::at(
            EventPayload::ToolCallMessage(ToolCallMessage {
                id: "tc1".into(),
                name: "get_time".into(),
                input: json!({}),
            }),
            5,
            ctx(),
        );
        let record = MessageRecord::from_event(&event, "s1").unwrap();
        assert_eq!(record.role, "assistant");
        assert_eq!(record.subtype.as_deref(), Some("tool_call"));
    }

    #[test]
    fn assistant_message_keeps_stop_reason_in_content() {
        let event = Event::at(
            EventPayload::AssistantMessage(AssistantMessage {
                id: "m2".into(),
                content: "hello".into(),
                stop_reason: Some(StopReason::EndTurn),
                usage: None,
            }),
            5,
            ctx(),
        );
        let record = MessageRecord::from_event(&event, "s1").unwrap();
        assert_eq!(record.content["stopReason"], json!("end_turn"));
    }

    #[test]
    fn non_message_events_do_not_persist() {
        let event = Event::at(
            EventPayload::StateChange(StateChange {
                prev: LifecycleState::Idle,
                current: LifecycleState::Thinking,
            }),
            5,
            ctx(),
        );
        assert!(MessageRecord::from_event(&event, "s1").is_none());

        let unidentified = Event::user_request(
            UserMessage {
                id: None,
                content: "hi".into(),
            },
            ctx(),
        );
        assert!(MessageRecord::from_event(&unidentified, "s1").is_none());
    }
}
