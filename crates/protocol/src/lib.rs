//! Wire protocol: frame shapes and dispatch for the reliable WebSocket
//! transport.
//!
//! Every frame is one JSON text object, in one of four shapes:
//! 1. reliable envelope — `{"__reliable": true, "id", "payload"}`
//! 2. reliable ack — `{"__ack": true, "id"}`
//! 3. queue control — `{"type": "queue_*", ...}`
//! 4. plain event record
//!
//! [`Frame::decode`] dispatches by discriminator in exactly that
//! precedence. Unknown fields are tolerated everywhere; unparseable
//! frames decode to `None` and are dropped by both peers. Binary frames
//! are reserved.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use convoy_domain::Event;

/// Default timeout for a reliable envelope awaiting its ACK.
pub const DEFAULT_RELIABLE_TIMEOUT_MS: u64 = 10_000;
/// Default timeout for a command request/response round trip.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
/// Default server heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
/// Replay page cap per batch on re-subscribe.
pub const REPLAY_PAGE_LIMIT: usize = 1_000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reliability envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Wraps any payload with an ACK-able id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliableEnvelope {
    #[serde(rename = "__reliable")]
    pub reliable: bool,
    pub id: String,
    pub payload: Value,
}

impl ReliableEnvelope {
    pub fn new(id: impl Into<String>, payload: Value) -> Self {
        Self {
            reliable: true,
            id: id.into(),
            payload,
        }
    }
}

/// Acknowledges one reliable envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliableAck {
    #[serde(rename = "__ack")]
    pub ack: bool,
    pub id: String,
}

impl ReliableAck {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            ack: true,
            id: id.into(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Queue control messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The queue subprotocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    /// C→S: subscribe (resume when `after_cursor` is given).
    QueueSubscribe {
        topic: String,
        client_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after_cursor: Option<String>,
    },

    /// S→C: subscription confirmed.
    QueueSubscribed {
        topic: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        latest_cursor: Option<String>,
    },

    /// S→C: one queue entry.
    QueueEntry {
        topic: String,
        cursor: String,
        event: Event,
    },

    /// C→S: acknowledge up to `cursor`; the server advances the
    /// consumer.
    QueueAck {
        topic: String,
        client_id: String,
        cursor: String,
    },

    /// C→S: drop the subscription.
    QueueUnsubscribe { topic: String, client_id: String },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Frame dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Reliable(ReliableEnvelope),
    Ack(ReliableAck),
    Control(ControlMessage),
    Event(Event),
}

impl Frame {
    /// Decode one text frame. Dispatch precedence: `__reliable`, then
    /// `__ack`, then `type ∈ queue_*`, then plain event. Returns `None`
    /// for anything unparseable (the frame is discarded, the connection
    /// stays open).
    pub fn decode(text: &str) -> Option<Frame> {
        Self::decode_value(serde_json::from_str(text).ok()?)
    }

    /// [`decode`](Self::decode) for an already-parsed value — the inner
    /// payload of a reliable envelope goes through the same dispatch.
    pub fn decode_value(value: Value) -> Option<Frame> {
        if !value.is_object() {
            return None;
        }

        let is_reliable = value.get("__reliable").and_then(Value::as_bool) == Some(true);
        let is_ack = value.get("__ack").and_then(Value::as_bool) == Some(true);
        let is_control = value
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|kind| kind.starts_with("queue_"));

        if is_reliable {
            serde_json::from_value(value).ok().map(Frame::Reliable)
        } else if is_ack {
            serde_json::from_value(value).ok().map(Frame::Ack)
        } else if is_control {
            serde_json::from_value(value).ok().map(Frame::Control)
        } else {
            serde_json::from_value(value).ok().map(Frame::Event)
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Frame::Reliable(envelope) => serde_json::to_string(envelope),
            Frame::Ack(ack) => serde_json::to_string(ack),
            Frame::Control(control) => serde_json::to_string(control),
            Frame::Event(event) => serde_json::to_string(event),
        }
        .unwrap_or_else(|_| "{}".to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_domain::event::{TextDelta, UserMessage};
    use convoy_domain::{EventContext, EventPayload};
    use serde_json::json;

    fn sample_event() -> Event {
        Event::at(
            EventPayload::UserMessage(UserMessage {
                id: Some("m1".into()),
                content: "hi".into(),
            }),
            1,
            EventContext::for_agent("a1").with_session("s1"),
        )
    }

    #[test]
    fn reliable_envelope_round_trips() {
        let frame = Frame::Reliable(ReliableEnvelope::new("r1", json!({"x": 1})));
        let text = frame.encode();
        assert_eq!(Frame::decode(&text), Some(frame));
    }

    #[test]
    fn ack_round_trips() {
        let frame = Frame::Ack(ReliableAck::new("r1"));
        let text = frame.encode();
        assert!(text.contains("\"__ack\":true"));
        assert_eq!(Frame::decode(&text), Some(frame));
    }

    #[test]
    fn control_round_trips_with_camel_case_fields() {
        let frame = Frame::Control(ControlMessage::QueueSubscribe {
            topic: "s1".into(),
            client_id: "base:tab1".into(),
            after_cursor: Some("c2".into()),
        });
        let text = frame.encode();
        assert!(text.contains("\"type\":\"queue_subscribe\""));
        assert!(text.contains("\"clientId\""));
        assert!(text.contains("\"afterCursor\""));
        assert_eq!(Frame::decode(&text), Some(frame));
    }

    #[test]
    fn queue_entry_carries_a_full_event() {
        let frame = Frame::Control(ControlMessage::QueueEntry {
            topic: "s1".into(),
            cursor: "c1".into(),
            event: sample_event(),
        });
        let decoded = Frame::decode(&frame.encode());
        assert_eq!(decoded, Some(frame));
    }

    #[test]
    fn plain_event_decodes_as_event() {
        let text = serde_json::to_string(&sample_event()).unwrap();
        match Frame::decode(&text) {
            Some(Frame::Event(event)) => assert_eq!(event, sample_event()),
            other => panic!("expected event frame, got {other:?}"),
        }
    }

    #[test]
    fn reliable_takes_precedence_over_type() {
        // A malicious/confused frame carrying both discriminators must
        // dispatch as reliable.
        let text = json!({
            "__reliable": true,
            "id": "r1",
            "payload": {},
            "type": "queue_ack"
        })
        .to_string();
        assert!(matches!(Frame::decode(&text), Some(Frame::Reliable(_))));
    }

    #[test]
    fn garbage_is_discarded() {
        assert_eq!(Frame::decode("not json"), None);
        assert_eq!(Frame::decode("[1,2,3]"), None);
        assert_eq!(Frame::decode("{\"type\":\"queue_mystery\"}"), None);
        assert_eq!(Frame::decode("{\"hello\":\"world\"}"), None);
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let text = json!({
            "type": "queue_ack",
            "topic": "s1",
            "clientId": "c1",
            "cursor": "x",
            "futureField": 42
        })
        .to_string();
        assert!(matches!(
            Frame::decode(&text),
            Some(Frame::Control(ControlMessage::QueueAck { .. }))
        ));
    }

    #[test]
    fn delta_event_survives_the_wire() {
        let event = Event::at(
            EventPayload::TextDelta(TextDelta {
                index: 2,
                text: "chunk".into(),
            }),
            99,
            EventContext::for_agent("a1").with_turn("t1"),
        );
        let text = Frame::Event(event.clone()).encode();
        match Frame::decode(&text) {
            Some(Frame::Event(decoded)) => assert_eq!(decoded, event),
            other => panic!("expected event frame, got {other:?}"),
        }
    }
}
