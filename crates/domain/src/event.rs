//! The Convoy event record.
//!
//! Every event is one flat JSON object on the wire:
//! `{type, timestamp, source, category, intent, context, data}`.
//! The `type` tag plus `data` object map onto the [`EventPayload`] sum
//! type. Command events (`*_request` / `*_response` with arbitrary
//! prefixes) keep an open namespace through the `CommandRequest` /
//! `CommandResponse` arms, so the sum itself stays closed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Milliseconds since the Unix epoch, the timestamp unit used everywhere.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tagging enums
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Environment,
    Agent,
    Session,
    Container,
    Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Stream,
    State,
    Message,
    Turn,
    Lifecycle,
    Request,
    Response,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventIntent {
    Request,
    Response,
    Notification,
    Result,
}

/// Routing context. All fields optional; absent fields are omitted on
/// the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
}

impl EventContext {
    pub fn for_agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            ..Self::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_container(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = Some(container_id.into());
        self
    }

    pub fn with_turn(mut self, turn_id: impl Into<String>) -> Self {
        self.turn_id = Some(turn_id.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.container_id.is_none()
            && self.session_id.is_none()
            && self.agent_id.is_none()
            && self.turn_id.is_none()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payload data
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Why the model stopped emitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
}

impl StopReason {
    /// `tool_use` continues the turn; everything else closes it.
    pub fn is_terminal(self) -> bool {
        !matches!(self, StopReason::ToolUse)
    }
}

/// Token usage for one model response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStart {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockStart {
    #[serde(default)]
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextDelta {
    #[serde(default)]
    pub index: u32,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockStop {
    #[serde(default)]
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseStart {
    #[serde(default)]
    pub index: u32,
    pub tool_call_id: String,
    pub tool_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputJsonDelta {
    #[serde(default)]
    pub index: u32,
    pub partial_json: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseStop {
    #[serde(default)]
    pub index: u32,
    pub tool_call_id: String,
    /// Final input if the driver already parsed it; the assembler
    /// otherwise reconstructs it from the accumulated JSON deltas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub tool_call_id: String,
    pub result: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStop {
    pub stop_reason: StopReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessage {
    /// Message id; assigned by the assembler when ingress left it out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantMessage {
    pub id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallMessage {
    /// The tool call id.
    pub id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultMessage {
    /// The originating tool call id.
    pub id: String,
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

/// Agent lifecycle states tracked by the engine's state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Idle,
    Thinking,
    Responding,
    PlanningTool,
    AwaitingToolResult,
    Interrupted,
    Destroyed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub prev: LifecycleState,
    pub current: LifecycleState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    pub turn_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnResponse {
    pub turn_id: String,
    pub message_id: String,
    #[serde(rename = "duration")]
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEstablished {
    pub connection_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLifecycle {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentLifecycle {
    pub agent_id: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payload sum
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The wire-visible event taxonomy.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    // Stream fragments (driver → engine).
    MessageStart(MessageStart),
    TextContentBlockStart(BlockStart),
    TextDelta(TextDelta),
    TextContentBlockStop(BlockStop),
    ToolUseStart(ToolUseStart),
    InputJsonDelta(InputJsonDelta),
    ToolUseStop(ToolUseStop),
    ToolResult(ToolResult),
    MessageDelta(MessageDelta),
    MessageStop(MessageStop),

    // Complete messages (engine → consumers).
    UserMessage(UserMessage),
    AssistantMessage(AssistantMessage),
    ToolCallMessage(ToolCallMessage),
    ToolResultMessage(ToolResultMessage),
    ErrorMessage(ErrorMessage),

    // State and turn tracking.
    StateChange(StateChange),
    TurnRequest(TurnRequest),
    TurnResponse(TurnResponse),

    // Lifecycle.
    ConnectionEstablished(ConnectionEstablished),
    Interrupted,
    SessionCreated(SessionLifecycle),
    SessionResumed(SessionLifecycle),
    SessionDestroyed(SessionLifecycle),
    AgentStarted(AgentLifecycle),
    AgentDestroyed(AgentLifecycle),

    // Commands: open `*_request` / `*_response` namespace. `data` carries
    // at least a `requestId`.
    CommandRequest { name: String, data: Value },
    CommandResponse { name: String, data: Value },
}

impl EventPayload {
    /// The wire `type` tag.
    pub fn kind(&self) -> &str {
        match self {
            Self::MessageStart(_) => "message_start",
            Self::TextContentBlockStart(_) => "text_content_block_start",
            Self::TextDelta(_) => "text_delta",
            Self::TextContentBlockStop(_) => "text_content_block_stop",
            Self::ToolUseStart(_) => "tool_use_start",
            Self::InputJsonDelta(_) => "input_json_delta",
            Self::ToolUseStop(_) => "tool_use_stop",
            Self::ToolResult(_) => "tool_result",
            Self::MessageDelta(_) => "message_delta",
            Self::MessageStop(_) => "message_stop",
            Self::UserMessage(_) => "user_message",
            Self::AssistantMessage(_) => "assistant_message",
            Self::ToolCallMessage(_) => "tool_call_message",
            Self::ToolResultMessage(_) => "tool_result_message",
            Self::ErrorMessage(_) => "error_message",
            Self::StateChange(_) => "state_change",
            Self::TurnRequest(_) => "turn_request",
            Self::TurnResponse(_) => "turn_response",
            Self::ConnectionEstablished(_) => "connection_established",
            Self::Interrupted => "interrupted",
            Self::SessionCreated(_) => "session_created",
            Self::SessionResumed(_) => "session_resumed",
            Self::SessionDestroyed(_) => "session_destroyed",
            Self::AgentStarted(_) => "agent_started",
            Self::AgentDestroyed(_) => "agent_destroyed",
            Self::CommandRequest { name, .. } | Self::CommandResponse { name, .. } => name,
        }
    }

    /// The wire `data` object.
    pub fn data_value(&self) -> Value {
        fn to_val<T: Serialize>(v: &T) -> Value {
            serde_json::to_value(v).unwrap_or(Value::Null)
        }
        match self {
            Self::MessageStart(p) => to_val(p),
            Self::TextContentBlockStart(p) => to_val(p),
            Self::TextDelta(p) => to_val(p),
            Self::TextContentBlockStop(p) => to_val(p),
            Self::ToolUseStart(p) => to_val(p),
            Self::InputJsonDelta(p) => to_val(p),
            Self::ToolUseStop(p) => to_val(p),
            Self::ToolResult(p) => to_val(p),
            Self::MessageDelta(p) => to_val(p),
            Self::MessageStop(p) => to_val(p),
            Self::UserMessage(p) => to_val(p),
            Self::AssistantMessage(p) => to_val(p),
            Self::ToolCallMessage(p) => to_val(p),
            Self::ToolResultMessage(p) => to_val(p),
            Self::ErrorMessage(p) => to_val(p),
            Self::StateChange(p) => to_val(p),
            Self::TurnRequest(p) => to_val(p),
            Self::TurnResponse(p) => to_val(p),
            Self::ConnectionEstablished(p) => to_val(p),
            Self::Interrupted => Value::Object(Default::default()),
            Self::SessionCreated(p) => to_val(p),
            Self::SessionResumed(p) => to_val(p),
            Self::SessionDestroyed(p) => to_val(p),
            Self::AgentStarted(p) => to_val(p),
            Self::AgentDestroyed(p) => to_val(p),
            Self::CommandRequest { data, .. } | Self::CommandResponse { data, .. } => data.clone(),
        }
    }

    /// Decode a `(type, data)` pair back into a payload. Unknown tags
    /// ending in `_request` / `_response` become command arms; anything
    /// else is a protocol error (callers drop the frame).
    pub fn from_wire(kind: &str, data: Value) -> Result<Self, Error> {
        fn from_val<T: for<'de> Deserialize<'de>>(data: Value) -> Result<T, Error> {
            serde_json::from_value(data).map_err(Error::Json)
        }
        Ok(match kind {
            "message_start" => Self::MessageStart(from_val(data)?),
            "text_content_block_start" => Self::TextContentBlockStart(from_val(data)?),
            "text_delta" => Self::TextDelta(from_val(data)?),
            "text_content_block_stop" => Self::TextContentBlockStop(from_val(data)?),
            "tool_use_start" => Self::ToolUseStart(from_val(data)?),
            "input_json_delta" => Self::InputJsonDelta(from_val(data)?),
            "tool_use_stop" => Self::ToolUseStop(from_val(data)?),
            "tool_result" => Self::ToolResult(from_val(data)?),
            "message_delta" => Self::MessageDelta(from_val(data)?),
            "message_stop" => Self::MessageStop(from_val(data)?),
            "user_message" => Self::UserMessage(from_val(data)?),
            "assistant_message" => Self::AssistantMessage(from_val(data)?),
            "tool_call_message" => Self::ToolCallMessage(from_val(data)?),
            "tool_result_message" => Self::ToolResultMessage(from_val(data)?),
            "error_message" => Self::ErrorMessage(from_val(data)?),
            "state_change" => Self::StateChange(from_val(data)?),
            "turn_request" => Self::TurnRequest(from_val(data)?),
            "turn_response" => Self::TurnResponse(from_val(data)?),
            "connection_established" => Self::ConnectionEstablished(from_val(data)?),
            "interrupted" => Self::Interrupted,
            "session_created" => Self::SessionCreated(from_val(data)?),
            "session_resumed" => Self::SessionResumed(from_val(data)?),
            "session_destroyed" => Self::SessionDestroyed(from_val(data)?),
            "agent_started" => Self::AgentStarted(from_val(data)?),
            "agent_destroyed" => Self::AgentDestroyed(from_val(data)?),
            other if other.ends_with("_request") => Self::CommandRequest {
                name: other.to_owned(),
                data,
            },
            other if other.ends_with("_response") => Self::CommandResponse {
                name: other.to_owned(),
                data,
            },
            other => return Err(Error::Protocol(format!("unknown event type: {other}"))),
        })
    }

    /// Canonical `(source, category, intent)` triple for this payload.
    ///
    /// This is the single place events get tagged; boundaries convert
    /// instead of re-tagging (ingress user messages use
    /// [`Event::user_request`]).
    pub fn tagging(&self) -> (EventSource, EventCategory, EventIntent) {
        use EventCategory as C;
        use EventIntent as I;
        use EventSource as S;
        match self {
            Self::MessageStart(_)
            | Self::TextContentBlockStart(_)
            | Self::TextDelta(_)
            | Self::TextContentBlockStop(_)
            | Self::ToolUseStart(_)
            | Self::InputJsonDelta(_)
            | Self::ToolUseStop(_)
            | Self::ToolResult(_)
            | Self::MessageDelta(_)
            | Self::MessageStop(_) => (S::Environment, C::Stream, I::Notification),
            Self::UserMessage(_)
            | Self::AssistantMessage(_)
            | Self::ToolCallMessage(_)
            | Self::ToolResultMessage(_) => (S::Agent, C::Message, I::Notification),
            Self::ErrorMessage(_) => (S::Agent, C::Error, I::Notification),
            Self::StateChange(_) => (S::Agent, C::State, I::Notification),
            Self::TurnRequest(_) | Self::TurnResponse(_) => (S::Agent, C::Turn, I::Notification),
            Self::ConnectionEstablished(_)
            | Self::SessionCreated(_)
            | Self::SessionResumed(_)
            | Self::SessionDestroyed(_) => (S::Session, C::Lifecycle, I::Notification),
            Self::Interrupted | Self::AgentStarted(_) | Self::AgentDestroyed(_) => {
                (S::Agent, C::Lifecycle, I::Notification)
            }
            Self::CommandRequest { .. } => (S::Command, C::Request, I::Request),
            Self::CommandResponse { .. } => (S::Command, C::Response, I::Response),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An immutable event record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireEvent", into = "WireEvent")]
pub struct Event {
    pub payload: EventPayload,
    pub timestamp: i64,
    pub source: EventSource,
    pub category: EventCategory,
    pub intent: EventIntent,
    pub context: EventContext,
}

impl Event {
    /// Build an event with the canonical tagging and the current time.
    pub fn new(payload: EventPayload, context: EventContext) -> Self {
        Self::at(payload, now_millis(), context)
    }

    /// Build an event with the canonical tagging at an explicit time.
    /// Engine processors use this so their outputs stay deterministic.
    pub fn at(payload: EventPayload, timestamp: i64, context: EventContext) -> Self {
        let (source, category, intent) = payload.tagging();
        Self {
            payload,
            timestamp,
            source,
            category,
            intent,
            context,
        }
    }

    /// An inbound user message at ingress: same `user_message` wire type,
    /// but tagged as a request so it is never enqueued as-is.
    pub fn user_request(message: UserMessage, context: EventContext) -> Self {
        Self {
            payload: EventPayload::UserMessage(message),
            timestamp: now_millis(),
            source: EventSource::Session,
            category: EventCategory::Request,
            intent: EventIntent::Request,
            context,
        }
    }

    /// A command request event with a pre-assigned `requestId` in `data`.
    pub fn command_request(name: impl Into<String>, data: Value, context: EventContext) -> Self {
        Self::new(
            EventPayload::CommandRequest {
                name: name.into(),
                data,
            },
            context,
        )
    }

    /// A command response correlated to `request_id`.
    pub fn command_response(
        name: impl Into<String>,
        request_id: &str,
        mut data: Value,
        context: EventContext,
    ) -> Self {
        if let Value::Object(map) = &mut data {
            map.insert("requestId".into(), Value::String(request_id.to_owned()));
        }
        Self::new(
            EventPayload::CommandResponse {
                name: name.into(),
                data,
            },
            context,
        )
    }

    pub fn kind(&self) -> &str {
        self.payload.kind()
    }

    /// Raw stream fragments and control requests stay process-internal;
    /// everything else is fair game for the queue and the wire.
    pub fn broadcastable(&self) -> bool {
        self.source != EventSource::Environment && self.intent != EventIntent::Request
    }

    /// The `requestId` carried in command event data, if any.
    pub fn request_id(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::CommandRequest { data, .. }
            | EventPayload::CommandResponse { data, .. } => {
                data.get("requestId").and_then(Value::as_str)
            }
            _ => None,
        }
    }
}

/// Wire mirror of [`Event`]: the flat JSON object.
#[derive(Serialize, Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    kind: String,
    timestamp: i64,
    source: EventSource,
    category: EventCategory,
    intent: EventIntent,
    #[serde(default, skip_serializing_if = "EventContext::is_empty")]
    context: EventContext,
    #[serde(default)]
    data: Value,
}

impl From<Event> for WireEvent {
    fn from(event: Event) -> Self {
        Self {
            kind: event.payload.kind().to_owned(),
            timestamp: event.timestamp,
            source: event.source,
            category: event.category,
            intent: event.intent,
            context: event.context,
            data: event.payload.data_value(),
        }
    }
}

impl TryFrom<WireEvent> for Event {
    type Error = Error;

    fn try_from(wire: WireEvent) -> Result<Self, Error> {
        let payload = EventPayload::from_wire(&wire.kind, wire.data)?;
        Ok(Self {
            payload,
            timestamp: wire.timestamp,
            source: wire.source,
            category: wire.category,
            intent: wire.intent,
            context: wire.context,
        })
    }
}
