//! Pairs user requests with assistant responses and emits turn metrics.
//!
//! `turn_request` fires on the completed user message; `turn_response`
//! fires when a re-injected `assistant_message` closes with a terminal
//! stop reason. A `tool_use` stop keeps the pending turn alive, and an
//! interrupt discards it (no response is ever emitted for an
//! interrupted turn).

use convoy_domain::event::{TurnRequest, TurnResponse};
use convoy_domain::{Event, EventIntent, EventPayload};

use crate::processor::Processor;

#[derive(Debug, Default)]
pub struct TurnTrackerState {
    pub pending: Option<PendingTurn>,
}

#[derive(Debug, Clone)]
pub struct PendingTurn {
    pub turn_id: String,
    /// Id of the user message that opened the turn.
    pub message_id: String,
    pub requested_at: i64,
}

#[derive(Debug, Default)]
pub struct TurnTracker;

impl TurnTracker {
    pub fn new() -> Self {
        Self
    }
}

impl Processor for TurnTracker {
    type State = TurnTrackerState;

    fn process(&self, state: &mut TurnTrackerState, input: &Event) -> Vec<Event> {
        match &input.payload {
            EventPayload::UserMessage(message) if input.intent == EventIntent::Notification => {
                let Some(message_id) = message.id.clone() else {
                    return Vec::new();
                };
                // Turn id comes from ingress context; the message id is
                // the deterministic fallback.
                let turn_id = input
                    .context
                    .turn_id
                    .clone()
                    .unwrap_or_else(|| message_id.clone());

                state.pending = Some(PendingTurn {
                    turn_id: turn_id.clone(),
                    message_id: message_id.clone(),
                    requested_at: input.timestamp,
                });

                vec![Event::at(
                    EventPayload::TurnRequest(TurnRequest {
                        turn_id: turn_id.clone(),
                        message_id,
                    }),
                    input.timestamp,
                    input.context.clone().with_turn(turn_id),
                )]
            }

            EventPayload::AssistantMessage(message) => {
                let terminal = message
                    .stop_reason
                    .map(|reason| reason.is_terminal())
                    .unwrap_or(false);
                if !terminal {
                    return Vec::new();
                }
                let Some(pending) = state.pending.take() else {
                    return Vec::new();
                };

                vec![Event::at(
                    EventPayload::TurnResponse(TurnResponse {
                        turn_id: pending.turn_id.clone(),
                        message_id: message.id.clone(),
                        duration_ms: (input.timestamp - pending.requested_at).max(0),
                        usage: message.usage.clone(),
                    }),
                    input.timestamp,
                    input.context.clone().with_turn(pending.turn_id),
                )]
            }

            EventPayload::Interrupted => {
                state.pending = None;
                Vec::new()
            }

            _ => Vec::new(),
        }
    }
}
