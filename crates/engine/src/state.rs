//! Agent lifecycle state machine.
//!
//! ```text
//! idle ──user_message──► thinking ──text_delta──► responding
//!   ▲                      │
//!   │                      └──tool_use_start──► planning_tool
//!   │                            tool_use_stop ─► awaiting_tool_result
//!   │                                tool_result ─► thinking
//!   └── message_stop(terminal) / interrupt (via interrupted)
//! ```
//!
//! A `state_change {prev, current}` event is emitted only when the
//! state actually changes; repeated `text_delta` while responding is
//! silent.

use convoy_domain::event::StateChange;
use convoy_domain::{Event, EventIntent, EventPayload, LifecycleState};

use crate::processor::Processor;

#[derive(Debug, Default)]
pub struct StateTrackerState {
    pub current: LifecycleState,
}

#[derive(Debug, Default)]
pub struct StateTracker;

impl StateTracker {
    pub fn new() -> Self {
        Self
    }
}

impl StateTracker {
    fn transition(
        state: &mut StateTrackerState,
        next: LifecycleState,
        input: &Event,
        outputs: &mut Vec<Event>,
    ) {
        if state.current == next {
            return;
        }
        let prev = state.current;
        state.current = next;
        outputs.push(Event::at(
            EventPayload::StateChange(StateChange {
                prev,
                current: next,
            }),
            input.timestamp,
            input.context.clone(),
        ));
    }
}

impl Processor for StateTracker {
    type State = StateTrackerState;

    fn process(&self, state: &mut StateTrackerState, input: &Event) -> Vec<Event> {
        use LifecycleState as L;

        let mut outputs = Vec::new();
        match &input.payload {
            // The completed user message (not the raw ingress request)
            // starts the thinking phase.
            EventPayload::UserMessage(_) if input.intent == EventIntent::Notification => {
                Self::transition(state, L::Thinking, input, &mut outputs);
            }

            EventPayload::TextDelta(_) if state.current == L::Thinking => {
                Self::transition(state, L::Responding, input, &mut outputs);
            }

            EventPayload::ToolUseStart(_)
                if matches!(state.current, L::Thinking | L::Responding) =>
            {
                Self::transition(state, L::PlanningTool, input, &mut outputs);
            }

            EventPayload::ToolUseStop(_) if state.current == L::PlanningTool => {
                Self::transition(state, L::AwaitingToolResult, input, &mut outputs);
            }

            EventPayload::ToolResult(_) if state.current == L::AwaitingToolResult => {
                Self::transition(state, L::Thinking, input, &mut outputs);
            }

            EventPayload::MessageStop(stop) if stop.stop_reason.is_terminal() => {
                Self::transition(state, L::Idle, input, &mut outputs);
            }

            EventPayload::Interrupted if state.current != L::Idle => {
                Self::transition(state, L::Interrupted, input, &mut outputs);
                Self::transition(state, L::Idle, input, &mut outputs);
            }

            _ => {}
        }
        outputs
    }
}
