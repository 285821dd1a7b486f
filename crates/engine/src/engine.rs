//! The engine: keyed processor state plus output re-injection.
//!
//! Each agent has its own state cell guarded by a mutex, so at most one
//! event is in flight per agent; the keyed map lock is never held while
//! processing. Outputs are re-injected through the pipeline in FIFO
//! order (a work queue, not call-stack recursion) so an output produced
//! early in a wave is observed by every processor before any of its own
//! consequences — bounded by `max_depth` generations per input.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use convoy_domain::{Event, EventContext, EventPayload, LifecycleState};

use crate::assembler::MessageAssembler;
use crate::processor::{combine, Combine, Processor};
use crate::state::StateTracker;
use crate::turn::TurnTracker;

/// Default bound on output re-injection generations.
pub const DEFAULT_MAX_DEPTH: usize = 100;

pub struct Engine<P: Processor> {
    processor: P,
    states: RwLock<HashMap<String, Arc<Mutex<P::State>>>>,
    max_depth: usize,
}

impl<P: Processor> Engine<P> {
    pub fn new(processor: P) -> Self {
        Self {
            processor,
            states: RwLock::new(HashMap::new()),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    fn cell(&self, agent_id: &str) -> Arc<Mutex<P::State>> {
        if let Some(cell) = self.states.read().get(agent_id) {
            return cell.clone();
        }
        self.states
            .write()
            .entry(agent_id.to_owned())
            .or_default()
            .clone()
    }

    /// Run one event through the pipeline for `agent_id`, re-injecting
    /// outputs until the pipeline is quiescent. Returns every produced
    /// event in emission order. Runs to completion; concurrent calls
    /// for the same agent serialize on the agent's state cell.
    pub fn process(&self, agent_id: &str, event: Event) -> Vec<Event> {
        let cell = self.cell(agent_id);
        let mut state = cell.lock();
        self.drive(&mut state, event)
    }

    fn drive(&self, state: &mut P::State, event: Event) -> Vec<Event> {
        let mut results = Vec::new();
        let mut queue: VecDeque<(Event, usize)> = VecDeque::new();
        queue.push_back((event, 0));

        while let Some((event, depth)) = queue.pop_front() {
            if depth > self.max_depth {
                tracing::warn!(
                    event_type = %event.kind(),
                    max_depth = self.max_depth,
                    "re-injection depth exceeded, dropping output"
                );
                continue;
            }
            for output in self.processor.process(state, &event) {
                results.push(output.clone());
                queue.push_back((output, depth + 1));
            }
        }

        results
    }

    /// Interrupt an agent: inject an `interrupted` lifecycle event
    /// through the pipeline (clearing pending assembler/turn state and
    /// driving the state machine back to idle) and return it together
    /// with everything the pipeline emitted. Idempotent; queue entries
    /// already appended elsewhere are untouched.
    pub fn interrupt(&self, agent_id: &str) -> Vec<Event> {
        let interrupted = Event::new(
            EventPayload::Interrupted,
            EventContext::for_agent(agent_id),
        );
        let cell = self.cell(agent_id);
        let mut state = cell.lock();

        let mut events = vec![interrupted.clone()];
        events.extend(self.drive(&mut state, interrupted));
        events
    }

    /// Drop an agent's state (on agent destruction).
    pub fn remove_agent(&self, agent_id: &str) -> bool {
        self.states.write().remove(agent_id).is_some()
    }

    pub fn agent_count(&self) -> usize {
        self.states.read().len()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The standard agent pipeline
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Assembler, then turn tracker, then state tracker. The order fixes
/// the observable event sequence: the turn tracker sees the completed
/// user message before the state tracker transitions, and closes the
/// turn off the re-injected assistant message after the terminal state
/// change.
pub type AgentProcessor = Combine<MessageAssembler, Combine<TurnTracker, StateTracker>>;

pub type AgentEngine = Engine<AgentProcessor>;

pub fn agent_pipeline() -> AgentProcessor {
    combine(
        MessageAssembler::new(),
        combine(TurnTracker::new(), StateTracker::new()),
    )
}

impl Engine<AgentProcessor> {
    /// Current lifecycle state for an agent (idle when unknown).
    pub fn lifecycle(&self, agent_id: &str) -> LifecycleState {
        self.states
            .read()
            .get(agent_id)
            .map(|cell| cell.lock().1 .1.current)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_domain::event::{
        InputJsonDelta, MessageStart, MessageStop, TextDelta, ToolResult, ToolUseStart,
        ToolUseStop, UserMessage,
    };
    use convoy_domain::StopReason;
    use serde_json::json;

    fn ctx() -> EventContext {
        EventContext::for_agent("a1")
            .with_session("s1")
            .with_turn("t1")
    }

    fn user_message(id: &str, content: &str, at: i64) -> Event {
        let mut event = Event::user_request(
            UserMessage {
                id: Some(id.into()),
                content: content.into(),
            },
            ctx(),
        );
        event.timestamp = at;
        event
    }

    fn stream(payload: EventPayload, at: i64) -> Event {
        Event::at(payload, at, ctx())
    }

    fn kinds(events: &[Event]) -> Vec<String> {
        events.iter().map(|e| e.kind().to_owned()).collect()
    }

    /// Scenario: single-turn text response.
    #[test]
    fn single_turn_text_event_order() {
        let engine = AgentEngine::new(agent_pipeline());
        let mut all = Vec::new();

        all.extend(engine.process("a1", user_message("m1", "hi", 100)));
        all.extend(engine.process(
            "a1",
            stream(
                EventPayload::MessageStart(MessageStart {
                    message_id: "m2".into(),
                    model: Some("x".into()),
                }),
                110,
            ),
        ));
        all.extend(engine.process(
            "a1",
            stream(
                EventPayload::TextDelta(TextDelta {
                    index: 0,
                    text: "Hel".into(),
                }),
                120,
            ),
        ));
        all.extend(engine.process(
            "a1",
            stream(
                EventPayload::TextDelta(TextDelta {
                    index: 0,
                    text: "lo".into(),
                }),
                130,
            ),
        ));
        all.extend(engine.process(
            "a1",
            stream(
                EventPayload::MessageStop(MessageStop {
                    stop_reason: StopReason::EndTurn,
                }),
                150,
            ),
        ));

        assert_eq!(
            kinds(&all),
            vec![
                "user_message",
                "turn_request",
                "state_change", // idle → thinking
                "state_change", // thinking → responding
                "assistant_message",
                "state_change", // responding → idle
                "turn_response",
            ]
        );

        // Spot-check the interesting payloads.
        match &all[1].payload {
            EventPayload::TurnRequest(r) => {
                assert_eq!(r.turn_id, "t1");
                assert_eq!(r.message_id, "m1");
            }
            other => panic!("expected turn_request, got {other:?}"),
        }
        match &all[4].payload {
            EventPayload::AssistantMessage(m) => {
                assert_eq!(m.id, "m2");
                assert_eq!(m.content, "Hello");
            }
            other => panic!("expected assistant_message, got {other:?}"),
        }
        match &all[6].payload {
            EventPayload::TurnResponse(r) => {
                assert_eq!(r.turn_id, "t1");
                assert_eq!(r.message_id, "m2");
                assert_eq!(r.duration_ms, 50);
            }
            other => panic!("expected turn_response, got {other:?}"),
        }
        assert_eq!(engine.lifecycle("a1"), LifecycleState::Idle);
    }

    /// Scenario: tool call and continuation — one turn across two model
    /// messages.
    #[test]
    fn tool_call_and_continuation_single_turn() {
        let engine = AgentEngine::new(agent_pipeline());
        let mut all = Vec::new();

        all.extend(engine.process("a1", user_message("m0", "time?", 100)));
        all.extend(engine.process(
            "a1",
            stream(
                EventPayload::MessageStart(MessageStart {
                    message_id: "m1".into(),
                    model: None,
                }),
                110,
            ),
        ));
        all.extend(engine.process(
            "a1",
            stream(
                EventPayload::ToolUseStart(ToolUseStart {
                    index: 0,
                    tool_call_id: "tc1".into(),
                    tool_name: "get_time".into(),
                }),
                120,
            ),
        ));
        all.extend(engine.process(
            "a1",
            stream(
                EventPayload::InputJsonDelta(InputJsonDelta {
                    index: 0,
                    partial_json: "{}".into(),
                }),
                125,
            ),
        ));
        all.extend(engine.process(
            "a1",
            stream(
                EventPayload::ToolUseStop(ToolUseStop {
                    index: 0,
                    tool_call_id: "tc1".into(),
                    input: None,
                }),
                130,
            ),
        ));
        all.extend(engine.process(
            "a1",
            stream(
                EventPayload::MessageStop(MessageStop {
                    stop_reason: StopReason::ToolUse,
                }),
                140,
            ),
        ));
        all.extend(engine.process(
            "a1",
            stream(
                EventPayload::ToolResult(ToolResult {
                    tool_call_id: "tc1".into(),
                    result: json!("12:00"),
                }),
                200,
            ),
        ));
        all.extend(engine.process(
            "a1",
            stream(
                EventPayload::MessageStart(MessageStart {
                    message_id: "m2".into(),
                    model: None,
                }),
                210,
            ),
        ));
        all.extend(engine.process(
            "a1",
            stream(
                EventPayload::TextDelta(TextDelta {
                    index: 0,
                    text: "It is 12:00".into(),
                }),
                220,
            ),
        ));
        all.extend(engine.process(
            "a1",
            stream(
                EventPayload::MessageStop(MessageStop {
                    stop_reason: StopReason::EndTurn,
                }),
                230,
            ),
        ));

        let count = |kind: &str| all.iter().filter(|e| e.kind() == kind).count();
        assert_eq!(count("turn_request"), 1);
        assert_eq!(count("turn_response"), 1);
        assert_eq!(count("tool_call_message"), 1);
        assert_eq!(count("tool_result_message"), 1);
        assert_eq!(count("assistant_message"), 1);

        let tool_call = all
            .iter()
            .find(|e| e.kind() == "tool_call_message")
            .unwrap();
        match &tool_call.payload {
            EventPayload::ToolCallMessage(m) => {
                assert_eq!(m.id, "tc1");
                assert_eq!(m.name, "get_time");
                assert_eq!(m.input, json!({}));
            }
            other => panic!("expected tool_call_message, got {other:?}"),
        }

        let response = all.iter().find(|e| e.kind() == "turn_response").unwrap();
        match &response.payload {
            EventPayload::TurnResponse(r) => {
                assert_eq!(r.message_id, "m2");
                assert_eq!(r.duration_ms, 130);
            }
            other => panic!("expected turn_response, got {other:?}"),
        }
    }

    /// Scenario: interrupt mid-stream — no assistant message, no turn
    /// response, late deltas are inert.
    #[test]
    fn interrupt_mid_stream() {
        let engine = AgentEngine::new(agent_pipeline());
        let mut all = Vec::new();

        all.extend(engine.process("a1", user_message("m1", "hi", 100)));
        all.extend(engine.process(
            "a1",
            stream(
                EventPayload::MessageStart(MessageStart {
                    message_id: "m2".into(),
                    model: None,
                }),
                110,
            ),
        ));
        all.extend(engine.process(
            "a1",
            stream(
                EventPayload::TextDelta(TextDelta {
                    index: 0,
                    text: "Hel".into(),
                }),
                120,
            ),
        ));

        let interrupt_events = engine.interrupt("a1");
        assert_eq!(
            kinds(&interrupt_events),
            vec!["interrupted", "state_change", "state_change"]
        );
        match &interrupt_events[1].payload {
            EventPayload::StateChange(c) => {
                assert_eq!(c.current, LifecycleState::Interrupted);
            }
            other => panic!("expected state_change, got {other:?}"),
        }
        match &interrupt_events[2].payload {
            EventPayload::StateChange(c) => {
                assert_eq!(c.prev, LifecycleState::Interrupted);
                assert_eq!(c.current, LifecycleState::Idle);
            }
            other => panic!("expected state_change, got {other:?}"),
        }
        all.extend(interrupt_events);

        // The late delta after the interrupt produces nothing.
        let late = engine.process(
            "a1",
            stream(
                EventPayload::TextDelta(TextDelta {
                    index: 0,
                    text: "lo".into(),
                }),
                130,
            ),
        );
        assert!(late.is_empty());

        assert_eq!(all.iter().filter(|e| e.kind() == "turn_request").count(), 1);
        assert_eq!(
            all.iter().filter(|e| e.kind() == "turn_response").count(),
            0
        );
        assert_eq!(
            all.iter()
                .filter(|e| e.kind() == "assistant_message")
                .count(),
            0
        );
    }

    #[test]
    fn interrupt_is_idempotent() {
        let engine = AgentEngine::new(agent_pipeline());
        engine.process("a1", user_message("m1", "hi", 100));

        let first = engine.interrupt("a1");
        assert!(first.len() > 1);

        // Second interrupt: already idle, only the lifecycle event.
        let second = engine.interrupt("a1");
        assert_eq!(kinds(&second), vec!["interrupted"]);
    }

    #[test]
    fn agents_are_isolated() {
        let engine = AgentEngine::new(agent_pipeline());
        engine.process("a1", user_message("m1", "hi", 100));
        assert_eq!(engine.lifecycle("a1"), LifecycleState::Thinking);
        assert_eq!(engine.lifecycle("a2"), LifecycleState::Idle);
        assert_eq!(engine.agent_count(), 1);

        engine.process("a2", user_message("m2", "yo", 100));
        assert_eq!(engine.agent_count(), 2);

        assert!(engine.remove_agent("a1"));
        assert!(!engine.remove_agent("a1"));
        assert_eq!(engine.agent_count(), 1);
    }

    #[test]
    fn processing_is_deterministic() {
        let inputs = |at: i64| {
            vec![
                user_message("m1", "hi", at),
                stream(
                    EventPayload::MessageStart(MessageStart {
                        message_id: "m2".into(),
                        model: None,
                    }),
                    at + 10,
                ),
                stream(
                    EventPayload::TextDelta(TextDelta {
                        index: 0,
                        text: "Hello".into(),
                    }),
                    at + 20,
                ),
                stream(
                    EventPayload::MessageStop(MessageStop {
                        stop_reason: StopReason::EndTurn,
                    }),
                    at + 30,
                ),
            ]
        };

        let run = || {
            let engine = AgentEngine::new(agent_pipeline());
            inputs(100)
                .into_iter()
                .flat_map(|e| engine.process("a1", e))
                .collect::<Vec<_>>()
        };

        assert_eq!(run(), run());
    }

    /// An always-echoing processor exercises the depth bound.
    struct Reverb;

    impl Processor for Reverb {
        type State = ();

        fn process(&self, _state: &mut (), input: &Event) -> Vec<Event> {
            vec![input.clone()]
        }
    }

    #[test]
    fn reinjection_depth_is_bounded() {
        let engine = Engine::new(Reverb).with_max_depth(5);
        let outputs = engine.process(
            "a1",
            stream(
                EventPayload::TextDelta(TextDelta {
                    index: 0,
                    text: "x".into(),
                }),
                1,
            ),
        );
        // One echo per generation, then the bound cuts the cascade.
        assert_eq!(outputs.len(), 6);
    }
}
