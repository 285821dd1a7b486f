//! Assembles raw stream fragments into complete typed messages.
//!
//! Text blocks accumulate per content-block index and concatenate in
//! index order at `message_stop`. Tool input accumulates `partialJson`
//! until `tool_use_stop`, at which point it parses; a parse failure
//! still produces a `tool_call_message` (with empty input) alongside an
//! `error_message`.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use convoy_domain::event::{
    AssistantMessage, ErrorMessage, ToolCallMessage, ToolResultMessage, UserMessage,
};
use convoy_domain::{Event, EventIntent, EventPayload, StopReason, Usage};

use crate::processor::Processor;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default)]
pub struct AssemblerState {
    /// The message currently being streamed, if any.
    open: Option<OpenMessage>,
}

#[derive(Debug)]
struct OpenMessage {
    message_id: String,
    /// Text accumulators keyed by content-block index; BTreeMap so
    /// concatenation at `message_stop` runs in index order.
    text_blocks: BTreeMap<u32, TextAccum>,
    /// Tool-input accumulators keyed by content-block index.
    tool_blocks: HashMap<u32, ToolAccum>,
    /// Carried from `message_delta` until the stop.
    stop_reason: Option<StopReason>,
    usage: Option<Usage>,
}

#[derive(Debug, Default)]
struct TextAccum {
    content: String,
}

#[derive(Debug)]
struct ToolAccum {
    tool_call_id: String,
    tool_name: String,
    partial_json: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Processor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default)]
pub struct MessageAssembler;

impl MessageAssembler {
    pub fn new() -> Self {
        Self
    }
}

impl Processor for MessageAssembler {
    type State = AssemblerState;

    fn process(&self, state: &mut AssemblerState, input: &Event) -> Vec<Event> {
        match &input.payload {
            // Ingress control input: re-emit as a completed message with
            // an id. Completed user messages (notification intent) are
            // not re-processed, which keeps re-injection idempotent.
            EventPayload::UserMessage(message) if input.intent == EventIntent::Request => {
                let id = message
                    .id
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                vec![Event::at(
                    EventPayload::UserMessage(UserMessage {
                        id: Some(id),
                        content: message.content.clone(),
                    }),
                    input.timestamp,
                    input.context.clone(),
                )]
            }

            EventPayload::MessageStart(start) => {
                state.open = Some(OpenMessage {
                    message_id: start.message_id.clone(),
                    text_blocks: BTreeMap::new(),
                    tool_blocks: HashMap::new(),
                    stop_reason: None,
                    usage: None,
                });
                Vec::new()
            }

            EventPayload::TextContentBlockStart(block) => {
                if let Some(open) = state.open.as_mut() {
                    open.text_blocks.entry(block.index).or_default();
                }
                Vec::new()
            }

            EventPayload::TextDelta(delta) => {
                if let Some(open) = state.open.as_mut() {
                    open.text_blocks
                        .entry(delta.index)
                        .or_default()
                        .content
                        .push_str(&delta.text);
                }
                Vec::new()
            }

            // Block close is bookkeeping only; content is already in.
            EventPayload::TextContentBlockStop(_) => Vec::new(),

            EventPayload::ToolUseStart(start) => {
                if let Some(open) = state.open.as_mut() {
                    open.tool_blocks.insert(
                        start.index,
                        ToolAccum {
                            tool_call_id: start.tool_call_id.clone(),
                            tool_name: start.tool_name.clone(),
                            partial_json: String::new(),
                        },
                    );
                }
                Vec::new()
            }

            EventPayload::InputJsonDelta(delta) => {
                if let Some(open) = state.open.as_mut() {
                    if let Some(accum) = open.tool_blocks.get_mut(&delta.index) {
                        accum.partial_json.push_str(&delta.partial_json);
                    }
                }
                Vec::new()
            }

            EventPayload::ToolUseStop(stop) => {
                let Some(open) = state.open.as_mut() else {
                    return Vec::new();
                };
                let Some(accum) = open.tool_blocks.remove(&stop.index) else {
                    // No tool_use_start for this block; nothing to close.
                    return Vec::new();
                };

                let mut outputs = Vec::new();
                let input_value = match &stop.input {
                    Some(value) => value.clone(),
                    None => match parse_tool_input(&accum.partial_json) {
                        Ok(value) => value,
                        Err(parse_error) => {
                            outputs.push(Event::at(
                                EventPayload::ErrorMessage(ErrorMessage {
                                    message: format!(
                                        "tool input for {} is not valid JSON: {parse_error}",
                                        accum.tool_name
                                    ),
                                    detail: Some(serde_json::json!({
                                        "toolCallId": accum.tool_call_id,
                                        "raw": accum.partial_json,
                                    })),
                                }),
                                input.timestamp,
                                input.context.clone(),
                            ));
                            Value::Object(Default::default())
                        }
                    },
                };

                outputs.insert(
                    0,
                    Event::at(
                        EventPayload::ToolCallMessage(ToolCallMessage {
                            id: accum.tool_call_id,
                            name: accum.tool_name,
                            input: input_value,
                        }),
                        input.timestamp,
                        input.context.clone(),
                    ),
                );
                outputs
            }

            EventPayload::ToolResult(result) => vec![Event::at(
                EventPayload::ToolResultMessage(ToolResultMessage {
                    id: result.tool_call_id.clone(),
                    result: result.result.clone(),
                }),
                input.timestamp,
                input.context.clone(),
            )],

            EventPayload::MessageDelta(delta) => {
                if let Some(open) = state.open.as_mut() {
                    if delta.stop_reason.is_some() {
                        open.stop_reason = delta.stop_reason;
                    }
                    if delta.usage.is_some() {
                        open.usage = delta.usage.clone();
                    }
                }
                Vec::new()
            }

            EventPayload::MessageStop(stop) => {
                // A stop without a start is silently ignored.
                let Some(open) = state.open.take() else {
                    return Vec::new();
                };

                let has_text = !open.text_blocks.is_empty();
                if !has_text && !stop.stop_reason.is_terminal() {
                    // Tool-only message; the turn continues after the
                    // tool result.
                    return Vec::new();
                }

                let content: String = open
                    .text_blocks
                    .values()
                    .map(|block| block.content.as_str())
                    .collect();

                vec![Event::at(
                    EventPayload::AssistantMessage(AssistantMessage {
                        id: open.message_id,
                        content,
                        stop_reason: Some(stop.stop_reason),
                        usage: open.usage,
                    }),
                    input.timestamp,
                    input.context.clone(),
                )]
            }

            EventPayload::Interrupted => {
                state.open = None;
                Vec::new()
            }

            _ => Vec::new(),
        }
    }
}

/// An absent or empty accumulation means "no arguments", not an error.
fn parse_tool_input(raw: &str) -> Result<Value, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_domain::event::{
        InputJsonDelta, MessageDelta, MessageStart, MessageStop, TextDelta, ToolResult,
        ToolUseStart, ToolUseStop,
    };
    use convoy_domain::EventContext;
    use serde_json::json;

    fn ctx() -> EventContext {
        EventContext::for_agent("a1").with_turn("t1")
    }

    fn stream(payload: EventPayload) -> Event {
        Event::at(payload, 10, ctx())
    }

    fn run(state: &mut AssemblerState, payloads: Vec<EventPayload>) -> Vec<Event> {
        let assembler = MessageAssembler::new();
        payloads
            .into_iter()
            .flat_map(|p| assembler.process(state, &stream(p)))
            .collect()
    }

    #[test]
    fn assembles_text_across_deltas() {
        let mut state = AssemblerState::default();
        let outputs = run(
            &mut state,
            vec![
                EventPayload::MessageStart(MessageStart {
                    message_id: "m2".into(),
                    model: Some("x".into()),
                }),
                EventPayload::TextDelta(TextDelta {
                    index: 0,
                    text: "Hel".into(),
                }),
                EventPayload::TextDelta(TextDelta {
                    index: 0,
                    text: "lo".into(),
                }),
                EventPayload::MessageStop(MessageStop {
                    stop_reason: StopReason::EndTurn,
                }),
            ],
        );

        assert_eq!(outputs.len(), 1);
        match &outputs[0].payload {
            EventPayload::AssistantMessage(m) => {
                assert_eq!(m.id, "m2");
                assert_eq!(m.content, "Hello");
                assert_eq!(m.stop_reason, Some(StopReason::EndTurn));
            }
            other => panic!("expected assistant_message, got {other:?}"),
        }
    }

    #[test]
    fn multiple_blocks_concatenate_in_index_order() {
        let mut state = AssemblerState::default();
        let outputs = run(
            &mut state,
            vec![
                EventPayload::MessageStart(MessageStart {
                    message_id: "m1".into(),
                    model: None,
                }),
                // Deltas arrive out of block order.
                EventPayload::TextDelta(TextDelta {
                    index: 1,
                    text: " world".into(),
                }),
                EventPayload::TextDelta(TextDelta {
                    index: 0,
                    text: "hello".into(),
                }),
                EventPayload::MessageStop(MessageStop {
                    stop_reason: StopReason::EndTurn,
                }),
            ],
        );

        match &outputs[0].payload {
            EventPayload::AssistantMessage(m) => assert_eq!(m.content, "hello world"),
            other => panic!("expected assistant_message, got {other:?}"),
        }
    }

    #[test]
    fn empty_deltas_yield_empty_content() {
        let mut state = AssemblerState::default();
        let outputs = run(
            &mut state,
            vec![
                EventPayload::MessageStart(MessageStart {
                    message_id: "m1".into(),
                    model: None,
                }),
                EventPayload::TextDelta(TextDelta {
                    index: 0,
                    text: String::new(),
                }),
                EventPayload::MessageStop(MessageStop {
                    stop_reason: StopReason::EndTurn,
                }),
            ],
        );

        match &outputs[0].payload {
            EventPayload::AssistantMessage(m) => assert_eq!(m.content, ""),
            other => panic!("expected assistant_message, got {other:?}"),
        }
    }

    #[test]
    fn tool_call_parses_accumulated_json() {
        let mut state = AssemblerState::default();
        let outputs = run(
            &mut state,
            vec![
                EventPayload::MessageStart(MessageStart {
                    message_id: "m1".into(),
                    model: None,
                }),
                EventPayload::ToolUseStart(ToolUseStart {
                    index: 0,
                    tool_call_id: "tc1".into(),
                    tool_name: "get_time".into(),
                }),
                EventPayload::InputJsonDelta(InputJsonDelta {
                    index: 0,
                    partial_json: "{\"zone\":".into(),
                }),
                EventPayload::InputJsonDelta(InputJsonDelta {
                    index: 0,
                    partial_json: "\"utc\"}".into(),
                }),
                EventPayload::ToolUseStop(ToolUseStop {
                    index: 0,
                    tool_call_id: "tc1".into(),
                    input: None,
                }),
            ],
        );

        assert_eq!(outputs.len(), 1);
        match &outputs[0].payload {
            EventPayload::ToolCallMessage(m) => {
                assert_eq!(m.id, "tc1");
                assert_eq!(m.name, "get_time");
                assert_eq!(m.input, json!({"zone": "utc"}));
            }
            other => panic!("expected tool_call_message, got {other:?}"),
        }
    }

    #[test]
    fn tool_stop_without_deltas_yields_empty_input() {
        let mut state = AssemblerState::default();
        let outputs = run(
            &mut state,
            vec![
                EventPayload::MessageStart(MessageStart {
                    message_id: "m1".into(),
                    model: None,
                }),
                EventPayload::ToolUseStart(ToolUseStart {
                    index: 0,
                    tool_call_id: "tc1".into(),
                    tool_name: "get_time".into(),
                }),
                EventPayload::ToolUseStop(ToolUseStop {
                    index: 0,
                    tool_call_id: "tc1".into(),
                    input: None,
                }),
            ],
        );

        assert_eq!(outputs.len(), 1);
        match &outputs[0].payload {
            EventPayload::ToolCallMessage(m) => assert_eq!(m.input, json!({})),
            other => panic!("expected tool_call_message, got {other:?}"),
        }
    }

    #[test]
    fn malformed_tool_json_emits_empty_input_plus_error() {
        let mut state = AssemblerState::default();
        let outputs = run(
            &mut state,
            vec![
                EventPayload::MessageStart(MessageStart {
                    message_id: "m1".into(),
                    model: None,
                }),
                EventPayload::ToolUseStart(ToolUseStart {
                    index: 0,
                    tool_call_id: "tc1".into(),
                    tool_name: "get_time".into(),
                }),
                EventPayload::InputJsonDelta(InputJsonDelta {
                    index: 0,
                    partial_json: "{\"zone\": tru".into(),
                }),
                EventPayload::ToolUseStop(ToolUseStop {
                    index: 0,
                    tool_call_id: "tc1".into(),
                    input: None,
                }),
            ],
        );

        assert_eq!(outputs.len(), 2);
        match &outputs[0].payload {
            EventPayload::ToolCallMessage(m) => assert_eq!(m.input, json!({})),
            other => panic!("expected tool_call_message, got {other:?}"),
        }
        assert!(matches!(
            outputs[1].payload,
            EventPayload::ErrorMessage(_)
        ));
    }

    #[test]
    fn tool_result_becomes_message() {
        let mut state = AssemblerState::default();
        let outputs = run(
            &mut state,
            vec![EventPayload::ToolResult(ToolResult {
                tool_call_id: "tc1".into(),
                result: json!("12:00"),
            })],
        );

        match &outputs[0].payload {
            EventPayload::ToolResultMessage(m) => {
                assert_eq!(m.id, "tc1");
                assert_eq!(m.result, json!("12:00"));
            }
            other => panic!("expected tool_result_message, got {other:?}"),
        }
    }

    #[test]
    fn tool_only_stop_with_tool_use_reason_emits_nothing() {
        let mut state = AssemblerState::default();
        let outputs = run(
            &mut state,
            vec![
                EventPayload::MessageStart(MessageStart {
                    message_id: "m1".into(),
                    model: None,
                }),
                EventPayload::ToolUseStart(ToolUseStart {
                    index: 0,
                    tool_call_id: "tc1".into(),
                    tool_name: "get_time".into(),
                }),
                EventPayload::ToolUseStop(ToolUseStop {
                    index: 0,
                    tool_call_id: "tc1".into(),
                    input: Some(json!({})),
                }),
                EventPayload::MessageStop(MessageStop {
                    stop_reason: StopReason::ToolUse,
                }),
            ],
        );

        // One tool_call_message; the stop itself yields no assistant text.
        assert_eq!(outputs.len(), 1);
        assert!(matches!(
            outputs[0].payload,
            EventPayload::ToolCallMessage(_)
        ));
    }

    #[test]
    fn stop_without_start_is_ignored() {
        let mut state = AssemblerState::default();
        let outputs = run(
            &mut state,
            vec![EventPayload::MessageStop(MessageStop {
                stop_reason: StopReason::EndTurn,
            })],
        );
        assert!(outputs.is_empty());
    }

    #[test]
    fn usage_from_message_delta_reaches_assistant_message() {
        let mut state = AssemblerState::default();
        let outputs = run(
            &mut state,
            vec![
                EventPayload::MessageStart(MessageStart {
                    message_id: "m1".into(),
                    model: None,
                }),
                EventPayload::TextDelta(TextDelta {
                    index: 0,
                    text: "ok".into(),
                }),
                EventPayload::MessageDelta(MessageDelta {
                    stop_reason: None,
                    usage: Some(Usage {
                        input_tokens: 10,
                        output_tokens: 2,
                    }),
                }),
                EventPayload::MessageStop(MessageStop {
                    stop_reason: StopReason::EndTurn,
                }),
            ],
        );

        match &outputs[0].payload {
            EventPayload::AssistantMessage(m) => {
                assert_eq!(
                    m.usage,
                    Some(Usage {
                        input_tokens: 10,
                        output_tokens: 2
                    })
                );
            }
            other => panic!("expected assistant_message, got {other:?}"),
        }
    }

    #[test]
    fn user_request_gets_an_id_and_notification_tagging() {
        let assembler = MessageAssembler::new();
        let mut state = AssemblerState::default();
        let input = Event::user_request(
            UserMessage {
                id: None,
                content: "hi".into(),
            },
            ctx(),
        );

        let outputs = assembler.process(&mut state, &input);
        assert_eq!(outputs.len(), 1);
        match &outputs[0].payload {
            EventPayload::UserMessage(m) => assert!(m.id.is_some()),
            other => panic!("expected user_message, got {other:?}"),
        }
        assert_eq!(outputs[0].intent, EventIntent::Notification);

        // The completed message is not re-processed.
        let echoed = assembler.process(&mut state, &outputs[0]);
        assert!(echoed.is_empty());
    }

    #[test]
    fn interrupt_discards_open_message() {
        let mut state = AssemblerState::default();
        let outputs = run(
            &mut state,
            vec![
                EventPayload::MessageStart(MessageStart {
                    message_id: "m1".into(),
                    model: None,
                }),
                EventPayload::TextDelta(TextDelta {
                    index: 0,
                    text: "Hel".into(),
                }),
                EventPayload::Interrupted,
                EventPayload::TextDelta(TextDelta {
                    index: 0,
                    text: "lo".into(),
                }),
                EventPayload::MessageStop(MessageStop {
                    stop_reason: StopReason::EndTurn,
                }),
            ],
        );
        // Open message was discarded; the late delta and stop are inert.
        assert!(outputs.is_empty());
    }
}
