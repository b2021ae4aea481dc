// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Semantic stream events (§3.4) and the Stream Reducer (§4.4).
//!
//! [`StreamEvent`] is the provider-agnostic event vocabulary; providers
//! speak it via [`from_response_event`], which adapts the lower-level
//! [`sven_model::ResponseEvent`] the current `ModelProvider` trait already
//! streams. The reducer [`reduce`] is a pure fold: given the turn-in-progress
//! accumulators and one event, it returns the broadcast events to emit and
//! the updated accumulators.

use std::collections::HashMap;

use sven_model::{ResponseEvent, Usage};

use crate::events::AgentEvent;
use crate::message::ToolCall;

/// A single in-progress tool call being assembled from streamed deltas.
#[derive(Debug, Clone, Default)]
pub struct PendingCall {
    id: String,
    name: String,
    args_json: String,
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextStart,
    TextDelta { text: String },
    TextDone { text: String },
    ThinkingStart,
    ThinkingDelta { text: String },
    ToolCallStart { call_id: String, name: String },
    ToolCallDelta { call_id: String, arguments_json_fragment: String },
    ToolCallDone { call_id: String, arguments: serde_json::Map<String, serde_json::Value> },
    Usage { prompt_tokens: u32, completion_tokens: u32, context_window: Option<u32> },
    ResponseDone { usage: Option<Usage> },
    Error { reason: String },
}

/// Adapt one `ResponseEvent` into zero or more semantic `StreamEvent`s.
/// `index` tracks which pending parallel tool call (if any) just finished,
/// so the caller can look up its accumulated id/name for `ToolCallDone`.
pub fn from_response_event(
    event: ResponseEvent,
    pending: &mut HashMap<u32, PendingCall>,
) -> Vec<StreamEvent> {
    match event {
        ResponseEvent::TextDelta(text) if text.is_empty() => vec![],
        ResponseEvent::TextDelta(text) => vec![StreamEvent::TextDelta { text }],
        ResponseEvent::ThinkingDelta(text) => vec![StreamEvent::ThinkingDelta { text }],
        ResponseEvent::ToolCall { index, id, name, arguments } => {
            let mut out = Vec::new();
            let is_new = !pending.contains_key(&index);
            let entry = pending.entry(index).or_default();
            if !id.is_empty() {
                entry.id = id;
            }
            if !name.is_empty() {
                entry.name = name;
            }
            if is_new {
                out.push(StreamEvent::ToolCallStart { call_id: entry.id.clone(), name: entry.name.clone() });
            }
            if !arguments.is_empty() {
                entry.args_json.push_str(&arguments);
                out.push(StreamEvent::ToolCallDelta {
                    call_id: entry.id.clone(),
                    arguments_json_fragment: arguments,
                });
            }
            out
        }
        ResponseEvent::Usage { input_tokens, output_tokens, .. } => {
            vec![StreamEvent::Usage { prompt_tokens: input_tokens, completion_tokens: output_tokens, context_window: None }]
        }
        ResponseEvent::Done => {
            let mut out = Vec::new();
            for (_, p) in pending.drain() {
                if p.name.is_empty() {
                    continue;
                }
                let args = serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(&p.args_json)
                    .unwrap_or_default();
                out.push(StreamEvent::ToolCallDone { call_id: p.id, arguments: args });
            }
            out.push(StreamEvent::ResponseDone { usage: None });
            out
        }
        ResponseEvent::MaxTokens => {
            // Drop any partial tool call: its arguments are truncated and
            // cannot be parsed as valid JSON.
            pending.clear();
            vec![StreamEvent::ResponseDone { usage: None }]
        }
        ResponseEvent::Error(reason) => vec![StreamEvent::Error { reason }],
    }
}

/// Turn-in-progress accumulators folded by [`reduce`] (§3.3 subset).
#[derive(Debug, Clone, Default)]
pub struct TurnState {
    pub current_text: String,
    pub current_thinking: String,
    pub current_tool_calls: Vec<ToolCall>,
    pub message_started: bool,
    pub thinking_started: bool,
    pub last_prompt_tokens: u32,
    pub stream_errored: Option<String>,
    pub turn_complete: bool,
    pub usage: Option<Usage>,
}

/// Pure fold: `reduce(turn_state, event) -> (turn_state', broadcast_events)`.
///
/// The dedup guard (§4.4) is implicit: `TextStart`/`MessageStart` is only
/// emitted on the first *non-empty* text delta, so a reasoning-only chunk
/// (empty text content alongside a thinking delta) never triggers a
/// spurious message start.
pub fn reduce(state: &mut TurnState, event: StreamEvent) -> Vec<AgentEvent> {
    match event {
        StreamEvent::TextStart | StreamEvent::TextDone { .. } => vec![],
        StreamEvent::TextDelta { text } => {
            let mut out = Vec::new();
            if !state.message_started {
                state.message_started = true;
                out.push(AgentEvent::MessageStart);
            }
            state.current_text.push_str(&text);
            out.push(AgentEvent::MessageDelta { delta: text });
            out
        }
        StreamEvent::ThinkingStart => vec![],
        StreamEvent::ThinkingDelta { text } => {
            let mut out = Vec::new();
            if !state.thinking_started {
                state.thinking_started = true;
                out.push(AgentEvent::ThinkingStart);
            }
            state.current_thinking.push_str(&text);
            out.push(AgentEvent::ThinkingDelta { delta: text });
            out
        }
        StreamEvent::ToolCallStart { call_id, name } => {
            state.current_tool_calls.push(ToolCall { call_id, name, arguments: Default::default() });
            vec![]
        }
        StreamEvent::ToolCallDelta { .. } => vec![],
        StreamEvent::ToolCallDone { call_id, arguments } => {
            if let Some(tc) = state.current_tool_calls.iter_mut().find(|c| c.call_id == call_id) {
                tc.arguments = arguments;
            }
            vec![]
        }
        StreamEvent::Usage { prompt_tokens, completion_tokens, .. } => {
            state.last_prompt_tokens = prompt_tokens;
            let usage = Usage {
                input_tokens: prompt_tokens,
                output_tokens: completion_tokens,
                cache_read_tokens: 0,
                cache_write_tokens: 0,
            };
            state.usage = Some(usage.clone());
            vec![AgentEvent::UsageUpdate { usage }]
        }
        StreamEvent::ResponseDone { .. } => {
            state.turn_complete = true;
            vec![]
        }
        StreamEvent::Error { reason } => {
            state.stream_errored = Some(reason.clone());
            vec![AgentEvent::Error { reason }]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_text_delta_emits_message_start_once() {
        let mut state = TurnState::default();
        let out1 = reduce(&mut state, StreamEvent::TextDelta { text: "hi".into() });
        assert!(matches!(out1[0], AgentEvent::MessageStart));
        let out2 = reduce(&mut state, StreamEvent::TextDelta { text: " there".into() });
        assert!(!matches!(out2[0], AgentEvent::MessageStart));
        assert_eq!(state.current_text, "hi there");
    }

    #[test]
    fn thinking_only_chunk_does_not_start_message() {
        let mut state = TurnState::default();
        let out = reduce(&mut state, StreamEvent::ThinkingDelta { text: "pondering".into() });
        assert!(out.iter().any(|e| matches!(e, AgentEvent::ThinkingStart)));
        assert!(!out.iter().any(|e| matches!(e, AgentEvent::MessageStart)));
        assert!(state.current_text.is_empty());
    }

    #[test]
    fn response_done_sets_turn_complete() {
        let mut state = TurnState::default();
        reduce(&mut state, StreamEvent::ResponseDone { usage: None });
        assert!(state.turn_complete);
    }

    #[test]
    fn error_event_sets_stream_errored() {
        let mut state = TurnState::default();
        reduce(&mut state, StreamEvent::Error { reason: "boom".into() });
        assert_eq!(state.stream_errored.as_deref(), Some("boom"));
    }

    #[test]
    fn tool_call_lifecycle_accumulates_arguments() {
        let mut state = TurnState::default();
        reduce(&mut state, StreamEvent::ToolCallStart { call_id: "A".into(), name: "read_file".into() });
        let mut args = serde_json::Map::new();
        args.insert("path".into(), serde_json::json!("foo.txt"));
        reduce(&mut state, StreamEvent::ToolCallDone { call_id: "A".into(), arguments: args.clone() });
        assert_eq!(state.current_tool_calls.len(), 1);
        assert_eq!(state.current_tool_calls[0].arguments, args);
    }

    #[test]
    fn from_response_event_groups_parallel_tool_calls_by_index() {
        let mut pending = HashMap::new();
        let evs1 = from_response_event(
            ResponseEvent::ToolCall { index: 0, id: "A".into(), name: "read_file".into(), arguments: "{\"p".into() },
            &mut pending,
        );
        assert!(matches!(evs1[0], StreamEvent::ToolCallStart { .. }));
        let evs2 = from_response_event(
            ResponseEvent::ToolCall { index: 0, id: String::new(), name: String::new(), arguments: "ath\":1}".into() },
            &mut pending,
        );
        assert!(matches!(evs2[0], StreamEvent::ToolCallDelta { .. }));
        let done = from_response_event(ResponseEvent::Done, &mut pending);
        let found = done.iter().find_map(|e| match e {
            StreamEvent::ToolCallDone { call_id, arguments } => Some((call_id.clone(), arguments.clone())),
            _ => None,
        });
        assert_eq!(found.unwrap().0, "A");
    }

    #[test]
    fn empty_text_delta_is_not_a_message_start() {
        let mut pending = HashMap::new();
        let evs = from_response_event(ResponseEvent::TextDelta(String::new()), &mut pending);
        assert!(evs.is_empty());
    }
}
