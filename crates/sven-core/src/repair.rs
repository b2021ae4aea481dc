// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Conversation repair (§4.7).
//!
//! Three redundant layers guarantee invariants M2 (pairing) and M3 (no
//! orphans) hold on every message list handed to a provider:
//!
//! - Layer 1 mutates the agent's live message list, synthesising results for
//!   calls that will never get one (abort, crash).
//! - Layer 2 is a pure function run immediately before every provider call,
//!   as a second, independent defence against anything Layer 1 missed.
//! - Layer 3 (the stream-error guard) lives in `fsm.rs`, since it decides
//!   whether to commit a partial turn at all.

use std::collections::HashSet;

use crate::message::{Message, Role};

const ABORTED_NOTICE: &str = "[Aborted by user]";
const FAILED_NOTICE: &str = "[Tool execution failed]";

/// Layer 1 — full-scan orphan repair. Walks every assistant message
/// chronologically; for each tool call with no later matching result,
/// appends a synthetic error result. `aborted` selects the wording used
/// (user abort vs. unspecified execution failure).
///
/// Returns the synthetic messages that were appended, for logging/tests.
pub fn full_scan_orphan_repair(messages: &mut Vec<Message>, aborted: bool) -> Vec<Message> {
    let mut satisfied: HashSet<String> = HashSet::new();
    for m in messages.iter() {
        if m.role == Role::ToolResult {
            if let Some(id) = &m.call_id {
                satisfied.insert(id.clone());
            }
        }
    }

    let mut orphans: Vec<String> = Vec::new();
    for m in messages.iter() {
        if m.role != Role::Assistant {
            continue;
        }
        if let Some(calls) = &m.tool_calls {
            for c in calls {
                if !satisfied.contains(&c.call_id) {
                    orphans.push(c.call_id.clone());
                }
            }
        }
    }

    let notice = if aborted { ABORTED_NOTICE } else { FAILED_NOTICE };
    let mut synthesized = Vec::new();
    for call_id in orphans {
        let msg = Message::tool_result(call_id, notice, true);
        synthesized.push(msg.clone());
        messages.push(msg);
    }
    synthesized
}

/// Layer 2 — positional validation. Pure function applied to the outgoing
/// list right before a provider call.
///
/// 1. Relocate: move matching tool_results directly after their assistant,
///    preserving relative order.
/// 2. Inject missing: insert a synthetic error result for any call lacking one.
/// 3. Strip: drop orphaned / duplicate tool_results.
///
/// After this runs, M2 and M3 hold by construction (see §4.7 proof sketch).
pub fn positional_repair(messages: &[Message]) -> Vec<Message> {
    // Index every tool_result by call_id, keeping only the first occurrence
    // (duplicates are stripped) and remembering which calls are known.
    let mut known_calls: HashSet<String> = HashSet::new();
    for m in messages {
        if m.role == Role::Assistant {
            if let Some(calls) = &m.tool_calls {
                for c in calls {
                    known_calls.insert(c.call_id.clone());
                }
            }
        }
    }

    let mut results_by_call: std::collections::HashMap<String, Message> = std::collections::HashMap::new();
    for m in messages {
        if m.role == Role::ToolResult {
            if let Some(id) = &m.call_id {
                // Strip orphans here: a result whose call_id matches no
                // ToolCall anywhere is dropped outright (M3).
                if known_calls.contains(id) {
                    // Strip duplicates: keep first.
                    results_by_call.entry(id.clone()).or_insert_with(|| m.clone());
                }
            }
        }
    }

    let mut out = Vec::with_capacity(messages.len());
    for m in messages {
        match m.role {
            Role::ToolResult => {
                // Results are re-emitted only at the relocation point below;
                // skip them here entirely (both originals and duplicates).
                continue;
            }
            Role::Assistant => {
                out.push(m.clone());
                if let Some(calls) = &m.tool_calls {
                    for c in calls {
                        let result = results_by_call.get(&c.call_id).cloned().unwrap_or_else(|| {
                            Message::tool_result(c.call_id.clone(), FAILED_NOTICE, true)
                        });
                        out.push(result);
                    }
                }
            }
            _ => out.push(m.clone()),
        }
    }
    out
}

/// Invariant check used by tests and as a defensive assertion: every
/// ToolCall is immediately followed by its matching tool_result, and no
/// tool_result lacks a prior ToolCall.
pub fn check_pairing_invariants(messages: &[Message]) -> Result<(), String> {
    let mut seen_calls: HashSet<String> = HashSet::new();
    let mut i = 0;
    while i < messages.len() {
        let m = &messages[i];
        match m.role {
            Role::Assistant => {
                if let Some(calls) = &m.tool_calls {
                    for (offset, c) in calls.iter().enumerate() {
                        seen_calls.insert(c.call_id.clone());
                        let expected = messages.get(i + 1 + offset);
                        match expected {
                            Some(next) if next.role == Role::ToolResult
                                && next.call_id.as_deref() == Some(c.call_id.as_str()) => {}
                            _ => return Err(format!("call {} has no immediately-following result", c.call_id)),
                        }
                    }
                }
            }
            Role::ToolResult => {
                let id = m.call_id.clone().unwrap_or_default();
                if !seen_calls.contains(&id) {
                    return Err(format!("orphan tool_result for unknown call {id}"));
                }
            }
            _ => {}
        }
        i += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolCall;

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall { call_id: id.into(), name: name.into(), arguments: Default::default() }
    }

    #[test]
    fn full_scan_repairs_orphan_call() {
        let mut msgs = vec![
            Message::user("go"),
            Message::assistant_with_tool_calls("", vec![call("A", "read_file")]),
        ];
        let synth = full_scan_orphan_repair(&mut msgs, true);
        assert_eq!(synth.len(), 1);
        assert_eq!(msgs.last().unwrap().call_id.as_deref(), Some("A"));
        assert!(msgs.last().unwrap().error);
        assert_eq!(msgs.last().unwrap().content, "[Aborted by user]");
    }

    #[test]
    fn full_scan_leaves_satisfied_calls_alone() {
        let mut msgs = vec![
            Message::assistant_with_tool_calls("", vec![call("A", "read_file")]),
            Message::tool_result("A", "contents", false),
        ];
        let synth = full_scan_orphan_repair(&mut msgs, true);
        assert!(synth.is_empty());
        assert_eq!(msgs.len(), 2);
    }

    #[test]
    fn positional_repair_relocates_out_of_order_result() {
        let msgs = vec![
            Message::assistant_with_tool_calls("", vec![call("A", "read_file")]),
            Message::user("steer"),
            Message::tool_result("A", "contents", false),
        ];
        let repaired = positional_repair(&msgs);
        assert_eq!(repaired[0].tool_calls.as_ref().unwrap()[0].call_id, "A");
        assert_eq!(repaired[1].call_id.as_deref(), Some("A"));
        check_pairing_invariants(&repaired).unwrap();
    }

    #[test]
    fn positional_repair_injects_missing_result() {
        let msgs = vec![Message::assistant_with_tool_calls("", vec![call("A", "read_file")])];
        let repaired = positional_repair(&msgs);
        assert_eq!(repaired.len(), 2);
        assert_eq!(repaired[1].call_id.as_deref(), Some("A"));
        assert!(repaired[1].error);
        check_pairing_invariants(&repaired).unwrap();
    }

    #[test]
    fn positional_repair_strips_orphan_result() {
        let msgs = vec![Message::tool_result("ghost", "x", false)];
        let repaired = positional_repair(&msgs);
        assert!(repaired.is_empty());
    }

    #[test]
    fn positional_repair_strips_duplicate_result_keeping_first() {
        let msgs = vec![
            Message::assistant_with_tool_calls("", vec![call("A", "read_file")]),
            Message::tool_result("A", "first", false),
            Message::tool_result("A", "second", false),
        ];
        let repaired = positional_repair(&msgs);
        assert_eq!(repaired.len(), 2);
        assert_eq!(repaired[1].content, "first");
    }

    #[test]
    fn positional_repair_is_identity_on_already_valid_input() {
        let msgs = vec![
            Message::user("go"),
            Message::assistant_with_tool_calls("", vec![call("A", "read_file")]),
            Message::tool_result("A", "contents", false),
            Message::assistant("done"),
        ];
        let repaired = positional_repair(&msgs);
        assert_eq!(repaired.len(), msgs.len());
        check_pairing_invariants(&repaired).unwrap();
    }

    #[test]
    fn multiple_calls_in_one_batch_all_get_results_in_order() {
        let msgs = vec![Message::assistant_with_tool_calls(
            "",
            vec![call("A", "read_file"), call("B", "grep")],
        )];
        let repaired = positional_repair(&msgs);
        assert_eq!(repaired.len(), 3);
        assert_eq!(repaired[1].call_id.as_deref(), Some("A"));
        assert_eq!(repaired[2].call_id.as_deref(), Some("B"));
    }
}
