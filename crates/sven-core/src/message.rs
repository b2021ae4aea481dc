// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The conversation tree's message type.
//!
//! This is distinct from [`sven_model::Message`], which is the provider
//! wire format.  A [`Message`] here is an immutable, content-addressed-by-id
//! node in the session's tree; [`crate::session::Session`] owns the tree and
//! [`to_wire`] projects the active path down to the flat list a
//! [`sven_model::ModelProvider`] understands.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tagged role of a tree message. `tool_call` entries live inside an
/// assistant message's `tool_calls`, not as a role of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    ToolResult,
}

/// A single tool invocation requested by the model, embedded in an
/// assistant message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub call_id: String,
    pub name: String,
    pub arguments: serde_json::Map<String, Value>,
}

impl ToolCall {
    /// Invariant M1: a call with an empty id or name cannot be dispatched
    /// or matched against a result and must be dropped at finalisation.
    pub fn is_valid(&self) -> bool {
        !self.call_id.is_empty() && !self.name.is_empty()
    }
}

/// One immutable node in the session's message tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub parent_id: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default)]
    pub error: bool,
}

impl Message {
    /// Construct a node with no `id`/`parent_id` assigned yet — these are
    /// filled in by [`crate::session::Session::append`].
    fn unplaced(role: Role) -> Self {
        Self {
            id: String::new(),
            parent_id: None,
            role,
            content: String::new(),
            tool_calls: None,
            call_id: None,
            thinking: None,
            metadata: HashMap::new(),
            error: false,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        let mut m = Self::unplaced(Role::System);
        m.content = text.into();
        m
    }

    pub fn user(text: impl Into<String>) -> Self {
        let mut m = Self::unplaced(Role::User);
        m.content = text.into();
        m
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        let mut m = Self::unplaced(Role::Assistant);
        m.content = text.into();
        m
    }

    pub fn assistant_with_tool_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut m = Self::unplaced(Role::Assistant);
        m.content = text.into();
        // Invariant M1: filter invalid calls at construction time.
        let valid: Vec<ToolCall> = tool_calls.into_iter().filter(|c| c.is_valid()).collect();
        m.tool_calls = if valid.is_empty() { None } else { Some(valid) };
        m
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>, error: bool) -> Self {
        let mut m = Self::unplaced(Role::ToolResult);
        m.call_id = Some(call_id.into());
        m.content = content.into();
        m.error = error;
        m
    }

    pub fn with_thinking(mut self, thinking: impl Into<String>) -> Self {
        self.thinking = Some(thinking.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Rough token estimate: ~4 characters per token, per §4.8.
    pub fn approx_tokens(&self) -> usize {
        let mut chars = self.content.len();
        if let Some(t) = &self.thinking {
            chars += t.len();
        }
        if let Some(calls) = &self.tool_calls {
            for c in calls {
                chars += c.name.len() + serde_json::to_string(&c.arguments).map(|s| s.len()).unwrap_or(0);
            }
        }
        (chars / 4).max(if chars == 0 { 0 } else { 1 })
    }
}

/// Convert the active-path messages (already repaired, see [`crate::repair`])
/// into the provider wire format. The system prompt is NOT included here —
/// callers prepend it separately per §4.6 step 3 ("prepend assembled system
/// prompt").
pub fn to_wire(messages: &[Message]) -> Vec<sven_model::Message> {
    let mut out = Vec::with_capacity(messages.len());
    for m in messages {
        match m.role {
            Role::System => out.push(sven_model::Message::system(m.content.clone())),
            Role::User => out.push(sven_model::Message::user(m.content.clone())),
            Role::ToolResult => {
                let call_id = m.call_id.clone().unwrap_or_default();
                out.push(sven_model::Message::tool_result(call_id, m.content.clone()));
            }
            Role::Assistant => {
                if !m.content.is_empty() || m.tool_calls.is_none() {
                    out.push(sven_model::Message::assistant(m.content.clone()));
                }
                if let Some(calls) = &m.tool_calls {
                    for c in calls {
                        out.push(sven_model::Message {
                            role: sven_model::Role::Assistant,
                            content: sven_model::MessageContent::ToolCall {
                                tool_call_id: c.call_id.clone(),
                                function: sven_model::FunctionCall {
                                    name: c.name.clone(),
                                    arguments: serde_json::to_string(&c.arguments)
                                        .unwrap_or_else(|_| "{}".to_string()),
                                },
                            },
                        });
                    }
                }
            }
        }
    }
    out
}
