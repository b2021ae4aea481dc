// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Broadcast events published on the [`crate::bus::EventBus`] (§3.5).

use serde::{Deserialize, Serialize};
use sven_model::Usage;

use crate::message::{Message, ToolCall};

/// Which compaction strategy actually produced a given checkpoint. Exposed
/// to the UI layer for status display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompactionStrategyUsed {
    Structured,
    Narrative,
    Emergency,
}

#[derive(Debug, Clone)]
pub enum AgentEvent {
    AgentStart,
    AgentEnd { usage: Option<Usage> },
    AgentAbort,
    AgentRecovered,

    MessageStart,
    MessageDelta { delta: String },
    ThinkingStart,
    ThinkingDelta { delta: String },

    ToolExecutionStart { tool: String, call_id: String, args: serde_json::Value, meta: Option<String> },
    ToolExecutionEnd { tool: String, call_id: String, result: String, is_error: bool },

    TurnEnd { message: Box<Message> },
    UsageUpdate { usage: Usage },
    StatusUpdate { message: String },

    CompactionStart,
    CompactionEnd { before: usize, after: usize, strategy: CompactionStrategyUsed },

    ContextDiscovered { files: Vec<String> },
    SkillLoaded { name: String },

    SubAgentEvent { parent_call_id: String, sub_session_id: String, inner: Box<AgentEvent> },

    /// Emitted when the model requests a tool call (kept distinct from
    /// `ToolExecutionStart`, which fires once the runner actually dispatches
    /// it — the two coincide today since dispatch is immediate, but a
    /// future approval-gate can delay execution without losing this event).
    ToolCallRequested { call: ToolCall },

    Error { reason: String },
}
