// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The `task` built-in tool: spawns a nested [`Agent`] to complete a
//! focused sub-task and returns its final text output. Every event the
//! sub-agent publishes is rebroadcast on the parent bus wrapped in
//! [`AgentEvent::SubAgentEvent`] so a UI can show live sub-agent progress.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

use sven_config::{AgentConfig, AgentMode, Config};
use sven_tools::{
    events::{TodoItem, ToolEvent},
    policy::ApprovalPolicy,
    tool::{Tool, ToolCall, ToolOutput},
    AskQuestionTool, DeleteFileTool, EditFileTool, GlobFileSearchTool, GrepTool, ListDirTool,
    ReadFileTool, RunTerminalCommandTool, SwitchModeTool, TodoWriteTool, ToolRegistry, WriteTool,
};

use crate::bus::EventBus;
use crate::events::AgentEvent;
use crate::fsm::Agent;
use crate::runtime_context::AgentRuntimeContext;

/// Sub-agents are capped at one level of nesting: a child spawned by the
/// top-level agent never has a `task` tool registered in its own registry,
/// so it cannot spawn grandchildren.
const MAX_DEPTH: usize = 1;

const SUB_AGENT_CONTEXT_TOKENS: usize = 128_000;

pub struct TaskTool {
    model: Arc<dyn sven_model::ModelProvider>,
    config: Arc<Config>,
    agent_config: Arc<AgentConfig>,
    depth: Arc<AtomicUsize>,
    bus: Arc<EventBus>,
    /// Topic the parent agent publishes on. Sub-agent events are rebroadcast
    /// here (wrapped in `SubAgentEvent`), not on the sub-agent's own topic,
    /// so a subscriber of only the parent session sees them.
    parent_session_id: String,
}

impl TaskTool {
    pub fn new(
        model: Arc<dyn sven_model::ModelProvider>,
        config: Arc<Config>,
        agent_config: Arc<AgentConfig>,
        depth: Arc<AtomicUsize>,
        bus: Arc<EventBus>,
        parent_session_id: String,
    ) -> Self {
        Self { model, config, agent_config, depth, bus, parent_session_id }
    }

    fn build_sub_registry(&self) -> ToolRegistry {
        let todos: Arc<Mutex<Vec<TodoItem>>> = Arc::new(Mutex::new(Vec::new()));
        let mode: Arc<Mutex<AgentMode>> = Arc::new(Mutex::new(AgentMode::Agent));
        let (tx, _rx) = mpsc::channel::<ToolEvent>(64);

        let mut reg = ToolRegistry::new();
        reg.register(ReadFileTool);
        reg.register(ListDirTool);
        reg.register(GlobFileSearchTool);
        reg.register(GrepTool);
        reg.register(AskQuestionTool::new());
        reg.register(TodoWriteTool::new(todos, tx.clone()));
        reg.register(SwitchModeTool::new(mode, tx.clone()));
        reg.register(WriteTool);
        reg.register(EditFileTool);
        reg.register(DeleteFileTool);
        reg.register(RunTerminalCommandTool { timeout_secs: self.config.tools.timeout_secs });
        // TaskTool is intentionally NOT registered here to limit nesting to MAX_DEPTH.
        reg
    }
}

#[async_trait]
impl Tool for TaskTool {
    fn name(&self) -> &str {
        "task"
    }

    fn description(&self) -> &str {
        "Spawn a sub-agent to complete a focused task and return its final text output. \
         Useful for delegating isolated sub-tasks. The sub-agent has access to the standard \
         read-only and editing tools but cannot itself spawn further sub-agents."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "The task description for the sub-agent"
                },
                "mode": {
                    "type": "string",
                    "enum": ["research", "plan", "agent"],
                    "description": "Operating mode for the sub-agent (default: agent)"
                },
                "max_rounds": {
                    "type": "integer",
                    "description": "Maximum tool-call rounds (default: from config)"
                }
            },
            "required": ["prompt"]
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    fn modes(&self) -> &[AgentMode] {
        &[AgentMode::Agent]
    }

    fn tags(&self) -> &[&str] {
        &["sub_agent"]
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let prompt = match call.args.get("prompt").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'prompt'"),
        };
        let mode_str = call.args.get("mode").and_then(|v| v.as_str()).unwrap_or("agent");
        let mode = match mode_str {
            "research" => AgentMode::Research,
            "plan" => AgentMode::Plan,
            "agent" => AgentMode::Agent,
            other => return ToolOutput::err(&call.id, format!("unknown mode: {other}")),
        };

        let current_depth = self.depth.load(Ordering::Relaxed);
        if current_depth >= MAX_DEPTH {
            return ToolOutput::err(&call.id, format!("maximum sub-agent depth ({MAX_DEPTH}) reached"));
        }

        self.depth.fetch_add(1, Ordering::Relaxed);
        debug!(prompt = %prompt, mode = %mode_str, depth = current_depth + 1, "task: spawning sub-agent");

        let mut sub_config = (*self.agent_config).clone();
        if let Some(max_rounds) = call.args.get("max_rounds").and_then(|v| v.as_u64()) {
            sub_config.max_tool_rounds = max_rounds as u32;
        }

        let tools = Arc::new(self.build_sub_registry());
        let (_tool_event_tx, tool_event_rx) = mpsc::channel::<ToolEvent>(1);
        let (_steering_tx, steering_rx) = mpsc::unbounded_channel::<String>();

        let mut agent = Agent::new(
            self.model.clone(),
            tools,
            Arc::new(sub_config),
            AgentRuntimeContext::default(),
            Arc::new(Mutex::new(mode)),
            tool_event_rx,
            steering_rx,
            Arc::clone(&self.bus),
            SUB_AGENT_CONTEXT_TOKENS,
        );

        let sub_session_id = agent.session().id.clone();
        let mut sub_rx = self.bus.subscribe(&sub_session_id);

        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let submit_result = agent.prompt(&prompt, cancel_rx).await;

        let mut output = String::new();
        while let Ok(event) = sub_rx.try_recv() {
            if let AgentEvent::MessageDelta { delta } = &event {
                output.push_str(delta);
            }
            self.bus.publish(
                &self.parent_session_id,
                AgentEvent::SubAgentEvent {
                    parent_call_id: call.id.clone(),
                    sub_session_id: sub_session_id.clone(),
                    inner: Box::new(event),
                },
            );
        }

        self.depth.fetch_sub(1, Ordering::Relaxed);

        match submit_result {
            Ok(()) => {
                if output.is_empty() {
                    ToolOutput::ok(&call.id, "(sub-agent produced no text output)")
                } else {
                    ToolOutput::ok(&call.id, output)
                }
            }
            Err(e) => ToolOutput::err(&call.id, format!("sub-agent error: {e}")),
        }
    }
}
