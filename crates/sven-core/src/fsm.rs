// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The Agent FSM (§3.3, §4.6) and the sequential tool runner (§4.5).
//!
//! Four states: `Idle` between turns, `Running` while the turn is being
//! set up (system message, budget check), `Streaming` while the model
//! response is arriving, and `ExecutingTools` while dispatched tool calls
//! run. The loop itself lives in [`Agent::prompt`]; `status()` reports the
//! current state to an external observer (e.g. a supervisor or UI) without
//! requiring a reply channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::Context as _;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::warn;

use sven_config::{AgentConfig, AgentMode};
use sven_model::{CompletionRequest, ModelProvider};
use sven_tools::events::ToolEvent;
use sven_tools::{ToolCall as WireToolCall, ToolRegistry};

use crate::bus::EventBus;
use crate::context::{self, FileOpTracking};
use crate::events::{AgentEvent, CompactionStrategyUsed};
use crate::message::{self, Message, ToolCall};
use crate::provider_port::{backoff_delay_ms, classify_error, usage_exceeds_window, ErrorKind};
use crate::prompts::{system_prompt, PromptContext};
use crate::repair;
use crate::runtime_context::AgentRuntimeContext;
use crate::session::Session;
use crate::stream::{self, StreamEvent, TurnState};

const BACKOFF_CAP_MS: u64 = 30_000;
const MAX_EMPTY_TURN_RETRIES: u32 = 2;

/// Reasoning effort requested from the model, when the provider supports it.
/// No current provider wire format exposes this (see DESIGN.md); it is
/// tracked here so `get_state` reports it and so a provider that gains
/// support later has somewhere to read it from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThinkingLevel {
    Off,
    #[default]
    Low,
    Medium,
    High,
}

/// The four states of the Agent FSM (§3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AgentStatus {
    Idle = 0,
    Running = 1,
    Streaming = 2,
    ExecutingTools = 3,
}

impl AgentStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => AgentStatus::Running,
            2 => AgentStatus::Streaming,
            3 => AgentStatus::ExecutingTools,
            _ => AgentStatus::Idle,
        }
    }
}

/// Shared, lock-free status cell so `get_state` never blocks on the agent's
/// own task.
#[derive(Default)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn get(&self) -> AgentStatus {
        AgentStatus::from_u8(self.0.load(Ordering::Relaxed))
    }
    fn set(&self, s: AgentStatus) {
        self.0.store(s as u8, Ordering::Relaxed);
    }
}

/// The core agent: owns a session tree and drives the model ↔ tool loop,
/// publishing every state transition and stream event on the [`EventBus`].
pub struct Agent {
    session: Session,
    tools: Arc<ToolRegistry>,
    model: Arc<dyn ModelProvider>,
    config: Arc<AgentConfig>,
    runtime: AgentRuntimeContext,
    mode: Arc<Mutex<AgentMode>>,
    thinking_level: ThinkingLevel,
    tool_event_rx: mpsc::Receiver<ToolEvent>,
    /// Messages injected mid-tool-execution (e.g. a user typing a follow-up
    /// while tools are still running). Drained between dispatches by the
    /// sequential runner; see module docs.
    steering_rx: mpsc::UnboundedReceiver<String>,
    bus: Arc<EventBus>,
    status: Arc<StatusCell>,
    file_ops: FileOpTracking,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        config: Arc<AgentConfig>,
        runtime: AgentRuntimeContext,
        mode: Arc<Mutex<AgentMode>>,
        tool_event_rx: mpsc::Receiver<ToolEvent>,
        steering_rx: mpsc::UnboundedReceiver<String>,
        bus: Arc<EventBus>,
        max_context_tokens: usize,
    ) -> Self {
        let max_output_tokens = model.catalog_max_output_tokens().unwrap_or(0) as usize;
        let mut session = Session::new(max_context_tokens);
        session.max_output_tokens = max_output_tokens;
        Self {
            session,
            tools,
            model,
            config,
            runtime,
            mode,
            thinking_level: ThinkingLevel::default(),
            tool_event_rx,
            steering_rx,
            bus,
            status: Arc::new(StatusCell::default()),
            file_ops: FileOpTracking::default(),
        }
    }

    pub fn status_cell(&self) -> Arc<StatusCell> {
        Arc::clone(&self.status)
    }

    pub fn get_state(&self) -> AgentStatus {
        self.status.get()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn set_model(&mut self, model: Arc<dyn ModelProvider>) {
        if let Some(cw) = model.catalog_context_window() {
            self.session.max_tokens = cw as usize;
        }
        if let Some(mot) = model.catalog_max_output_tokens() {
            self.session.max_output_tokens = mot as usize;
        }
        self.model = model;
    }

    pub fn set_thinking_level(&mut self, level: ThinkingLevel) {
        self.thinking_level = level;
    }

    pub fn thinking_level(&self) -> ThinkingLevel {
        self.thinking_level
    }

    pub async fn mode(&self) -> AgentMode {
        *self.mode.lock().await
    }

    pub async fn set_mode(&self, mode: AgentMode) {
        *self.mode.lock().await = mode;
    }

    /// §6.2 `branch`: fork the conversation tree at `target_id`.
    pub fn branch(&mut self, target_id: &str) -> anyhow::Result<()> {
        self.session.branch(target_id)
    }

    /// §6.2 `get_context`: the active path, repaired, as it would be sent
    /// to the provider right now (without actually calling it).
    pub fn get_context(&self) -> Vec<Message> {
        repair::positional_repair(&self.session.get_path())
    }

    /// §6.2 `compact`: force a compaction pass regardless of the current
    /// token fraction.
    pub async fn compact(&mut self) -> anyhow::Result<()> {
        self.maybe_compact(true).await
    }

    /// Run one user turn to completion: append the user message, then loop
    /// model-call → (tool dispatch)* until the model produces a final
    /// tool-free response or is cancelled.
    pub async fn prompt(
        &mut self,
        user_input: &str,
        mut cancel: oneshot::Receiver<()>,
    ) -> anyhow::Result<()> {
        // §8 boundary behaviour: an empty prompt is rejected outright and
        // never touches the session or the FSM status.
        if user_input.trim().is_empty() {
            self.bus.publish(
                &self.session.id,
                AgentEvent::Error { reason: "empty prompt rejected".to_string() },
            );
            return Ok(());
        }

        self.status.set(AgentStatus::Running);
        self.bus.publish(&self.session.id, AgentEvent::AgentStart);

        if cancel.try_recv().is_ok() {
            self.repair_orphans(true);
            self.bus.publish(&self.session.id, AgentEvent::AgentAbort);
            self.status.set(AgentStatus::Idle);
            return Ok(());
        }

        self.maybe_compact(false).await?;

        if self.session.is_empty() {
            let sys = self.build_system_message().await;
            self.session.append(sys);
        }
        self.session.append(Message::user(user_input));

        let result = self.run_loop(&mut cancel).await;
        self.status.set(AgentStatus::Idle);
        result
    }

    async fn run_loop(&mut self, cancel: &mut oneshot::Receiver<()>) -> anyhow::Result<()> {
        let mut rounds = 0u32;
        let mut empty_turn_retries = 0u32;
        let mut tool_call_rounds = 0u32;
        let mut stall_nudge_sent = false;

        loop {
            if cancel.try_recv().is_ok() {
                self.repair_orphans(true);
                self.bus.publish(&self.session.id, AgentEvent::AgentAbort);
                return Ok(());
            }

            // §4.6 run_turn step 2: full-scan orphan repair at every turn start.
            self.repair_orphans(false);

            rounds += 1;
            if rounds > self.config.max_tool_rounds {
                let wrap_msg = format!(
                    "You have reached the maximum tool-call budget ({} rounds). \
                     Do not call any more tools. \
                     Write a concise summary of: (1) what has been completed, \
                     (2) what still remains to be done, and (3) how to continue.",
                    self.config.max_tool_rounds
                );
                self.session.append(Message::user(wrap_msg));
                let turn = self.stream_turn(false, cancel).await?;
                if let Some(t) = turn {
                    if !t.current_text.is_empty() {
                        self.session.append(Message::assistant(t.current_text));
                    }
                }
                self.bus.publish(&self.session.id, AgentEvent::AgentEnd { usage: None });
                break;
            }

            let turn = match self.stream_turn(true, cancel).await? {
                Some(t) => t,
                None => {
                    self.repair_orphans(true);
                    self.bus.publish(&self.session.id, AgentEvent::AgentAbort);
                    return Ok(());
                }
            };

            let has_calls = !turn.current_tool_calls.is_empty();
            let text = turn.current_text.clone();

            if !text.is_empty() || turn.current_thinking.is_empty() {
                // Commit the assistant message (text and/or tool calls) as
                // one tree node, carrying thinking alongside it.
                let msg = if has_calls {
                    Message::assistant_with_tool_calls(text.clone(), turn.current_tool_calls.clone())
                } else {
                    Message::assistant(text.clone())
                };
                let msg = if !turn.current_thinking.is_empty() {
                    msg.with_thinking(turn.current_thinking.clone())
                } else {
                    msg
                };
                self.session.append(msg.clone());
                self.bus.publish(&self.session.id, AgentEvent::TurnEnd { message: Box::new(msg) });
            }

            if !has_calls {
                if text.is_empty() && empty_turn_retries < MAX_EMPTY_TURN_RETRIES {
                    empty_turn_retries += 1;
                    self.session.append(Message::user(
                        "You produced a thinking block but no response or tool call. \
                         Please continue with your next action.",
                    ));
                    continue;
                }
                if !text.is_empty()
                    && text_contains_malformed_tool_call(&text)
                    && empty_turn_retries < MAX_EMPTY_TURN_RETRIES
                {
                    empty_turn_retries += 1;
                    self.session.append(Message::user(
                        "You output a tool call using an incorrect format (XML/function tags \
                         in the text response). Do not include tool calls in your text. \
                         Use the JSON tool-call protocol provided by your schema.",
                    ));
                    continue;
                }
                if !text.is_empty() && tool_call_rounds >= 2 && !stall_nudge_sent {
                    stall_nudge_sent = true;
                    self.session.append(Message::user(
                        "You have not finished the task yet. \
                         Please continue with your next tool call.",
                    ));
                    continue;
                }
                self.bus.publish(
                    &self.session.id,
                    AgentEvent::AgentEnd { usage: turn.usage.clone() },
                );
                break;
            }

            empty_turn_retries = 0;
            tool_call_rounds += 1;

            if self.dispatch_tool_calls(&turn.current_tool_calls, cancel).await? {
                // §4.5 step 3e: abort landed mid-batch. The runner already
                // repaired orphans and broadcast `agent_abort`; go straight
                // back to idle instead of looping for another model call.
                return Ok(());
            }
            self.maybe_compact(false).await?;
        }

        Ok(())
    }

    /// The sequential tool runner (§4.5): dispatches one call at a time,
    /// draining steering input between each so a concurrently-typed user
    /// message never has to wait for the whole batch to finish, and racing
    /// the in-flight task against `cancel` so an `abort` takes effect
    /// immediately instead of waiting for the tool to finish on its own.
    ///
    /// Returns `true` if an abort landed mid-batch — the caller must stop
    /// the loop and return to idle rather than looping back for another
    /// model call.
    async fn dispatch_tool_calls(
        &mut self,
        calls: &[ToolCall],
        cancel: &mut oneshot::Receiver<()>,
    ) -> anyhow::Result<bool> {
        self.status.set(AgentStatus::ExecutingTools);
        let cap = self.config.tool_result_token_cap;

        for call in calls {
            if self.drain_steering() {
                // §4.5 step 3a: steering arrived mid-batch. The remaining
                // queued calls are never dispatched — the steering text is
                // already appended as a user message, and the turn ends here
                // so the model sees it on the very next round instead of
                // after finishing a batch it no longer has full context for.
                break;
            }
            self.drain_tool_events().await;

            let wire = WireToolCall {
                id: call.call_id.clone(),
                name: call.name.clone(),
                args: serde_json::Value::Object(call.arguments.clone()),
            };
            self.bus.publish(
                &self.session.id,
                AgentEvent::ToolExecutionStart {
                    tool: call.name.clone(),
                    call_id: call.call_id.clone(),
                    args: wire.args.clone(),
                    meta: None,
                },
            );

            let output = tokio::select! {
                biased;
                _ = &mut *cancel => {
                    // §4.5 step 3e / §4.9 abort: cancel the in-flight task —
                    // dropping the `execute` future here, not awaiting its
                    // result — and run Layer 1 so this call and every other
                    // not-yet-dispatched call in the batch get a synthetic
                    // "[Aborted by user]" result instead of the real one.
                    self.repair_orphans(true);
                    self.bus.publish(&self.session.id, AgentEvent::AgentAbort);
                    self.status.set(AgentStatus::Idle);
                    return Ok(true);
                }
                result = self.tools.execute(&wire) => result,
            };
            self.track_file_ops(&call.name, &wire.args, &output);

            let category = self
                .tools
                .get(&call.name)
                .map(|t| t.output_category())
                .unwrap_or_default();
            let truncated = context::smart_truncate(&output.content, category, cap);

            self.bus.publish(
                &self.session.id,
                AgentEvent::ToolExecutionEnd {
                    tool: call.name.clone(),
                    call_id: call.call_id.clone(),
                    result: truncated.clone(),
                    is_error: output.is_error,
                },
            );

            self.session
                .append(Message::tool_result(call.call_id.clone(), truncated, output.is_error));
        }

        self.drain_steering();
        self.status.set(AgentStatus::Running);
        Ok(false)
    }

    /// Repair Layer 1 (§4.7): scan the live session tree for tool calls
    /// lacking a matching result and append synthetic ones directly to the
    /// agent state. Run at the start of every turn and whenever an abort
    /// cancels in-flight streaming or tool execution.
    fn repair_orphans(&mut self, aborted: bool) {
        let mut path = self.session.get_path();
        let synthesized = repair::full_scan_orphan_repair(&mut path, aborted);
        for msg in synthesized {
            self.session.append(msg);
        }
    }

    /// Drains any steering messages into the session, returning whether at
    /// least one was appended.
    fn drain_steering(&mut self) -> bool {
        let mut any = false;
        while let Ok(text) = self.steering_rx.try_recv() {
            self.session.append(Message::user(text));
            any = true;
        }
        any
    }

    async fn drain_tool_events(&mut self) {
        while let Ok(te) = self.tool_event_rx.try_recv() {
            match te {
                ToolEvent::TodoUpdate(todos) => {
                    let msg = serde_json::to_string(&todos).unwrap_or_default();
                    self.bus.publish(
                        &self.session.id,
                        AgentEvent::StatusUpdate { message: format!("todos: {msg}") },
                    );
                }
                ToolEvent::ModeChanged(new_mode) => {
                    *self.mode.lock().await = new_mode;
                    self.bus.publish(
                        &self.session.id,
                        AgentEvent::StatusUpdate { message: format!("mode changed to {new_mode:?}") },
                    );
                }
            }
        }
    }

    fn track_file_ops(&mut self, tool_name: &str, args: &serde_json::Value, output: &sven_tools::ToolOutput) {
        if output.is_error {
            return;
        }
        let path = args.get("path").or_else(|| args.get("file_path")).and_then(|v| v.as_str());
        let Some(path) = path else { return };
        let mut delta = FileOpTracking::default();
        match tool_name {
            "read_file" => {
                delta.read_files.insert(path.to_string());
            }
            "write" | "edit_file" | "delete_file" => {
                delta.modified_files.insert(path.to_string());
            }
            _ => return,
        }
        self.file_ops.merge(&delta);
    }

    /// Stream one turn from the model. Returns `None` if cancelled before
    /// or during streaming. Implements Layer 3 (§4.7): if the stream ends
    /// in error, the partial turn is never committed — the caller sees it
    /// as a retryable failure via the `Err` branch, not as a truncated
    /// assistant message in history.
    async fn stream_turn(
        &mut self,
        with_tools: bool,
        cancel: &mut oneshot::Receiver<()>,
    ) -> anyhow::Result<Option<TurnState>> {
        self.status.set(AgentStatus::Running);
        let mode = *self.mode.lock().await;
        self.session.schema_overhead = self.estimate_schema_overhead(mode).await;

        let max_retries = self.config.retry_max_attempts;
        let base_delay_ms = self.config.retry_base_delay_ms;
        let stall_timeout = std::time::Duration::from_secs(self.config.stream_stall_timeout_secs.max(1));

        let mut attempt = 0u32;
        loop {
            if cancel.try_recv().is_ok() {
                return Ok(None);
            }

            let req = self.build_request(mode, with_tools).await;
            self.status.set(AgentStatus::Streaming);

            let stream_result = tokio::select! {
                biased;
                _ = &mut *cancel => return Ok(None),
                result = self.model.complete(req) => result,
            };

            let mut provider_stream = match stream_result {
                Ok(s) => s,
                Err(e) => {
                    let kind = classify_error(&e.to_string(), None);
                    match kind {
                        ErrorKind::Overflow => {
                            self.emergency_compact_now().await?;
                            continue;
                        }
                        ErrorKind::Transient if attempt < max_retries => {
                            attempt += 1;
                            let delay = backoff_delay_ms(attempt, base_delay_ms, BACKOFF_CAP_MS);
                            warn!(attempt, delay_ms = delay, "transient provider error, retrying: {e}");
                            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                            continue;
                        }
                        _ => return Err(e).context("model completion failed"),
                    }
                }
            };

            let mut turn_state = TurnState::default();
            let mut pending = HashMap::new();
            loop {
                let next = tokio::select! {
                    biased;
                    _ = &mut *cancel => return Ok(None),
                    item = provider_stream.next() => Some(item),
                    _ = tokio::time::sleep(stall_timeout) => None,
                };
                let Some(item) = next else {
                    turn_state.stream_errored =
                        Some(format!("stream timed out: no chunk received for {}s (watchdog)", stall_timeout.as_secs()));
                    break;
                };
                let Some(event) = item else { break };
                let response_event = match event {
                    Ok(e) => e,
                    Err(e) => {
                        turn_state.stream_errored = Some(e.to_string());
                        break;
                    }
                };
                for se in stream::from_response_event(response_event, &mut pending) {
                    if let StreamEvent::Usage { prompt_tokens, context_window, .. } = &se {
                        if let Some(cw) = context_window {
                            if usage_exceeds_window(*prompt_tokens, *cw) {
                                self.emergency_compact_now().await?;
                            }
                        }
                    }
                    let events = stream::reduce(&mut turn_state, se);
                    for ev in events {
                        self.bus.publish(&self.session.id, ev);
                    }
                    if turn_state.turn_complete || turn_state.stream_errored.is_some() {
                        break;
                    }
                }
                if turn_state.turn_complete || turn_state.stream_errored.is_some() {
                    break;
                }
            }

            if let Some(reason) = turn_state.stream_errored {
                let kind = classify_error(&reason, None);
                match kind {
                    ErrorKind::Overflow => {
                        self.emergency_compact_now().await?;
                        continue;
                    }
                    ErrorKind::Transient if attempt < max_retries => {
                        attempt += 1;
                        let delay = backoff_delay_ms(attempt, base_delay_ms, BACKOFF_CAP_MS);
                        warn!(attempt, delay_ms = delay, "stream error, discarding partial turn and retrying: {reason}");
                        tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                        continue;
                    }
                    _ => anyhow::bail!("model stream failed: {reason}"),
                }
            }

            if let Some(usage) = &turn_state.usage {
                self.session.add_cache_usage(usage.cache_read_tokens, usage.cache_write_tokens);
                let actual_input = usage.input_tokens + usage.cache_read_tokens;
                if actual_input > 0 {
                    let estimated = self.session.token_count + self.session.schema_overhead;
                    self.session.update_calibration(actual_input, estimated);
                }
            }

            return Ok(Some(turn_state));
        }
    }

    async fn build_request(&self, mode: AgentMode, with_tools: bool) -> CompletionRequest {
        let tools = if with_tools {
            self.tools
                .schemas_for_mode(mode)
                .into_iter()
                .map(|s| sven_model::ToolSchema { name: s.name, description: s.description, parameters: s.parameters })
                .collect()
        } else {
            vec![]
        };

        let repaired = self.get_context();
        let modalities = self.model.input_modalities();
        let wire = sven_model::sanitize::strip_images_if_unsupported(message::to_wire(&repaired), &modalities);

        CompletionRequest {
            messages: wire,
            tools,
            stream: true,
            system_dynamic_suffix: self.dynamic_context().await,
            cache_key: Some(self.session.id.clone()),
        }
    }

    async fn estimate_schema_overhead(&self, mode: AgentMode) -> usize {
        let schema_tokens: usize = self
            .tools
            .schemas_for_mode(mode)
            .iter()
            .map(|s| (s.name.len() + s.description.len() + s.parameters.to_string().len()) / 4)
            .sum();
        let dynamic_tokens = self.dynamic_context().await.map(|s| s.len() / 4).unwrap_or(0);
        schema_tokens + dynamic_tokens
    }

    /// Auto-compaction trigger (§4.8): runs before every turn and after
    /// every tool batch, and on demand via [`Self::compact`].
    async fn maybe_compact(&mut self, force: bool) -> anyhow::Result<()> {
        let input_budget = self.session.input_budget();
        if input_budget == 0 {
            return Ok(());
        }

        let threshold = (self.config.compaction_threshold - self.config.compaction_overhead_reserve).max(0.1);
        if !force && !self.session.is_near_limit(threshold) {
            return Ok(());
        }

        let tokens_before = self.session.token_count;
        let path = self.session.get_path();
        let keep_recent_tokens =
            context::default_keep_recent_tokens(self.session.input_budget(), false);
        let cut = context::find_cut_point(&path, keep_recent_tokens);

        if cut.idx == 0 {
            // Nothing old enough to summarise.
            return Ok(());
        }

        let from_id = path[0].id.clone();
        let boundary_id = path[cut.idx.saturating_sub(1)].id.clone();
        let to_compact = &path[..cut.idx];

        let prior_summary = if context::looks_like_prior_summary(&path[0]) { Some(&path[0]) } else { None };
        let structured = matches!(self.config.compaction_strategy, sven_config::CompactionStrategy::Structured);

        let prompt_text = context::build_summarize_prompt(to_compact, structured, prior_summary);
        let summary_result = self.run_compaction_turn(&prompt_text).await;

        let mut tracking = context::FileOpTracking::from_metadata(&path[0].metadata);
        tracking.merge(&self.file_ops);

        let (summary_msg, strategy) = match summary_result {
            Ok(text) if !text.is_empty() => {
                let tags = context::parse_file_tags(&text);
                tracking.merge(&tags);
                (context::build_summary_message(text, &tracking), context::strategy_label(structured))
            }
            _ => {
                let text = context::truncate_summary(to_compact);
                (context::build_summary_message(text, &tracking), CompactionStrategyUsed::Emergency)
            }
        };

        self.bus.publish(&self.session.id, AgentEvent::CompactionStart);
        self.session.replace_path_segment(&from_id, &boundary_id, vec![summary_msg])?;
        self.bus.publish(
            &self.session.id,
            AgentEvent::CompactionEnd { before: tokens_before, after: self.session.token_count, strategy },
        );
        Ok(())
    }

    /// Deterministic, model-free compaction used when the provider is
    /// unavailable or overflowed mid-turn (§4.8 "Overflow recovery").
    async fn emergency_compact_now(&mut self) -> anyhow::Result<()> {
        let path = self.session.get_path();
        if path.len() <= 1 {
            return Ok(());
        }
        let tokens_before = self.session.token_count;
        let keep_recent_tokens = context::default_keep_recent_tokens(self.session.input_budget(), true);
        let cut = context::find_cut_point(&path, keep_recent_tokens);
        if cut.idx == 0 {
            return Ok(());
        }
        let from_id = path[0].id.clone();
        let boundary_id = path[cut.idx.saturating_sub(1)].id.clone();
        let summary = context::emergency_summary(&path[..cut.idx]);
        self.bus.publish(&self.session.id, AgentEvent::CompactionStart);
        self.session.replace_path_segment(&from_id, &boundary_id, vec![summary])?;
        self.bus.publish(
            &self.session.id,
            AgentEvent::CompactionEnd {
                before: tokens_before,
                after: self.session.token_count,
                strategy: CompactionStrategyUsed::Emergency,
            },
        );
        Ok(())
    }

    /// Run a tool-free turn whose only purpose is to produce compaction
    /// summary text. Separate from the main loop so a compaction failure
    /// can fall back to the deterministic truncate strategy.
    async fn run_compaction_turn(&mut self, prompt_text: &str) -> anyhow::Result<String> {
        let mode = *self.mode.lock().await;
        let req = CompletionRequest {
            messages: vec![sven_model::Message::user(prompt_text)],
            tools: vec![],
            stream: true,
            system_dynamic_suffix: None,
            cache_key: None,
        };
        let mut resp = self.model.complete(req).await?;
        let mut pending = HashMap::new();
        let mut state = TurnState::default();
        while let Some(event) = resp.next().await {
            let event = event?;
            for se in stream::from_response_event(event, &mut pending) {
                stream::reduce(&mut state, se);
            }
            if state.turn_complete {
                break;
            }
        }
        let _ = mode;
        Ok(state.current_text)
    }

    async fn build_system_message(&self) -> Message {
        let ctx = self.prompt_context();
        let stable_ctx = ctx.stable_only();
        let custom = self.runtime.system_prompt_override.as_deref().or(self.config.system_prompt.as_deref());
        let mode = *self.mode.lock().await;
        Message::system(system_prompt(mode, custom, stable_ctx))
    }

    fn prompt_context(&self) -> PromptContext<'_> {
        PromptContext {
            project_root: self.runtime.project_root.as_deref(),
            git_context: self.runtime.git_context_note.as_deref(),
            project_context_file: self.runtime.project_context_file.as_deref(),
            ci_context: self.runtime.ci_context_note.as_deref(),
            append: self.runtime.append_system_prompt.as_deref(),
        }
    }

    async fn dynamic_context(&self) -> Option<String> {
        if self.runtime.system_prompt_override.is_some() || self.config.system_prompt.is_some() {
            return None;
        }
        self.prompt_context().dynamic_block()
    }
}

/// Detect `<think>`/`</think>` wrapper text smuggled into the plain text
/// stream by servers that don't separate `reasoning_content` (§4.4 note).
fn text_contains_malformed_tool_call(text: &str) -> bool {
    text.contains("<tool_call>")
        || text.contains("</tool_call>")
        || text.contains("<function=")
        || text.contains("[TOOL_CALL]")
}
