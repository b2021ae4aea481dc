// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Session supervision (§4.9): multi-session lifecycle plus crash recovery.
//!
//! Each session runs its [`Agent`] on a dedicated `tokio` task, driven by a
//! command channel. The [`SessionSupervisor`] tracks every live session in
//! *start order*; if a session's task panics, the supervisor reloads it from
//! its persisted log and restarts it, along with every session started after
//! it (Erlang's `rest_for_one`: a crash invalidates not just the failed
//! child but everything that came after it in the supervision order).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{error, warn};

use sven_config::{AgentConfig, AgentMode};
use sven_model::ModelProvider;
use sven_tools::events::ToolEvent;
use sven_tools::ToolRegistry;

use crate::bus::EventBus;
use crate::events::AgentEvent;
use crate::fsm::{Agent, AgentStatus, ThinkingLevel};
use crate::message::Message;
use crate::runtime_context::AgentRuntimeContext;
use crate::session::Session;

/// A command sent to a session's driver task. Each variant mirrors one of
/// the single-agent public operations (§6.2); the `reply` channel carries
/// the result back to the caller.
enum Command {
    Prompt { text: String, cancel: oneshot::Receiver<()>, reply: oneshot::Sender<anyhow::Result<()>> },
    SetModel { model: Arc<dyn ModelProvider>, reply: oneshot::Sender<()> },
    SetThinkingLevel { level: ThinkingLevel, reply: oneshot::Sender<()> },
    GetContext { reply: oneshot::Sender<Vec<Message>> },
    Compact { reply: oneshot::Sender<anyhow::Result<()>> },
    Branch { target_id: String, reply: oneshot::Sender<anyhow::Result<()>> },
    SetPersistPath { path: PathBuf, reply: oneshot::Sender<()> },
}

/// What a freshly-started (or restarted) session needs to build its [`Agent`].
/// Stored so the supervisor can rebuild an identical agent after a crash.
#[derive(Clone)]
pub struct SessionSpec {
    pub model: Arc<dyn ModelProvider>,
    pub tools: Arc<ToolRegistry>,
    pub config: Arc<AgentConfig>,
    pub runtime: AgentRuntimeContext,
    pub mode: AgentMode,
    pub max_context_tokens: usize,
    pub persist_path: Option<PathBuf>,
    /// Pre-assign the session's id instead of letting `Session::new` mint
    /// one. Lets a caller know the id before the session exists, e.g. to
    /// register a `task` tool whose `parent_session_id` must match.
    pub session_id: Option<String>,
}

struct SessionHandle {
    id: String,
    cmd_tx: mpsc::Sender<Command>,
    status: Arc<crate::fsm::StatusCell>,
    spec: SessionSpec,
    /// Cancellation sender for whatever `prompt` call is currently in
    /// flight, if any. Kept outside the `cmd_tx` queue so `abort` can fire
    /// it immediately instead of waiting behind the in-flight command (the
    /// driver loop processes one command at a time and would not otherwise
    /// see an `abort` until the current prompt already finished).
    cancel_slot: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    /// The live agent's steering channel. `prompt`/`steer` calls that arrive
    /// while the session is not idle are routed here (§4.6 "any:
    /// prompt/steer while not idle -> append to pending_prompts") instead of
    /// being queued as another `Command::Prompt`, which would otherwise wait
    /// behind the whole in-flight turn rather than being drained between
    /// tool dispatches.
    steering_tx: mpsc::UnboundedSender<String>,
}

/// Public, cheap-to-clone description of a tracked session (§6.2 `list_sessions`).
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub status: AgentStatus,
}

/// Root of the supervision tree. One process normally holds a single
/// `SessionSupervisor`, shared behind an `Arc`.
pub struct SessionSupervisor {
    bus: Arc<EventBus>,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    /// Start order, oldest first — the ordering `rest_for_one` restarts walk.
    order: Mutex<Vec<String>>,
    /// §6.5 `session.max_sessions`; `0` means unlimited. Restarts performed
    /// by `rest_for_one` never count against this cap — they replace an
    /// existing tracked session rather than adding a new one.
    max_sessions: usize,
}

impl SessionSupervisor {
    pub fn new(bus: Arc<EventBus>, max_sessions: usize) -> Arc<Self> {
        Arc::new(Self { bus, sessions: Mutex::new(HashMap::new()), order: Mutex::new(Vec::new()), max_sessions })
    }

    /// §6.2 `start_session`: build a fresh [`Agent`] and spawn its driver
    /// task. Fails with `max_sessions_reached` if the configured cap
    /// (`session.max_sessions`, `0` = unlimited) is already met.
    pub async fn start_session(self: &Arc<Self>, spec: SessionSpec) -> anyhow::Result<String> {
        if self.max_sessions > 0 {
            let count = self.sessions.lock().await.len();
            if count >= self.max_sessions {
                anyhow::bail!("max_sessions_reached: {} sessions already tracked (limit {})", count, self.max_sessions);
            }
        }

        let (tool_event_tx, tool_event_rx) = mpsc::channel::<ToolEvent>(64);
        let (steering_tx, steering_rx) = mpsc::unbounded_channel::<String>();
        drop(tool_event_tx); // no tool currently needs to signal this top-level session directly

        let mut agent = Agent::new(
            Arc::clone(&spec.model),
            Arc::clone(&spec.tools),
            Arc::clone(&spec.config),
            spec.runtime.clone(),
            Arc::new(Mutex::new(spec.mode)),
            tool_event_rx,
            steering_rx,
            Arc::clone(&self.bus),
            spec.max_context_tokens,
        );

        if let Some(id) = &spec.session_id {
            agent.session_mut().set_id(id.clone());
        }
        if let Some(path) = &spec.persist_path {
            agent.session_mut().set_persist_path(path.clone());
        }

        let id = agent.session().id.clone();
        self.spawn_driver(id.clone(), agent, spec, steering_tx).await;
        Ok(id)
    }

    async fn spawn_driver(
        self: &Arc<Self>,
        id: String,
        mut agent: Agent,
        spec: SessionSpec,
        steering_tx: mpsc::UnboundedSender<String>,
    ) {
        let status = agent.status_cell();
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(16);
        // Sent once the driver loop exits cleanly (channel closed by `stop_session`).
        // If the task panics instead, `done_rx` resolves to `Err` and `watch` treats
        // that as a crash worth restarting.
        let (done_tx, done_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    Command::Prompt { text, cancel, reply } => {
                        let result = agent.prompt(&text, cancel).await;
                        let _ = reply.send(result);
                    }
                    Command::SetModel { model, reply } => {
                        agent.set_model(model);
                        let _ = reply.send(());
                    }
                    Command::SetThinkingLevel { level, reply } => {
                        agent.set_thinking_level(level);
                        let _ = reply.send(());
                    }
                    Command::GetContext { reply } => {
                        let _ = reply.send(agent.get_context());
                    }
                    Command::Compact { reply } => {
                        let _ = reply.send(agent.compact().await);
                    }
                    Command::Branch { target_id, reply } => {
                        let _ = reply.send(agent.branch(&target_id));
                    }
                    Command::SetPersistPath { path, reply } => {
                        agent.session_mut().set_persist_path(path);
                        let _ = reply.send(());
                    }
                }
            }
            let _ = done_tx.send(());
        });

        let handle = SessionHandle {
            id: id.clone(),
            cmd_tx,
            status,
            spec,
            cancel_slot: Arc::new(Mutex::new(None)),
            steering_tx,
        };
        self.sessions.lock().await.insert(id.clone(), handle);
        self.order.lock().await.push(id.clone());
        self.watch(Arc::clone(self), id, done_rx);
    }

    /// Spawn the crash monitor for one session. If the driver task panics
    /// before signalling clean completion, reload the persisted log (if
    /// any), rebuild the agent, broadcast [`AgentEvent::AgentRecovered`],
    /// and apply `rest_for_one`: every session started after this one in
    /// `order` is restarted too.
    fn watch(self: &Arc<Self>, sup: Arc<Self>, id: String, done_rx: oneshot::Receiver<()>) {
        tokio::spawn(async move {
            if done_rx.await.is_err() {
                error!(session = %id, "session driver task panicked; restarting via rest_for_one");
                sup.restart_rest_for_one(&id).await;
            }
        });
    }

    /// Erlang `rest_for_one`: restart the crashed session and every session
    /// that was started after it, oldest-first.
    async fn restart_rest_for_one(self: &Arc<Self>, crashed_id: &str) {
        let to_restart: Vec<String> = {
            let order = self.order.lock().await;
            match order.iter().position(|id| id == crashed_id) {
                Some(pos) => order[pos..].to_vec(),
                None => return,
            }
        };

        for id in &to_restart {
            let spec = {
                let mut sessions = self.sessions.lock().await;
                sessions.remove(id).map(|h| h.spec)
            };
            let Some(spec) = spec else { continue };
            let recovered_session = match &spec.persist_path {
                Some(path) if path.exists() => Session::load(path, spec.max_context_tokens).ok(),
                _ => None,
            };

            let (tool_event_tx, tool_event_rx) = mpsc::channel::<ToolEvent>(64);
            let (steering_tx, steering_rx) = mpsc::unbounded_channel::<String>();
            drop(tool_event_tx);

            let mut agent = Agent::new(
                Arc::clone(&spec.model),
                Arc::clone(&spec.tools),
                Arc::clone(&spec.config),
                spec.runtime.clone(),
                Arc::new(Mutex::new(spec.mode)),
                tool_event_rx,
                steering_rx,
                Arc::clone(&self.bus),
                spec.max_context_tokens,
            );

            if let Some(recovered) = recovered_session {
                *agent.session_mut() = recovered;
            } else if let Some(id) = &spec.session_id {
                agent.session_mut().set_id(id.clone());
            }
            if let Some(path) = &spec.persist_path {
                agent.session_mut().set_persist_path(path.clone());
            }

            let new_id = agent.session().id.clone();
            self.bus.publish(&new_id, AgentEvent::AgentRecovered);
            warn!(old_session = %id, new_session = %new_id, "session recovered after crash");

            {
                let mut order = self.order.lock().await;
                if let Some(pos) = order.iter().position(|o| o == id) {
                    order[pos] = new_id.clone();
                }
            }
            self.spawn_driver(new_id, agent, spec, steering_tx).await;
        }
    }

    /// §6.2 `list_sessions`.
    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let order = self.order.lock().await;
        let sessions = self.sessions.lock().await;
        order
            .iter()
            .filter_map(|id| sessions.get(id))
            .map(|h| SessionInfo { id: h.id.clone(), status: h.status.get() })
            .collect()
    }

    /// §6.2 `stop_session`: drop the command channel, ending the driver task
    /// cleanly (not a crash, so no `rest_for_one` restart fires).
    pub async fn stop_session(&self, id: &str) -> bool {
        let handle = self.sessions.lock().await.remove(id);
        let Some(handle) = handle else { return false };
        drop(handle.cmd_tx);
        self.order.lock().await.retain(|o| o != id);
        true
    }

    /// §6.2 `prompt`: start a user turn, or — if the session is already
    /// busy — steer it (§4.6 "any: prompt/steer while not idle -> append to
    /// pending_prompts"). Steering text is routed directly to the agent's
    /// steering channel so it is drained between tool dispatches instead of
    /// queuing behind the entire in-flight turn.
    pub async fn prompt(&self, id: &str, text: &str) -> anyhow::Result<()> {
        let (status, steering_tx) = {
            let sessions = self.sessions.lock().await;
            let handle = sessions.get(id).ok_or_else(|| anyhow::anyhow!("unknown session {id}"))?;
            (handle.status.get(), handle.steering_tx.clone())
        };

        if status != AgentStatus::Idle {
            return steering_tx
                .send(text.to_string())
                .map_err(|_| anyhow::anyhow!("session {id} driver task is not accepting steering input"));
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let cancel_slot = {
            let sessions = self.sessions.lock().await;
            let handle = sessions.get(id).ok_or_else(|| anyhow::anyhow!("unknown session {id}"))?;
            Arc::clone(&handle.cancel_slot)
        };
        *cancel_slot.lock().await = Some(cancel_tx);

        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(id, Command::Prompt { text: text.to_string(), cancel: cancel_rx, reply: reply_tx }).await?;
        let result = reply_rx.await.map_err(|_| anyhow::anyhow!("session {id} driver task ended before replying"))?;
        cancel_slot.lock().await.take();
        result
    }

    /// §6.2 `abort`: idempotent. Cancels the in-flight streaming handle and
    /// pending tool task (via the FSM's own cooperative check of `cancel`),
    /// and is a no-op — not an error — if the session is already idle.
    pub async fn abort(&self, id: &str) -> anyhow::Result<()> {
        let cancel_slot = {
            let sessions = self.sessions.lock().await;
            let handle = sessions.get(id).ok_or_else(|| anyhow::anyhow!("unknown session {id}"))?;
            Arc::clone(&handle.cancel_slot)
        };
        if let Some(tx) = cancel_slot.lock().await.take() {
            let _ = tx.send(());
        }
        Ok(())
    }

    pub async fn set_model(&self, id: &str, model: Arc<dyn ModelProvider>) -> anyhow::Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(id, Command::SetModel { model, reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| anyhow::anyhow!("session {id} driver task ended before replying"))
    }

    /// Attach (or change) a session's on-disk persistence path after it has
    /// already started, e.g. once the caller has minted a deterministic file
    /// name from the id `start_session` returned. Also updates the stored
    /// [`SessionSpec`] so a future `rest_for_one` restart reloads from it.
    pub async fn set_persist_path(&self, id: &str, path: PathBuf) -> anyhow::Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(id, Command::SetPersistPath { path: path.clone(), reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| anyhow::anyhow!("session {id} driver task ended before replying"))?;
        if let Some(handle) = self.sessions.lock().await.get_mut(id) {
            handle.spec.persist_path = Some(path);
        }
        Ok(())
    }

    pub async fn set_thinking_level(&self, id: &str, level: ThinkingLevel) -> anyhow::Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(id, Command::SetThinkingLevel { level, reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| anyhow::anyhow!("session {id} driver task ended before replying"))
    }

    pub async fn get_context(&self, id: &str) -> anyhow::Result<Vec<Message>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(id, Command::GetContext { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| anyhow::anyhow!("session {id} driver task ended before replying"))
    }

    pub async fn compact(&self, id: &str) -> anyhow::Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(id, Command::Compact { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| anyhow::anyhow!("session {id} driver task ended before replying"))?
    }

    pub async fn branch(&self, id: &str, target_id: &str) -> anyhow::Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(id, Command::Branch { target_id: target_id.to_string(), reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| anyhow::anyhow!("session {id} driver task ended before replying"))?
    }

    async fn send(&self, id: &str, cmd: Command) -> anyhow::Result<()> {
        let tx = {
            let sessions = self.sessions.lock().await;
            sessions.get(id).map(|h| h.cmd_tx.clone())
        };
        let tx = tx.ok_or_else(|| anyhow::anyhow!("unknown session {id}"))?;
        tx.send(cmd).await.map_err(|_| anyhow::anyhow!("session {id} driver task is not accepting commands"))
    }
}
