// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Headless driver for the core agent runtime (§6).
//!
//! This binary exercises the public operations of §6.2 directly against a
//! [`sven_core::SessionSupervisor`] — it has no TUI and no RPC transport
//! (§6.1 leaves that to a consumer). Given a prompt on the command line it
//! runs one turn and exits; given none it reads prompts from stdin, one per
//! line, until EOF or a `:`-prefixed command tells it to stop.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use sven_config::AgentMode;
use sven_core::{
    AgentEvent, AgentRuntimeContext, EventBus, SessionSpec, SessionSupervisor, TaskTool, ALL_TOPIC,
};
use sven_tools::{
    AskQuestionTool, DeleteFileTool, EditFileTool, GlobFileSearchTool, GrepTool, ListDirTool,
    ReadFileTool, RunTerminalCommandTool, SwitchModeTool, TodoItem, TodoWriteTool, ToolEvent,
    ToolRegistry, WriteTool,
};

#[derive(Parser, Debug)]
#[command(name = "sven-agent", version, about = "Core runtime for a coding-agent harness")]
struct Cli {
    /// Initial prompt. Omit to read prompts from stdin, one per line.
    #[arg(value_name = "PROMPT")]
    prompt: Option<String>,

    /// Path to config file (overrides auto-discovery).
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Agent mode, overriding `agent.default_mode` from config.
    #[arg(long, short = 'm', value_enum)]
    mode: Option<AgentMode>,

    /// Model to use, e.g. "gpt-4o" or "anthropic/claude-opus-4-5". Overrides
    /// `model` from config; looked up first against `providers.*`, then the
    /// static catalog.
    #[arg(long, short = 'M', env = "SVEN_MODEL")]
    model: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace). Logs go to stderr.
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Disable session persistence regardless of `session.auto_save`.
    #[arg(long)]
    no_persist: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = sven_config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(mode) = cli.mode {
        config.agent.default_mode = mode;
    }
    let config = Arc::new(config);

    let model_cfg = match &cli.model {
        Some(name) => sven_model::resolve_model_from_config(&config, name),
        None => config.model.clone(),
    };
    let model: Arc<dyn sven_model::ModelProvider> =
        Arc::from(sven_model::from_config(&model_cfg).context("constructing model provider")?);
    let max_context_tokens = model.catalog_context_window().unwrap_or(128_000) as usize;

    let bus = Arc::new(EventBus::new());
    let session_id = uuid::Uuid::new_v4().to_string();
    let tools = Arc::new(build_registry(&config, &model, &bus, session_id.clone()));
    let runtime = AgentRuntimeContext { project_root: find_project_root(), ..Default::default() };

    let persist_path = if cli.no_persist || !config.session.auto_save {
        None
    } else {
        Some(session_log_path(&session_id)?)
    };

    let spec = SessionSpec {
        model,
        tools,
        config: Arc::new(config.agent.clone()),
        runtime,
        mode: config.agent.default_mode,
        max_context_tokens,
        persist_path,
        session_id: Some(session_id.clone()),
    };

    let supervisor = SessionSupervisor::new(Arc::clone(&bus), config.session.max_sessions);
    let id = supervisor.start_session(spec).await.context("starting session")?;
    debug_assert_eq!(id, session_id, "pre-assigned session id must round-trip");

    let mut events = bus.subscribe(ALL_TOPIC);
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(&event);
        }
    });

    if let Some(prompt) = &cli.prompt {
        run_turn(&supervisor, &id, prompt).await;
        return Ok(());
    }

    run_repl(&supervisor, &id).await
}

/// Run one turn and print a trailing newline so stdout ends cleanly even if
/// the model's final chunk did not itself end in one.
async fn run_turn(supervisor: &Arc<SessionSupervisor>, id: &str, text: &str) {
    if let Err(e) = supervisor.prompt(id, text).await {
        eprintln!("error: {e:#}");
    }
    println!();
}

async fn run_repl(supervisor: &Arc<SessionSupervisor>, id: &str) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let Some(line) = lines.next_line().await? else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line {
            ":quit" | ":q" => break,
            ":abort" => {
                if let Err(e) = supervisor.abort(id).await {
                    eprintln!("error: {e:#}");
                }
            }
            ":compact" => {
                if let Err(e) = supervisor.compact(id).await {
                    eprintln!("error: {e:#}");
                }
            }
            ":context" => match supervisor.get_context(id).await {
                Ok(messages) => println!("{} messages on the active path", messages.len()),
                Err(e) => eprintln!("error: {e:#}"),
            },
            _ => run_turn(supervisor, id, line).await,
        }
    }
    supervisor.stop_session(id).await;
    Ok(())
}

/// Render a stream of [`AgentEvent`]s as plain text on stdout, mirroring the
/// "conversation" output format a TUI would otherwise render live.
fn print_event(event: &AgentEvent) {
    use std::io::Write as _;
    match event {
        AgentEvent::MessageDelta { delta } | AgentEvent::ThinkingDelta { delta } => {
            print!("{delta}");
            let _ = std::io::stdout().flush();
        }
        AgentEvent::ToolExecutionStart { tool, .. } => {
            eprintln!("\n[tool] {tool}");
        }
        AgentEvent::ToolExecutionEnd { tool, is_error, .. } => {
            if *is_error {
                eprintln!("[tool] {tool} failed");
            }
        }
        AgentEvent::CompactionEnd { before, after, .. } => {
            eprintln!("[context compacted: {before} -> {after} tokens]");
        }
        AgentEvent::Error { reason } => {
            eprintln!("[error] {reason}");
        }
        AgentEvent::SubAgentEvent { inner, .. } => print_event(inner),
        _ => {}
    }
}

/// Register every built-in tool, gated by `session.features.*` (§6.5).
/// `skills` and `mcp` are schema-complete but currently gate nothing: no
/// skill-loading or MCP-client tool exists in this workspace (see DESIGN.md).
fn build_registry(
    config: &sven_config::Config,
    model: &Arc<dyn sven_model::ModelProvider>,
    bus: &Arc<EventBus>,
    session_id: String,
) -> ToolRegistry {
    let mode = Arc::new(tokio::sync::Mutex::new(config.agent.default_mode));
    let todos: Arc<tokio::sync::Mutex<Vec<TodoItem>>> = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let (tool_tx, _tool_rx) = tokio::sync::mpsc::channel::<ToolEvent>(64);

    let mut registry = ToolRegistry::new();
    registry.register(ReadFileTool);
    registry.register(WriteTool);
    registry.register(EditFileTool);
    registry.register(DeleteFileTool);
    registry.register(GlobFileSearchTool);
    registry.register(GrepTool);
    registry.register(ListDirTool);
    registry.register(RunTerminalCommandTool { timeout_secs: config.tools.timeout_secs });
    registry.register(AskQuestionTool::new_headless());
    registry.register(TodoWriteTool::new(todos, tool_tx.clone()));
    registry.register(SwitchModeTool::new(mode, tool_tx));

    if config.session.features.sub_agents {
        registry.register(TaskTool::new(
            Arc::clone(model),
            Arc::new(config.clone()),
            Arc::new(config.agent.clone()),
            Arc::new(AtomicUsize::new(0)),
            Arc::clone(bus),
            session_id,
        ));
    }

    registry
}

/// Walk upward from the current directory looking for a `.git` marker.
fn find_project_root() -> Option<PathBuf> {
    let mut dir = std::env::current_dir().ok()?;
    loop {
        if dir.join(".git").exists() {
            return Some(dir);
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// `$XDG_DATA_HOME/sven-agent/sessions/<id>.jsonl`, mirroring the history
/// directory convention used elsewhere for this project's on-disk state.
fn session_log_path(id: &str) -> anyhow::Result<PathBuf> {
    let dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sven-agent")
        .join("sessions");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("creating session directory {}", dir.display()))?;
    Ok(dir.join(format!("{id}.jsonl")))
}

/// Logs go to stderr so they never interleave with the streamed response on
/// stdout. `-v`/`-vv` raise the default level; `RUST_LOG` always wins.
fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sven_agent={default_level},sven_core={default_level}")));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
