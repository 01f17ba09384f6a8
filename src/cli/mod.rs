use anyhow::Result;
use std::io::{self, Write};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::orchestrator::{EventSink, Orchestrator, OrchestratorError, Role, StreamEvent, Turn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Tools,
    History,
    Reset,
    Quit,
    Unknown(String),
}

/// `None` for ordinary chat input.
pub fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if !line.starts_with('/') {
        return None;
    }
    let cmd = match line {
        "/help" => Command::Help,
        "/tools" => Command::Tools,
        "/history" => Command::History,
        "/reset" => Command::Reset,
        "/quit" | "/exit" => Command::Quit,
        other => Command::Unknown(other.to_string()),
    };
    Some(cmd)
}

pub fn print_help() {
    println!(
        "/help   Show help\n/tools  List provider tools\n/history Show this session's turns\n/reset  Clear this session's history\n/quit   Quit\nCtrl-C cancels a running exchange"
    );
}

/// SSE frame for one event, as the HTTP layer of a chat host would send it.
pub fn format_sse(event: &StreamEvent) -> String {
    format!("event: {}\ndata: {}\n\n", event.name(), event.payload())
}

/// Plain rendering: deltas go to stdout inline, tool activity to stderr.
pub fn format_plain(event: &StreamEvent) -> (bool, String) {
    match event {
        StreamEvent::Delta(text) => (false, text.clone()),
        StreamEvent::ToolCallStarted(calls) => {
            let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
            (true, format!("[tools] {}\n", names.join(", ")))
        }
        StreamEvent::ToolCall { name, args } => {
            (true, format!("[call] {name} {}\n", args.to_wire_string()))
        }
        StreamEvent::ToolResult { name, result } => {
            let first = result.lines().next().unwrap_or_default();
            let more = if result.lines().nth(1).is_some() { " ..." } else { "" };
            (true, format!("[result] {name}: {first}{more}\n"))
        }
        StreamEvent::Done(_) => (false, "\n".to_string()),
    }
}

/// One line per committed turn, as shown by `/history`.
pub fn format_turn(turn: &Turn) -> String {
    match turn.role {
        Role::User => format!("user: {}", turn.content),
        Role::Assistant if turn.tool_calls.is_empty() => format!("assistant: {}", turn.content),
        Role::Assistant => {
            let names: Vec<&str> = turn.tool_calls.iter().map(|c| c.name.as_str()).collect();
            format!("assistant: {} [calls {}]", turn.content, names.join(", "))
        }
        Role::Tool => format!(
            "tool({}): {}",
            turn.tool_call_id.as_deref().unwrap_or_default(),
            turn.content
        ),
    }
}

pub struct TerminalSink {
    pub sse: bool,
}

impl EventSink for TerminalSink {
    fn emit(&self, event: &StreamEvent) -> Result<()> {
        if self.sse {
            let mut out = io::stdout().lock();
            out.write_all(format_sse(event).as_bytes())?;
            out.flush()?;
            return Ok(());
        }
        let (to_stderr, text) = format_plain(event);
        if to_stderr {
            let mut err = io::stderr().lock();
            err.write_all(text.as_bytes())?;
            err.flush()?;
        } else {
            let mut out = io::stdout().lock();
            out.write_all(text.as_bytes())?;
            out.flush()?;
        }
        Ok(())
    }
}

/// Runs one exchange; Ctrl-C cancels it without leaving the session half written.
/// Cancellation is reported but not treated as a failure.
async fn run_exchange(
    orch: &Orchestrator,
    session_id: i64,
    text: &str,
    sink: &dyn EventSink,
) -> Result<(), OrchestratorError> {
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };
    let res = orch.handle(session_id, text, sink, cancel).await;
    watcher.abort();
    match res {
        Ok(outcome) => {
            info!(session_id, ?outcome, "exchange done");
            Ok(())
        }
        Err(OrchestratorError::Cancelled) => {
            eprintln!("\n[cancelled]");
            Ok(())
        }
        Err(e) => {
            warn!(session_id, error = %e, "exchange failed");
            Err(e)
        }
    }
}

fn print_tools(orch: &Orchestrator) {
    let tools = orch.provider().tools();
    if tools.is_empty() {
        println!("provider advertises no tools");
        return;
    }
    for t in tools {
        println!("{:<20} {}", t.name, t.description);
    }
}

/// One-shot when `prompt` is given, otherwise a line-oriented REPL on stdin.
pub async fn run(
    orch: Arc<Orchestrator>,
    session_id: i64,
    prompt: Option<String>,
    sse: bool,
) -> Result<()> {
    let sink = TerminalSink { sse };
    if let Some(prompt) = prompt {
        run_exchange(&orch, session_id, &prompt, &sink).await?;
        return Ok(());
    }

    eprintln!("mcp-host - type /help for commands");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line) {
            Some(Command::Quit) => break,
            Some(Command::Help) => print_help(),
            Some(Command::Tools) => print_tools(&orch),
            Some(Command::History) => {
                for turn in orch.sessions().history(session_id).await {
                    println!("{}", format_turn(&turn));
                }
            }
            Some(Command::Reset) => {
                orch.sessions().reset(session_id).await;
                eprintln!("session {session_id} cleared");
            }
            Some(Command::Unknown(cmd)) => eprintln!("unknown command: {cmd}"),
            None => {
                if let Err(e) = run_exchange(&orch, session_id, line.trim(), &sink).await {
                    eprintln!("\nerror: {e}");
                }
            }
        }
    }
    Ok(())
}
