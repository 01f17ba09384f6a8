pub mod events;
pub mod session;

use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ChatConfig;
use crate::llm::{ChatModel, FinishReason, StreamFragment, ToolCallRequest, ToolDef, is_cancelled};
use crate::mcp::ToolProvider;

pub use events::{DoneReason, EventSink, StreamEvent};
pub use session::{Role, Session, SessionStore, Turn};

const TOOL_ERROR_PREFIX: &str = "tool error: ";

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("model stream failed: {0:#}")]
    Stream(anyhow::Error),
    #[error("exchange cancelled")]
    Cancelled,
}

impl OrchestratorError {
    fn from_stream(err: anyhow::Error) -> Self {
        if is_cancelled(&err) {
            Self::Cancelled
        } else {
            Self::Stream(err)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    NoTool,
    Completed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallResult {
    pub id: String,
    pub name: String,
    pub output: String,
}

struct PhaseResult {
    text: String,
    reason: FinishReason,
    tool_calls: Vec<ToolCallRequest>,
}

impl PhaseResult {
    fn wants_tools(&self) -> bool {
        self.reason == FinishReason::ToolCalls && !self.tool_calls.is_empty()
    }
}

/// Drives exchanges: stream, run requested tools in order, stream again.
pub struct Orchestrator {
    model: Arc<dyn ChatModel>,
    provider: Arc<dyn ToolProvider>,
    sessions: SessionStore,
    chat: ChatConfig,
}

impl Orchestrator {
    pub fn new(model: Arc<dyn ChatModel>, provider: Arc<dyn ToolProvider>, chat: ChatConfig) -> Self {
        Self {
            model,
            provider,
            sessions: SessionStore::new(),
            chat,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn provider(&self) -> &dyn ToolProvider {
        self.provider.as_ref()
    }

    /// Runs one user message to completion. Ends in exactly one of: a `Done`
    /// event with `Ok`, or an error with no `Done`. On error only turns
    /// committed before the failure remain in the session.
    pub async fn handle(
        &self,
        session_id: i64,
        text: &str,
        sink: &dyn EventSink,
        cancel: CancellationToken,
    ) -> Result<ExchangeOutcome, OrchestratorError> {
        let session = self.sessions.get_or_create(session_id).await;
        let mut session = session.lock().await;
        if !self.chat.history {
            session.clear();
        }
        session.push(Turn::user(text));
        info!(session_id, turns = session.len(), "exchange started");

        let tools = self.provider.tool_defs();

        let initial = self.stream_phase(&session, &tools, sink, &cancel).await?;
        if !initial.wants_tools() {
            if initial.reason == FinishReason::ToolCalls {
                warn!(session_id, "tool_calls finish without any calls");
            }
            session.push(Turn::assistant(initial.text, Vec::new()));
            emit(sink, StreamEvent::Done(DoneReason::NoTool));
            session.trim(self.chat.max_turns);
            info!(session_id, "exchange finished without tools");
            return Ok(ExchangeOutcome::NoTool);
        }

        let calls = initial.tool_calls;
        session.push(Turn::assistant(initial.text, calls.clone()));
        emit(sink, StreamEvent::ToolCallStarted(calls.clone()));

        for (i, call) in calls.iter().enumerate() {
            let Some(result) = self.run_tool(call, sink, &cancel).await else {
                for pending in &calls[i..] {
                    session.push(Turn::tool(
                        pending.id.clone(),
                        format!("{TOOL_ERROR_PREFIX}cancelled"),
                    ));
                }
                info!(session_id, "exchange cancelled during tool execution");
                return Err(OrchestratorError::Cancelled);
            };
            session.push(Turn::tool(result.id, result.output));
        }

        let last = self.stream_phase(&session, &tools, sink, &cancel).await?;
        if last.wants_tools() {
            // Single tool round per exchange.
            warn!(
                session_id,
                ignored = last.tool_calls.len(),
                "ignoring tool calls requested after tool results"
            );
        }
        session.push(Turn::assistant(last.text, Vec::new()));
        emit(sink, StreamEvent::Done(DoneReason::Completed));
        session.trim(self.chat.max_turns);
        info!(session_id, tools = calls.len(), "exchange completed");
        Ok(ExchangeOutcome::Completed)
    }

    async fn stream_phase(
        &self,
        session: &Session,
        tools: &[ToolDef],
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<PhaseResult, OrchestratorError> {
        let messages = session.to_messages(self.chat.system_prompt.as_deref());
        let mut stream = self
            .model
            .stream_chat(messages, tools, cancel.clone())
            .await
            .map_err(OrchestratorError::from_stream)?;

        let mut text = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                next = stream.next() => next,
            };
            let Some(fragment) = next else {
                debug!("model stream ended without finish fragment");
                return Ok(PhaseResult {
                    text,
                    reason: FinishReason::Stop,
                    tool_calls: Vec::new(),
                });
            };
            match fragment.map_err(OrchestratorError::from_stream)? {
                StreamFragment::Text(delta) => {
                    if delta.is_empty() {
                        continue;
                    }
                    text.push_str(&delta);
                    emit(sink, StreamEvent::Delta(delta));
                }
                StreamFragment::Finished { reason, tool_calls } => {
                    debug!(?reason, tool_calls = tool_calls.len(), "model stream finished");
                    return Ok(PhaseResult {
                        text,
                        reason,
                        tool_calls,
                    });
                }
            }
        }
    }

    /// `None` when cancelled before the call produced a result.
    async fn run_tool(
        &self,
        call: &ToolCallRequest,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Option<ToolCallResult> {
        if cancel.is_cancelled() {
            return None;
        }
        emit(
            sink,
            StreamEvent::ToolCall {
                name: call.name.clone(),
                args: call.arguments.clone(),
            },
        );
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            r = self.provider.invoke(&call.name, &call.arguments) => r,
        };
        let output = match result {
            Ok(text) => text,
            Err(e) => {
                warn!(tool = %call.name, id = %call.id, error = %e, "tool invocation failed");
                format!("{TOOL_ERROR_PREFIX}{e}")
            }
        };
        emit(
            sink,
            StreamEvent::ToolResult {
                name: call.name.clone(),
                result: output.clone(),
            },
        );
        Some(ToolCallResult {
            id: call.id.clone(),
            name: call.name.clone(),
            output,
        })
    }
}

fn emit(sink: &dyn EventSink, event: StreamEvent) {
    if let Err(e) = sink.emit(&event) {
        warn!(event = event.name(), error = %e, "event emission failed");
    }
}

#[cfg(test)]
mod tests;
