use anyhow::{Result, anyhow};
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use tokio::sync::mpsc::UnboundedSender;

use crate::llm::{ToolArguments, ToolCall, ToolCallRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneReason {
    NoTool,
    Completed,
}

impl DoneReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoTool => "no_tool",
            Self::Completed => "completed",
        }
    }
}

/// Progress of one exchange, emitted in generation order. `Done` is always last.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Delta(String),
    ToolCallStarted(Vec<ToolCallRequest>),
    ToolCall { name: String, args: ToolArguments },
    ToolResult { name: String, result: String },
    Done(DoneReason),
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Delta(_) => "delta",
            Self::ToolCallStarted(_) => "tool_call_started",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Done(_) => "done",
        }
    }

    pub fn payload(&self) -> JsonValue {
        match self {
            Self::Delta(text) => json!({ "text": text }),
            Self::ToolCallStarted(calls) => {
                let calls: Vec<ToolCall> = calls.iter().map(ToolCall::from).collect();
                json!({ "tool_calls": calls })
            }
            Self::ToolCall { name, args } => {
                json!({ "name": name, "args": args.to_payload() })
            }
            Self::ToolResult { name, result } => json!({ "name": name, "result": result }),
            Self::Done(reason) => json!({ "reason": reason.as_str() }),
        }
    }
}

/// Receiver of exchange events. Delivery is best effort: the orchestrator
/// logs a failed `emit` and carries on.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &StreamEvent) -> Result<()>;
}

impl EventSink for UnboundedSender<StreamEvent> {
    fn emit(&self, event: &StreamEvent) -> Result<()> {
        self.send(event.clone())
            .map_err(|_| anyhow!("event receiver dropped"))
    }
}
