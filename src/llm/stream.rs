use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::llm::client::OpenAIClient;
use crate::llm::tool_args::{ToolArguments, ToolCallRequest};
use crate::llm::types::{ChatMessage, ChatStreamChunk, ToolCallDelta, ToolDef};
use crate::llm::{ChatModel, LlmErrorKind};

/// Lazy, finite, non-restartable sequence of fragments for one completion.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<StreamFragment>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Other(String),
}

impl FinishReason {
    pub fn from_wire(s: &str) -> Self {
        match s {
            "stop" => Self::Stop,
            "tool_calls" => Self::ToolCalls,
            "length" => Self::Length,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamFragment {
    Text(String),
    /// Always the last fragment. `tool_calls` is only populated for `FinishReason::ToolCalls`.
    Finished {
        reason: FinishReason,
        tool_calls: Vec<ToolCallRequest>,
    },
}

#[derive(Debug, Clone, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Upper bound on backend-supplied tool call indices.
pub const MAX_TOOL_CALLS: usize = 128;

/// Reassembles tool calls whose name and argument text arrive split across deltas.
#[derive(Debug, Default)]
pub struct ToolDeltaBuffer {
    calls: Vec<PartialToolCall>,
}

impl ToolDeltaBuffer {
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn push_delta(&mut self, delta: &ToolCallDelta) {
        // Some backends omit `index` and send one complete call per delta.
        let index = match delta.index {
            Some(i) => i,
            None => match (&delta.id, self.calls.last()) {
                (Some(id), Some(last)) if last.id.as_deref() == Some(id.as_str()) => {
                    self.calls.len() - 1
                }
                (None, Some(_)) => self.calls.len() - 1,
                _ => self.calls.len(),
            },
        };
        if index >= MAX_TOOL_CALLS {
            warn!(index, "ignoring tool call delta with out of range index");
            return;
        }
        if self.calls.len() <= index {
            self.calls.resize_with(index + 1, Default::default);
        }
        let slot = &mut self.calls[index];
        if let Some(id) = delta.id.as_deref().filter(|s| !s.is_empty())
            && slot.id.is_none()
        {
            slot.id = Some(id.to_string());
        }
        if let Some(f) = &delta.function {
            if let Some(n) = f.name.as_deref() {
                slot.name.push_str(n);
            }
            if let Some(a) = f.arguments.as_deref() {
                slot.arguments.push_str(a);
            }
        }
    }

    /// Completed calls in index order. Slots that never received a name are dropped.
    pub fn finish(self) -> Vec<ToolCallRequest> {
        self.calls
            .into_iter()
            .enumerate()
            .filter_map(|(index, call)| {
                if call.name.is_empty() {
                    warn!(index, "dropping streamed tool call without a name");
                    return None;
                }
                let arguments = ToolArguments::parse(&call.arguments);
                if arguments.is_raw() {
                    warn!(tool = %call.name, "tool arguments are not a JSON object, passing raw text");
                }
                Some(ToolCallRequest {
                    id: call
                        .id
                        .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple())),
                    name: call.name,
                    arguments,
                })
            })
            .collect()
    }
}

/// Incremental parser for `text/event-stream` chat-completion bodies.
#[derive(Debug, Default)]
pub struct SseChunkParser {
    buf: Vec<u8>,
    tools: ToolDeltaBuffer,
    done: bool,
    error: Option<anyhow::Error>,
}

impl SseChunkParser {
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Inline error reported by the backend. Fragments parsed before it are
    /// still returned by `feed`/`finish`; the error comes after them.
    pub fn take_error(&mut self) -> Option<anyhow::Error> {
        self.error.take()
    }

    /// Consumes raw bytes and returns the fragments completed by them.
    /// Nothing is produced once a finish fragment or an error has been seen.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamFragment> {
        let mut out = Vec::new();
        if self.done {
            return out;
        }
        self.buf.extend_from_slice(bytes);
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.process_line(&line, &mut out);
            if self.done {
                self.buf.clear();
                break;
            }
        }
        out
    }

    /// Flushes a trailing unterminated line and closes the stream with
    /// `Finished(Stop)` if the backend never sent a finish reason.
    pub fn finish(&mut self) -> Vec<StreamFragment> {
        let mut out = Vec::new();
        if !self.done && !self.buf.is_empty() {
            let line = std::mem::take(&mut self.buf);
            self.process_line(&line, &mut out);
        }
        self.close(&mut out);
        out
    }

    fn process_line(&mut self, line: &[u8], out: &mut Vec<StreamFragment>) {
        if let Err(e) = self.handle_line(line, out) {
            self.error = Some(e);
            self.done = true;
        }
    }

    fn close(&mut self, out: &mut Vec<StreamFragment>) {
        if self.done {
            return;
        }
        if !self.tools.is_empty() {
            warn!("stream ended without finish reason, discarding partial tool calls");
        }
        self.done = true;
        out.push(StreamFragment::Finished {
            reason: FinishReason::Stop,
            tool_calls: Vec::new(),
        });
    }

    fn handle_line(&mut self, line: &[u8], out: &mut Vec<StreamFragment>) -> Result<()> {
        let Ok(s) = std::str::from_utf8(line) else {
            warn!("skipping non-utf8 stream line");
            return Ok(());
        };
        let s = s.trim();
        if s.is_empty()
            || s.starts_with(':')
            || s.starts_with("event:")
            || s.starts_with("id:")
            || s.starts_with("retry:")
        {
            return Ok(());
        }
        let payload = s.strip_prefix("data:").map(str::trim).unwrap_or(s);
        if payload == "[DONE]" {
            self.close(out);
            return Ok(());
        }

        debug!(response_chunk=%payload, "llm chat_stream response");

        let chunk = match serde_json::from_str::<ChatStreamChunk>(payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(payload, error=%e, "failed to parse stream chunk");
                return Ok(());
            }
        };
        if let Some(err) = chunk.error {
            return Err(anyhow!("chat stream error: {err}").context(LlmErrorKind::Server));
        }

        for ch in chunk.choices.into_iter().filter(|c| c.index == 0) {
            if let Some(text) = ch.delta.content.filter(|t| !t.is_empty()) {
                out.push(StreamFragment::Text(text));
            }
            if let Some(deltas) = &ch.delta.tool_calls {
                for d in deltas {
                    self.tools.push_delta(d);
                }
            }
            if let Some(reason) = ch.finish_reason {
                let reason = FinishReason::from_wire(&reason);
                let tools = std::mem::take(&mut self.tools);
                let tool_calls = if reason == FinishReason::ToolCalls {
                    tools.finish()
                } else {
                    if !tools.is_empty() {
                        warn!(?reason, "ignoring tool call deltas on non tool_calls finish");
                    }
                    Vec::new()
                };
                self.done = true;
                out.push(StreamFragment::Finished { reason, tool_calls });
                return Ok(());
            }
        }
        Ok(())
    }
}

/// Turns a chat-completion byte stream into fragments. The underlying body is
/// dropped as soon as a finish reason arrives.
pub fn fragment_stream<S, B, E>(bytes: S, cancel: CancellationToken) -> FragmentStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let stream = async_stream::try_stream! {
        let mut bytes = Box::pin(bytes);
        let mut parser = SseChunkParser::default();
        loop {
            let chunk_res: Result<Option<B>> = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("chat_stream cancelled during byte stream read");
                    Err(anyhow!(LlmErrorKind::Cancelled))
                }
                chunk = bytes.next() => match chunk {
                    Some(Ok(b)) => Ok(Some(b)),
                    Some(Err(e)) => Err(anyhow::Error::new(e).context("byte stream read error")),
                    None => Ok(None),
                },
            };
            let Some(chunk) = chunk_res? else {
                break;
            };
            for fragment in parser.feed(chunk.as_ref()) {
                yield fragment;
            }
            if let Some(e) = parser.take_error() {
                Err::<(), _>(e)?;
            }
            if parser.is_done() {
                break;
            }
        }
        for fragment in parser.finish() {
            yield fragment;
        }
        if let Some(e) = parser.take_error() {
            Err::<(), _>(e)?;
        }
    };
    Box::pin(stream)
}

#[async_trait]
impl ChatModel for OpenAIClient {
    async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        tools: &[ToolDef],
        cancel: CancellationToken,
    ) -> Result<FragmentStream> {
        let req = self.build_request(messages, tools);
        let resp = self.open_stream(&req, &cancel).await?;
        Ok(fragment_stream(resp.bytes_stream(), cancel))
    }
}
