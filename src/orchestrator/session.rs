use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::llm::{ChatMessage, ToolCall, ToolCallRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// One committed history entry. A `Tool` turn carries the id of a call listed
/// on an earlier `Assistant` turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub tool_call_id: Option<String>,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    pub fn to_message(&self) -> ChatMessage {
        match self.role {
            Role::User => ChatMessage::user(self.content.clone()),
            Role::Assistant => ChatMessage::assistant(
                self.content.clone(),
                self.tool_calls.iter().map(ToolCall::from).collect(),
            ),
            Role::Tool => ChatMessage::tool(
                self.tool_call_id.clone().unwrap_or_default(),
                self.content.clone(),
            ),
        }
    }
}

#[derive(Debug, Default)]
pub struct Session {
    turns: Vec<Turn>,
}

impl Session {
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// Drops whole exchanges from the front until at most `max_turns` remain.
    /// Cuts only at user turns; the newest exchange is always kept.
    pub fn trim(&mut self, max_turns: usize) {
        if max_turns == 0 || self.turns.len() <= max_turns {
            return;
        }
        let excess = self.turns.len() - max_turns;
        let cut = self
            .turns
            .iter()
            .enumerate()
            .skip(excess)
            .find(|(_, t)| t.role == Role::User)
            .map(|(i, _)| i)
            .or_else(|| self.turns.iter().rposition(|t| t.role == Role::User))
            .unwrap_or(0);
        self.turns.drain(..cut);
    }

    /// Request messages for the model; the system prompt is never stored.
    pub fn to_messages(&self, system_prompt: Option<&str>) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.turns.len() + 1);
        if let Some(sys) = system_prompt.filter(|s| !s.trim().is_empty()) {
            messages.push(ChatMessage::system(sys));
        }
        messages.extend(self.turns.iter().map(Turn::to_message));
        messages
    }
}

/// Sessions keyed by caller id. Each session sits behind its own lock so
/// exchanges on one key are serialized while other keys proceed.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<i64, Arc<Mutex<Session>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_create(&self, id: i64) -> Arc<Mutex<Session>> {
        if let Some(s) = self.sessions.read().await.get(&id) {
            return s.clone();
        }
        self.sessions
            .write()
            .await
            .entry(id)
            .or_default()
            .clone()
    }

    /// Snapshot of the committed turns; waits for an in-flight exchange.
    pub async fn history(&self, id: i64) -> Vec<Turn> {
        let session = self.sessions.read().await.get(&id).cloned();
        match session {
            Some(s) => s.lock().await.turns().to_vec(),
            None => Vec::new(),
        }
    }

    pub async fn reset(&self, id: i64) {
        let session = self.sessions.read().await.get(&id).cloned();
        if let Some(s) = session {
            s.lock().await.clear();
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}
