mod client;
mod stream;
mod tool_args;
pub mod types;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use client::*;
pub use stream::*;
pub use tool_args::*;
pub use types::*;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmErrorKind {
    #[error("rate limited")]
    RateLimited,
    #[error("server error")]
    Server,
    #[error("network error")]
    Network,
    #[error("timeout")]
    Timeout,
    #[error("client error")]
    Client,
    #[error("malformed response")]
    Deserialize,
    #[error("cancelled")]
    Cancelled,
    #[error("unknown error")]
    Unknown,
}

pub fn classify_error(status: Option<StatusCode>, err: &anyhow::Error) -> LlmErrorKind {
    if let Some(st) = status {
        if st == StatusCode::TOO_MANY_REQUESTS {
            return LlmErrorKind::RateLimited;
        }
        if st == StatusCode::REQUEST_TIMEOUT {
            return LlmErrorKind::Timeout;
        }
        if st.is_server_error() {
            return LlmErrorKind::Server;
        }
        if st.is_client_error() {
            return LlmErrorKind::Client;
        }
    }
    if let Some(kind) = err.downcast_ref::<LlmErrorKind>() {
        return kind.clone();
    }
    if let Some(e) = err.downcast_ref::<reqwest::Error>() {
        if e.is_timeout() {
            return LlmErrorKind::Timeout;
        }
        if e.is_decode() {
            return LlmErrorKind::Deserialize;
        }
        if e.is_connect() || e.is_body() || e.is_request() {
            return LlmErrorKind::Network;
        }
    }
    LlmErrorKind::Unknown
}

/// True when the error chain was produced by a cancelled token.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<LlmErrorKind>(),
        Some(LlmErrorKind::Cancelled)
    )
}

/// A streaming chat backend.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Opens one completion stream over `messages`, offering `tools` to the model.
    async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        tools: &[ToolDef],
        cancel: CancellationToken,
    ) -> Result<FragmentStream>;
}
