use std::time::Duration;
use thiserror::Error;

/// Failures of the tool provider layer.
///
/// `Config`, `Discovery`, `Connection` and `Initialization` are raised while
/// resolving a provider and are fatal to startup. The `Tool*` variants are
/// raised per invocation and are recoverable by the caller.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("mcp configuration error: {0}")]
    Config(String),

    #[error("service discovery failed: {0}")]
    Discovery(String),

    #[error("mcp connection failed: {0}")]
    Connection(String),

    #[error("mcp initialization failed: {0}")]
    Initialization(String),

    #[error("tool {name} timed out after {}", humantime::format_duration(*.timeout))]
    ToolTimeout { name: String, timeout: Duration },

    #[error("tool {name} transport error: {message}")]
    ToolTransport { name: String, message: String },

    #[error("tool {name} failed: {message}")]
    ToolFailed { name: String, message: String },
}
