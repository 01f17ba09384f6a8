use async_trait::async_trait;
use rmcp::{
    RoleClient,
    model::{
        CallToolRequestParam, CallToolResult, ClientCapabilities, ClientInfo, Implementation,
        RawContent, Tool,
    },
    service::RunningService,
};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, warn};

use crate::config::TransportKind;
use crate::llm::{ToolArguments, ToolDef, ToolFunctionDef};
use crate::mcp::error::ProviderError;

pub const CLIENT_NAME: &str = "mcp-host";

pub type ClientService = RunningService<RoleClient, ClientInfo>;

/// Identity announced to the provider during `initialize`.
pub fn client_info() -> ClientInfo {
    ClientInfo {
        protocol_version: Default::default(),
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: CLIENT_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ..Implementation::from_build_env()
        },
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: JsonValue,
}

impl ToolDescriptor {
    pub fn from_tool(tool: &Tool) -> Self {
        Self {
            name: tool.name.to_string(),
            description: tool
                .description
                .as_ref()
                .map(|d| d.to_string())
                .unwrap_or_default(),
            input_schema: JsonValue::Object(Arc::as_ref(&tool.input_schema).clone()),
        }
    }

    pub fn to_tool_def(&self) -> ToolDef {
        ToolDef {
            kind: "function".to_string(),
            function: ToolFunctionDef {
                name: self.name.clone(),
                description: self.description.clone(),
                parameters: self.input_schema.clone(),
            },
        }
    }
}

/// A connected session able to run tools by name.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn tools(&self) -> &[ToolDescriptor];

    async fn invoke(&self, name: &str, args: &ToolArguments) -> Result<String, ProviderError>;

    fn tool_defs(&self) -> Vec<ToolDef> {
        self.tools().iter().map(ToolDescriptor::to_tool_def).collect()
    }
}

/// One initialized provider session and the tools it advertised at startup.
///
/// The underlying `rmcp` peer multiplexes concurrent requests over a single
/// transport, so a connection is shared between sessions without a lock.
pub struct ProviderConnection {
    service: ClientService,
    tools: Vec<ToolDescriptor>,
    call_timeout: Duration,
    transport: TransportKind,
    server_name: String,
}

impl ProviderConnection {
    /// Enumerates tools on an already initialized service. `deadline` is shared
    /// with the handshake that produced `service`.
    pub async fn establish(
        service: ClientService,
        transport: TransportKind,
        server_name: impl Into<String>,
        call_timeout: Duration,
        deadline: Instant,
    ) -> Result<Self, ProviderError> {
        let server_name = server_name.into();
        let listed = timeout_at(deadline, service.list_tools(Default::default())).await;
        let listed = match listed {
            Ok(Ok(res)) => res,
            Ok(Err(e)) => {
                let _ = service.cancel().await;
                return Err(ProviderError::Initialization(format!("list tools: {e}")));
            }
            Err(_) => {
                let _ = service.cancel().await;
                return Err(ProviderError::Initialization(
                    "list tools timed out".to_string(),
                ));
            }
        };
        let tools: Vec<ToolDescriptor> = listed.tools.iter().map(ToolDescriptor::from_tool).collect();
        if let Some(peer) = service.peer_info() {
            info!(
                server = %server_name,
                remote = %peer.server_info.name,
                %transport,
                tools = tools.len(),
                "mcp provider ready"
            );
        }
        Ok(Self {
            service,
            tools,
            call_timeout,
            transport,
            server_name,
        })
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Cancels the session; a stdio child is reaped by the SDK.
    pub async fn close(self) {
        match self.service.cancel().await {
            Ok(reason) => debug!(server = %self.server_name, ?reason, "mcp provider closed"),
            Err(e) => warn!(server = %self.server_name, error = %e, "mcp provider close failed"),
        }
    }
}

#[async_trait]
impl ToolProvider for ProviderConnection {
    fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    async fn invoke(&self, name: &str, args: &ToolArguments) -> Result<String, ProviderError> {
        if !self.tools.iter().any(|t| t.name == name) {
            // The provider decides; this is only for the log.
            warn!(server = %self.server_name, tool = %name, "tool not advertised by provider");
        }
        info!(server = %self.server_name, tool = %name, "calling mcp tool");
        debug!(tool_args = %args.to_wire_string(), "tool arguments");

        let params = CallToolRequestParam {
            name: name.to_string().into(),
            arguments: Some(args.to_payload()),
        };
        let result = timeout(self.call_timeout, self.service.call_tool(params))
            .await
            .map_err(|_| ProviderError::ToolTimeout {
                name: name.to_string(),
                timeout: self.call_timeout,
            })?
            .map_err(|e| ProviderError::ToolTransport {
                name: name.to_string(),
                message: e.to_string(),
            })?;

        let text = flatten_result(&result);
        if result.is_error.unwrap_or(false) {
            return Err(ProviderError::ToolFailed {
                name: name.to_string(),
                message: text,
            });
        }
        debug!(tool = %name, bytes = text.len(), "tool result");
        Ok(text)
    }
}

/// Text parts joined by newlines; other parts are rendered as JSON.
pub(crate) fn flatten_result(result: &CallToolResult) -> String {
    if result.content.is_empty()
        && let Some(structured) = &result.structured_content
    {
        return structured.to_string();
    }
    result
        .content
        .iter()
        .map(|c| match &c.raw {
            RawContent::Text(t) => t.text.clone(),
            other => serde_json::to_string(other).unwrap_or_default(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}
