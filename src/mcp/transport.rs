use rmcp::transport::{SseClientTransport, StreamableHttpClientTransport, TokioChildProcess};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::{Instant, timeout_at};
use tracing::{info, warn};

use crate::config::{McpConfig, StdioConfig, TransportKind};
use crate::mcp::client::{ClientService, ProviderConnection, client_info};
use crate::mcp::discovery::resolve_base_url;
use crate::mcp::error::ProviderError;

/// Connects to the configured provider, runs the `initialize` handshake and
/// caches its tool list. Handshake and tool listing share one init deadline.
/// Nothing is retried here.
pub async fn resolve(cfg: &McpConfig) -> Result<ProviderConnection, ProviderError> {
    let init_timeout = cfg.effective_init_timeout();
    let call_timeout = cfg.effective_call_timeout();

    let (service, deadline) = match cfg.transport {
        TransportKind::Stdio => {
            let cmd = stdio_command(&cfg.stdio)?;
            info!(command = %cfg.stdio.command, args = ?cfg.stdio.args, "starting stdio mcp provider");
            let deadline = Instant::now() + init_timeout;
            let transport = TokioChildProcess::new(cmd).map_err(|e| {
                ProviderError::Connection(format!("spawn {}: {e}", cfg.stdio.command))
            })?;
            let service = handshake(
                rmcp::service::serve_client(client_info(), transport),
                deadline,
                init_timeout,
                &cfg.stdio.command,
            )
            .await?;
            (service, deadline)
        }
        TransportKind::Http => {
            let url = resolve_base_url(&cfg.http).await?;
            info!(%url, "connecting to streamable http mcp provider");
            let deadline = Instant::now() + init_timeout;
            let transport = StreamableHttpClientTransport::from_uri(url.clone());
            let service = handshake(
                rmcp::service::serve_client(client_info(), transport),
                deadline,
                init_timeout,
                &url,
            )
            .await?;
            (service, deadline)
        }
        TransportKind::Sse => {
            let url = resolve_base_url(&cfg.http).await?;
            info!(%url, "connecting to sse mcp provider");
            let deadline = Instant::now() + init_timeout;
            let transport = match timeout_at(deadline, SseClientTransport::start(url.clone())).await
            {
                Ok(Ok(t)) => t,
                Ok(Err(e)) => {
                    return Err(ProviderError::Connection(format!("sse connect {url}: {e}")));
                }
                Err(_) => return Err(init_timed_out(&url, init_timeout)),
            };
            let service = handshake(
                rmcp::service::serve_client(client_info(), transport),
                deadline,
                init_timeout,
                &url,
            )
            .await?;
            (service, deadline)
        }
    };

    ProviderConnection::establish(
        service,
        cfg.transport,
        cfg.server_name.clone(),
        call_timeout,
        deadline,
    )
    .await
}

fn stdio_command(cfg: &StdioConfig) -> Result<Command, ProviderError> {
    let program = cfg.command.trim();
    if program.is_empty() {
        return Err(ProviderError::Config(
            "mcp.stdio.command is empty".to_string(),
        ));
    }
    let mut cmd = Command::new(program);
    cmd.args(&cfg.args).envs(&cfg.env);
    Ok(cmd)
}

fn init_timed_out(target: &str, init_timeout: Duration) -> ProviderError {
    ProviderError::Initialization(format!(
        "{target}: no initialize response within {}",
        humantime::format_duration(init_timeout)
    ))
}

async fn handshake<F, E>(
    fut: F,
    deadline: Instant,
    init_timeout: Duration,
    target: &str,
) -> Result<ClientService, ProviderError>
where
    F: Future<Output = Result<ClientService, E>>,
    E: Display,
{
    match timeout_at(deadline, fut).await {
        Ok(Ok(service)) => Ok(service),
        Ok(Err(e)) => {
            warn!(%target, error = %e, "mcp handshake failed");
            Err(ProviderError::Connection(format!("{target}: {e}")))
        }
        Err(_) => {
            warn!(%target, "mcp handshake timed out");
            Err(init_timed_out(target, init_timeout))
        }
    }
}
