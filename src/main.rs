mod cli;
mod config;
mod llm;
mod logging;
mod mcp;
mod orchestrator;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use dotenvy::dotenv;
use tracing::info;

use crate::config::AppConfig;
use crate::llm::OpenAIClient;
use crate::mcp::ToolProvider;
use crate::orchestrator::Orchestrator;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "mcp-host",
    version,
    about = "Chat with an OpenAI-compatible model that can call MCP tools"
)]
pub struct Cli {
    /// Extra TOML config file layered over the global one
    #[arg(long)]
    config: Option<PathBuf>,

    /// OpenAI-compatible API base URL
    #[arg(long)]
    base_url: Option<String>,

    /// Model name
    #[arg(long)]
    model: Option<String>,

    /// API key (set via env OPENAI_API_KEY recommended)
    #[arg(long)]
    api_key: Option<String>,

    /// Log level (error,warn,info,debug,trace)
    #[arg(long)]
    log_level: Option<String>,

    /// MCP transport: stdio, http or sse
    #[arg(long)]
    transport: Option<String>,

    /// Session key the exchanges are recorded under
    #[arg(long, default_value_t = 1)]
    session: i64,

    /// Send a single message and exit
    #[arg(long)]
    prompt: Option<String>,

    /// Print events as SSE frames instead of plain text
    #[arg(long, action = ArgAction::SetTrue)]
    sse: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    let bootstrap = logging::bootstrap_subscriber(
        cli.log_level.as_deref().unwrap_or("info"),
        std::io::stderr,
    );
    let cfg = tracing::subscriber::with_default(bootstrap, || AppConfig::from_cli(&cli))?;
    logging::init_logging(
        &cfg.server.log_level,
        cfg.server.log_file.as_deref(),
        cfg.server.log_json,
    )?;
    info!(
        name = %cfg.server.name,
        version = %cfg.server.version,
        model = %cfg.model.model,
        base_url = %cfg.model.base_url,
        transport = %cfg.mcp.transport,
        "starting"
    );

    let provider = Arc::new(
        mcp::resolve(&cfg.mcp)
            .await
            .context("connect to mcp provider")?,
    );
    info!(
        server = provider.server_name(),
        transport = %provider.transport(),
        tools = provider.tools().len(),
        call_timeout = %humantime::format_duration(provider.call_timeout()),
        "tool provider connected"
    );
    let model = OpenAIClient::new(cfg.model.clone())?.with_llm_config(cfg.llm.clone());
    let orch = Arc::new(Orchestrator::new(
        Arc::new(model),
        provider.clone(),
        cfg.chat.clone(),
    ));

    let res = cli::run(orch.clone(), cli.session, cli.prompt.clone(), cli.sse).await;
    info!(sessions = orch.sessions().len().await, "shutting down");
    drop(orch);

    match Arc::try_unwrap(provider) {
        Ok(conn) => conn.close().await,
        Err(_) => info!("mcp provider still referenced at shutdown"),
    }
    res
}
