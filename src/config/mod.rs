use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_MODEL_BASE_URL: &str = "http://127.0.0.1:11434/v1";
pub const DEFAULT_MODEL: &str = "qwen3:latest";
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub llm: LlmConfig,
    pub chat: ChatConfig,
    pub mcp: McpConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub version: String,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub log_json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "mcp-host".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: "info".to_string(),
            log_file: None,
            log_json: false,
        }
    }
}

/// Chat backend selection and sampling options.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub max_tokens: Option<u32>,
    // Passed through verbatim into the request body.
    pub extra: HashMap<String, serde_json::Value>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_MODEL_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            temperature: None,
            top_p: None,
            top_k: None,
            max_tokens: None,
            extra: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub max_retries: usize,
    pub retry_base_ms: u64,
    pub retry_jitter_ms: u64,
    pub respect_retry_after: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            request_timeout_ms: 600_000,
            max_retries: 3,
            retry_base_ms: 500,
            retry_jitter_ms: 1_000,
            respect_retry_after: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub system_prompt: Option<String>,
    /// When false every exchange starts from an empty history.
    pub history: bool,
    /// Upper bound on retained turns per session, 0 disables trimming.
    pub max_turns: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            history: true,
            max_turns: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    Stdio,
    Http,
    Sse,
}

impl FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdio" => Ok(Self::Stdio),
            "http" => Ok(Self::Http),
            "sse" => Ok(Self::Sse),
            other => bail!("unknown mcp transport: {other} (expected stdio, http or sse)"),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::Sse => "sse",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct McpConfig {
    pub server_name: String,
    pub transport: TransportKind,
    pub stdio: StdioConfig,
    pub http: HttpConfig,
    pub init_timeout: Duration,
    pub call_timeout: Duration,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            server_name: "mcp_server".to_string(),
            transport: TransportKind::Stdio,
            stdio: StdioConfig::default(),
            http: HttpConfig::default(),
            init_timeout: DEFAULT_INIT_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StdioConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub base_url: String,
    pub init_timeout: Duration,
    pub call_timeout: Duration,
    pub consul: ConsulConfig,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            init_timeout: DEFAULT_INIT_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            consul: ConsulConfig::default(),
        }
    }
}

/// Service registry lookup. Takes precedence over `HttpConfig::base_url` when enabled.
#[derive(Debug, Clone)]
pub struct ConsulConfig {
    pub enable: bool,
    pub address: String,
    pub datacenter: Option<String>,
    pub token: Option<String>,
    pub service: String,
    pub tag: Option<String>,
    pub scheme: String,
    pub path: String,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            enable: false,
            address: String::new(),
            datacenter: None,
            token: None,
            service: String::new(),
            tag: None,
            scheme: "http".to_string(),
            path: "/mcp".to_string(),
        }
    }
}

impl McpConfig {
    /// Handshake timeout for the configured transport.
    pub fn effective_init_timeout(&self) -> Duration {
        match self.transport {
            TransportKind::Stdio => self.init_timeout,
            TransportKind::Http | TransportKind::Sse => self.http.init_timeout,
        }
    }

    /// Per-call timeout for the configured transport.
    pub fn effective_call_timeout(&self) -> Duration {
        match self.transport {
            TransportKind::Stdio => self.call_timeout,
            TransportKind::Http | TransportKind::Sse => self.http.call_timeout,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct FileConfig {
    pub server: Option<PartialServerConfig>,
    pub model: Option<PartialModelConfig>,
    pub llm: Option<PartialLlmConfig>,
    pub chat: Option<PartialChatConfig>,
    pub mcp: Option<PartialMcpConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PartialServerConfig {
    pub name: Option<String>,
    pub version: Option<String>,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub log_json: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PartialModelConfig {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub max_tokens: Option<u32>,
    pub extra: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PartialLlmConfig {
    pub connect_timeout_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub max_retries: Option<usize>,
    pub retry_base_ms: Option<u64>,
    pub retry_jitter_ms: Option<u64>,
    pub respect_retry_after: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PartialChatConfig {
    pub system_prompt: Option<String>,
    pub history: Option<bool>,
    pub max_turns: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PartialMcpConfig {
    pub server_name: Option<String>,
    pub transport: Option<String>,
    pub stdio: Option<PartialStdioConfig>,
    pub http: Option<PartialHttpConfig>,
    pub init_timeout: Option<String>,
    pub call_timeout: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PartialStdioConfig {
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub env: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PartialHttpConfig {
    pub base_url: Option<String>,
    pub init_timeout: Option<String>,
    pub call_timeout: Option<String>,
    pub consul: Option<PartialConsulConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PartialConsulConfig {
    pub enable: Option<bool>,
    pub address: Option<String>,
    pub datacenter: Option<String>,
    pub token: Option<String>,
    pub service: Option<String>,
    pub tag: Option<String>,
    pub scheme: Option<String>,
    pub path: Option<String>,
}

/// Field-wise overlay: values present in `over` win.
trait Overlay: Sized {
    fn overlay(self, over: Self) -> Self;
}

fn overlay_opt<T: Overlay>(base: Option<T>, over: Option<T>) -> Option<T> {
    match (base, over) {
        (Some(b), Some(o)) => Some(b.overlay(o)),
        (b, o) => o.or(b),
    }
}

impl Overlay for FileConfig {
    fn overlay(self, over: Self) -> Self {
        Self {
            server: overlay_opt(self.server, over.server),
            model: overlay_opt(self.model, over.model),
            llm: overlay_opt(self.llm, over.llm),
            chat: overlay_opt(self.chat, over.chat),
            mcp: overlay_opt(self.mcp, over.mcp),
        }
    }
}

impl Overlay for PartialServerConfig {
    fn overlay(self, over: Self) -> Self {
        Self {
            name: over.name.or(self.name),
            version: over.version.or(self.version),
            log_level: over.log_level.or(self.log_level),
            log_file: over.log_file.or(self.log_file),
            log_json: over.log_json.or(self.log_json),
        }
    }
}

impl Overlay for PartialModelConfig {
    fn overlay(self, over: Self) -> Self {
        let extra = match (self.extra, over.extra) {
            (Some(mut base), Some(over)) => {
                base.extend(over);
                Some(base)
            }
            (b, o) => o.or(b),
        };
        Self {
            base_url: over.base_url.or(self.base_url),
            model: over.model.or(self.model),
            api_key: over.api_key.or(self.api_key),
            temperature: over.temperature.or(self.temperature),
            top_p: over.top_p.or(self.top_p),
            top_k: over.top_k.or(self.top_k),
            max_tokens: over.max_tokens.or(self.max_tokens),
            extra,
        }
    }
}

impl Overlay for PartialLlmConfig {
    fn overlay(self, over: Self) -> Self {
        Self {
            connect_timeout_ms: over.connect_timeout_ms.or(self.connect_timeout_ms),
            request_timeout_ms: over.request_timeout_ms.or(self.request_timeout_ms),
            max_retries: over.max_retries.or(self.max_retries),
            retry_base_ms: over.retry_base_ms.or(self.retry_base_ms),
            retry_jitter_ms: over.retry_jitter_ms.or(self.retry_jitter_ms),
            respect_retry_after: over.respect_retry_after.or(self.respect_retry_after),
        }
    }
}

impl Overlay for PartialChatConfig {
    fn overlay(self, over: Self) -> Self {
        Self {
            system_prompt: over.system_prompt.or(self.system_prompt),
            history: over.history.or(self.history),
            max_turns: over.max_turns.or(self.max_turns),
        }
    }
}

impl Overlay for PartialMcpConfig {
    fn overlay(self, over: Self) -> Self {
        Self {
            server_name: over.server_name.or(self.server_name),
            transport: over.transport.or(self.transport),
            stdio: overlay_opt(self.stdio, over.stdio),
            http: overlay_opt(self.http, over.http),
            init_timeout: over.init_timeout.or(self.init_timeout),
            call_timeout: over.call_timeout.or(self.call_timeout),
        }
    }
}

impl Overlay for PartialStdioConfig {
    fn overlay(self, over: Self) -> Self {
        Self {
            command: over.command.or(self.command),
            args: over.args.or(self.args),
            env: over.env.or(self.env),
        }
    }
}

impl Overlay for PartialHttpConfig {
    fn overlay(self, over: Self) -> Self {
        Self {
            base_url: over.base_url.or(self.base_url),
            init_timeout: over.init_timeout.or(self.init_timeout),
            call_timeout: over.call_timeout.or(self.call_timeout),
            consul: overlay_opt(self.consul, over.consul),
        }
    }
}

impl Overlay for PartialConsulConfig {
    fn overlay(self, over: Self) -> Self {
        Self {
            enable: over.enable.or(self.enable),
            address: over.address.or(self.address),
            datacenter: over.datacenter.or(self.datacenter),
            token: over.token.or(self.token),
            service: over.service.or(self.service),
            tag: over.tag.or(self.tag),
            scheme: over.scheme.or(self.scheme),
            path: over.path.or(self.path),
        }
    }
}

/// Parses a humantime duration ("10s", "1m 30s"). Absent or zero values fall back to `default`.
pub fn parse_timeout(value: Option<&str>, default: Duration) -> Result<Duration> {
    let Some(raw) = value.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(default);
    };
    let parsed =
        humantime::parse_duration(raw).with_context(|| format!("invalid duration: {raw}"))?;
    if parsed.is_zero() {
        Ok(default)
    } else {
        Ok(parsed)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

impl AppConfig {
    pub fn from_cli(cli: &crate::Cli) -> Result<Self> {
        let project_root = std::env::current_dir().context("resolve current dir")?;

        let mut file_cfg = load_file_config().unwrap_or_default();
        if let Some(path) = &cli.config {
            // An explicit --config must exist and parse.
            file_cfg = file_cfg.overlay(load_config_from(path)?);
        }
        let file_cfg = file_cfg.overlay(load_project_config(&project_root).unwrap_or_default());

        let mut cfg = Self::from_file_config(file_cfg)?;

        // env < cli
        if let Ok(v) = std::env::var("OPENAI_API_KEY")
            && !v.is_empty()
        {
            cfg.model.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("OPENAI_BASE_URL")
            && !v.is_empty()
        {
            cfg.model.base_url = v;
        }
        if let Ok(v) = std::env::var("OPENAI_MODEL")
            && !v.is_empty()
        {
            cfg.model.model = v;
        }
        if let Ok(v) = std::env::var("MCP_HOST_LOG")
            && !v.is_empty()
        {
            cfg.server.log_level = v;
        }

        if let Some(v) = non_empty(cli.base_url.clone()) {
            cfg.model.base_url = v;
        }
        if let Some(v) = non_empty(cli.model.clone()) {
            cfg.model.model = v;
        }
        if let Some(v) = non_empty(cli.api_key.clone()) {
            cfg.model.api_key = Some(v);
        }
        if let Some(v) = non_empty(cli.log_level.clone()) {
            cfg.server.log_level = v;
        }
        if let Some(v) = &cli.transport {
            cfg.mcp.transport = v.parse()?;
        }

        Ok(cfg)
    }

    /// Resolves a merged file configuration onto the built-in defaults.
    pub fn from_file_config(file: FileConfig) -> Result<Self> {
        let server_defaults = ServerConfig::default();
        let server = file.server.unwrap_or_default();
        let server = ServerConfig {
            name: server.name.unwrap_or(server_defaults.name),
            version: server.version.unwrap_or(server_defaults.version),
            log_level: non_empty(server.log_level).unwrap_or(server_defaults.log_level),
            log_file: server.log_file,
            log_json: server.log_json.unwrap_or(server_defaults.log_json),
        };

        let model_defaults = ModelConfig::default();
        let model = file.model.unwrap_or_default();
        let model = ModelConfig {
            base_url: non_empty(model.base_url).unwrap_or(model_defaults.base_url),
            model: non_empty(model.model).unwrap_or(model_defaults.model),
            api_key: non_empty(model.api_key),
            temperature: model.temperature,
            top_p: model.top_p,
            top_k: model.top_k,
            max_tokens: model.max_tokens,
            extra: model.extra.unwrap_or_default(),
        };

        let llm_defaults = LlmConfig::default();
        let llm = match file.llm {
            Some(p) => LlmConfig {
                connect_timeout_ms: p
                    .connect_timeout_ms
                    .unwrap_or(llm_defaults.connect_timeout_ms),
                request_timeout_ms: p
                    .request_timeout_ms
                    .unwrap_or(llm_defaults.request_timeout_ms),
                max_retries: p.max_retries.unwrap_or(llm_defaults.max_retries),
                retry_base_ms: p.retry_base_ms.unwrap_or(llm_defaults.retry_base_ms),
                retry_jitter_ms: p.retry_jitter_ms.unwrap_or(llm_defaults.retry_jitter_ms),
                respect_retry_after: p
                    .respect_retry_after
                    .unwrap_or(llm_defaults.respect_retry_after),
            },
            None => llm_defaults,
        };

        let chat_defaults = ChatConfig::default();
        let chat = file.chat.unwrap_or_default();
        let chat = ChatConfig {
            system_prompt: non_empty(chat.system_prompt),
            history: chat.history.unwrap_or(chat_defaults.history),
            max_turns: chat.max_turns.unwrap_or(chat_defaults.max_turns),
        };

        let mcp = Self::resolve_mcp(file.mcp.unwrap_or_default())?;

        Ok(Self {
            server,
            model,
            llm,
            chat,
            mcp,
        })
    }

    fn resolve_mcp(p: PartialMcpConfig) -> Result<McpConfig> {
        let defaults = McpConfig::default();
        let transport = match non_empty(p.transport) {
            Some(t) => t.parse()?,
            None => defaults.transport,
        };

        let stdio = p.stdio.unwrap_or_default();
        let stdio = StdioConfig {
            command: stdio.command.unwrap_or_default(),
            args: stdio.args.unwrap_or_default(),
            env: stdio.env.unwrap_or_default(),
        };

        let http = p.http.unwrap_or_default();
        let consul_defaults = ConsulConfig::default();
        let consul = http.consul.unwrap_or_default();
        let consul = ConsulConfig {
            enable: consul.enable.unwrap_or(consul_defaults.enable),
            address: consul.address.unwrap_or_default(),
            datacenter: non_empty(consul.datacenter),
            token: non_empty(consul.token),
            service: consul.service.unwrap_or_default(),
            tag: non_empty(consul.tag),
            scheme: non_empty(consul.scheme).unwrap_or(consul_defaults.scheme),
            path: non_empty(consul.path).unwrap_or(consul_defaults.path),
        };
        let http = HttpConfig {
            base_url: http.base_url.unwrap_or_default(),
            init_timeout: parse_timeout(http.init_timeout.as_deref(), DEFAULT_INIT_TIMEOUT)
                .context("mcp.http.init_timeout")?,
            call_timeout: parse_timeout(http.call_timeout.as_deref(), DEFAULT_CALL_TIMEOUT)
                .context("mcp.http.call_timeout")?,
            consul,
        };

        Ok(McpConfig {
            server_name: non_empty(p.server_name).unwrap_or(defaults.server_name),
            transport,
            stdio,
            http,
            init_timeout: parse_timeout(p.init_timeout.as_deref(), DEFAULT_INIT_TIMEOUT)
                .context("mcp.init_timeout")?,
            call_timeout: parse_timeout(p.call_timeout.as_deref(), DEFAULT_CALL_TIMEOUT)
                .context("mcp.call_timeout")?,
        })
    }
}

/// Reads and parses one TOML configuration file.
pub fn load_config_from(path: &Path) -> Result<FileConfig> {
    let s =
        fs::read_to_string(path).with_context(|| format!("read config file: {}", path.display()))?;
    let cfg = toml::from_str::<FileConfig>(&s)
        .with_context(|| format!("parse config file: {}", path.display()))?;
    info!(path=%path.display(), "loaded config file");
    Ok(cfg)
}

pub fn load_file_config() -> Result<FileConfig> {
    fn candidate_paths() -> Vec<PathBuf> {
        let mut v = Vec::new();
        if let Ok(p) = std::env::var("MCP_HOST_CONFIG") {
            v.push(PathBuf::from(p));
        }
        if let Ok(xdg_home) = std::env::var("XDG_CONFIG_HOME") {
            v.push(Path::new(&xdg_home).join("mcp-host/config.toml"));
        } else if let Some(dir) = dirs::config_dir() {
            v.push(dir.join("mcp-host/config.toml"));
        }
        if let Some(home) = dirs::home_dir() {
            v.push(home.join(".config/mcp-host/config.toml"));
        }
        v
    }

    for p in candidate_paths() {
        if p.exists() {
            match load_config_from(&p) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(path=%p.display(), error=%e, "parse config failed");
                    continue;
                }
            }
        }
    }
    Ok(FileConfig::default())
}

/// Load project-specific configuration from .mcp-host/config.toml
pub fn load_project_config(project_root: &Path) -> Result<FileConfig> {
    let project_config_path = project_root.join(".mcp-host").join("config.toml");

    if project_config_path.exists() {
        match load_config_from(&project_config_path) {
            Ok(cfg) => Ok(cfg),
            Err(e) => {
                warn!(path=%project_config_path.display(), error=%e, "parse project config failed");
                Ok(FileConfig::default())
            }
        }
    } else {
        Ok(FileConfig::default())
    }
}
