use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{ConsulConfig, HttpConfig};
use crate::mcp::error::ProviderError;

const REGISTRY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    node: NodeInfo,
    service: ServiceInfo,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeInfo {
    #[serde(default)]
    address: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceInfo {
    #[serde(default)]
    address: String,
    port: u16,
}

/// Picks the provider URL: the registry when enabled, otherwise the static base URL.
pub async fn resolve_base_url(http: &HttpConfig) -> Result<String, ProviderError> {
    if http.consul.enable {
        return discover(&http.consul).await;
    }
    if http.base_url.trim().is_empty() {
        return Err(ProviderError::Config(
            "http.base_url empty and consul disabled".into(),
        ));
    }
    Ok(http.base_url.trim().to_string())
}

fn registry_endpoint(address: &str, service: &str) -> String {
    let address = address.trim().trim_end_matches('/');
    let base = if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{address}")
    };
    format!("{base}/v1/health/service/{service}")
}

/// Queries the Consul health API for passing instances of the configured
/// service and builds a URL from the first one returned.
pub async fn discover(cfg: &ConsulConfig) -> Result<String, ProviderError> {
    if cfg.address.trim().is_empty() || cfg.service.trim().is_empty() {
        return Err(ProviderError::Discovery(
            "consul.address or consul.service is empty".into(),
        ));
    }

    let url = registry_endpoint(&cfg.address, cfg.service.trim());
    let mut query: Vec<(&str, &str)> = vec![("passing", "true")];
    if let Some(tag) = &cfg.tag {
        query.push(("tag", tag.as_str()));
    }
    if let Some(dc) = &cfg.datacenter {
        query.push(("dc", dc.as_str()));
    }

    let client = reqwest::Client::builder()
        .timeout(REGISTRY_TIMEOUT)
        .build()
        .map_err(|e| ProviderError::Discovery(format!("consul client: {e}")))?;
    let mut req = client.get(&url).query(&query);
    if let Some(token) = &cfg.token {
        req = req.header("X-Consul-Token", token);
    }

    debug!(%url, service = %cfg.service, "querying consul");
    let resp = req
        .send()
        .await
        .map_err(|e| ProviderError::Discovery(format!("consul discover: {e}")))?;
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(ProviderError::Discovery(format!(
            "consul discover: {status} - {text}"
        )));
    }
    let entries: Vec<HealthEntry> = resp
        .json()
        .await
        .map_err(|e| ProviderError::Discovery(format!("consul response: {e}")))?;

    let Some(inst) = entries.into_iter().next() else {
        return Err(ProviderError::Discovery(format!(
            "consul: no healthy instances for {}",
            cfg.service
        )));
    };

    let host = if inst.service.address.is_empty() {
        inst.node.address
    } else {
        inst.service.address
    };
    if host.is_empty() {
        return Err(ProviderError::Discovery(format!(
            "consul: instance of {} has no address",
            cfg.service
        )));
    }

    let resolved = format!("{}://{}:{}{}", cfg.scheme, host, inst.service.port, cfg.path);
    info!(service = %cfg.service, url = %resolved, "discovered mcp provider");
    Ok(resolved)
}
