use anyhow::Result;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, RETRY_AFTER};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{LlmConfig, ModelConfig};
use crate::llm::types::{ChatMessage, ChatRequest, ToolDef};
use crate::llm::{LlmErrorKind, classify_error};

/// OpenAI-compatible chat-completions client (works against Ollama's `/v1`).
#[derive(Debug, Clone)]
pub struct OpenAIClient {
    pub base_url: String,
    pub api_key: Option<String>,
    pub(crate) inner: reqwest::Client,
    pub llm_cfg: LlmConfig,
    pub model: ModelConfig,
}

impl OpenAIClient {
    pub fn new(model: ModelConfig) -> Result<Self> {
        let inner = reqwest::Client::builder().build()?;
        Ok(Self {
            base_url: model.base_url.clone(),
            api_key: model.api_key.clone(),
            inner,
            llm_cfg: LlmConfig::default(),
            model,
        })
    }

    pub fn with_llm_config(mut self, cfg: LlmConfig) -> Self {
        // `timeout` bounds the whole request, streamed body included, so it caps
        // the length of one completion. No per-read timeout is set.
        let builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
            .timeout(Duration::from_millis(cfg.request_timeout_ms));
        if let Ok(c) = builder.build() {
            self.inner = c;
        }
        self.llm_cfg = cfg;
        self
    }

    pub(crate) fn endpoint(&self) -> String {
        let mut base = self.base_url.trim_end_matches('/').to_string();
        if let Some(pos) = base.rfind("/v1") {
            base.truncate(pos);
            base = base.trim_end_matches('/').to_string();
        }
        format!("{base}/v1/chat/completions")
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty())
            && let Ok(value) = HeaderValue::from_str(&format!("Bearer {key}"))
        {
            headers.insert(AUTHORIZATION, value);
        }
        headers
    }

    pub(crate) fn build_request(&self, messages: Vec<ChatMessage>, tools: &[ToolDef]) -> ChatRequest {
        ChatRequest {
            model: self.model.model.clone(),
            messages,
            tools: tools.to_vec(),
            temperature: self.model.temperature,
            top_p: self.model.top_p,
            top_k: self.model.top_k,
            max_tokens: self.model.max_tokens,
            stream: Some(true),
            extra: self.model.extra.clone(),
        }
    }

    /// Sends a streaming request and returns the response once the backend
    /// accepted it. Only establishing the stream is retried, never mid-stream reads.
    pub(crate) async fn open_stream(
        &self,
        req: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        let url = self.endpoint();
        let headers = self.headers();

        if let Ok(payload) = serde_json::to_string(req) {
            debug!(payload=%payload, endpoint=%url, "sending chat.completions payload (stream)");
        }

        let max_attempts = self.llm_cfg.max_retries.saturating_add(1);
        let mut attempt = 1usize;
        loop {
            let fut = self
                .inner
                .post(url.clone())
                .headers(headers.clone())
                .json(req)
                .send();

            let resp_res = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("chat_stream cancelled before send");
                    return Err(anyhow::anyhow!(LlmErrorKind::Cancelled));
                }
                res = fut => res,
            };

            let (err, retry_after) = match resp_res {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    let retry_after = resp
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|h| h.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok());
                    let text = resp.text().await.unwrap_or_default();
                    let e = anyhow::anyhow!("chat error: {} - {}", status, text);
                    let kind = classify_error(Some(status), &e);
                    if !should_retry(&kind) || attempt >= max_attempts {
                        return Err(e.context(kind));
                    }
                    info!(attempt, status=%status.as_u16(), "retrying stream establish after HTTP error");
                    (e, retry_after)
                }
                Err(e) => {
                    let e = anyhow::Error::new(e).context("send chat request (stream)");
                    let kind = classify_error(None, &e);
                    if !should_retry(&kind) || attempt >= max_attempts {
                        return Err(e.context(kind));
                    }
                    warn!(attempt, err=%e, "retrying stream establish after error");
                    (e, None)
                }
            };

            let wait = self.backoff_delay(attempt, retry_after);
            debug!(attempt, last_err=%err, wait_ms=%wait.as_millis(), "backing off");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("chat_stream cancelled during retry sleep");
                    return Err(anyhow::anyhow!(LlmErrorKind::Cancelled));
                }
                _ = tokio::time::sleep(wait) => {}
            }
            attempt += 1;
        }
    }

    pub(crate) fn backoff_delay(&self, attempt: usize, retry_after_secs: Option<u64>) -> Duration {
        if self.llm_cfg.respect_retry_after
            && let Some(secs) = retry_after_secs
        {
            return Duration::from_secs(secs);
        }
        let base = self.llm_cfg.retry_base_ms;
        let shift = (attempt.saturating_sub(1)).min(16) as u32;
        let exp = base.saturating_mul(1u64 << shift);
        let jitter = self.llm_cfg.retry_jitter_ms;
        let rnd = if jitter == 0 {
            0
        } else {
            fastrand::u64(0..=jitter)
        };
        Duration::from_millis(exp.saturating_add(rnd))
    }
}

pub(crate) fn should_retry(kind: &LlmErrorKind) -> bool {
    matches!(
        kind,
        LlmErrorKind::RateLimited
            | LlmErrorKind::Server
            | LlmErrorKind::Network
            | LlmErrorKind::Timeout
    )
}
