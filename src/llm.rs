// =============================================================================
// LLM interface — the narrow seam the research agent talks through
// =============================================================================
//
// Model selection, provider quirks, and retries all live behind this trait.
// The research agent treats any failure as "signal unavailable" and degrades
// to HOLD; nothing above this seam knows which provider is configured.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

/// Options for one analysis call.
#[derive(Debug, Clone)]
pub struct LlmOptions {
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for LlmOptions {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            timeout: Duration::from_secs(10),
        }
    }
}

/// The model's answer.
#[derive(Debug, Clone)]
pub struct LlmAnalysis {
    pub text: String,
    /// Some providers return a usable confidence signal; most do not.
    pub confidence_hint: Option<f64>,
}

#[derive(Debug)]
pub struct LlmError(pub String);

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for LlmError {}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn analyze(&self, prompt: &str, opts: &LlmOptions) -> Result<LlmAnalysis, LlmError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation (chat-completions shape)
// ---------------------------------------------------------------------------

pub struct HttpLlmClient {
    endpoint: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl HttpLlmClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn analyze(&self, prompt: &str, opts: &LlmOptions) -> Result<LlmAnalysis, LlmError> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": opts.max_tokens,
            "messages": [{"role": "user", "content": prompt}],
        });

        let resp = self
            .client
            .post(&self.endpoint)
            .timeout(opts.timeout)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError(format!("llm request failed: {e}")))?;

        let status = resp.status();
        let payload: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| LlmError(format!("llm response parse failed: {e}")))?;

        if !status.is_success() {
            return Err(LlmError(format!("llm returned {status}: {payload}")));
        }

        let text = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| LlmError("llm response missing content".to_string()))?
            .to_string();

        debug!(model = %self.model, chars = text.len(), "llm analysis received");
        Ok(LlmAnalysis {
            text,
            confidence_hint: None,
        })
    }
}

impl std::fmt::Debug for HttpLlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpLlmClient")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Disabled client
// ---------------------------------------------------------------------------

/// Stands in when no LLM is configured: every call reports unavailable and
/// the research agent degrades on its own.
#[derive(Debug, Default)]
pub struct DisabledLlm;

#[async_trait]
impl LlmClient for DisabledLlm {
    async fn analyze(&self, _prompt: &str, _opts: &LlmOptions) -> Result<LlmAnalysis, LlmError> {
        Err(LlmError("llm disabled by configuration".to_string()))
    }
}
