//! Transformation service boundary and the OpenRouter chat client.
//!
//! A service turns `(instructions, payload)` into raw text. Parsing and
//! schema validation belong to the stage that asked.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};
use url::Url;

use newsfeed_shared::{NewsfeedError, Result, StageName, TransformConfig};

/// User-Agent string for service requests.
const USER_AGENT: &str = concat!("newsfeed/", env!("CARGO_PKG_VERSION"));

static FENCED_JSON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").expect("static regex"));

// ---------------------------------------------------------------------------
// Boundary
// ---------------------------------------------------------------------------

/// One transform call.
#[derive(Debug, Clone)]
pub struct TransformRequest {
    pub stage: StageName,
    pub instructions: String,
    pub payload: serde_json::Value,
}

impl TransformRequest {
    /// Cache key over stage, instructions, and payload.
    pub fn prompt_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.stage.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.instructions.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.payload.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// An LLM-like backend producing structured text.
#[async_trait]
pub trait TransformService: Send + Sync {
    /// Model identifier, part of the cache key.
    fn model_id(&self) -> &str;

    async fn transform(&self, request: &TransformRequest) -> Result<String>;
}

// ---------------------------------------------------------------------------
// OpenRouter
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// OpenAI-compatible chat completions over OpenRouter.
pub struct OpenRouterService {
    client: Client,
    endpoint: Url,
    api_key: String,
    model: String,
    temperature: f32,
}

impl OpenRouterService {
    pub fn new(config: &TransformConfig, api_key: String, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(&config.endpoint).map_err(|e| {
            NewsfeedError::config(format!(
                "invalid transform endpoint '{}': {e}",
                config.endpoint
            ))
        })?;
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| NewsfeedError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl TransformService for OpenRouterService {
    fn model_id(&self) -> &str {
        &self.model
    }

    #[instrument(skip_all, fields(stage = %request.stage, model = %self.model))]
    async fn transform(&self, request: &TransformRequest) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": request.instructions },
                { "role": "user", "content": request.payload.to_string() },
            ],
        });

        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| NewsfeedError::service_transient(format!("openrouter request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let msg = format!("openrouter HTTP {status}: {}", detail.trim());
            return Err(
                if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                    NewsfeedError::service_transient(msg)
                } else {
                    NewsfeedError::service_fatal(msg)
                },
            );
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| NewsfeedError::service_fatal(format!("openrouter response: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| NewsfeedError::service_transient("openrouter returned no content"))?;

        debug!(chars = content.len(), "transform complete");
        Ok(content)
    }
}

// ---------------------------------------------------------------------------
// Output parsing
// ---------------------------------------------------------------------------

/// Pull a JSON value out of model output, tolerating code fences and
/// surrounding prose.
pub fn extract_json(raw: &str) -> Result<serde_json::Value> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    if let Some(caps) = FENCED_JSON_RE.captures(trimmed) {
        if let Ok(value) = serde_json::from_str(&caps[1]) {
            return Ok(value);
        }
    }

    let start = trimmed.find(['{', '[']);
    let end = trimmed.rfind(['}', ']']);
    if let (Some(s), Some(e)) = (start, end) {
        if s < e {
            if let Ok(value) = serde_json::from_str(&trimmed[s..=e]) {
                return Ok(value);
            }
        }
    }

    Err(NewsfeedError::validation(format!(
        "output is not JSON: {}",
        trimmed.chars().take(80).collect::<String>()
    )))
}
