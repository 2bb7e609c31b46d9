use super::adapter::promptbundle_to_messages_and_text;
use super::{PromptBundle, TokenBudget};
use crate::{BobError, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Configuration for LlmClient loaded from environment variables
#[derive(Debug, Clone)]
pub struct LlmClientConfig {
    pub base_url: String, // e.g., http://localhost:8000/v1
    pub model: String,
    pub api_key: Option<String>,
    pub request_timeout_ms: u64,
    pub temperature: f32,
}

impl Default for LlmClientConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("VLLM_BASE_URL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "http://localhost:8000/v1".to_string()),
            model: std::env::var("VLLM_MODEL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "qwen2.5-0.5b-instruct".to_string()),
            api_key: std::env::var("VLLM_API_KEY").ok().filter(|s| !s.is_empty()),
            request_timeout_ms: std::env::var("REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(30_000),
            temperature: std::env::var("VLLM_TEMPERATURE")
                .ok()
                .and_then(|v| v.parse::<f32>().ok())
                .unwrap_or(0.7),
        }
    }
}

/// Assistant text plus whatever the backend reported about the call
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmResponse {
    pub text: String,
    pub model: Option<String>,
    pub provider: Option<String>, // "responses" or "chat.completions"
    pub usage: Option<serde_json::Value>,
}

/// HTTP client that prefers the OpenAI Responses API and falls back to Chat Completions
#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    cfg: LlmClientConfig,
}

impl LlmClient {
    pub fn new(cfg: LlmClientConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()
            .map_err(|e| BobError::LlmError(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { http, cfg })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(LlmClientConfig::default())
    }

    pub fn config(&self) -> &LlmClientConfig {
        &self.cfg
    }

    /// Generate a completion for the given prompt bundle.
    ///
    /// The Responses API is tried first; a 404, a transport error or an unparseable
    /// body falls through to Chat Completions, whose failure is returned as-is.
    pub async fn generate(
        &self,
        bundle: &PromptBundle,
        budget: Option<TokenBudget>,
    ) -> Result<LlmResponse> {
        let budget = budget.unwrap_or_default();
        let (messages, input_text) = promptbundle_to_messages_and_text(bundle, budget);

        if let Some(resp) = self.try_responses(&input_text, budget).await? {
            return Ok(resp);
        }
        self.chat_completions(messages, budget).await
    }

    async fn try_responses(
        &self,
        input_text: &str,
        budget: TokenBudget,
    ) -> Result<Option<LlmResponse>> {
        let url = format!("{}/responses", self.cfg.base_url.trim_end_matches('/'));
        debug!(target: "llm_client", "POST {} via Responses API", url);

        let mut req = self.http.post(&url).header("content-type", "application/json");
        if let Some(key) = &self.cfg.api_key {
            req = req.bearer_auth(key);
        }
        let body = json!({
            "model": self.cfg.model,
            "input": input_text,
            "max_output_tokens": budget.max_output_tokens as u32,
            "temperature": self.cfg.temperature,
        });

        let resp = match req.json(&body).send().await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(target: "llm_client", error = %err, "Responses API request failed; trying chat.completions fallback");
                return Ok(None);
            }
        };

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(target: "llm_client", %status, body = %body, "Responses API error; trying chat.completions fallback");
            return Ok(None);
        }

        let val: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BobError::LlmError(format!("Failed to parse Responses JSON: {e}")))?;
        Ok(extract_text_from_responses(&val).map(|text| LlmResponse {
            text,
            model: model_of(&val),
            provider: Some("responses".to_string()),
            usage: val.get("usage").cloned(),
        }))
    }

    async fn chat_completions(
        &self,
        messages: Vec<serde_json::Value>,
        budget: TokenBudget,
    ) -> Result<LlmResponse> {
        let url = format!(
            "{}/chat/completions",
            self.cfg.base_url.trim_end_matches('/')
        );
        debug!(target: "llm_client", "POST {} via Chat Completions", url);

        let mut req = self.http.post(&url).header("content-type", "application/json");
        if let Some(key) = &self.cfg.api_key {
            req = req.bearer_auth(key);
        }
        let body = json!({
            "model": self.cfg.model,
            "messages": messages,
            "max_tokens": budget.max_output_tokens as u32,
            "temperature": self.cfg.temperature,
        });

        let resp = req
            .json(&body)
            .send()
            .await
            .map_err(|e| BobError::LlmError(format!("Chat Completions HTTP error: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            error!(target: "llm_client", %status, body = %text, "Chat Completions error");
            return Err(BobError::LlmError(format!(
                "Chat Completions error: status={} body={}",
                status, text
            )));
        }

        let val: serde_json::Value = resp.json().await.map_err(|e| {
            BobError::LlmError(format!("Failed to parse Chat Completions JSON: {e}"))
        })?;
        let text = extract_text_from_chat_completions(&val).ok_or_else(|| {
            BobError::LlmError("Missing choices[0].message.content in chat completions".into())
        })?;
        Ok(LlmResponse {
            text,
            model: model_of(&val),
            provider: Some("chat.completions".to_string()),
            usage: val.get("usage").cloned(),
        })
    }
}

fn model_of(v: &serde_json::Value) -> Option<String> {
    v.get("model").and_then(|m| m.as_str()).map(|s| s.to_string())
}

fn extract_text_from_chat_completions(v: &serde_json::Value) -> Option<String> {
    v.get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
        .map(|s| s.to_string())
}

fn extract_text_from_responses(v: &serde_json::Value) -> Option<String> {
    if let Some(s) = v.get("output_text").and_then(|x| x.as_str()) {
        if !s.is_empty() {
            return Some(s.to_string());
        }
    }
    if let Some(items) = v.get("output").and_then(|x| x.as_array()) {
        let mut acc = String::new();
        for content in items
            .iter()
            .filter_map(|item| item.get("content").and_then(|c| c.as_array()))
            .flatten()
        {
            let text = content
                .get("text")
                .and_then(|t| t.get("value").or(Some(t)))
                .and_then(|t| t.as_str());
            if let Some(t) = text {
                acc.push_str(t);
            }
        }
        if !acc.is_empty() {
            return Some(acc);
        }
    }
    extract_text_from_chat_completions(v)
}
