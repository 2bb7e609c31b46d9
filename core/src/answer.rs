//! Answer Service: turns a user query into a spoken-friendly text answer
//!
//! `LlmAnswerService` grounds the query with a few web search results (when
//! enabled) and asks an OpenAI-compatible backend for a short reply.

use crate::llm::{LlmClient, PromptBundle, TokenBudget};
use crate::providers::{WebSearchConfig, WebSearchProvider};
use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Bob, a helpful voice assistant. You can answer questions about any topic \
including general knowledge, current events, weather, technology and calculations. \
Provide clear, concise and helpful responses that are suitable for voice output. \
Keep your responses conversational and easy to understand when spoken aloud. \
Limit responses to 2-3 sentences.";

/// Failure of a single answer request
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnswerError {
    #[error("{0}")]
    Backend(String),

    #[error("the assistant returned an empty answer")]
    Empty,

    #[error("no answer within {0} ms")]
    Timeout(u64),
}

impl AnswerError {
    /// Text spoken back to the user in place of an answer
    pub fn apology(&self) -> String {
        format!("Sorry, I encountered an error: {}", self)
    }
}

impl From<crate::BobError> for AnswerError {
    fn from(e: crate::BobError) -> Self {
        AnswerError::Backend(e.to_string())
    }
}

/// Anything that can answer a text query; may be slow and may fail.
#[async_trait]
pub trait AnswerService: Send + Sync {
    async fn answer(&self, query: &str) -> Result<String, AnswerError>;
}

#[derive(Debug, Clone)]
pub struct LlmAnswerServiceConfig {
    pub system_prompt: String,
    pub web_search: bool,
    pub search_results: usize,
    pub budget: TokenBudget,
}

impl Default for LlmAnswerServiceConfig {
    fn default() -> Self {
        Self {
            system_prompt: std::env::var("VOICE_SYSTEM_PROMPT")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            web_search: std::env::var("WEB_SEARCH_ENABLED")
                .ok()
                .map(|s| matches!(s.as_str(), "1" | "true" | "TRUE" | "yes" | "on"))
                .unwrap_or(true),
            search_results: 3,
            budget: TokenBudget::default(),
        }
    }
}

pub struct LlmAnswerService {
    client: LlmClient,
    search: Option<WebSearchProvider>,
    cfg: LlmAnswerServiceConfig,
}

impl LlmAnswerService {
    pub fn new(client: LlmClient, cfg: LlmAnswerServiceConfig) -> Self {
        let search = cfg
            .web_search
            .then(|| WebSearchProvider::with_config(WebSearchConfig::default()));
        Self {
            client,
            search,
            cfg,
        }
    }

    pub fn with_search(mut self, search: Option<WebSearchProvider>) -> Self {
        self.search = search;
        self
    }

    pub fn from_env() -> crate::Result<Self> {
        Ok(Self::new(
            LlmClient::from_env()?,
            LlmAnswerServiceConfig::default(),
        ))
    }

    /// Assemble the prompt for `query` with any gathered search context
    pub fn bundle_for(&self, query: &str, context_docs: Vec<String>) -> PromptBundle {
        PromptBundle {
            system: self.cfg.system_prompt.clone(),
            instructions: query.trim().to_string(),
            context_docs,
            history: Vec::new(),
        }
    }

    async fn gather_context(&self, query: &str) -> Vec<String> {
        let Some(search) = &self.search else {
            return Vec::new();
        };
        match search.search(query, self.cfg.search_results).await {
            Ok(results) => {
                debug!(target: "answer", count = results.len(), "Web search context gathered");
                results.iter().map(|r| r.as_context_line()).collect()
            }
            Err(e) => {
                warn!(target: "answer", error = %e, "Web search failed; answering without it");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl AnswerService for LlmAnswerService {
    async fn answer(&self, query: &str) -> Result<String, AnswerError> {
        let context_docs = self.gather_context(query).await;
        let bundle = self.bundle_for(query, context_docs);

        let resp = self.client.generate(&bundle, Some(self.cfg.budget)).await?;
        let text = resp.text.trim().to_string();
        if text.is_empty() {
            return Err(AnswerError::Empty);
        }
        info!(target: "answer", model = ?resp.model, provider = ?resp.provider, "Answer generated");
        Ok(text)
    }
}
