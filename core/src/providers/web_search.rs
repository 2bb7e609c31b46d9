/// Web search used to ground answers in current information
///
/// Uses the DuckDuckGo Instant Answer API; the endpoint is configurable so tests
/// and self-hosted proxies can stand in for it.
use crate::{BobError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for web search provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSearchConfig {
    /// API endpoint (default: DuckDuckGo)
    pub api_endpoint: String,
    /// Timeout for API requests in milliseconds
    pub timeout_ms: u64,
    /// User agent string
    pub user_agent: String,
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            api_endpoint: std::env::var("WEB_SEARCH_ENDPOINT")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "https://api.duckduckgo.com/".to_string()),
            timeout_ms: std::env::var("WEB_SEARCH_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(10_000),
            user_agent: "bob-voice-assistant/0.1".to_string(),
        }
    }
}

/// Search result item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: Option<String>,
}

impl SearchResult {
    /// One-line rendering used as LLM context
    pub fn as_context_line(&self) -> String {
        match &self.snippet {
            Some(snippet) => format!("{}: {} ({})", self.title, snippet, self.url),
            None => format!("{} ({})", self.title, self.url),
        }
    }
}

/// DuckDuckGo API response structure
#[derive(Debug, Deserialize)]
struct DuckDuckGoResponse {
    #[serde(rename = "AbstractText", default)]
    abstract_text: String,
    #[serde(rename = "AbstractURL", default)]
    abstract_url: String,
    #[serde(rename = "RelatedTopics", default)]
    related_topics: Vec<RelatedTopic>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RelatedTopic {
    Result {
        #[serde(rename = "Text")]
        text: String,
        #[serde(rename = "FirstURL")]
        first_url: String,
    },
    Group {
        #[serde(rename = "Topics")]
        topics: Vec<RelatedTopic>,
    },
}

pub struct WebSearchProvider {
    config: WebSearchConfig,
    http_client: reqwest::Client,
}

impl WebSearchProvider {
    pub fn new() -> Self {
        Self::with_config(WebSearchConfig::default())
    }

    pub fn with_config(config: WebSearchConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(&config.user_agent)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            config,
            http_client,
        }
    }

    /// Search and return at most `top_k` results
    pub async fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchResult>> {
        if query.trim().is_empty() {
            return Err(BobError::SearchError("Query cannot be empty".to_string()));
        }
        debug!(target: "web_search", query = %query, top_k = %top_k, "Performing DuckDuckGo search");

        let response = self
            .http_client
            .get(&self.config.api_endpoint)
            .query(&[("q", query), ("format", "json"), ("no_html", "1")])
            .send()
            .await
            .map_err(|e| {
                warn!(target: "web_search", error = %e, "DuckDuckGo API request failed");
                BobError::SearchError(format!("Search API request failed: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            warn!(target: "web_search", status = %status, "DuckDuckGo API returned error");
            return Err(BobError::SearchError(format!(
                "Search API returned status: {}",
                status
            )));
        }

        let body: DuckDuckGoResponse = response.json().await.map_err(|e| {
            warn!(target: "web_search", error = %e, "Failed to parse DuckDuckGo response");
            BobError::SearchError(format!("Failed to parse search response: {}", e))
        })?;

        Ok(collect_results(body, query, top_k))
    }
}

impl Default for WebSearchProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn collect_results(body: DuckDuckGoResponse, query: &str, top_k: usize) -> Vec<SearchResult> {
    let mut results = Vec::new();
    if top_k == 0 {
        return results;
    }

    if !body.abstract_text.is_empty() {
        results.push(SearchResult {
            title: "Summary".to_string(),
            url: body.abstract_url,
            snippet: Some(body.abstract_text),
        });
    }

    fn flatten(topics: Vec<RelatedTopic>, results: &mut Vec<SearchResult>, limit: usize) {
        for topic in topics {
            if results.len() >= limit {
                break;
            }
            match topic {
                RelatedTopic::Result { text, first_url } => {
                    if !text.is_empty() && !first_url.is_empty() {
                        results.push(SearchResult {
                            title: text,
                            url: first_url,
                            snippet: None,
                        });
                    }
                }
                RelatedTopic::Group { topics } => flatten(topics, results, limit),
            }
        }
    }
    flatten(body.related_topics, &mut results, top_k);

    // Stub result so callers always have something to cite
    if results.is_empty() {
        results.push(SearchResult {
            title: format!("Search: {}", query),
            url: format!("https://duckduckgo.com/?q={}", query.replace(' ', "+")),
            snippet: Some("No detailed results available.".to_string()),
        });
    }

    results
}
