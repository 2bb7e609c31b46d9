//! LLM module: HTTP client and prompt adapter
//!
//! This module provides:
//! - `PromptBundle` / `TokenBudget`, the inputs of a generation call
//! - `LlmClientConfig`, `LlmClient`, `LlmResponse` for talking to OpenAI-compatible backends
//! - `promptbundle_to_messages_and_text` adapter for turning `PromptBundle` into payloads

mod adapter;
mod client;

pub use adapter::promptbundle_to_messages_and_text;
pub use client::{LlmClient, LlmClientConfig, LlmResponse};

use serde::{Deserialize, Serialize};

/// Token budget to control prompt assembly size
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenBudget {
    pub max_input_tokens: usize,
    pub max_output_tokens: usize,
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self {
            max_input_tokens: 2048,
            max_output_tokens: 256,
        }
    }
}

/// A bundle of prompt components for an LLM call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptBundle {
    pub system: String,
    pub instructions: String,
    pub context_docs: Vec<String>,
    pub history: Vec<String>,
}
