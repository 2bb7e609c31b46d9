use super::{PromptBundle, TokenBudget};
use serde_json::json;

// Approximate token->char ratio
const CHARS_PER_TOKEN: usize = 4;

/// Convert a PromptBundle into chat messages plus one fused text for the Responses API.
///
/// Oldest history turns are dropped first when the bundle exceeds the input budget;
/// the instructions are truncated only as a last resort.
pub fn promptbundle_to_messages_and_text(
    bundle: &PromptBundle,
    budget: TokenBudget,
) -> (Vec<serde_json::Value>, String) {
    let char_budget = budget.max_input_tokens.saturating_mul(CHARS_PER_TOKEN);

    let context_block = if bundle.context_docs.is_empty() {
        String::new()
    } else {
        let mut block = String::from("Web results:\n");
        for doc in &bundle.context_docs {
            block.push_str("- ");
            block.push_str(doc);
            block.push('\n');
        }
        block
    };

    let fixed_len = bundle.system.chars().count() + context_block.chars().count();
    let mut history: &[String] = &bundle.history;
    let history_len = |h: &[String]| h.iter().map(|s| s.chars().count()).sum::<usize>();
    while !history.is_empty()
        && fixed_len + history_len(history) + bundle.instructions.chars().count() > char_budget
    {
        history = &history[1..];
    }

    let allowed = char_budget.saturating_sub(fixed_len + history_len(history));
    let instructions: String = bundle.instructions.chars().take(allowed).collect();

    let mut messages = Vec::new();
    if !bundle.system.is_empty() {
        messages.push(json!({"role": "system", "content": bundle.system}));
    }
    if !context_block.is_empty() {
        messages.push(json!({"role": "system", "content": context_block}));
    }
    for turn in history {
        messages.push(json!({"role": "user", "content": turn}));
    }
    if !instructions.is_empty() {
        messages.push(json!({"role": "user", "content": instructions}));
    }

    let mut fused = String::new();
    if !bundle.system.is_empty() {
        fused.push_str("System:\n");
        fused.push_str(&bundle.system);
        fused.push_str("\n\n");
    }
    if !context_block.is_empty() {
        fused.push_str(&context_block);
        fused.push('\n');
    }
    if !history.is_empty() {
        fused.push_str("Earlier in this conversation:\n");
        for turn in history {
            fused.push_str("- ");
            fused.push_str(turn);
            fused.push('\n');
        }
        fused.push('\n');
    }
    if !instructions.is_empty() {
        fused.push_str("User:\n");
        fused.push_str(&instructions);
        fused.push('\n');
    }

    (messages, fused)
}
