//! Token usage extraction from agent response metadata.

use std::collections::HashMap;

use forgeline_core::types::TokenUsage;
use serde_json::Value;

/// Field names providers use for input and output token counts.
const INPUT_KEYS: &[&str] = &["input_tokens", "prompt_tokens", "promptTokenCount"];
const OUTPUT_KEYS: &[&str] = &["output_tokens", "completion_tokens", "candidatesTokenCount"];

fn first_u64(object: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|key| object.get(*key).and_then(Value::as_u64))
}

/// Extract reported token usage from response metadata.
///
/// Understands a nested `usage` object in Anthropic, OpenAI or Gemini
/// naming, and a flat `tokens_used` count. Returns `None` when the provider
/// reported nothing.
#[must_use]
pub fn usage_from_metadata(metadata: &HashMap<String, Value>) -> Option<TokenUsage> {
    if let Some(usage) = metadata.get("usage").and_then(Value::as_object) {
        let input = first_u64(usage, INPUT_KEYS);
        let output = first_u64(usage, OUTPUT_KEYS);
        if input.is_some() || output.is_some() {
            return Some(TokenUsage {
                input_tokens: input.unwrap_or(0),
                output_tokens: output.unwrap_or(0),
                cache_read_tokens: usage
                    .get("cache_read_input_tokens")
                    .and_then(Value::as_u64),
                cache_write_tokens: usage
                    .get("cache_creation_input_tokens")
                    .and_then(Value::as_u64),
            });
        }
    }

    metadata
        .get("tokens_used")
        .and_then(Value::as_u64)
        .map(|total| TokenUsage {
            input_tokens: total,
            ..TokenUsage::default()
        })
}

/// Total reported tokens, if any.
#[must_use]
pub fn tokens_from_metadata(metadata: &HashMap<String, Value>) -> Option<u64> {
    usage_from_metadata(metadata).map(|usage| usage.total())
}
