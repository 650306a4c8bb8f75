//! Non-incremental tool-call extraction helpers.
//!
//! Some providers report completed tool calls only inside a terminal
//! payload. Extraction is idempotent: ids are taken from the payload or
//! synthesized from the call's position, never from random sources.
//!
//! Positional ids restart with every response, so a caller that drives
//! several responses in one turn scopes them with [`scope_call_id`].

use serde_json::{Map, Value, json};

use parley_core::types::ToolCall;

use crate::ProtocolAdapter;

/// Extract tool calls from a provider's terminal payload.
pub fn extract(adapter: &dyn ProtocolAdapter, payload: &Value) -> Vec<ToolCall> {
    adapter.extract_tool_calls(payload)
}

/// [`extract`] for the `round`-th response of a turn. Synthetic ids match
/// those of a [`StreamParser::for_round`](crate::parser::StreamParser::for_round)
/// parser on the same round.
pub fn extract_for_round(adapter: &dyn ProtocolAdapter, payload: &Value, round: u32) -> Vec<ToolCall> {
    adapter
        .extract_tool_calls(payload)
        .into_iter()
        .map(|mut call| {
            call.id = scope_call_id(&call.id, round);
            call
        })
        .collect()
}

/// Normalize a provider's argument representation to a JSON object.
///
/// Accepts an object, a JSON-encoded string, or nothing. Empty or absent
/// arguments default to `{}`; unparseable strings are kept under `_raw` so
/// validation reports the missing fields instead of dropping the call.
pub fn parse_arguments(raw: Option<&Value>) -> Value {
    match raw {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(Value::String(s)) if s.trim().is_empty() => Value::Object(Map::new()),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Null) => Value::Object(Map::new()),
            Ok(v) => v,
            Err(_) => json!({ "_raw": s }),
        },
        Some(other) => other.clone(),
    }
}

/// Serialize arguments for wire formats that carry them as a JSON string.
pub fn arguments_string(arguments: &Value) -> String {
    if arguments.is_null() {
        "{}".to_string()
    } else {
        arguments.to_string()
    }
}

const SYNTHETIC_PREFIXES: [&str; 5] = ["openai", "responses", "anthropic", "gemini", "mistral"];

/// Deterministic id for a call the provider did not name.
pub fn synthetic_call_id(prefix: &str, position: usize) -> String {
    format!("{prefix}_call_{position}")
}

/// Whether `id` came from [`synthetic_call_id`] rather than the provider.
pub fn is_synthetic_call_id(id: &str) -> bool {
    id.split_once("_call_").is_some_and(|(prefix, position)| {
        SYNTHETIC_PREFIXES.contains(&prefix)
            && !position.is_empty()
            && position.bytes().all(|b| b.is_ascii_digit())
    })
}

/// Namespace a synthetic id by response round (`gemini_call_1` becomes
/// `gemini_call_r2_1` on round 2). Provider-supplied ids pass through.
pub fn scope_call_id(id: &str, round: u32) -> String {
    match id.split_once("_call_") {
        Some((prefix, position)) if is_synthetic_call_id(id) => {
            format!("{prefix}_call_r{round}_{position}")
        }
        _ => id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arguments_defaults_to_empty_object() {
        assert_eq!(parse_arguments(None), json!({}));
        assert_eq!(parse_arguments(Some(&Value::Null)), json!({}));
        assert_eq!(parse_arguments(Some(&json!(""))), json!({}));
        assert_eq!(parse_arguments(Some(&json!("  "))), json!({}));
    }

    #[test]
    fn test_parse_arguments_string_and_object() {
        assert_eq!(parse_arguments(Some(&json!(r#"{"a":1}"#))), json!({"a": 1}));
        assert_eq!(parse_arguments(Some(&json!({"b": 2}))), json!({"b": 2}));
        assert_eq!(parse_arguments(Some(&json!("{bad"))), json!({"_raw": "{bad"}));
    }

    #[test]
    fn test_synthetic_ids_are_positional() {
        assert_eq!(synthetic_call_id("gemini", 1), "gemini_call_1");
        assert_eq!(synthetic_call_id("gemini", 1), synthetic_call_id("gemini", 1));
    }

    #[test]
    fn test_scoped_ids_differ_between_rounds() {
        assert_eq!(scope_call_id("gemini_call_1", 1), "gemini_call_r1_1");
        assert_eq!(scope_call_id("mistral_call_3", 2), "mistral_call_r2_3");
        assert_ne!(scope_call_id("gemini_call_1", 1), scope_call_id("gemini_call_1", 2));
    }

    #[test]
    fn test_provider_ids_are_not_scoped() {
        for id in ["call_abc123", "toolu_01XYZ", "fc_1", "custom_call_x", "gemini_call_", ""] {
            assert!(!is_synthetic_call_id(id), "{id}");
            assert_eq!(scope_call_id(id, 4), id);
        }
        assert!(is_synthetic_call_id("anthropic_call_12"));
    }
}
