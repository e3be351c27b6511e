//! Best-effort extraction of a JSON object from free-form model output.
//!
//! Models are asked to answer in JSON but routinely wrap it in prose, use
//! single quotes, leave keys bare or add trailing commas. [`extract_object`]
//! takes the outermost `{...}` span; [`extract_object_with_repair`] also runs
//! one repair pass before giving up.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

lazy_static! {
    static ref OBJECT_SPAN: Regex = Regex::new(r"(?s)\{.*\}").unwrap();
    static ref BARE_KEY: Regex = Regex::new(r"([,{\s])(\w+)(\s*:)").unwrap();
    static ref TRAILING_COMMA: Regex = Regex::new(r",\s*([}\]])").unwrap();
    static ref NUMBER_TRAILING_COMMA: Regex = Regex::new(r"(\d+),(\s*[,}])").unwrap();
}

/// Why extraction produced nothing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("no JSON object in model output")]
    NoObject,
    #[error("malformed JSON object: {0}")]
    Malformed(String),
}

/// Greedy span from the first `{` to the last `}`.
pub fn object_span(raw: &str) -> Option<&str> {
    OBJECT_SPAN.find(raw).map(|m| m.as_str())
}

/// Strict parse of the outermost object span.
pub fn extract_object(raw: &str) -> Result<Map<String, Value>, ExtractError> {
    let span = object_span(raw).ok_or(ExtractError::NoObject)?;
    parse_object(span)
}

/// Strict parse, then one repair pass and a single retry.
pub fn extract_object_with_repair(raw: &str) -> Result<Map<String, Value>, ExtractError> {
    let span = object_span(raw).ok_or(ExtractError::NoObject)?;
    match parse_object(span) {
        Ok(object) => Ok(object),
        Err(_) => parse_object(&repair(span)),
    }
}

/// Quote normalisation, bare-key quoting and trailing-comma removal.
pub fn repair(span: &str) -> String {
    let fixed = span.replace('\'', "\"");
    let fixed = BARE_KEY.replace_all(&fixed, "${1}\"${2}\"${3}");
    let fixed = TRAILING_COMMA.replace_all(&fixed, "${1}");
    NUMBER_TRAILING_COMMA.replace_all(&fixed, "${1}${2}").into_owned()
}

fn parse_object(text: &str) -> Result<Map<String, Value>, ExtractError> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(ExtractError::Malformed(format!("expected object, got {}", other))),
        Err(e) => Err(ExtractError::Malformed(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    // ===== Span extraction =====

    #[test]
    fn test_span_is_greedy() {
        let raw = "Sure! {\"a\": {\"b\": 1}} and {\"c\": 2} done";
        assert_eq!(object_span(raw), Some("{\"a\": {\"b\": 1}} and {\"c\": 2}"));
        assert_eq!(object_span("no braces here"), None);
    }

    #[test]
    fn test_strict_parse_ignores_prose() {
        let raw = "結果です:\n{\"is_match\": true, \"operation\": \"list\"}\n以上";
        let object = extract_object(raw).unwrap();
        assert_eq!(object.get("operation"), Some(&json!("list")));
    }

    #[test]
    fn test_strict_parse_does_not_repair() {
        assert!(matches!(extract_object("{is_match: true}"), Err(ExtractError::Malformed(_))));
        assert_eq!(extract_object("nothing"), Err(ExtractError::NoObject));
    }

    #[test]
    fn test_errors_convert_into_anyhow() {
        let err: anyhow::Error = extract_object("[1, 2]").unwrap_err().into();
        assert_eq!(err.to_string(), "no JSON object in model output");

        let err = extract_object("{oops}").unwrap_err();
        assert!(err.to_string().starts_with("malformed JSON object: "));
    }

    // ===== Repair =====

    #[test]
    fn test_repair_mixed_quoting_and_trailing_comma() {
        let object = extract_object_with_repair("{is_true: true, 'note': 'ok',}").unwrap();
        assert_eq!(Value::Object(object), json!({"is_true": true, "note": "ok"}));
    }

    #[test]
    fn test_repair_trailing_comma_in_array() {
        let object = extract_object_with_repair("{\"steps\": [\"a\", \"b\",], \"confidence\": 80,}").unwrap();
        assert_eq!(object.get("steps"), Some(&json!(["a", "b"])));
        assert_eq!(object.get("confidence"), Some(&json!(80)));
    }

    #[test]
    fn test_repair_gives_up_on_garbage() {
        assert!(extract_object_with_repair("{this is : : not json").is_err());
        assert_eq!(extract_object_with_repair("plain text"), Err(ExtractError::NoObject));
    }

    proptest! {
        #[test]
        fn test_valid_objects_survive_repair_path(key in "[a-z]{1,8}", n in 0i64..1000) {
            let raw = format!("prefix {{\"{}\": {}}} suffix", key, n);
            let object = extract_object_with_repair(&raw).unwrap();
            prop_assert_eq!(object.get(&key), Some(&json!(n)));
        }
    }
}
