//! Tolerant JSON extraction from model output.
//!
//! Stages ask the agent for structured reports, but the agent replies with
//! prose, fenced code blocks, or a bare JSON value depending on mood.
//! [`extract_json`] accepts all of the expected shapes and is idempotent:
//! extracting from the serialization of an extracted value yields the same
//! value. Only objects and arrays are accepted — a stray number or `true`
//! inside prose is never a structured report.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::JsonExtractError;

static FENCED_BLOCK_RE: Lazy<Regex> = Lazy::new(|| {
    // (?s) so the body may span lines; non-greedy so multiple blocks are
    // tried independently.
    Regex::new(r"(?s)```(?:json)?\s*(.*?)```").unwrap_or_else(|e| panic!("invalid regex: {e}"))
});

fn preview_of(text: &str) -> String {
    let trimmed = text.trim();
    let mut preview: String = trimmed.chars().take(80).collect();
    if trimmed.chars().count() > 80 {
        preview.push('…');
    }
    preview
}

fn parse_container(candidate: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(candidate.trim()) {
        Ok(v) if v.is_object() || v.is_array() => Some(v),
        _ => None,
    }
}

/// Parse exactly one JSON value starting at the head of `slice`, ignoring
/// whatever trails it. Used for objects embedded mid-prose.
fn parse_prefix(slice: &str) -> Option<Value> {
    let mut stream = serde_json::Deserializer::from_str(slice).into_iter::<Value>();
    match stream.next() {
        Some(Ok(v)) if v.is_object() || v.is_array() => Some(v),
        _ => None,
    }
}

/// Extract the first JSON object or array from `text`.
///
/// Tried in order: fenced code blocks (with or without a `json` language
/// tag), the whole trimmed text, then a scan for a value embedded in
/// surrounding prose. Non-JSON text fails with [`JsonExtractError`]; a
/// partial or truncated object is never returned.
///
/// # Errors
///
/// Returns [`JsonExtractError`] when no complete JSON object or array can
/// be found anywhere in the text.
pub fn extract_json(text: &str) -> Result<Value, JsonExtractError> {
    for caps in FENCED_BLOCK_RE.captures_iter(text) {
        if let Some(v) = caps.get(1).and_then(|m| parse_container(m.as_str())) {
            return Ok(v);
        }
    }

    if let Some(v) = parse_container(text) {
        return Ok(v);
    }

    for (idx, ch) in text.char_indices() {
        if ch == '{' || ch == '[' {
            if let Some(v) = parse_prefix(&text[idx..]) {
                return Ok(v);
            }
        }
    }

    Err(JsonExtractError {
        preview: preview_of(text),
    })
}

/// Extract and deserialize a typed report from model output.
///
/// # Errors
///
/// Returns [`JsonExtractError`] when no JSON value is found or the value
/// does not match the target shape.
pub fn extract_json_as<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, JsonExtractError> {
    let value = extract_json(text)?;
    serde_json::from_value(value).map_err(|_| JsonExtractError {
        preview: preview_of(text),
    })
}
