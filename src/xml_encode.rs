//! Rendering of tool calls as the client's XML vocabulary.
//!
//! Output uses elements only (never attributes), so escaping covers `&`, `<`
//! and `>` and nothing else.

use crate::constants::{FOLLOWUP_TAG, MCP_WRAPPER_TAG};
use serde_json::{Map, Value};
use std::borrow::Cow;

pub fn xml_escape(s: &str) -> Cow<'_, str> {
    if !s.contains(['&', '<', '>']) {
        return Cow::Borrowed(s);
    }
    let mut out = String::with_capacity(s.len() + 8);
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

fn scalar_text(value: &Value) -> Cow<'_, str> {
    match value {
        Value::String(s) => Cow::Borrowed(s.as_str()),
        Value::Null => Cow::Borrowed(""),
        Value::Bool(_) | Value::Number(_) => Cow::Owned(value.to_string()),
        Value::Array(_) | Value::Object(_) => Cow::Owned(value.to_string()),
    }
}

/// Parses argument text into an object. Blank text is an empty object; anything
/// that is not a JSON object is logged and treated as empty.
pub fn parse_arguments(tag: &str, arguments_json: &str) -> Map<String, Value> {
    if arguments_json.trim().is_empty() {
        return Map::new();
    }
    match serde_json::from_str::<Value>(arguments_json) {
        Ok(Value::Object(obj)) => obj,
        Ok(other) => {
            tracing::warn!(
                "Arguments for tool '{}' are not a JSON object: {}",
                tag,
                crate::str_utils::first_n_chars_lossy(&other.to_string(), 200)
            );
            Map::new()
        }
        Err(e) => {
            tracing::warn!(
                "Arguments JSON parse failed for tool '{}': {} ({})",
                tag,
                crate::str_utils::first_n_chars_lossy(arguments_json, 200),
                e
            );
            Map::new()
        }
    }
}

fn push_element(out: &mut String, key: &str, value: &Value) {
    out.push('<');
    out.push_str(key);
    out.push('>');
    out.push_str(&xml_escape(&scalar_text(value)));
    out.push_str("</");
    out.push_str(key);
    out.push('>');
}

/// `<tag><k>v</k>...</tag>`. Keys named in `parameter_order` come first, the
/// rest follow in the order they appear in the arguments.
pub fn encode_direct(tag: &str, arguments_json: &str, parameter_order: &[&str]) -> String {
    let args = parse_arguments(tag, arguments_json);

    let mut out = String::new();
    out.push('<');
    out.push_str(tag);
    out.push('>');

    for key in parameter_order {
        if let Some(value) = args.get(*key) {
            push_element(&mut out, key, value);
        }
    }
    for (key, value) in &args {
        if !parameter_order.contains(&key.as_str()) {
            push_element(&mut out, key, value);
        }
    }

    out.push_str("</");
    out.push_str(tag);
    out.push('>');
    out
}

/// Indirection tag for tools without a canonical mapping. The arguments are
/// carried verbatim as text (`{}` when absent).
pub fn encode_wrapped(server_name: &str, tool_name: &str, arguments_json: &str) -> String {
    let arguments = if arguments_json.is_empty() {
        "{}"
    } else {
        arguments_json
    };
    format!(
        "<{tag}><server_name>{}</server_name><tool_name>{}</tool_name><arguments>{}</arguments></{tag}>",
        xml_escape(server_name),
        xml_escape(tool_name),
        xml_escape(arguments),
        tag = MCP_WRAPPER_TAG,
    )
}

pub fn clarifying_question(question: &str) -> String {
    format!(
        "<{tag}><question>{}</question></{tag}>",
        xml_escape(question),
        tag = FOLLOWUP_TAG,
    )
}
