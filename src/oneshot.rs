//! Rewrites a complete (non-streaming) upstream response so that structured
//! tool calls become XML inside the message text.

use crate::convert::{PendingToolCall, ToolConverter};
use serde_json::{json, Value};

/// Number of choices whose tool calls were folded into their content.
pub fn translate_response(response: &mut Value, converter: &ToolConverter) -> usize {
    let choices = match response.get_mut("choices").and_then(|c| c.as_array_mut()) {
        Some(c) => c,
        None => return 0,
    };

    let mut translated = 0;
    for choice in choices {
        let message = match choice.get_mut("message") {
            Some(m) => m,
            None => continue,
        };
        let calls = pending_calls(message);
        if calls.is_empty() {
            continue;
        }

        let xml = converter.convert_batch(
            calls
                .iter()
                .enumerate()
                .map(|(index, call)| (index as u32, call)),
        );
        let mut content = match message.get("content") {
            Some(Value::String(s)) => s.clone(),
            _ => String::new(),
        };
        content.push_str(&xml);

        tracing::info!(
            "[⚙️  -> 🖱️ ] Folded {} tool call(s) into message content",
            calls.len()
        );
        *message = json!({ "role": "assistant", "content": content });
        choice["finish_reason"] = json!("stop");
        translated += 1;
    }
    translated
}

fn pending_calls(message: &Value) -> Vec<PendingToolCall> {
    let calls = match message.get("tool_calls").and_then(|tc| tc.as_array()) {
        Some(calls) => calls,
        None => return Vec::new(),
    };
    calls
        .iter()
        .map(|call| {
            let function = call.get("function");
            let name = function
                .and_then(|f| f.get("name"))
                .and_then(|n| n.as_str())
                .unwrap_or_default();
            let arguments = match function.and_then(|f| f.get("arguments")) {
                Some(Value::String(s)) => s.clone(),
                // Some servers send the arguments already decoded.
                Some(Value::Object(obj)) => Value::Object(obj.clone()).to_string(),
                _ => String::new(),
            };
            PendingToolCall::new(name, arguments)
        })
        .collect()
}
