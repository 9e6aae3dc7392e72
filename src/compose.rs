//! Builds the outbound request body from the client's request and operator
//! configuration, and derives the per-turn [`TurnContext`].

use crate::aliases::ToolResolver;
use crate::constants::{
    ACT_MODE_MARKER, CLIENT_SAMPLING_KEYS, CURRENT_MODE_HEADING, GUARDRAIL_MESSAGE,
    PLAN_MODE_MARKER,
};
use crate::tool_schema::{extract_tool_specs, synthesize_tool_schema, ExampleStyle, ToolSpecs};
use crate::types::{message_text, Result, Role, ShimError};
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConversationMode {
    Plan,
    #[default]
    Act,
}

impl fmt::Display for ConversationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plan => write!(f, "PLAN"),
            Self::Act => write!(f, "ACT"),
        }
    }
}

/// Which modes receive the experimental grammar hint.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GrammarScope {
    #[default]
    Off,
    Plan,
    Act,
    Both,
}

impl GrammarScope {
    pub fn covers(self, mode: ConversationMode) -> bool {
        match self {
            GrammarScope::Off => false,
            GrammarScope::Both => true,
            GrammarScope::Plan => mode == ConversationMode::Plan,
            GrammarScope::Act => mode == ConversationMode::Act,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ComposeOptions {
    pub default_model: String,
    pub force_tool_choice_none: bool,
    pub default_tool_choice: Option<Value>,
    pub inject_guardrail: bool,
    pub default_mode: ConversationMode,
    pub strip_client_sampling: bool,
    pub sampling_overrides: Map<String, Value>,
    pub plan_sampling_overrides: Map<String, Value>,
    pub act_sampling_overrides: Map<String, Value>,
    pub extract_tools: bool,
    pub example_style: ExampleStyle,
    pub grammar_scope: GrammarScope,
}

impl ComposeOptions {
    /// Global overrides with the mode-specific ones layered on top.
    pub fn effective_sampling(&self, mode: ConversationMode) -> Map<String, Value> {
        let mut merged = self.sampling_overrides.clone();
        let mode_specific = match mode {
            ConversationMode::Plan => &self.plan_sampling_overrides,
            ConversationMode::Act => &self.act_sampling_overrides,
        };
        for (k, v) in mode_specific {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }
}

/// Everything the translators need to know about the turn being served.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub mode: ConversationMode,
    pub specs: Arc<ToolSpecs>,
    pub sampling: Map<String, Value>,
    pub model: String,
    pub stream: bool,
}

pub struct RequestComposer<'a> {
    options: &'a ComposeOptions,
    resolver: &'a ToolResolver,
}

impl<'a> RequestComposer<'a> {
    pub fn new(options: &'a ComposeOptions, resolver: &'a ToolResolver) -> Self {
        Self { options, resolver }
    }

    pub fn compose(&self, body: Value) -> Result<(Value, TurnContext)> {
        let mut body = match body {
            Value::Object(obj) => obj,
            other => {
                return Err(ShimError::InvalidRequest(format!(
                    "expected a JSON object, got {}",
                    json_kind(&other)
                ))
                .into())
            }
        };

        let model = match body.get("model").and_then(|m| m.as_str()) {
            Some(m) if !m.is_empty() => m.to_string(),
            _ => {
                body.insert(
                    "model".to_string(),
                    Value::String(self.options.default_model.clone()),
                );
                self.options.default_model.clone()
            }
        };
        let stream = body.get("stream").and_then(|s| s.as_bool()).unwrap_or(false);

        // 1. tool_choice
        self.apply_tool_choice(&mut body);

        // 2. guardrail
        if self.options.inject_guardrail {
            if let Some(Value::Array(messages)) = body.get_mut("messages") {
                insert_guardrail(messages);
            }
        }

        let messages: &[Value] = match body.get("messages").and_then(|m| m.as_array()) {
            Some(m) => m,
            None => &[],
        };

        // 3. mode
        let mode = detect_mode(messages, self.options.default_mode);

        // 5 (needs the messages before they are mutated further).
        let specs = if self.options.extract_tools {
            extract_tool_specs(&system_text(messages))
        } else {
            ToolSpecs::new()
        };

        // 4. sampling
        if self.options.strip_client_sampling {
            for key in CLIENT_SAMPLING_KEYS {
                body.remove(*key);
            }
        }
        let sampling = self.options.effective_sampling(mode);
        for (k, v) in &sampling {
            body.insert(k.clone(), v.clone());
        }

        // 5. tool schema
        if !specs.is_empty() {
            if body.contains_key("tools") {
                tracing::debug!(
                    "Client supplied its own tools; {} extracted specs not injected",
                    specs.len()
                );
            } else {
                let tools = synthesize_tool_schema(&specs, self.options.example_style);
                body.insert("tools".to_string(), serde_json::to_value(tools)?);
            }
        }

        // 6. grammar hint
        if self.options.grammar_scope.covers(mode) {
            body.insert(
                "grammar".to_string(),
                Value::String(grammar_hint(&self.tag_set(&specs))),
            );
        }

        tracing::info!(
            "[🖱️  -> ⚙️ ] Composed turn: mode={} stream={} extracted_tools={} sampling_keys={} tool_choice={}",
            mode,
            stream,
            specs.len(),
            sampling.len(),
            match body.get("tool_choice") {
                Some(v) => v.to_string(),
                None => "-".to_string(),
            }
        );

        Ok((
            Value::Object(body),
            TurnContext {
                mode,
                specs: Arc::new(specs),
                sampling,
                model,
                stream,
            },
        ))
    }

    fn apply_tool_choice(&self, body: &mut Map<String, Value>) {
        if self.options.force_tool_choice_none {
            body.insert("tool_choice".to_string(), json!("none"));
            return;
        }
        match body.get_mut("tool_choice") {
            Some(Value::String(s)) => {
                *s = s.trim().to_lowercase();
            }
            Some(_) => {}
            None => {
                if let Some(default) = &self.options.default_tool_choice {
                    body.insert("tool_choice".to_string(), default.clone());
                }
            }
        }
    }

    /// Canonical tags followed by any extracted tool names not already present.
    fn tag_set(&self, specs: &ToolSpecs) -> Vec<String> {
        let mut tags: Vec<String> = self
            .resolver
            .canonical()
            .sorted()
            .into_iter()
            .map(str::to_string)
            .collect();
        for name in specs.keys() {
            if !tags.contains(name) {
                tags.push(name.clone());
            }
        }
        tags
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn insert_guardrail(messages: &mut Vec<Value>) {
    let guardrail = json!({ "role": "system", "content": GUARDRAIL_MESSAGE });
    let first_system = messages
        .iter()
        .position(|m| Role::of_message(m) == Some(Role::System));
    match first_system {
        Some(i) => messages.insert(i + 1, guardrail),
        None => messages.push(guardrail),
    }
}

/// All system-message text of the turn, joined by blank lines.
pub fn system_text(messages: &[Value]) -> String {
    messages
        .iter()
        .filter(|m| Role::of_message(m) == Some(Role::System))
        .map(message_text)
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Newest user message carrying a mode marker decides; otherwise `default`.
pub fn detect_mode(messages: &[Value], default: ConversationMode) -> ConversationMode {
    for message in messages.iter().rev() {
        if Role::of_message(message) != Some(Role::User) {
            continue;
        }
        if let Some(mode) = mode_marker(&message_text(message)) {
            tracing::debug!("Mode detected from user message: {}", mode);
            return mode;
        }
    }
    default
}

fn mode_marker(text: &str) -> Option<ConversationMode> {
    if let Some(pos) = text.rfind(CURRENT_MODE_HEADING) {
        let after = &text[pos + CURRENT_MODE_HEADING.len()..];
        if let Some(line) = after.lines().map(str::trim).find(|l| !l.is_empty()) {
            let upper = line.to_uppercase();
            if upper.contains(PLAN_MODE_MARKER) {
                return Some(ConversationMode::Plan);
            }
            if upper.contains(ACT_MODE_MARKER) {
                return Some(ConversationMode::Act);
            }
        }
    }

    match (text.rfind(PLAN_MODE_MARKER), text.rfind(ACT_MODE_MARKER)) {
        (Some(plan), Some(act)) if plan > act => Some(ConversationMode::Plan),
        (Some(_), Some(_)) => Some(ConversationMode::Act),
        (Some(_), None) => Some(ConversationMode::Plan),
        (None, Some(_)) => Some(ConversationMode::Act),
        (None, None) => None,
    }
}

/// GBNF hint: optional prose followed by exactly one known tag.
pub fn grammar_hint(tags: &[String]) -> String {
    let mut rules = vec![
        "root ::= prose tool ws".to_string(),
        "prose ::= [^<]*".to_string(),
        "ws ::= [ \\t\\n]*".to_string(),
        "body ::= ([^<] | \"<\" [a-zA-Z_/])*".to_string(),
    ];
    let alternatives: Vec<String> = (0..tags.len()).map(|i| format!("tool-{}", i)).collect();
    rules.push(format!("tool ::= {}", alternatives.join(" | ")));
    for (i, tag) in tags.iter().enumerate() {
        rules.push(format!(
            "tool-{} ::= \"<{}>\" body \"</{}>\"",
            i, tag, tag
        ));
    }
    rules.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOOLS_PROMPT: &str =
        "Intro\n\n# Tools\n\n## read_file\nDescription: Read a file.\nParameters:\n- path: (required) File path\n\n# Rules\nBe nice.";

    fn options() -> ComposeOptions {
        ComposeOptions {
            default_model: "gpt-oss".to_string(),
            extract_tools: true,
            ..ComposeOptions::default()
        }
    }

    fn compose(options: &ComposeOptions, body: Value) -> (Value, TurnContext) {
        let resolver = ToolResolver::default();
        RequestComposer::new(options, &resolver)
            .compose(body)
            .expect("compose should succeed")
    }

    fn map(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_rejects_non_object_body() {
        let resolver = ToolResolver::default();
        let opts = options();
        let err = RequestComposer::new(&opts, &resolver)
            .compose(json!([1, 2]))
            .unwrap_err();
        assert!(matches!(err.inner, ShimError::InvalidRequest(_)));
    }

    #[test]
    fn test_tool_choice_policy() {
        let mut opts = options();
        opts.default_tool_choice = Some(json!("auto"));

        let (body, _) = compose(&opts, json!({"messages": []}));
        assert_eq!(body["tool_choice"], "auto");

        let (body, _) = compose(&opts, json!({"messages": [], "tool_choice": " Required "}));
        assert_eq!(body["tool_choice"], "required");

        opts.force_tool_choice_none = true;
        let (body, _) = compose(&opts, json!({"messages": [], "tool_choice": "auto"}));
        assert_eq!(body["tool_choice"], "none");
    }

    #[test]
    fn test_guardrail_goes_after_first_system_message() {
        let mut opts = options();
        opts.inject_guardrail = true;

        let (body, _) = compose(
            &opts,
            json!({"messages": [
                {"role": "system", "content": "sys"},
                {"role": "system", "content": "sys2"},
                {"role": "user", "content": "hi"}
            ]}),
        );
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1]["content"], GUARDRAIL_MESSAGE);
        assert_eq!(messages[2]["content"], "sys2");

        let (body, _) = compose(&opts, json!({"messages": [{"role": "user", "content": "hi"}]}));
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.last().unwrap()["content"], GUARDRAIL_MESSAGE);
    }

    #[test]
    fn test_mode_detection_prefers_newest_user_marker() {
        let messages = vec![
            json!({"role": "user", "content": "# Current Mode\nPLAN MODE\n"}),
            json!({"role": "assistant", "content": "ACT MODE"}),
            json!({"role": "user", "content": [{"type": "text", "text": "<environment_details>\n# Current Mode\nACT MODE\n</environment_details>"}]}),
            json!({"role": "user", "content": "no marker here"}),
        ];
        assert_eq!(detect_mode(&messages, ConversationMode::Plan), ConversationMode::Act);
        assert_eq!(detect_mode(&messages[..2], ConversationMode::Act), ConversationMode::Plan);
        assert_eq!(detect_mode(&messages[3..], ConversationMode::Plan), ConversationMode::Plan);
    }

    #[test]
    fn test_mode_marker_without_heading_uses_last_occurrence() {
        assert_eq!(
            mode_marker("we were in ACT MODE, now switch to PLAN MODE"),
            Some(ConversationMode::Plan)
        );
        assert_eq!(mode_marker("PLAN MODE then ACT MODE"), Some(ConversationMode::Act));
        assert_eq!(mode_marker("nothing"), None);
    }

    #[test]
    fn test_sampling_overrides_mode_wins_and_strip_runs_first() {
        let mut opts = options();
        opts.strip_client_sampling = true;
        opts.sampling_overrides = map(json!({"temperature": 0.5, "top_p": 0.9}));
        opts.plan_sampling_overrides = map(json!({"temperature": 0.1}));
        opts.act_sampling_overrides = map(json!({"top_k": 40}));

        let (body, ctx) = compose(
            &opts,
            json!({
                "messages": [{"role": "user", "content": "# Current Mode\nPLAN MODE"}],
                "temperature": 1.5,
                "min_p": 0.2,
                "max_tokens": 100
            }),
        );
        assert_eq!(ctx.mode, ConversationMode::Plan);
        assert_eq!(body["temperature"], 0.1);
        assert_eq!(body["top_p"], 0.9);
        assert!(body.get("min_p").is_none());
        assert!(body.get("top_k").is_none());
        assert_eq!(body["max_tokens"], 100);
        assert_eq!(ctx.sampling, map(json!({"temperature": 0.1, "top_p": 0.9})));
    }

    #[test]
    fn test_client_sampling_kept_without_strip() {
        let (body, ctx) = compose(&options(), json!({"messages": [], "temperature": 1.5}));
        assert_eq!(body["temperature"], 1.5);
        assert!(ctx.sampling.is_empty());
        assert_eq!(ctx.mode, ConversationMode::Act);
    }

    #[test]
    fn test_tool_schema_injection() {
        let (body, ctx) = compose(
            &options(),
            json!({"model": "m", "stream": true, "messages": [
                {"role": "system", "content": TOOLS_PROMPT},
                {"role": "user", "content": "read it"}
            ]}),
        );
        assert!(ctx.stream);
        assert_eq!(ctx.model, "m");
        assert_eq!(ctx.specs.len(), 1);
        assert_eq!(body["tools"][0]["function"]["name"], "read_file");
        assert_eq!(body["tools"][0]["function"]["parameters"]["required"], json!(["path"]));
    }

    #[test]
    fn test_no_injection_when_disabled_or_client_tools_present() {
        let mut opts = options();
        let client_tools = json!([{"type": "function", "function": {"name": "x", "parameters": {}}}]);
        let (body, ctx) = compose(
            &opts,
            json!({"messages": [{"role": "system", "content": TOOLS_PROMPT}], "tools": client_tools.clone()}),
        );
        assert_eq!(body["tools"], client_tools);
        assert_eq!(ctx.specs.len(), 1);

        opts.extract_tools = false;
        let (body, ctx) = compose(&opts, json!({"messages": [{"role": "system", "content": TOOLS_PROMPT}]}));
        assert!(body.get("tools").is_none());
        assert!(ctx.specs.is_empty());
    }

    #[test]
    fn test_default_model_is_filled_in() {
        let (body, ctx) = compose(&options(), json!({"messages": []}));
        assert_eq!(body["model"], "gpt-oss");
        assert_eq!(ctx.model, "gpt-oss");
        assert!(!ctx.stream);
    }

    #[test]
    fn test_grammar_hint_scope() {
        let mut opts = options();
        opts.grammar_scope = GrammarScope::Plan;

        let (body, _) = compose(&opts, json!({"messages": [{"role": "system", "content": TOOLS_PROMPT}]}));
        assert!(body.get("grammar").is_none());

        let (body, _) = compose(
            &opts,
            json!({"messages": [{"role": "user", "content": "PLAN MODE"}]}),
        );
        let grammar = body["grammar"].as_str().unwrap();
        assert!(grammar.starts_with("root ::= prose tool ws"));
        assert!(grammar.contains("\"<read_file>\" body \"</read_file>\""));
        assert!(grammar.contains("\"<plan_mode_respond>\""));
    }

    #[test]
    fn test_grammar_hint_includes_extracted_tags_once() {
        let hint = grammar_hint(&["a".to_string(), "b".to_string()]);
        assert!(hint.contains("tool ::= tool-0 | tool-1"));
        assert!(hint.contains("tool-1 ::= \"<b>\" body \"</b>\""));
    }
}
