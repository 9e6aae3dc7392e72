use crate::aliases::{AliasTable, CanonicalToolSet, ToolResolver};
use crate::compose::{ComposeOptions, ConversationMode, GrammarScope};
use crate::constants::{DEFAULT_FALLBACK_QUESTION, UPSTREAM_CHAT_COMPLETIONS_PATH};
use crate::convert::{ConversionOptions, MultiToolPolicy, ToolConverter};
use crate::fallback::FallbackChain;
use crate::streaming::StreamSettings;
use crate::tee::DiagnosticTees;
use crate::tool_schema::{ExampleStyle, ToolSpecs};
use crate::types::*;
use clap::builder::FalseyValueParser;
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::sync::Arc;

pub type JsonObject = serde_json::Map<String, serde_json::Value>;

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Command line wins over the environment; `.env` is read before parsing.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "XML tool-call shim for OpenAI-compatible upstreams", long_about = None)]
pub struct Args {
    /// Upstream base URL (the shim appends /v1/chat/completions)
    #[arg(long, env = "UPSTREAM", default_value = "http://127.0.0.1:8081")]
    pub upstream: String,
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,
    #[arg(long, env = "PORT", default_value_t = 10000)]
    pub port: u16,
    /// Model reported when the client request names none
    #[arg(long, env = "MODEL", default_value = "gpt-oss")]
    pub model: String,
    #[arg(long, env = "UPSTREAM_API_KEY", hide_env_values = true)]
    pub upstream_api_key: Option<String>,
    #[arg(long, env = "CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub connect_timeout_secs: u64,
    /// Overall upstream request timeout, 0 for none
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 0)]
    pub request_timeout_secs: u64,
    #[arg(long, env = "MAX_BODY_SIZE", default_value_t = 50 * 1024 * 1024)]
    pub max_body_size: usize,

    /// tracing filter directive, e.g. "info" or "toolshim=debug"
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
    /// Also write logs (redacted, daily rolled) to this file
    #[arg(long, env = "LOG_FILE")]
    pub log_file: Option<PathBuf>,
    /// Log request and response bodies (truncated)
    #[arg(long, env = "LOG_BODY", value_parser = FalseyValueParser::new())]
    pub log_body: bool,
    /// Echo every upstream SSE line
    #[arg(long, env = "TRACE_STREAM", value_parser = FalseyValueParser::new())]
    pub trace_stream: bool,
    /// Log reasoning deltas at debug level
    #[arg(long, env = "LOG_REASONING", value_parser = FalseyValueParser::new())]
    pub log_reasoning: bool,

    /// Always send tool_choice "none" upstream
    #[arg(long, env = "FORCE_TOOL_CHOICE_NONE", value_parser = FalseyValueParser::new())]
    pub force_tool_choice_none: bool,
    /// tool_choice used when the client sends none ("auto", "none", "required" or a JSON object)
    #[arg(long, env = "DEFAULT_TOOL_CHOICE", value_parser = parse_tool_choice)]
    pub default_tool_choice: Option<serde_json::Value>,

    /// Unknown tools become a clarifying question instead of an indirection tag
    #[arg(long, env = "STRICT_XML", value_parser = FalseyValueParser::new())]
    pub strict_xml: bool,
    /// Emit unknown tools as literal tags instead of <use_mcp_tool>
    #[arg(
        long = "no-allow-unknown-as-mcp",
        env = "ALLOW_UNKNOWN_AS_MCP",
        action = ArgAction::SetFalse,
        value_parser = FalseyValueParser::new()
    )]
    pub allow_unknown_as_mcp: bool,
    #[arg(long, env = "BROWSER_SERVER_NAME", default_value = "browser")]
    pub browser_server_name: String,
    /// JSON object of extra aliases (alias -> canonical tag)
    #[arg(long, env = "CUSTOM_ALIASES_JSON")]
    pub custom_aliases_json: Option<PathBuf>,

    /// Answer empty turns with an <ask_followup_question>
    #[arg(long, env = "SYNTHESIZE_EMPTY_XML", value_parser = FalseyValueParser::new())]
    pub synthesize_empty_xml: bool,
    #[arg(long, env = "FALLBACK_QUESTION", default_value = DEFAULT_FALLBACK_QUESTION)]
    pub fallback_question: String,
    /// Answer empty turns with the captured reasoning text when there is any
    #[arg(long, env = "PROMOTE_REASONING_IF_EMPTY", value_parser = FalseyValueParser::new())]
    pub promote_reasoning_if_empty: bool,

    /// Append raw upstream SSE lines to this file
    #[arg(long, env = "DUMP_UPSTREAM")]
    pub dump_upstream: Option<PathBuf>,
    /// Append raw SSE lines sent to the client to this file
    #[arg(long, env = "DUMP_DOWNSTREAM")]
    pub dump_downstream: Option<PathBuf>,

    #[arg(long, env = "MULTI_TOOL_POLICY", value_enum, default_value_t = MultiToolPolicy::First)]
    pub multi_tool_policy: MultiToolPolicy,
    /// Buffered text is flushed at this many characters (or at a line break)
    #[arg(long, env = "TEXT_FLUSH_THRESHOLD", default_value_t = 256, value_parser = clap::value_parser!(u32).range(1..))]
    pub text_flush_threshold: u32,

    /// Insert a one-tool-per-message system message after the first system message
    #[arg(long, env = "INJECT_GUARDRAIL", value_parser = FalseyValueParser::new())]
    pub inject_guardrail: bool,
    #[arg(long, env = "DEFAULT_MODE", value_enum, default_value_t = ConversationMode::Act)]
    pub default_mode: ConversationMode,
    /// Drop the client's sampling fields before applying overrides
    #[arg(long, env = "STRIP_CLIENT_SAMPLING", value_parser = FalseyValueParser::new())]
    pub strip_client_sampling: bool,
    /// JSON object merged into every upstream request
    #[arg(long, env = "SAMPLING_OVERRIDES", value_parser = parse_json_object)]
    pub sampling_overrides: Option<JsonObject>,
    #[arg(long, env = "PLAN_SAMPLING_OVERRIDES", value_parser = parse_json_object)]
    pub plan_sampling_overrides: Option<JsonObject>,
    #[arg(long, env = "ACT_SAMPLING_OVERRIDES", value_parser = parse_json_object)]
    pub act_sampling_overrides: Option<JsonObject>,

    /// Do not parse the system prompt for tool specifications
    #[arg(
        long = "no-extract-tools",
        env = "EXTRACT_TOOLS",
        action = ArgAction::SetFalse,
        value_parser = FalseyValueParser::new()
    )]
    pub extract_tools: bool,
    #[arg(long, env = "EXAMPLE_STYLE", value_enum, default_value_t = ExampleStyle::Xml)]
    pub example_style: ExampleStyle,
    /// Experimental GBNF hint restricting output to one known tag
    #[arg(long, env = "GRAMMAR_HINT", value_enum, default_value_t = GrammarScope::Off)]
    pub grammar_hint: GrammarScope,
}

fn parse_json_object(raw: &str) -> std::result::Result<JsonObject, String> {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err("expected a JSON object".to_string()),
        Err(e) => Err(format!("invalid JSON: {}", e)),
    }
}

fn parse_tool_choice(raw: &str) -> std::result::Result<serde_json::Value, String> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return parse_json_object(trimmed).map(serde_json::Value::Object);
    }
    match trimmed.to_lowercase().as_str() {
        choice @ ("auto" | "none" | "required") => Ok(serde_json::Value::String(choice.to_string())),
        other => Err(format!(
            "unknown tool_choice '{}' (expected auto, none, required or a JSON object)",
            other
        )),
    }
}

impl Args {
    pub fn upstream_url(&self) -> String {
        format!(
            "{}{}",
            self.upstream.trim_end_matches('/'),
            UPSTREAM_CHAT_COMPLETIONS_PATH
        )
    }

    pub fn conversion_options(&self) -> ConversionOptions {
        ConversionOptions {
            strict_xml: self.strict_xml,
            allow_unknown_as_mcp: self.allow_unknown_as_mcp,
            browser_server_name: self.browser_server_name.clone(),
            multi_tool_policy: self.multi_tool_policy,
        }
    }

    pub fn fallback_chain(&self) -> FallbackChain {
        FallbackChain::new(
            self.promote_reasoning_if_empty,
            self.synthesize_empty_xml,
            self.fallback_question.clone(),
        )
    }

    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            text_flush_threshold: self.text_flush_threshold as usize,
            log_reasoning: self.log_reasoning,
            trace_stream: self.trace_stream,
        }
    }

    pub fn compose_options(&self) -> ComposeOptions {
        ComposeOptions {
            default_model: self.model.clone(),
            force_tool_choice_none: self.force_tool_choice_none,
            default_tool_choice: self.default_tool_choice.clone(),
            inject_guardrail: self.inject_guardrail,
            default_mode: self.default_mode,
            strip_client_sampling: self.strip_client_sampling,
            sampling_overrides: self.sampling_overrides.clone().unwrap_or_default(),
            plan_sampling_overrides: self.plan_sampling_overrides.clone().unwrap_or_default(),
            act_sampling_overrides: self.act_sampling_overrides.clone().unwrap_or_default(),
            extract_tools: self.extract_tools,
            example_style: self.example_style,
            grammar_scope: self.grammar_hint,
        }
    }

    pub fn diagnostic_tees(&self) -> DiagnosticTees {
        let non_empty = |p: &Option<PathBuf>| p.clone().filter(|p| !p.as_os_str().is_empty());
        DiagnosticTees::new(non_empty(&self.dump_upstream), non_empty(&self.dump_downstream))
    }
}

#[derive(Clone)]
pub struct AppState {
    pub client: reqwest::Client,
    pub args: Arc<Args>,
    pub resolver: Arc<ToolResolver>,
    pub compose: Arc<ComposeOptions>,
    pub tees: DiagnosticTees,
}

impl AppState {
    pub fn new(args: Args) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(args.connect_timeout_secs));
        if args.request_timeout_secs > 0 {
            builder = builder.timeout(std::time::Duration::from_secs(args.request_timeout_secs));
        }
        let client = builder.build()?;

        let aliases = AliasTable::load(args.custom_aliases_json.as_deref());
        let resolver = ToolResolver::new(CanonicalToolSet::default(), aliases);
        tracing::info!(
            "Resolver ready: {} canonical tags, {} aliases",
            resolver.canonical().sorted().len(),
            resolver.aliases().len()
        );

        Ok(Self {
            client,
            compose: Arc::new(args.compose_options()),
            tees: args.diagnostic_tees(),
            resolver: Arc::new(resolver),
            args: Arc::new(args),
        })
    }

    /// Converter bound to the tool specifications of one turn.
    pub fn converter_for(&self, specs: Arc<ToolSpecs>) -> ToolConverter {
        ToolConverter::new(self.resolver.clone(), specs, self.args.conversion_options())
    }
}
