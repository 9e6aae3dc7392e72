/// Tags the downstream client understands natively.
pub const CANONICAL_TOOLS: &[&str] = &[
    // Files & CLI
    "read_file",
    "write_to_file",
    "replace_in_file",
    "search_files",
    "list_files",
    "execute_command",
    "list_code_definition_names",
    // Interaction / planning
    "ask_followup_question",
    "attempt_completion",
    "new_task",
    "plan_mode_respond",
    "load_mcp_documentation",
    // Server-mediated indirection
    "use_mcp_tool",
    "access_mcp_resource",
];

/// Built-in alias table, overridable from `--custom-aliases-json`.
pub const DEFAULT_ALIASES: &[(&str, &str)] = &[
    ("exec", "execute_command"),
    ("run_command", "execute_command"),
    ("command", "execute_command"),
    ("shell", "execute_command"),
    ("bash", "execute_command"),
    ("powershell", "execute_command"),
    ("ls", "list_files"),
    ("list", "list_files"),
    ("read", "read_file"),
    ("write", "write_to_file"),
    ("search", "search_files"),
    ("replace", "replace_in_file"),
    ("complete", "attempt_completion"),
    ("ask", "ask_followup_question"),
    ("question", "ask_followup_question"),
];

/// Substrings that mark a tool name as a browser / UI action.
pub const INTERACTIVE_UI_KEYWORDS: &[&str] = &[
    "browser",
    "navigate",
    "open_url",
    "visit",
    "go_to",
    "click",
    "type",
    "scroll",
    "screenshot",
    "close_browser",
    "web.",
    "web_",
    "page_",
    "tab_",
];

pub const MCP_WRAPPER_TAG: &str = "use_mcp_tool";
pub const FOLLOWUP_TAG: &str = "ask_followup_question";
pub const UNKNOWN_MCP_SERVER: &str = "unknown";

pub const DEFAULT_FALLBACK_QUESTION: &str = "The upstream model returned no content this turn. \
Would you like me to try again, adjust model settings, or proceed with a follow-up question?";

pub const MULTI_TOOL_REJECTED_QUESTION: &str = "The model tried to use several tools in one message. \
Which single action should I take next?";

pub const GUARDRAIL_MESSAGE: &str = "Use exactly one tool per message. \
Express the tool call as XML in the message text, e.g. <read_file><path>src/main.rs</path></read_file>, \
and wait for the result before calling another tool.";

/// Mode markers as they appear in the client's environment details.
pub const CURRENT_MODE_HEADING: &str = "# Current Mode";
pub const PLAN_MODE_MARKER: &str = "PLAN MODE";
pub const ACT_MODE_MARKER: &str = "ACT MODE";

/// Client sampling fields dropped by `--strip-client-sampling`.
pub const CLIENT_SAMPLING_KEYS: &[&str] = &[
    "temperature",
    "top_p",
    "top_k",
    "min_p",
    "typical_p",
    "presence_penalty",
    "frequency_penalty",
    "repeat_penalty",
    "repetition_penalty",
    "seed",
];

pub const UPSTREAM_CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

pub const MAX_UPSTREAM_LINE_BYTES: usize = 1024 * 1024;
pub const LOG_BODY_MAX_CHARS: usize = 2000;
