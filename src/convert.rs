//! Turns native function calls into the client's XML, shared by the streaming
//! and one-shot paths.

use crate::aliases::{looks_like_interactive_ui, ToolResolver};
use crate::constants::{MULTI_TOOL_REJECTED_QUESTION, UNKNOWN_MCP_SERVER};
use crate::tool_schema::ToolSpecs;
use crate::xml_encode::{clarifying_question, encode_direct, encode_wrapped};
use std::sync::Arc;

/// What to do when one assistant message carries more than one tool call.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MultiToolPolicy {
    /// Keep the call with the lowest slot index, drop the rest
    #[default]
    First,
    /// Encode every call, concatenated in slot order
    Merge,
    /// Drop every call and ask the user a clarifying question instead
    Error,
}

#[derive(Debug, Clone)]
pub struct ConversionOptions {
    pub strict_xml: bool,
    pub allow_unknown_as_mcp: bool,
    pub browser_server_name: String,
    pub multi_tool_policy: MultiToolPolicy,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            strict_xml: false,
            allow_unknown_as_mcp: true,
            browser_server_name: "browser".to_string(),
            multi_tool_policy: MultiToolPolicy::default(),
        }
    }
}

/// A fully accumulated native call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingToolCall {
    pub name: String,
    pub arguments: String,
}

impl PendingToolCall {
    pub fn new(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolConverter {
    resolver: Arc<ToolResolver>,
    specs: Arc<ToolSpecs>,
    options: ConversionOptions,
}

impl ToolConverter {
    pub fn new(resolver: Arc<ToolResolver>, specs: Arc<ToolSpecs>, options: ConversionOptions) -> Self {
        Self {
            resolver,
            specs,
            options,
        }
    }

    /// Encodes a single call. Always returns a non-empty tag.
    pub fn convert(&self, call: &PendingToolCall) -> String {
        let raw = call.name.as_str();
        let (canonical, known) = self.resolver.resolve(raw);

        if known {
            let order = match self.specs.get(canonical) {
                Some(spec) => spec.parameter_names(),
                None => Vec::new(),
            };
            if canonical != raw {
                tracing::debug!("Alias '{}' resolved to <{}>", raw, canonical);
            }
            return encode_direct(canonical, &call.arguments, &order);
        }

        if looks_like_interactive_ui(raw) {
            tracing::info!(
                "Browser fallback mapped '{}' -> <use_mcp_tool server={}>",
                raw,
                self.options.browser_server_name
            );
            return encode_wrapped(&self.options.browser_server_name, raw, &call.arguments);
        }

        if self.options.strict_xml {
            tracing::error!("Unknown tool '{}' rejected (strict XML); asking the user instead", raw);
            return clarifying_question(&format!(
                "The model requested a tool this client does not support ('{}'). How would you like to proceed?",
                raw
            ));
        }

        if self.options.allow_unknown_as_mcp {
            tracing::warn!(
                "Unknown tool '{}' mapped to MCP fallback server={}",
                raw,
                UNKNOWN_MCP_SERVER
            );
            return encode_wrapped(UNKNOWN_MCP_SERVER, raw, &call.arguments);
        }

        tracing::warn!("Unknown tool '{}' emitted as literal tag (may fail)", raw);
        let order = match self.specs.get(raw) {
            Some(spec) => spec.parameter_names(),
            None => Vec::new(),
        };
        encode_direct(raw, &call.arguments, &order)
    }

    /// Applies the multi-tool policy to calls already sorted by slot index and
    /// returns the XML to emit (empty only when `calls` is empty).
    pub fn convert_batch<'a, I>(&self, calls: I) -> String
    where
        I: IntoIterator<Item = (u32, &'a PendingToolCall)>,
    {
        let calls: Vec<(u32, &PendingToolCall)> = calls.into_iter().collect();
        if calls.len() <= 1 {
            return calls.iter().map(|(_, c)| self.convert(c)).collect();
        }

        match self.options.multi_tool_policy {
            MultiToolPolicy::Merge => {
                tracing::info!("Merging {} tool calls into one message", calls.len());
                calls.iter().map(|(_, c)| self.convert(c)).collect()
            }
            MultiToolPolicy::First => {
                let (kept_index, kept) = calls[0];
                for (index, dropped) in &calls[1..] {
                    tracing::warn!(
                        "Multi-tool policy 'first': dropping tool call idx={} name='{}' (kept idx={})",
                        index,
                        dropped.name,
                        kept_index
                    );
                }
                self.convert(kept)
            }
            MultiToolPolicy::Error => {
                for (index, dropped) in &calls {
                    tracing::warn!(
                        "Multi-tool policy 'error': dropping tool call idx={} name='{}'",
                        index,
                        dropped.name
                    );
                }
                clarifying_question(MULTI_TOOL_REJECTED_QUESTION)
            }
        }
    }
}
