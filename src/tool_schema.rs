//! Tool Schema Extraction Module
//!
//! Recovers tool definitions from the free-text `# Tools` section of the
//! client's system prompt and turns them into an upstream function schema.
//! Extraction never fails: anything it cannot make sense of is skipped and the
//! result is simply smaller (possibly empty).

use crate::specs::openai::{OpenAiFunctionDefinition, OpenAiTool};
use indexmap::IndexMap;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Value};

lazy_static! {
    static ref TOOLS_HEADING: Regex =
        Regex::new(r"(?im)^[ \t]*#[ \t]+tools[ \t]*$").expect("Invalid tools heading regex");
    static ref TOP_LEVEL_HEADING: Regex =
        Regex::new(r"(?m)^[ \t]*#[ \t]+\S").expect("Invalid heading regex");
    static ref TOOL_HEADING: Regex =
        Regex::new(r"(?m)^[ \t]*##[ \t]+(.*)$").expect("Invalid tool heading regex");
    static ref TOOL_NAME: Regex =
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_.:\-]*$").expect("Invalid tool name regex");
    static ref FIELD_LABEL: Regex = Regex::new(r"(?i)^\s*(description|parameters|usage)\s*:(.*)$")
        .expect("Invalid label regex");
    static ref PARAM_BULLET: Regex = Regex::new(
        r"(?i)^\s*[-*]\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*:\s*\((required|optional)\)\s*(.*)$"
    )
    .expect("Invalid parameter regex");
    static ref XML_OPEN_TAG: Regex =
        Regex::new(r"<([A-Za-z_][A-Za-z0-9_.:\-]*)>").expect("Invalid open tag regex");
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolParameter {
    pub name: String,
    pub required: bool,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSpecification {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
    pub usage_example: Option<String>,
}

/// Tool name -> specification, in order of appearance in the prompt.
pub type ToolSpecs = IndexMap<String, ToolSpecification>;

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExampleStyle {
    /// Append the prompt's usage example (or a generated XML skeleton)
    #[default]
    Xml,
    /// Append a generated JSON arguments object
    Json,
    /// Leave descriptions untouched
    None,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Field {
    Preamble,
    Description,
    Parameters,
    Usage,
}

/// Extracts every well-formed tool from the `# Tools` section of `system_text`.
pub fn extract_tool_specs(system_text: &str) -> ToolSpecs {
    let mut specs = ToolSpecs::new();
    let Some(section) = tools_section(system_text) else {
        return specs;
    };

    let headings: Vec<_> = TOOL_HEADING.captures_iter(section).collect();
    for (i, caps) in headings.iter().enumerate() {
        let (Some(whole), Some(title)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let body_end = match headings.get(i + 1).and_then(|c| c.get(0)) {
            Some(next) => next.start(),
            None => section.len(),
        };
        let body = &section[whole.end()..body_end];

        match parse_tool_chunk(title.as_str(), body) {
            Some(spec) => {
                if specs.contains_key(&spec.name) {
                    tracing::debug!("Duplicate tool section '{}' ignored", spec.name);
                    continue;
                }
                specs.insert(spec.name.clone(), spec);
            }
            None => {
                tracing::debug!(
                    "Skipping malformed tool section '{}'",
                    crate::str_utils::first_n_chars_lossy(title.as_str().trim(), 60)
                );
            }
        }
    }

    specs
}

fn tools_section(text: &str) -> Option<&str> {
    let heading = TOOLS_HEADING.find(text)?;
    let rest = &text[heading.end()..];
    let end = match TOP_LEVEL_HEADING.find(rest) {
        Some(m) => m.start(),
        None => rest.len(),
    };
    Some(&rest[..end])
}

fn parse_tool_chunk(title: &str, body: &str) -> Option<ToolSpecification> {
    let name = title
        .split_whitespace()
        .next()?
        .trim_end_matches(':')
        .to_string();
    if !TOOL_NAME.is_match(&name) {
        return None;
    }

    let mut field = Field::Preamble;
    let mut description_lines: Vec<&str> = Vec::new();
    let mut usage_lines: Vec<&str> = Vec::new();
    let mut parameters: Vec<ToolParameter> = Vec::new();
    let mut saw_parameters = false;

    for line in body.lines() {
        if let Some(label) = FIELD_LABEL.captures(line) {
            let inline = label.get(2).map(|m| m.as_str()).unwrap_or_default();
            match label[1].to_lowercase().as_str() {
                "description" => {
                    field = Field::Description;
                    description_lines.push(inline);
                }
                "parameters" => {
                    field = Field::Parameters;
                    saw_parameters = true;
                }
                _ => {
                    field = Field::Usage;
                    usage_lines.push(inline);
                }
            }
            continue;
        }

        match field {
            Field::Preamble => {}
            Field::Description => description_lines.push(line),
            Field::Usage => usage_lines.push(line),
            Field::Parameters => {
                if let Some(param) = PARAM_BULLET.captures(line) {
                    let param_name = param[1].to_string();
                    if parameters.iter().any(|p| p.name == param_name) {
                        continue;
                    }
                    parameters.push(ToolParameter {
                        name: param_name,
                        required: param[2].eq_ignore_ascii_case("required"),
                        description: param[3].trim().to_string(),
                    });
                }
            }
        }
    }

    let description = description_lines.join("\n").trim().to_string();
    if description.is_empty() && !saw_parameters {
        return None;
    }

    Some(ToolSpecification {
        name,
        description,
        parameters,
        usage_example: first_xml_example(&usage_lines.join("\n")),
    })
}

fn first_xml_example(usage: &str) -> Option<String> {
    let open = XML_OPEN_TAG.captures(usage)?;
    let whole = open.get(0)?;
    let closing = format!("</{}>", &open[1]);
    let example = match usage[whole.end()..].find(&closing) {
        Some(offset) => &usage[whole.start()..whole.end() + offset + closing.len()],
        None => &usage[whole.start()..],
    };
    Some(example.trim().to_string())
}

impl ToolSpecification {
    pub fn parameter_names(&self) -> Vec<&str> {
        self.parameters.iter().map(|p| p.name.as_str()).collect()
    }

    fn generated_xml_example(&self) -> String {
        let mut out = format!("<{}>", self.name);
        for p in &self.parameters {
            out.push_str(&format!("\n<{0}>{0} value</{0}>", p.name));
        }
        out.push_str(&format!("\n</{}>", self.name));
        out
    }

    fn generated_json_example(&self) -> String {
        let mut args = serde_json::Map::new();
        for p in &self.parameters {
            args.insert(p.name.clone(), Value::String(format!("<{}>", p.name)));
        }
        Value::Object(args).to_string()
    }

    pub fn example(&self, style: ExampleStyle) -> Option<String> {
        match style {
            ExampleStyle::None => None,
            ExampleStyle::Xml => Some(format!(
                "Example:\n{}",
                match &self.usage_example {
                    Some(u) => u.clone(),
                    None => self.generated_xml_example(),
                }
            )),
            ExampleStyle::Json => Some(format!(
                "Example arguments: {}",
                self.generated_json_example()
            )),
        }
    }

    pub fn json_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        for p in &self.parameters {
            let mut prop = json!({ "type": "string" });
            if !p.description.is_empty() {
                prop["description"] = Value::String(p.description.clone());
            }
            properties.insert(p.name.clone(), prop);
        }
        let required: Vec<&str> = self
            .parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    pub fn to_openai_tool(&self, style: ExampleStyle) -> OpenAiTool {
        let description = match self.example(style) {
            Some(example) if self.description.is_empty() => example,
            Some(example) => format!("{}\n\n{}", self.description, example),
            None => self.description.clone(),
        };

        OpenAiTool {
            r#type: "function".to_string(),
            function: OpenAiFunctionDefinition {
                name: self.name.clone(),
                description: Some(description),
                parameters: self.json_schema(),
            },
        }
    }
}

pub fn synthesize_tool_schema(specs: &ToolSpecs, style: ExampleStyle) -> Vec<OpenAiTool> {
    specs.values().map(|s| s.to_openai_tool(style)).collect()
}
