//! Tool-name resolution.
//!
//! The canonical set and the alias table are built once at startup and shared
//! read-only (behind an `Arc`) by every turn.

use crate::constants::{CANONICAL_TOOLS, DEFAULT_ALIASES, INTERACTIVE_UI_KEYWORDS};
use crate::types::{Result, ShimError};
use std::collections::{HashMap, HashSet};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct CanonicalToolSet {
    tags: HashSet<String>,
}

impl Default for CanonicalToolSet {
    fn default() -> Self {
        Self {
            tags: CANONICAL_TOOLS.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl CanonicalToolSet {
    pub fn contains(&self, name: &str) -> bool {
        self.tags.contains(name)
    }

    /// Canonical tags in a stable (sorted) order.
    pub fn sorted(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.tags.iter().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }
}

#[derive(Debug, Clone)]
pub struct AliasTable {
    entries: HashMap<String, String>,
}

impl Default for AliasTable {
    fn default() -> Self {
        Self {
            entries: DEFAULT_ALIASES
                .iter()
                .map(|(alias, target)| (alias.to_string(), target.to_string()))
                .collect(),
        }
    }
}

impl AliasTable {
    pub fn get(&self, alias: &str) -> Option<&str> {
        self.entries.get(alias).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(a, t)| (a.as_str(), t.as_str()))
    }

    /// Merges a flat JSON object of `alias -> target` into the table.
    /// Keys and values are stringified; file entries win over defaults.
    pub fn merge_json(&mut self, raw: &str) -> Result<usize> {
        let parsed: serde_json::Value = serde_json::from_str(raw)?;
        let obj = match parsed.as_object() {
            Some(o) => o,
            None => {
                return Err(ShimError::Config(
                    "alias file must contain a JSON object".to_string(),
                )
                .into())
            }
        };

        for (alias, target) in obj {
            let target = match target.as_str() {
                Some(s) => s.to_string(),
                None => target.to_string(),
            };
            self.entries.insert(alias.clone(), target);
        }
        Ok(obj.len())
    }

    pub fn merge_file(&mut self, path: &Path) -> Result<usize> {
        let raw = std::fs::read_to_string(path)?;
        self.merge_json(&raw)
    }

    /// Default table plus the operator file. Any problem with the file is logged
    /// and the defaults are kept.
    pub fn load(path: Option<&Path>) -> Self {
        let mut table = Self::default();
        let Some(path) = path else {
            return table;
        };

        if !path.exists() {
            tracing::error!("Custom alias file not found: {}", path.display());
            return table;
        }

        let mut candidate = table.clone();
        match candidate.merge_file(path) {
            Ok(n) => {
                tracing::info!("Loaded {} custom aliases from {}", n, path.display());
                table = candidate;
            }
            Err(e) => {
                tracing::error!(
                    "Failed to load custom aliases from {}: {}",
                    path.display(),
                    e.inner
                );
            }
        }
        table
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolResolver {
    canonical: CanonicalToolSet,
    aliases: AliasTable,
}

impl ToolResolver {
    pub fn new(canonical: CanonicalToolSet, aliases: AliasTable) -> Self {
        Self { canonical, aliases }
    }

    pub fn canonical(&self) -> &CanonicalToolSet {
        &self.canonical
    }

    pub fn aliases(&self) -> &AliasTable {
        &self.aliases
    }

    /// Maps `raw` to `(name, known)`. `known` is true only when the returned
    /// name is a canonical tag.
    pub fn resolve<'a>(&'a self, raw: &'a str) -> (&'a str, bool) {
        if raw.is_empty() {
            return ("", false);
        }
        if self.canonical.contains(raw) {
            return (raw, true);
        }
        if let Some(target) = self.aliases.get(raw) {
            return (target, self.canonical.contains(target));
        }
        (raw, false)
    }
}

/// Heuristic for browser / UI actions that should be routed to the browser MCP server.
pub fn looks_like_interactive_ui(name: &str) -> bool {
    let lower = name.to_lowercase();
    INTERACTIVE_UI_KEYWORDS.iter().any(|k| lower.contains(k))
}
