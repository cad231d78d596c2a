//! Tool registry: aggregates tool definitions across all MCP servers.
//!
//! Provides:
//! - Lookup by namespaced key (`server.tool`) or by bare tool name when unique
//! - Ambiguity detection when a bare name is advertised by several servers
//! - Validation that a tool call matches the registered schema
//! - Serialization of tools into the LLM function-calling format
//!
//! A [`ToolRegistry`] is an immutable snapshot. [`SharedRegistry`] rebuilds a
//! new snapshot wholesale whenever a server's tool set changes and swaps it
//! in, so readers always see either the old or the new registry in full.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::Serialize;

use super::errors::McpError;
use super::types::ToolDescriptor;

/// Separator between server name and tool name in registry keys.
pub const KEY_SEPARATOR: char = '.';

/// Minimum similarity for a tool to be offered as a suggestion.
const SUGGESTION_FLOOR: f64 = 0.3;

/// Maximum number of suggestions attached to `UnknownTool`.
const MAX_SUGGESTIONS: usize = 3;

/// Build the registry key for a server's tool.
pub fn tool_key(server: &str, tool: &str) -> String {
    format!("{server}{KEY_SEPARATOR}{tool}")
}

// ─── RegisteredTool ──────────────────────────────────────────────────────────

/// A tool together with the server that owns it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisteredTool {
    /// Namespaced key, e.g. `"memory.lookup"`.
    pub key: String,
    /// Owning server.
    pub server: String,
    /// Descriptor as advertised by the server; `descriptor.name` is the
    /// name the server expects in `tools/call`.
    pub descriptor: ToolDescriptor,
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Snapshot of every tool offered by every `Ready` server.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    /// `key → tool`.
    tools: BTreeMap<String, RegisteredTool>,
    /// `bare tool name → keys advertising it`.
    by_name: BTreeMap<String, Vec<String>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from per-server tool lists.
    ///
    /// `allowed`, when present, keeps only the listed keys.
    pub fn build<'a, I>(sources: I, allowed: Option<&HashSet<String>>) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a [ToolDescriptor])>,
    {
        let mut registry = Self::new();
        for (server, tools) in sources {
            registry.register_server_tools(server, tools);
        }
        if let Some(allowed) = allowed {
            registry.retain_tools(allowed);
        }
        registry
    }

    /// Register tools from a server under `server.tool` keys.
    fn register_server_tools(&mut self, server: &str, tools: &[ToolDescriptor]) {
        for tool in tools {
            let key = tool_key(server, &tool.name);
            let entry = RegisteredTool {
                key: key.clone(),
                server: server.to_string(),
                descriptor: tool.clone(),
            };
            if self.tools.insert(key.clone(), entry).is_some() {
                tracing::warn!(server, tool = %tool.name, "server advertised tool twice, keeping the last");
                continue;
            }
            self.by_name.entry(tool.name.clone()).or_default().push(key);
        }
    }

    /// Retain only tools whose keys appear in the allowlist.
    fn retain_tools(&mut self, allowed: &HashSet<String>) {
        let before = self.tools.len();
        self.tools.retain(|key, _| allowed.contains(key));
        for keys in self.by_name.values_mut() {
            keys.retain(|key| allowed.contains(key));
        }
        self.by_name.retain(|_, keys| !keys.is_empty());
        let after = self.tools.len();
        if before != after {
            tracing::debug!(before, after, "filtered tool registry by enabled_tools allowlist");
        }
    }

    /// Look up a tool by its key.
    pub fn get(&self, key: &str) -> Option<&RegisteredTool> {
        self.tools.get(key)
    }

    /// All tools, ordered by key.
    pub fn list(&self) -> Vec<&RegisteredTool> {
        self.tools.values().collect()
    }

    /// All keys, ordered.
    pub fn keys(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Count tools belonging to a specific server.
    pub fn tools_for_server(&self, server: &str) -> usize {
        self.tools.values().filter(|t| t.server == server).count()
    }

    /// All servers contributing at least one tool, sorted.
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.values().map(|t| t.server.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    /// Resolve a caller-supplied name to exactly one tool.
    ///
    /// 1. A registry key (`server.tool`) matches as-is.
    /// 2. A bare tool name matches when exactly one server advertises it.
    /// 3. A bare name advertised by several servers is `AmbiguousTool`.
    /// 4. Anything else is `UnknownTool`, with up to three similar keys.
    pub fn resolve(&self, name: &str) -> Result<&RegisteredTool, McpError> {
        if let Some(tool) = self.tools.get(name) {
            return Ok(tool);
        }

        match self.by_name.get(name).map(Vec::as_slice) {
            Some([key]) => self.tools.get(key).ok_or_else(|| self.unknown(name)),
            Some(keys) if keys.len() > 1 => Err(McpError::AmbiguousTool {
                name: name.to_string(),
                candidates: keys.to_vec(),
            }),
            _ => Err(self.unknown(name)),
        }
    }

    fn unknown(&self, name: &str) -> McpError {
        McpError::UnknownTool {
            name: name.to_string(),
            suggestions: self.find_similar(name, MAX_SUGGESTIONS),
        }
    }

    /// Find up to `max_results` keys most similar to `name`, best first.
    ///
    /// Qualified names are compared key-to-key; bare names are compared
    /// against each tool's bare name.
    pub fn find_similar(&self, name: &str, max_results: usize) -> Vec<String> {
        let qualified = name.contains(KEY_SEPARATOR);

        let mut scored: Vec<(&str, f64)> = self
            .tools
            .values()
            .map(|t| {
                let candidate = if qualified {
                    t.key.as_str()
                } else {
                    t.descriptor.name.as_str()
                };
                (t.key.as_str(), similarity(name, candidate))
            })
            .filter(|(_, score)| *score > SUGGESTION_FLOOR)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(max_results);
        scored.into_iter().map(|(key, _)| key.to_string()).collect()
    }

    /// Validate a tool call: tool exists and arguments match schema.
    ///
    /// This is a basic structural check: arguments form an object, required
    /// fields are present, and top-level fields have their declared JSON type.
    /// Full JSON Schema validation is left to the server.
    pub fn validate_tool_call(&self, key: &str, arguments: &serde_json::Value) -> Result<(), McpError> {
        let tool = self.resolve(key)?;
        validate_arguments(&tool.key, &tool.descriptor.input_schema, arguments)
    }

    /// Generate a concise capability summary for a system prompt.
    pub fn capability_summary(&self) -> String {
        if self.is_empty() {
            return "No MCP tools currently available.".to_string();
        }

        let server_names = self.server_names();
        let server_parts: Vec<String> = server_names
            .iter()
            .map(|name| format!("{name} ({})", self.tools_for_server(name)))
            .collect();

        format!(
            "Available capabilities ({} tools across {} servers): {}.",
            self.len(),
            server_names.len(),
            server_parts.join(", "),
        )
    }

    /// Serialize all tool definitions into OpenAI function-calling format.
    pub fn to_openai_tools(&self) -> Vec<serde_json::Value> {
        self.tools
            .values()
            .map(|tool| {
                let parameters = if tool.descriptor.input_schema.is_null() {
                    serde_json::json!({"type": "object", "properties": {}})
                } else {
                    tool.descriptor.input_schema.clone()
                };
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": tool.key,
                        "description": tool.descriptor.description,
                        "parameters": parameters,
                    }
                })
            })
            .collect()
    }
}

/// Structural argument check against a tool's input schema.
pub fn validate_arguments(
    tool: &str,
    schema: &serde_json::Value,
    arguments: &serde_json::Value,
) -> Result<(), McpError> {
    let invalid = |reason: String| McpError::InvalidArguments {
        tool: tool.to_string(),
        reason,
    };

    let empty = serde_json::Map::new();
    let args = match arguments {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null => &empty,
        other => {
            return Err(invalid(format!(
                "arguments must be a JSON object, got {}",
                json_type_name(other)
            )))
        }
    };

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field in required.iter().filter_map(|f| f.as_str()) {
            if !args.contains_key(field) {
                return Err(invalid(format!("missing required field: '{field}'")));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) {
        for (field, value) in args {
            let Some(expected) = properties
                .get(field)
                .and_then(|p| p.get("type"))
                .and_then(|t| t.as_str())
            else {
                continue;
            };
            if !json_type_matches(expected, value) {
                return Err(invalid(format!(
                    "field '{field}' should be {expected}, got {}",
                    json_type_name(value)
                )));
            }
        }
    }

    Ok(())
}

fn json_type_matches(expected: &str, value: &serde_json::Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        // Unknown type keyword: leave it to the server.
        _ => true,
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// ─── SharedRegistry ──────────────────────────────────────────────────────────

/// Live registry shared between supervisors (writers) and the router (reader).
///
/// Writers publish or withdraw a whole server's tool set; each change
/// rebuilds the snapshot and swaps it in under a write lock. Readers clone
/// the current `Arc` and never observe a half-built registry.
#[derive(Debug, Default)]
pub struct SharedRegistry {
    sources: Mutex<BTreeMap<String, Vec<ToolDescriptor>>>,
    allowed: Option<HashSet<String>>,
    snapshot: RwLock<Arc<ToolRegistry>>,
}

impl SharedRegistry {
    /// Create an empty registry, optionally restricted to `allowed` keys.
    pub fn new(allowed: Option<Vec<String>>) -> Self {
        Self {
            sources: Mutex::new(BTreeMap::new()),
            allowed: allowed.map(|keys| keys.into_iter().collect()),
            snapshot: RwLock::new(Arc::new(ToolRegistry::new())),
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<ToolRegistry> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace `server`'s tools (server became `Ready`).
    pub fn publish(&self, server: &str, tools: Vec<ToolDescriptor>) {
        let mut sources = self.sources.lock().unwrap_or_else(PoisonError::into_inner);
        sources.insert(server.to_string(), tools);
        self.rebuild(&sources);
    }

    /// Remove `server`'s tools (server left `Ready`).
    pub fn withdraw(&self, server: &str) {
        let mut sources = self.sources.lock().unwrap_or_else(PoisonError::into_inner);
        if sources.remove(server).is_some() {
            self.rebuild(&sources);
        }
    }

    fn rebuild(&self, sources: &BTreeMap<String, Vec<ToolDescriptor>>) {
        let next = ToolRegistry::build(
            sources.iter().map(|(server, tools)| (server.as_str(), tools.as_slice())),
            self.allowed.as_ref(),
        );
        tracing::debug!(tools = next.len(), servers = sources.len(), "tool registry rebuilt");
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
    }
}

// ─── Edit Distance ──────────────────────────────────────────────────────────

/// Compute the Levenshtein edit distance between two strings.
fn levenshtein(a: &str, b: &str) -> usize {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    let n = b_bytes.len();

    // Single-row DP
    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];

    for (i, a_byte) in a_bytes.iter().enumerate() {
        curr[0] = i + 1;
        for j in 1..=n {
            let cost = usize::from(*a_byte != b_bytes[j - 1]);
            curr[j] = (prev[j] + 1) // deletion
                .min(curr[j - 1] + 1) // insertion
                .min(prev[j - 1] + cost); // substitution
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}

/// Normalized similarity between two strings (0.0 = completely different, 1.0 = identical).
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 1.0;
    }
    let dist = levenshtein(a, b);
    1.0 - (dist as f64 / max_len as f64)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
