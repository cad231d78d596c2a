//! MCP client error types.

use thiserror::Error;

use super::config::ConfigError;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// A server process (or network stream) could not be opened.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// Handshake timed out, the process exited immediately, or the
    /// capability reply was unusable.
    #[error("server '{name}' failed to start: {reason}")]
    StartupFailure { name: String, reason: String },

    /// JSON-RPC communication error (malformed message, I/O error).
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The tool ran and flagged its own result as an error. Only typed
    /// adapters raise this; `call_tool` returns such results as data.
    #[error("tool '{tool}' failed: {message}")]
    ToolFailed { tool: String, message: String },

    /// Tool not found in the aggregated registry.
    #[error("unknown tool: '{name}'{}", format_suggestions(.suggestions))]
    UnknownTool {
        name: String,
        suggestions: Vec<String>,
    },

    /// An unqualified tool name is advertised by more than one server.
    #[error("ambiguous tool '{name}': qualify it as one of {}", .candidates.join(", "))]
    AmbiguousTool {
        name: String,
        candidates: Vec<String>,
    },

    /// Tool call arguments failed schema validation.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// The owning server is not `Ready`. Callers may retry later.
    #[error("server '{name}' is unavailable ({state})")]
    ServerUnavailable { name: String, state: String },

    /// A tool call timed out.
    #[error("tool call '{tool}' timed out after {timeout_ms}ms")]
    CallTimeout { tool: String, timeout_ms: u64 },

    /// The connection closed while the call was pending.
    #[error("connection to server '{name}' lost: {reason}")]
    ConnectionLost { name: String, reason: String },

    /// All restart attempts exhausted for a server.
    #[error("server '{name}' failed after {attempts} restart attempts")]
    RestartExhausted { name: String, attempts: u32 },

    /// The orchestrator is switched off in configuration.
    #[error("MCP is not enabled")]
    Disabled,

    /// Configuration error (bad document, unresolved variable).
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl McpError {
    /// Whether a caller may reasonably retry the same call later.
    ///
    /// Only infrastructure conditions qualify; caller mistakes never do.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::ServerUnavailable { .. } | Self::CallTimeout { .. } | Self::ConnectionLost { .. }
        )
    }
}

fn format_suggestions(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!(" (did you mean: {}?)", suggestions.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_tool_message_lists_suggestions() {
        let err = McpError::UnknownTool {
            name: "memory.lokup".into(),
            suggestions: vec!["memory.lookup".into()],
        };
        assert_eq!(
            err.to_string(),
            "unknown tool: 'memory.lokup' (did you mean: memory.lookup?)"
        );

        let bare = McpError::UnknownTool {
            name: "nope".into(),
            suggestions: vec![],
        };
        assert_eq!(bare.to_string(), "unknown tool: 'nope'");
    }

    #[test]
    fn test_ambiguous_tool_message() {
        let err = McpError::AmbiguousTool {
            name: "search".into(),
            candidates: vec!["a.search".into(), "b.search".into()],
        };
        assert!(err.to_string().contains("a.search, b.search"));
    }

    #[test]
    fn test_retriable_classification() {
        assert!(McpError::CallTimeout {
            tool: "t".into(),
            timeout_ms: 10,
        }
        .is_retriable());
        assert!(McpError::ServerUnavailable {
            name: "s".into(),
            state: "closed".into(),
        }
        .is_retriable());
        assert!(!McpError::UnknownTool {
            name: "x".into(),
            suggestions: vec![],
        }
        .is_retriable());
        assert!(!McpError::Disabled.is_retriable());
    }
}
