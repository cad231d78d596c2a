//! Invocation router.
//!
//! Turns `(tool key, arguments)` into a `tools/call` on the owning server's
//! connection and normalises the reply. Caller mistakes (unknown or
//! ambiguous names, bad arguments) fail before any connection is touched;
//! a server that is not `Ready` fails with `ServerUnavailable` without
//! anything being written.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::connection::{extract_result, Connection, ConnectionState};
use super::errors::McpError;
use super::lifecycle::ServerHandle;
use super::registry::{validate_arguments, SharedRegistry, KEY_SEPARATOR};
use super::types::{CallToolResult, ToolCallResult, ToolContent};

/// Where a call for a given server should go.
pub struct Route {
    pub connection: Arc<Connection>,
    /// Timeout applied when the caller does not pass one.
    pub call_timeout: Duration,
}

/// Finds the live connection for a server.
pub trait ConnectionLookup: Send + Sync {
    /// Fails with `ServerUnavailable` when the server has no connection.
    fn route(&self, server: &str) -> Result<Route, McpError>;

    /// Whether `server` is supervised at all, running or not.
    fn is_configured(&self, server: &str) -> bool;
}

impl ConnectionLookup for BTreeMap<String, ServerHandle> {
    fn route(&self, server: &str) -> Result<Route, McpError> {
        let handle = self.get(server).ok_or_else(|| McpError::ServerUnavailable {
            name: server.to_string(),
            state: "not configured".to_string(),
        })?;
        let connection = handle
            .connection()
            .ok_or_else(|| McpError::ServerUnavailable {
                name: server.to_string(),
                state: handle.status().state.to_string(),
            })?;
        Ok(Route {
            connection,
            call_timeout: handle.call_timeout(),
        })
    }

    fn is_configured(&self, server: &str) -> bool {
        self.contains_key(server)
    }
}

impl<L: ConnectionLookup + ?Sized> ConnectionLookup for Arc<L> {
    fn route(&self, server: &str) -> Result<Route, McpError> {
        (**self).route(server)
    }

    fn is_configured(&self, server: &str) -> bool {
        (**self).is_configured(server)
    }
}

/// Dispatches tool calls through the registry to their owning connections.
pub struct Router<L> {
    registry: Arc<SharedRegistry>,
    servers: L,
}

impl<L: ConnectionLookup> Router<L> {
    pub fn new(registry: Arc<SharedRegistry>, servers: L) -> Self {
        Self { registry, servers }
    }

    /// Call a tool and wait up to `timeout` (or the server's default) for
    /// the reply.
    ///
    /// A JSON-RPC error reply is a completed call: it comes back as an `Ok`
    /// result with `success == false`. Infrastructure failures come back as
    /// `Err`.
    pub async fn invoke(
        &self,
        key: &str,
        arguments: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<ToolCallResult, McpError> {
        let snapshot = self.registry.snapshot();
        let tool = match snapshot.resolve(key) {
            Ok(tool) => tool,
            Err(err @ McpError::UnknownTool { .. }) => return Err(self.explain_unknown(key, err)),
            Err(err) => return Err(err),
        };
        validate_arguments(&tool.key, &tool.descriptor.input_schema, &arguments)?;

        let route = self.servers.route(&tool.server)?;
        let state = route.connection.state();
        if state != ConnectionState::Ready {
            return Err(McpError::ServerUnavailable {
                name: tool.server.clone(),
                state: state.to_string(),
            });
        }
        let timeout = timeout.unwrap_or(route.call_timeout);

        let arguments = match arguments {
            serde_json::Value::Null => serde_json::json!({}),
            other => other,
        };
        let params = serde_json::json!({
            "name": tool.descriptor.name,
            "arguments": arguments,
        });

        tracing::debug!(tool = %tool.key, server = %tool.server, "dispatching tool call");
        let start = Instant::now();
        let response = route
            .connection
            .request("tools/call", Some(params), &tool.key, timeout)
            .await?;
        let elapsed = start.elapsed().as_millis() as u64;

        let result = match extract_result(response) {
            Ok(value) => {
                let parsed: CallToolResult =
                    serde_json::from_value(value).map_err(|e| McpError::TransportError {
                        server: tool.server.clone(),
                        reason: format!("malformed tools/call result: {e}"),
                    })?;
                let mut result = ToolCallResult {
                    tool_key: tool.key.clone(),
                    server: tool.server.clone(),
                    success: !parsed.is_error,
                    content: parsed.content,
                    structured: parsed.structured_content,
                    error: None,
                    execution_time_ms: elapsed,
                };
                if parsed.is_error {
                    result.error = Some(result.text());
                }
                result
            }
            Err(McpError::ServerError { code, message, .. }) => ToolCallResult {
                tool_key: tool.key.clone(),
                server: tool.server.clone(),
                success: false,
                content: vec![ToolContent::Text {
                    text: message.clone(),
                }],
                structured: None,
                error: Some(format!("[{code}] {message}")),
                execution_time_ms: elapsed,
            },
            Err(e) => return Err(e),
        };

        tracing::info!(
            tool = %result.tool_key,
            server = %result.server,
            success = result.success,
            elapsed_ms = elapsed,
            "tool call completed"
        );
        Ok(result)
    }

    /// A qualified key whose server is configured but down has had its
    /// tools withdrawn. Report the server as unavailable rather than the
    /// tool as unknown.
    fn explain_unknown(&self, key: &str, unknown: McpError) -> McpError {
        let Some((server, _)) = key.split_once(KEY_SEPARATOR) else {
            return unknown;
        };
        if !self.servers.is_configured(server) {
            return unknown;
        }
        match self.servers.route(server) {
            Err(unavailable) => unavailable,
            Ok(route) if route.connection.state() != ConnectionState::Ready => {
                McpError::ServerUnavailable {
                    name: server.to_string(),
                    state: route.connection.state().to_string(),
                }
            }
            Ok(_) => unknown,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
