//! One live channel to one tool server.
//!
//! A [`Connection`] is transport-agnostic: the stdio and SSE transports feed
//! it inbound messages and drain its outbound queue. It owns:
//! - the per-connection call-id sequence
//! - the pending-call table used to correlate replies
//! - the lifecycle state (`Pending → Handshaking → Ready → Degraded → Closed`)
//!
//! Outbound messages go through a single queue consumed by exactly one writer
//! task, so concurrent callers never interleave frames. Inbound messages are
//! demultiplexed by id; anything that does not match a pending call is logged
//! and dropped.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};

use super::errors::McpError;
use super::types::{
    error_codes, Inbound, InboundMessage, InitializeResult, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, ListToolsResult, ToolDescriptor, PROTOCOL_VERSION,
};

/// Upper bound on `tools/list` pages, in case a server keeps handing out cursors.
const MAX_TOOL_PAGES: usize = 64;

// ─── State ───────────────────────────────────────────────────────────────────

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Transport opening (process spawning, stream connecting).
    Pending,
    /// `initialize` sent, waiting for the capability reply.
    Handshaking,
    /// Accepting tool calls.
    Ready,
    /// Transport fault observed; pending calls are being failed and the
    /// transport torn down. Never accepts calls again.
    Degraded,
    /// All handles released.
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// A frame queued for the transport writer.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// One serialized JSON-RPC message (no trailing newline).
    Message(String),
    /// Close the outbound half (stdin EOF for stdio servers).
    Close,
}

// ─── Pending calls ───────────────────────────────────────────────────────────

type Completion = oneshot::Sender<Result<JsonRpcResponse, McpError>>;

/// An in-flight request awaiting its correlated reply.
struct PendingCall {
    /// Method or tool key, for diagnostics.
    label: String,
    submitted: Instant,
    completion: Completion,
}

#[derive(Default)]
struct PendingTable {
    /// Keyed by call id; ids are issued in increasing order, so iteration
    /// order is issuance order.
    calls: BTreeMap<u64, PendingCall>,
    /// Set once the connection is going away. New calls are refused.
    closed: Option<String>,
}

/// Removes the pending entry if the waiting future is dropped or times out.
struct PendingGuard<'a> {
    conn: &'a Connection,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.conn.pending().calls.remove(&self.id);
    }
}

// ─── Connection ──────────────────────────────────────────────────────────────

/// Transport-agnostic request/reply multiplexer for one server.
pub struct Connection {
    server: String,
    next_id: AtomicU64,
    pending: Mutex<PendingTable>,
    outbound: mpsc::UnboundedSender<Outbound>,
    state: watch::Sender<ConnectionState>,
    tools: Mutex<Vec<ToolDescriptor>>,
}

impl Connection {
    /// Create a connection in the `Pending` state.
    ///
    /// The returned receiver must be handed to exactly one writer task.
    pub(crate) fn new(server: &str) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Pending);
        let conn = Self {
            server: server.to_string(),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(PendingTable::default()),
            outbound,
            state,
            tools: Mutex::new(Vec::new()),
        };
        (conn, outbound_rx)
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Tools advertised during the handshake.
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Why the connection stopped accepting calls, once it has.
    pub fn close_reason(&self) -> Option<String> {
        self.pending().closed.clone()
    }

    /// Number of calls currently awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.pending().calls.len()
    }

    fn pending(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            // Closed is terminal; Degraded only moves on to Closed.
            let allowed = match *current {
                ConnectionState::Closed => false,
                ConnectionState::Degraded => next == ConnectionState::Closed,
                _ => *current != next,
            };
            if !allowed {
                return false;
            }
            tracing::debug!(server = %self.server, from = %current, to = %next, "connection state");
            *current = next;
            true
        });
    }

    /// Wait until the connection reaches `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    /// Wait until the transport has reported a fault (or the connection closed).
    pub(crate) async fn faulted(&self) {
        let mut rx = self.subscribe();
        let _ = rx
            .wait_for(|s| matches!(s, ConnectionState::Degraded | ConnectionState::Closed))
            .await;
    }

    // ─── Outbound ────────────────────────────────────────────────────────

    fn enqueue(&self, frame: String) -> Result<(), McpError> {
        self.outbound
            .send(Outbound::Message(frame))
            .map_err(|_| McpError::ConnectionLost {
                name: self.server.clone(),
                reason: "writer has shut down".into(),
            })
    }

    /// Ask the writer to close the outbound half once queued frames are written.
    pub(crate) fn close_outbound(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    /// Send a request and wait up to `timeout` for the correlated reply.
    ///
    /// On timeout the pending entry is removed; a reply arriving later is
    /// discarded by [`Connection::dispatch`].
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        label: &str,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = serde_json::to_string(&JsonRpcRequest::new(id, method, params)).map_err(|e| {
            McpError::TransportError {
                server: self.server.clone(),
                reason: format!("failed to serialize request: {e}"),
            }
        })?;

        let (tx, rx) = oneshot::channel();
        {
            let mut table = self.pending();
            if let Some(reason) = &table.closed {
                return Err(McpError::ConnectionLost {
                    name: self.server.clone(),
                    reason: reason.clone(),
                });
            }
            table.calls.insert(
                id,
                PendingCall {
                    label: label.to_string(),
                    submitted: Instant::now(),
                    completion: tx,
                },
            );
        }
        let _guard = PendingGuard { conn: self, id };

        self.enqueue(frame)?;
        tracing::trace!(server = %self.server, call_id = id, method, "request sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(McpError::ConnectionLost {
                name: self.server.clone(),
                reason: "completion dropped".into(),
            }),
            Err(_) => {
                tracing::warn!(
                    server = %self.server,
                    call_id = id,
                    label,
                    timeout_ms = timeout.as_millis() as u64,
                    "call timed out"
                );
                Err(McpError::CallTimeout {
                    tool: label.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send a notification (no reply expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let frame = serde_json::to_string(&JsonRpcNotification::new(method, params)).map_err(
            |e| McpError::TransportError {
                server: self.server.clone(),
                reason: format!("failed to serialize notification: {e}"),
            },
        )?;
        self.enqueue(frame)
    }

    // ─── Inbound ─────────────────────────────────────────────────────────

    /// Decode one inbound frame and route it.
    ///
    /// Frames that are not JSON-RPC (stray log output on stdout) are skipped.
    pub(crate) fn dispatch_raw(&self, raw: &str) {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return;
        }
        match serde_json::from_str::<InboundMessage>(trimmed) {
            Ok(msg) => match msg.classify() {
                Some(inbound) => self.dispatch(inbound),
                None => tracing::debug!(server = %self.server, "ignoring non-JSON-RPC message"),
            },
            Err(_) => {
                tracing::trace!(server = %self.server, line = %trimmed, "skipping non-JSON output")
            }
        }
    }

    /// Route a classified inbound message.
    pub(crate) fn dispatch(&self, inbound: Inbound) {
        match inbound {
            Inbound::Response(resp) => {
                let call = self.pending().calls.remove(&resp.id);
                match call {
                    Some(call) => {
                        tracing::trace!(
                            server = %self.server,
                            call_id = resp.id,
                            label = %call.label,
                            elapsed_ms = call.submitted.elapsed().as_millis() as u64,
                            "reply received"
                        );
                        let _ = call.completion.send(Ok(resp));
                    }
                    None => tracing::debug!(
                        server = %self.server,
                        call_id = resp.id,
                        "discarding reply for unknown or expired call"
                    ),
                }
            }
            Inbound::Request { id, method } => {
                // Servers may ping us; everything else is unsupported here.
                let reply = if method == "ping" {
                    serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {}})
                } else {
                    serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {
                            "code": error_codes::METHOD_NOT_FOUND,
                            "message": format!("method '{method}' not supported by client"),
                        }
                    })
                };
                tracing::debug!(server = %self.server, method = %method, "server request");
                let _ = self.enqueue(reply.to_string());
            }
            Inbound::Notification { method } => {
                tracing::debug!(server = %self.server, method = %method, "unsolicited notification");
            }
        }
    }

    // ─── Teardown ────────────────────────────────────────────────────────

    /// Record a transport fault: refuse new calls, fail every pending call
    /// with `ConnectionLost` in issuance order, and move to `Degraded`.
    ///
    /// Only the first fault is recorded.
    pub(crate) fn degrade(&self, reason: &str) {
        if self.fail_pending(reason) {
            tracing::warn!(server = %self.server, reason, "connection degraded");
            self.set_state(ConnectionState::Degraded);
        }
    }

    /// Refuse new calls and fail pending ones without recording a fault.
    /// Used for intentional shutdown.
    pub(crate) fn drain(&self, reason: &str) {
        self.fail_pending(reason);
    }

    /// Final transition once the transport's handles are released.
    pub(crate) fn mark_closed(&self, reason: &str) {
        self.fail_pending(reason);
        self.set_state(ConnectionState::Closed);
    }

    /// Returns `false` if the table was already closed.
    fn fail_pending(&self, reason: &str) -> bool {
        let drained = {
            let mut table = self.pending();
            if table.closed.is_some() {
                return false;
            }
            table.closed = Some(reason.to_string());
            std::mem::take(&mut table.calls)
        };
        if !drained.is_empty() {
            tracing::info!(
                server = %self.server,
                count = drained.len(),
                "failing pending calls"
            );
        }
        for (_, call) in drained {
            let _ = call.completion.send(Err(McpError::ConnectionLost {
                name: self.server.clone(),
                reason: reason.to_string(),
            }));
        }
        true
    }
}

// ─── Handshake ───────────────────────────────────────────────────────────────

/// Perform the MCP initialization handshake and collect the tool list.
///
/// On success the connection is `Ready` and its tools are recorded. The
/// caller bounds the whole exchange with the startup timeout.
pub async fn handshake(conn: &Connection, timeout: Duration) -> Result<Vec<ToolDescriptor>, McpError> {
    conn.set_state(ConnectionState::Handshaking);

    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "mcphub",
            "version": env!("CARGO_PKG_VERSION"),
        }
    });
    let response = conn
        .request("initialize", Some(params), "initialize", timeout)
        .await?;
    let result = extract_result(response)?;
    let init: InitializeResult =
        serde_json::from_value(result).map_err(|e| McpError::StartupFailure {
            name: conn.server().to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    if let Some(info) = &init.server_info {
        tracing::info!(
            server = %conn.server(),
            remote_name = info.name.as_deref().unwrap_or("?"),
            remote_version = info.version.as_deref().unwrap_or("?"),
            protocol = init.protocol_version.as_deref().unwrap_or("?"),
            "server initialized"
        );
    }

    conn.notify("notifications/initialized", None).await?;

    let tools = if init.tools.is_empty() {
        list_tools(conn, timeout).await?
    } else {
        init.tools
    };

    *conn.tools.lock().unwrap_or_else(PoisonError::into_inner) = tools.clone();
    conn.set_state(ConnectionState::Ready);
    Ok(tools)
}

/// Fetch every page of `tools/list`.
async fn list_tools(conn: &Connection, timeout: Duration) -> Result<Vec<ToolDescriptor>, McpError> {
    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_TOOL_PAGES {
        let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
        let response = conn.request("tools/list", params, "tools/list", timeout).await?;
        let result = match extract_result(response) {
            Ok(result) => result,
            Err(McpError::ServerError { code, .. }) if code == error_codes::METHOD_NOT_FOUND => {
                tracing::debug!(server = %conn.server(), "server has no tools/list");
                return Ok(tools);
            }
            Err(e) => return Err(e),
        };
        let page: ListToolsResult =
            serde_json::from_value(result).map_err(|e| McpError::StartupFailure {
                name: conn.server().to_string(),
                reason: format!("failed to parse tools/list response: {e}"),
            })?;
        tools.extend(page.tools);
        match page.next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => return Ok(tools),
        }
    }

    tracing::warn!(server = %conn.server(), pages = MAX_TOOL_PAGES, "tools/list pagination truncated");
    Ok(tools)
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::types::JsonRpcError;
    use std::sync::Arc;

    /// Pull the next outbound message and return its decoded JSON.
    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> serde_json::Value {
        match rx.recv().await {
            Some(Outbound::Message(frame)) => serde_json::from_str(&frame).unwrap(),
            other => panic!("expected message frame, got {other:?}"),
        }
    }

    #[test]
    fn test_extract_result_success() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: Some(serde_json::json!({"text": "hello"})),
            error: None,
        };
        let result = extract_result(resp).unwrap();
        assert_eq!(result["text"], "hello");
    }

    #[test]
    fn test_extract_result_error() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: None,
            error: Some(JsonRpcError {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            }),
        };
        match extract_result(resp).unwrap_err() {
            McpError::ServerError { code, message, .. } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected ServerError, got {other:?}"),
        }
    }

    #[test]
    fn test_extract_result_missing_both() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: None,
            error: None,
        };
        assert!(matches!(
            extract_result(resp).unwrap_err(),
            McpError::ServerError { .. }
        ));
    }

    #[tokio::test]
    async fn test_reply_routed_by_id() {
        let (conn, mut rx) = Connection::new("memory");
        let conn = Arc::new(conn);

        let caller = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.request("tools/call", None, "memory.lookup", Duration::from_secs(5))
                    .await
            })
        };

        let frame = next_frame(&mut rx).await;
        let id = frame["id"].as_u64().unwrap();
        assert_eq!(conn.pending_count(), 1);

        conn.dispatch_raw(&format!(r#"{{"jsonrpc":"2.0","id":{id},"result":{{"ok":true}}}}"#));
        let reply = caller.await.unwrap().unwrap();
        assert_eq!(reply.result.unwrap()["ok"], true);
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_and_late_reply_is_discarded() {
        let (conn, mut rx) = Connection::new("search");

        let err = conn
            .request("tools/call", None, "search.lookup", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::CallTimeout { .. }));
        assert_eq!(conn.pending_count(), 0);

        let first = next_frame(&mut rx).await["id"].as_u64().unwrap();

        // A second call gets a fresh id.
        let conn = Arc::new(conn);
        let caller = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.request("tools/call", None, "search.lookup", Duration::from_secs(5))
                    .await
            })
        };
        let second = next_frame(&mut rx).await["id"].as_u64().unwrap();
        assert_ne!(first, second);

        // The late reply for the first id must not complete the second call.
        conn.dispatch_raw(&format!(r#"{{"jsonrpc":"2.0","id":{first},"result":{{"late":true}}}}"#));
        assert_eq!(conn.pending_count(), 1);

        conn.dispatch_raw(&format!(r#"{{"jsonrpc":"2.0","id":{second},"result":{{"late":false}}}}"#));
        let reply = caller.await.unwrap().unwrap();
        assert_eq!(reply.result.unwrap()["late"], false);
    }

    #[tokio::test]
    async fn test_degrade_fails_pending_calls_and_refuses_new_ones() {
        let (conn, mut rx) = Connection::new("shell");
        let conn = Arc::new(conn);

        let mut callers = Vec::new();
        for _ in 0..3 {
            let conn = conn.clone();
            callers.push(tokio::spawn(async move {
                conn.request("tools/call", None, "shell.run", Duration::from_secs(5))
                    .await
            }));
            next_frame(&mut rx).await;
        }
        assert_eq!(conn.pending_count(), 3);

        conn.degrade("process exited");
        assert_eq!(conn.state(), ConnectionState::Degraded);
        for caller in callers {
            let err = caller.await.unwrap().unwrap_err();
            assert!(matches!(err, McpError::ConnectionLost { ref reason, .. } if reason == "process exited"));
        }

        let err = conn
            .request("tools/call", None, "shell.run", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ConnectionLost { .. }));

        conn.mark_closed("released");
        assert_eq!(conn.state(), ConnectionState::Closed);
        // Closed is terminal.
        conn.set_state(ConnectionState::Ready);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_server_ping_is_answered() {
        let (conn, mut rx) = Connection::new("memory");
        conn.dispatch_raw(r#"{"jsonrpc":"2.0","id":"srv-9","method":"ping"}"#);
        let reply = next_frame(&mut rx).await;
        assert_eq!(reply["id"], "srv-9");
        assert!(reply["result"].is_object());

        conn.dispatch_raw(r#"{"jsonrpc":"2.0","id":3,"method":"sampling/createMessage"}"#);
        let reply = next_frame(&mut rx).await;
        assert_eq!(reply["error"]["code"], error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_handshake_with_paginated_tools_list() {
        let (conn, mut rx) = Connection::new("memory");
        let conn = Arc::new(conn);

        let hs = {
            let conn = conn.clone();
            tokio::spawn(async move { handshake(&conn, Duration::from_secs(5)).await })
        };

        let init = next_frame(&mut rx).await;
        assert_eq!(init["method"], "initialize");
        assert_eq!(init["params"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(conn.state(), ConnectionState::Handshaking);
        conn.dispatch_raw(&format!(
            r#"{{"jsonrpc":"2.0","id":{},"result":{{"protocolVersion":"2024-11-05","capabilities":{{"tools":{{}}}},"serverInfo":{{"name":"mem","version":"1"}}}}}}"#,
            init["id"]
        ));

        let initialized = next_frame(&mut rx).await;
        assert_eq!(initialized["method"], "notifications/initialized");
        assert!(initialized.get("id").is_none());

        let page1 = next_frame(&mut rx).await;
        assert_eq!(page1["method"], "tools/list");
        conn.dispatch_raw(&format!(
            r#"{{"jsonrpc":"2.0","id":{},"result":{{"tools":[{{"name":"lookup"}}],"nextCursor":"p2"}}}}"#,
            page1["id"]
        ));

        let page2 = next_frame(&mut rx).await;
        assert_eq!(page2["params"]["cursor"], "p2");
        conn.dispatch_raw(&format!(
            r#"{{"jsonrpc":"2.0","id":{},"result":{{"tools":[{{"name":"store"}}]}}}}"#,
            page2["id"]
        ));

        let tools = hs.await.unwrap().unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["lookup", "store"]);
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(conn.tools().len(), 2);
    }

    #[tokio::test]
    async fn test_handshake_uses_inline_tools() {
        let (conn, mut rx) = Connection::new("fs");
        let conn = Arc::new(conn);
        let hs = {
            let conn = conn.clone();
            tokio::spawn(async move { handshake(&conn, Duration::from_secs(5)).await })
        };
        let init = next_frame(&mut rx).await;
        conn.dispatch_raw(&format!(
            r#"{{"jsonrpc":"2.0","id":{},"result":{{"tools":[{{"name":"read_file","description":"Read"}}]}}}}"#,
            init["id"]
        ));
        let tools = hs.await.unwrap().unwrap();
        assert_eq!(tools.len(), 1);
        // Only the initialized notification follows; no tools/list request.
        let note = next_frame(&mut rx).await;
        assert_eq!(note["method"], "notifications/initialized");
        assert!(rx.try_recv().is_err());
    }
}
