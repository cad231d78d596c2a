//! HTTP + Server-Sent Events transport.
//!
//! The client opens a long-lived `GET` on the configured URL. The first
//! `endpoint` event names the URL (relative to the stream URL) that requests
//! are POSTed to; every later `message` event carries one JSON-RPC frame.
//! Replies arrive on the event stream, not in the POST response, so the same
//! id-based demultiplexing as stdio applies.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::Url;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::config::SseLaunch;
use super::connection::{Connection, Outbound};
use super::errors::McpError;
use super::transport::TransportHandle;

// ─── Decoder ─────────────────────────────────────────────────────────────────

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    /// Event type; `message` when the server did not name one.
    pub event: String,
    /// Data lines joined with `\n`.
    pub data: String,
}

/// Incremental `text/event-stream` decoder.
///
/// Chunks may split lines (and UTF-8 sequences) anywhere; incomplete input
/// is buffered until the next chunk.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    partial: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feed raw bytes and return every event completed by them.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.partial.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
                continue;
            }
            // Comment / keep-alive
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }

        events
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

// ─── Connect ─────────────────────────────────────────────────────────────────

/// Open the event stream and wire it to a new connection.
///
/// Returns once the stream is established; the `endpoint` event may still be
/// in flight, in which case outbound frames wait for it.
pub(crate) async fn connect(
    name: &str,
    launch: &SseLaunch,
    connect_timeout: Duration,
) -> Result<(Arc<Connection>, TransportHandle), McpError> {
    let spawn_failed = |reason: String| McpError::SpawnFailed {
        name: name.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .default_headers(header_map(&launch.headers).map_err(spawn_failed)?)
        .build()
        .map_err(|e| spawn_failed(format!("failed to build HTTP client: {e}")))?;

    let response = tokio::time::timeout(
        connect_timeout,
        client
            .get(launch.url.clone())
            .header(ACCEPT, "text/event-stream")
            .send(),
    )
    .await
    .map_err(|_| spawn_failed(format!("connecting to {} timed out", launch.url)))?
    .map_err(|e| spawn_failed(format!("failed to connect to {}: {e}", launch.url)))?;

    if !response.status().is_success() {
        return Err(spawn_failed(format!(
            "{} returned status {}",
            launch.url,
            response.status()
        )));
    }

    tracing::info!(server = name, url = %launch.url, "event stream opened");

    let (conn, outbound) = Connection::new(name);
    let conn = Arc::new(conn);
    let (endpoint_tx, endpoint_rx) = oneshot::channel();

    let reader = tokio::spawn(read_events(
        conn.clone(),
        response,
        launch.url.clone(),
        endpoint_tx,
    ));
    let writer = tokio::spawn(post_loop(conn.clone(), client, endpoint_rx, outbound));

    let (stop_tx, stop_rx) = oneshot::channel();
    let driver = tokio::spawn(drive_sse(conn.clone(), stop_rx, reader, writer));

    Ok((conn, TransportHandle::new(stop_tx, driver, None)))
}

/// Configured headers go on every request. Values are marked sensitive so
/// they never show up in debug output.
fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, String> {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| format!("invalid header name '{key}': {e}"))?;
        let mut value = HeaderValue::from_str(value)
            .map_err(|e| format!("invalid value for header '{key}': {e}"))?;
        value.set_sensitive(true);
        map.insert(name, value);
    }
    Ok(map)
}

async fn drive_sse(
    conn: Arc<Connection>,
    mut stop: oneshot::Receiver<Duration>,
    mut reader: JoinHandle<String>,
    writer: JoinHandle<()>,
) {
    let reason = tokio::select! {
        ended = &mut reader => ended.unwrap_or_else(|e| format!("event reader failed: {e}")),
        _ = conn.faulted() => "transport fault".to_string(),
        _ = &mut stop => {
            conn.drain("server stopped");
            "server stopped".to_string()
        }
    };

    reader.abort();
    writer.abort();

    conn.degrade(&reason);
    conn.mark_closed(&reason);
    tracing::info!(server = %conn.server(), reason = %reason, "transport closed");
}

/// Decode the event stream until it ends. Returns the reason it ended.
async fn read_events(
    conn: Arc<Connection>,
    response: reqwest::Response,
    base: Url,
    endpoint_tx: oneshot::Sender<Url>,
) -> String {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut decoder = SseDecoder::default();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => return format!("event stream failed: {e}"),
        };
        for event in decoder.feed(&chunk) {
            match event.event.as_str() {
                "endpoint" => {
                    let endpoint = match base.join(event.data.trim()) {
                        Ok(url) => url,
                        Err(e) => return format!("invalid endpoint '{}': {e}", event.data),
                    };
                    match endpoint_tx.take() {
                        Some(tx) => {
                            tracing::debug!(server = %conn.server(), endpoint = %endpoint, "post endpoint received");
                            let _ = tx.send(endpoint);
                        }
                        None => tracing::debug!(server = %conn.server(), "ignoring repeated endpoint event"),
                    }
                }
                "message" => conn.dispatch_raw(&event.data),
                other => tracing::trace!(server = %conn.server(), event = other, "ignoring event"),
            }
        }
    }

    "event stream ended".to_string()
}

/// Sole consumer of the outbound queue; POSTs frames one at a time so their
/// order is preserved.
async fn post_loop(
    conn: Arc<Connection>,
    client: reqwest::Client,
    endpoint: oneshot::Receiver<Url>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let Ok(endpoint) = endpoint.await else {
        return;
    };

    while let Some(frame) = outbound.recv().await {
        let body = match frame {
            Outbound::Message(body) => body,
            Outbound::Close => break,
        };
        let sent = client
            .post(endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await;
        match sent {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                conn.degrade(&format!("POST {endpoint} returned status {}", resp.status()));
                return;
            }
            Err(e) => {
                conn.degrade(&format!("POST {endpoint} failed: {e}"));
                return;
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
