//! MCP Client: high-level interface for tool execution.
//!
//! Owns one supervised [`ServerHandle`] per configured server, the shared
//! tool registry they publish into, and the router that dispatches calls.
//! This is the primary API used by embedders and by the `mcphub` binary.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};

use super::config::{self, ConfigError, McpServersConfig, ServerDescriptor};
use super::errors::McpError;
use super::lifecycle::{ServerEvent, ServerHandle, ServerState, ServerStatus, EVENT_CAPACITY};
use super::registry::{RegisteredTool, SharedRegistry, ToolRegistry};
use super::router::Router;
use super::secrets::SecretProvider;
use super::types::ToolCallResult;

type Servers = Arc<BTreeMap<String, ServerHandle>>;

// ─── McpClient ───────────────────────────────────────────────────────────────

/// High-level MCP client that manages multiple servers and routes tool calls.
///
/// All methods take `&self`; the client can be shared behind an `Arc` by
/// concurrent callers.
pub struct McpClient {
    servers: Servers,
    registry: Arc<SharedRegistry>,
    router: Router<Servers>,
    events: broadcast::Sender<ServerEvent>,
    /// Entries rejected at load time. The remaining servers still run.
    config_errors: Vec<ConfigError>,
    /// First-start outcomes not yet collected by `start_all`.
    startup: std::sync::Mutex<Vec<(String, oneshot::Receiver<Result<usize, McpError>>)>>,
}

impl McpClient {
    /// Resolve `config` and start supervising every enabled server.
    ///
    /// Bad server entries are logged and kept in [`McpClient::config_errors`];
    /// only a globally disabled config is an error. Must be called from
    /// within a Tokio runtime.
    pub fn from_config(
        config: &McpServersConfig,
        secrets: &dyn SecretProvider,
    ) -> Result<Self, McpError> {
        if !config.is_enabled() {
            return Err(McpError::Disabled);
        }
        let (descriptors, config_errors) = config::load_lenient(config, secrets);
        let mut client = Self::from_descriptors(descriptors, config.enabled_tools.clone());
        client.config_errors = config_errors;
        Ok(client)
    }

    /// Start supervising already-resolved descriptors.
    pub fn from_descriptors(
        descriptors: Vec<ServerDescriptor>,
        enabled_tools: Option<Vec<String>>,
    ) -> Self {
        let registry = Arc::new(SharedRegistry::new(enabled_tools));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let mut servers = BTreeMap::new();
        let mut startup = Vec::new();
        for descriptor in descriptors {
            let name = descriptor.name.clone();
            tracing::info!(
                server = %name,
                transport = %descriptor.transport_kind(),
                "starting MCP server"
            );
            let (handle, ready) = ServerHandle::spawn(descriptor, registry.clone(), events.clone());
            startup.push((name.clone(), ready));
            servers.insert(name, handle);
        }

        let servers: Servers = Arc::new(servers);
        Self {
            router: Router::new(registry.clone(), servers.clone()),
            servers,
            registry,
            events,
            config_errors: Vec::new(),
            startup: std::sync::Mutex::new(startup),
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Wait for every server's first start attempt to finish.
    ///
    /// Returns the servers that failed to start (partial startup is OK;
    /// failed servers keep retrying in the background per their restart
    /// policy). Calling this again returns an empty list.
    pub async fn start_all(&self) -> Vec<(String, McpError)> {
        let pending = std::mem::take(
            &mut *self
                .startup
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );

        let outcomes = futures::future::join_all(pending.into_iter().map(
            |(name, ready)| async move {
                let outcome = ready.await.unwrap_or_else(|_| {
                    Err(McpError::ServerUnavailable {
                        name: name.clone(),
                        state: ServerState::Stopped.to_string(),
                    })
                });
                (name, outcome)
            },
        ))
        .await;

        let mut errors = Vec::new();
        for (name, outcome) in outcomes {
            match outcome {
                Ok(tools) => tracing::debug!(server = %name, tools, "initial start complete"),
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "MCP server failed to start (non-fatal)");
                    errors.push((name, e));
                }
            }
        }

        tracing::info!(
            running_servers = self.running_server_count(),
            total_tools = self.tool_count(),
            "MCP client initialized"
        );
        errors
    }

    /// Restart a server with a fresh restart budget.
    pub fn restart_server(&self, name: &str) -> Result<(), McpError> {
        self.handle(name)?.restart()
    }

    /// Stop one server. Its tools disappear from the registry and later
    /// calls fail with `ServerUnavailable`.
    pub async fn stop_server(&self, name: &str) -> Result<(), McpError> {
        self.handle(name)?.stop().await;
        Ok(())
    }

    /// Stop every server concurrently and wait for all handles to be
    /// released.
    pub async fn shutdown_all(&self) {
        futures::future::join_all(self.servers.values().map(|h| h.stop())).await;
        tracing::info!(servers = self.servers.len(), "all MCP servers stopped");
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Execute a tool call using the owning server's call timeout.
    ///
    /// `tool` is a `server.tool` key, or a bare tool name when exactly one
    /// server advertises it.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult, McpError> {
        self.router.invoke(tool, arguments, None).await
    }

    /// Execute a tool call with an explicit timeout.
    pub async fn call_tool_with_timeout(
        &self,
        tool: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<ToolCallResult, McpError> {
        self.router.invoke(tool, arguments, Some(timeout)).await
    }

    // ─── Registry ────────────────────────────────────────────────────────

    /// Current registry snapshot. Stays valid while servers come and go.
    pub fn registry(&self) -> Arc<ToolRegistry> {
        self.registry.snapshot()
    }

    /// All tools currently callable, sorted by key.
    pub fn list_tools(&self) -> Vec<RegisteredTool> {
        self.registry().list().into_iter().cloned().collect()
    }

    pub fn tool_count(&self) -> usize {
        self.registry().len()
    }

    /// OpenAI function-calling definitions for every registered tool.
    pub fn to_openai_tools(&self) -> Vec<serde_json::Value> {
        self.registry().to_openai_tools()
    }

    pub fn capability_summary(&self) -> String {
        self.registry().capability_summary()
    }

    // ─── Status ──────────────────────────────────────────────────────────

    pub fn server_status(&self, name: &str) -> Option<ServerStatus> {
        self.servers.get(name).map(ServerHandle::status)
    }

    /// Status of every configured server, sorted by name.
    pub fn servers_status(&self) -> Vec<ServerStatus> {
        self.servers.values().map(ServerHandle::status).collect()
    }

    /// Get the number of servers currently `Ready`.
    pub fn running_server_count(&self) -> usize {
        self.servers
            .values()
            .filter(|h| h.status().state == ServerState::Ready)
            .count()
    }

    /// Names of all supervised servers (including those that failed to start).
    pub fn configured_servers(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    /// Server entries rejected while loading the config.
    pub fn config_errors(&self) -> &[ConfigError] {
        &self.config_errors
    }

    /// Receive lifecycle events from every server.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    fn handle(&self, name: &str) -> Result<&ServerHandle, McpError> {
        self.servers.get(name).ok_or_else(|| McpError::ServerUnavailable {
            name: name.to_string(),
            state: "not configured".to_string(),
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::config::RawServerConfig;
    use crate::mcp_client::secrets::MapSecrets;

    fn config_with(servers: Vec<(&str, RawServerConfig)>) -> McpServersConfig {
        McpServersConfig {
            servers: servers
                .into_iter()
                .map(|(name, raw)| (name.to_string(), raw))
                .collect(),
            ..McpServersConfig::default()
        }
    }

    #[tokio::test]
    async fn test_new_client_empty() {
        let client =
            McpClient::from_config(&McpServersConfig::default(), &MapSecrets::new()).unwrap();
        assert!(client.start_all().await.is_empty());
        assert_eq!(client.running_server_count(), 0);
        assert_eq!(client.tool_count(), 0);
        assert!(client.list_tools().is_empty());
        assert!(client.configured_servers().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_config() {
        let config = McpServersConfig {
            enabled: Some(false),
            ..config_with(vec![("fs", RawServerConfig::stdio("cat"))])
        };
        assert!(matches!(
            McpClient::from_config(&config, &MapSecrets::new()),
            Err(McpError::Disabled)
        ));
    }

    #[tokio::test]
    async fn test_bad_entries_are_reported_not_started() {
        let config = config_with(vec![
            ("needs_key", RawServerConfig::sse("https://example.test/${API_URL_PATH}")),
            ("bad.name", RawServerConfig::stdio("cat")),
        ]);
        let client = McpClient::from_config(&config, &MapSecrets::new()).unwrap();

        assert_eq!(client.config_errors().len(), 2);
        assert!(client.configured_servers().is_empty());
        assert!(client.start_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_tool_and_server() {
        let client =
            McpClient::from_config(&McpServersConfig::default(), &MapSecrets::new()).unwrap();

        let err = client
            .call_tool("files.read", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::UnknownTool { .. }));

        assert!(client.server_status("files").is_none());
        assert!(matches!(
            client.restart_server("files"),
            Err(McpError::ServerUnavailable { .. })
        ));
        assert!(client.stop_server("files").await.is_err());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_partial_startup() {
        let mut config = config_with(vec![(
            "ghost",
            RawServerConfig::stdio("definitely-not-a-real-binary-mcphub"),
        )]);
        let defaults = config.defaults.get_or_insert_with(Default::default);
        defaults.restart.max_attempts = 0;

        let client = McpClient::from_config(&config, &MapSecrets::new()).unwrap();
        let mut events = client.subscribe_events();
        let errors = client.start_all().await;

        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, "ghost");
        assert!(matches!(errors[0].1, McpError::SpawnFailed { .. }));
        assert!(matches!(
            events.recv().await.unwrap(),
            ServerEvent::StartupFailed { ref server, .. } if server == "ghost"
        ));
        assert_eq!(client.configured_servers(), vec!["ghost"]);
        assert_eq!(client.running_server_count(), 0);

        client.shutdown_all().await;
        assert_eq!(
            client.server_status("ghost").unwrap().state,
            ServerState::Stopped
        );
    }
}
