//! MCP Client: JSON-RPC tool-server orchestration.
//!
//! This module handles:
//! - Loading server entries with `${VAR}` substitution
//! - Spawning stdio servers and connecting to SSE servers
//! - Request/reply correlation over each connection
//! - Supervision with restart and exponential backoff
//! - Tool aggregation under `server.tool` keys
//! - Tool call routing, validation, and execution
//! - Typed adapters over specific servers (shell)

pub mod client;
pub mod config;
pub mod connection;
pub mod errors;
pub mod lifecycle;
pub mod registry;
pub mod router;
pub mod secrets;
pub mod shell;
mod sse;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use client::McpClient;
pub use config::{ConfigError, McpServersConfig, RawServerConfig, ServerDescriptor, TransportKind};
pub use connection::{Connection, ConnectionState};
pub use errors::McpError;
pub use lifecycle::{ServerEvent, ServerHandle, ServerState, ServerStatus};
pub use registry::{RegisteredTool, SharedRegistry, ToolRegistry};
pub use router::Router;
pub use secrets::{ChainSecrets, EnvSecrets, MapSecrets, SecretProvider};
pub use shell::ShellAdapter;
pub use types::{ToolCallResult, ToolContent, ToolDescriptor};
