//! Typed wrapper over a shell tool server (`mcp-shell`).
//!
//! Agents consume tool output as text, so [`ShellAdapter::execute_command`]
//! folds every failure into a readable message. Use [`ShellAdapter::run`]
//! to keep the structured error.

use serde_json::json;

use super::client::McpClient;
use super::errors::McpError;

/// Server name used by the default catalogue.
pub const DEFAULT_SHELL_SERVER: &str = "mcp-shell";

/// Tool the shell server exposes for running one command.
const RUN_COMMAND: &str = "run_command";

/// Reported when a command succeeds without printing anything.
const NO_OUTPUT: &str = "Command executed successfully";

pub struct ShellAdapter<'a> {
    client: &'a McpClient,
    server: String,
}

impl<'a> ShellAdapter<'a> {
    /// Adapter for the server named [`DEFAULT_SHELL_SERVER`].
    pub fn new(client: &'a McpClient) -> Self {
        Self::for_server(client, DEFAULT_SHELL_SERVER)
    }

    pub fn for_server(client: &'a McpClient, server: impl Into<String>) -> Self {
        Self {
            client,
            server: server.into(),
        }
    }

    /// Run `command` and return its output.
    ///
    /// A result the server flags as an error becomes `McpError::ToolFailed`.
    pub async fn run(&self, command: &str) -> Result<String, McpError> {
        let key = format!("{}.{RUN_COMMAND}", self.server);
        let result = self
            .client
            .call_tool(&key, json!({ "command": command }))
            .await?;

        if !result.success {
            return Err(McpError::ToolFailed {
                message: result.error.clone().unwrap_or_else(|| result.text()),
                tool: result.tool_key,
            });
        }

        let output = result.text();
        if output.is_empty() {
            Ok(NO_OUTPUT.to_string())
        } else {
            Ok(output)
        }
    }

    /// Run `command`, rendering any failure as text.
    pub async fn execute_command(&self, command: &str) -> String {
        match self.run(command).await {
            Ok(output) => output,
            Err(e) => {
                tracing::error!(server = %self.server, error = %e, "shell command failed");
                format!("Error executing shell command: {e}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::config::McpServersConfig;
    use crate::mcp_client::secrets::MapSecrets;

    #[tokio::test]
    async fn test_missing_server_is_reported_as_text() {
        let client =
            McpClient::from_config(&McpServersConfig::default(), &MapSecrets::new()).unwrap();
        let shell = ShellAdapter::new(&client);

        assert!(matches!(
            shell.run("ls").await,
            Err(McpError::UnknownTool { .. })
        ));
        let text = shell.execute_command("ls").await;
        assert!(text.starts_with("Error executing shell command:"), "{text}");
    }
}
