//! Loading a real config file from disk and starting what it describes.

use std::io::Write;

use mcphub::mcp_client::config::Launch;
use mcphub::mcp_client::{config, ConfigError, MapSecrets, McpClient, McpServersConfig};
use mcphub::DataDirs;
use serde_json::json;

const MOCK: &str = env!("CARGO_BIN_EXE_mock-tool-server");

fn write_file(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(body.as_bytes()).unwrap();
    path
}

const BASE: &str = r#"
defaults:
  startup_timeout_secs: 10
  call_timeout_secs: 5
  shutdown_grace_secs: 1
  restart:
    max_attempts: 0
servers:
  notes:
    command: "${MOCK_BIN}"
    env:
      MOCK_LABEL: "${NOTES_LABEL:-notes}"
      MOCK_TOOLS: lookup
  remote:
    transport: sse
    url: "https://tools.example.test/sse"
    headers:
      Authorization: "Bearer ${REMOTE_TOKEN}"
"#;

#[tokio::test]
async fn test_yaml_file_starts_servers_with_substitution() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "mcp-servers.yaml", BASE);

    let cfg = McpServersConfig::from_path(&path).unwrap();
    // REMOTE_TOKEN is missing: only that server is rejected.
    let secrets = MapSecrets::new().with("MOCK_BIN", MOCK);
    let client = McpClient::from_config(&cfg, &secrets).unwrap();

    assert_eq!(client.config_errors().len(), 1);
    assert!(matches!(
        &client.config_errors()[0],
        ConfigError::UnresolvedVariable { server, var } if server == "remote" && var == "REMOTE_TOKEN"
    ));
    assert_eq!(client.configured_servers(), vec!["notes"]);

    assert!(client.start_all().await.is_empty());
    let result = client
        .call_tool("notes.lookup", json!({"query": "todo"}))
        .await
        .unwrap();
    assert_eq!(result.text(), "notes:todo");

    client.shutdown_all().await;
}

#[tokio::test]
async fn test_override_layer_replaces_server_entry() {
    let dir = tempfile::tempdir().unwrap();
    let base = write_file(dir.path(), "base.yaml", BASE);
    let local = write_file(
        dir.path(),
        "local.json",
        r#"{
            "enabled_servers": ["notes"],
            "servers": {
                "notes": {
                    "command": "${MOCK_BIN}",
                    "env": {"MOCK_LABEL": "override", "MOCK_TOOLS": "lookup,echo"}
                }
            }
        }"#,
    );

    let cfg = McpServersConfig::from_paths(&[base, local]).unwrap();
    let secrets = MapSecrets::new().with("MOCK_BIN", MOCK);
    let descriptors = config::load(&cfg, &secrets).unwrap();
    assert_eq!(descriptors.len(), 1);

    let client = McpClient::from_config(&cfg, &secrets).unwrap();
    assert!(client.config_errors().is_empty());
    assert!(client.start_all().await.is_empty());
    assert_eq!(client.tool_count(), 2);

    let result = client
        .call_tool("lookup", json!({"query": "x"}))
        .await
        .unwrap();
    assert_eq!(result.text(), "override:x");

    client.shutdown_all().await;
}

#[test]
fn test_find_config_path_walks_up() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "mcp-servers.yaml", "servers: {}\n");
    let nested = dir.path().join("a").join("b");
    std::fs::create_dir_all(&nested).unwrap();

    if std::env::var_os("MCPHUB_CONFIG").is_none() {
        assert_eq!(config::find_config_path(&nested).unwrap(), path);
    }
}

#[test]
fn test_shipped_catalogue_resolves_against_data_dirs() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config/mcp-servers.yaml");
    let cfg = McpServersConfig::from_path(&path).unwrap();

    let root = tempfile::tempdir().unwrap();
    let dirs = DataDirs::under(root.path());
    dirs.provision().unwrap();
    // PERPLEXITY_API_KEY is deliberately absent: it defaults to empty.
    let descriptors = config::load(&cfg, &dirs.secrets()).unwrap();

    let mut names: Vec<&str> = descriptors.iter().map(|d| d.name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["filesystem", "mcp-shell", "memory", "perplexity-ask"]);

    let stdio = |name: &str| match &descriptors.iter().find(|d| d.name == name).unwrap().launch {
        Launch::Stdio(launch) => launch.clone(),
        Launch::Sse(_) => panic!("{name} should be a stdio server"),
    };

    let memory = stdio("memory");
    assert_eq!(
        memory.env.get("MEMORY_FILE_PATH").map(std::path::PathBuf::from),
        Some(dirs.memory_file())
    );
    assert_eq!(stdio("perplexity-ask").env.get("PERPLEXITY_API_KEY").map(String::as_str), Some(""));
    assert_eq!(
        stdio("filesystem").args.last().map(std::path::PathBuf::from),
        Some(dirs.data.clone())
    );
    assert_eq!(stdio("mcp-shell").args, vec!["-y", "mcp-shell"]);
}
