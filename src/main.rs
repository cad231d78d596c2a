//! mcphub CLI - start configured tool servers and talk to them.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use mcphub::mcp_client::{config, ChainSecrets, EnvSecrets, McpClient, McpServersConfig};
use mcphub::{DataDirs, LogTarget};

#[derive(Parser, Debug)]
#[command(name = "mcphub")]
#[command(about = "Supervise MCP tool servers and route tool calls to them", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file(s); later files override earlier ones (default: search
    /// for mcp-servers.yaml upward from the current directory)
    #[arg(short, long, global = true, env = "MCPHUB_CONFIG")]
    config: Vec<PathBuf>,

    /// Write logs to this file (rotated) instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Root for the servers' data and memory directories (created if
    /// missing; default: the platform data directory)
    #[arg(long, global = true, env = "MCPHUB_DATA_ROOT")]
    data_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the config and print the resolved servers
    CheckConfig,
    /// Start all servers and list the tools they advertise
    List {
        /// Print OpenAI function-calling definitions instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Call one tool and print its result
    Call {
        /// Tool key (`server.tool`) or an unambiguous bare tool name
        tool: String,

        /// Arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,

        /// Override the server's call timeout
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Start all servers and print their status
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Start all servers and stream lifecycle events until Ctrl-C
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let target = match &cli.log_file {
        Some(path) => LogTarget::File(path.clone()),
        None => LogTarget::Stderr,
    };
    mcphub::init_tracing(&target, cli.log_json).context("failed to initialize logging")?;

    let config = load_config(&cli.config)?;
    let secrets = secrets(cli.data_root.as_deref())?;

    match cli.command {
        Commands::CheckConfig => check_config(&config, &secrets),
        Commands::List { json } => {
            let client = start(&config, &secrets).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&client.to_openai_tools())?);
            } else {
                for tool in client.list_tools() {
                    println!("{:<40} {}", tool.key, tool.descriptor.description);
                }
            }
            client.shutdown_all().await;
            Ok(())
        }
        Commands::Call {
            tool,
            args,
            timeout_ms,
        } => {
            let arguments: serde_json::Value =
                serde_json::from_str(&args).context("--args must be valid JSON")?;
            let client = start(&config, &secrets).await?;
            let outcome = match timeout_ms {
                Some(ms) => {
                    client
                        .call_tool_with_timeout(&tool, arguments, Duration::from_millis(ms))
                        .await
                }
                None => client.call_tool(&tool, arguments).await,
            };
            client.shutdown_all().await;

            let result = outcome?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                bail!(
                    "tool '{}' reported an error: {}",
                    result.tool_key,
                    result.error.unwrap_or_default()
                );
            }
            Ok(())
        }
        Commands::Status { json } => {
            let client = start(&config, &secrets).await?;
            let statuses = client.servers_status();
            if json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else {
                for s in &statuses {
                    println!(
                        "{:<20} {:<6} {:<10} tools={:<4} restarts={:<3} {}",
                        s.name,
                        s.transport,
                        s.state,
                        s.tool_count,
                        s.restarts,
                        s.last_error.as_deref().unwrap_or("")
                    );
                }
            }
            client.shutdown_all().await;
            Ok(())
        }
        Commands::Watch => {
            let client = McpClient::from_config(&config, &secrets)?;
            report_config_errors(&client);
            let mut events = client.subscribe_events();
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => println!("{}", serde_json::to_string(&event)?),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "event stream lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            client.shutdown_all().await;
            Ok(())
        }
    }
}

fn load_config(paths: &[PathBuf]) -> Result<McpServersConfig> {
    let paths = if paths.is_empty() {
        let cwd = std::env::current_dir().context("cannot read current directory")?;
        vec![config::find_config_path(&cwd)?]
    } else {
        paths.to_vec()
    };
    for path in &paths {
        tracing::info!(path = %path.display(), "loading config");
    }
    Ok(McpServersConfig::from_paths(&paths)?)
}

/// Environment first, then the provisioned data directories.
fn secrets(data_root: Option<&std::path::Path>) -> Result<ChainSecrets> {
    let root = data_root.map_or_else(mcphub::data_dir, std::path::Path::to_path_buf);
    let dirs = DataDirs::under(&root);
    dirs.provision()
        .with_context(|| format!("cannot create data directories under {}", root.display()))?;
    Ok(ChainSecrets::new().push(EnvSecrets).push(dirs.secrets()))
}

fn check_config(config: &McpServersConfig, secrets: &ChainSecrets) -> Result<()> {
    if !config.is_enabled() {
        println!("MCP is disabled in this config");
        return Ok(());
    }
    let (descriptors, errors) = config::load_lenient(config, secrets);
    for d in &descriptors {
        println!(
            "ok     {:<20} {:<6} startup={}s call={}s",
            d.name,
            d.transport_kind(),
            d.startup_timeout.as_secs(),
            d.call_timeout.as_secs()
        );
    }
    for e in &errors {
        println!("error  {e}");
    }
    if !errors.is_empty() {
        bail!("{} server entr{} rejected", errors.len(), if errors.len() == 1 { "y" } else { "ies" });
    }
    Ok(())
}

async fn start(config: &McpServersConfig, secrets: &ChainSecrets) -> Result<McpClient> {
    let client = McpClient::from_config(config, secrets)?;
    report_config_errors(&client);
    for (name, err) in client.start_all().await {
        eprintln!("warning: server '{name}' failed to start: {err}");
    }
    Ok(client)
}

fn report_config_errors(client: &McpClient) {
    for e in client.config_errors() {
        eprintln!("warning: {e}");
    }
}
