//! Server configuration loading and validation.
//!
//! Reads the declarative server list (`mcp-servers.yaml` or `.json`),
//! substitutes `${VAR}` placeholders through a [`SecretProvider`], and turns
//! each entry into a fully-resolved [`ServerDescriptor`]. Nothing downstream
//! ever sees a placeholder.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::secrets::SecretProvider;

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Problems with the configuration document or a single server entry.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config: {reason}")]
    Parse { reason: String },

    #[error("server '{server}': missing required field '{field}'")]
    MissingField { server: String, field: &'static str },

    #[error("server '{server}': field '{field}' is not valid for {transport} transport")]
    UnexpectedField {
        server: String,
        field: &'static str,
        transport: TransportKind,
    },

    #[error("invalid server name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("server '{server}': unresolved variable '${{{var}}}'")]
    UnresolvedVariable { var: String, server: String },

    #[error("server '{server}': unterminated placeholder in '{value}'")]
    MalformedPlaceholder { server: String, value: String },

    #[error("server '{server}': invalid url '{url}': {reason}")]
    InvalidUrl {
        server: String,
        url: String,
        reason: String,
    },

    #[error("server '{server}': invalid header '{header}': {reason}")]
    InvalidHeader {
        server: String,
        header: String,
        reason: String,
    },
}

impl ConfigError {
    /// Name of the server this error belongs to, if it is server-scoped.
    pub fn server(&self) -> Option<&str> {
        match self {
            Self::MissingField { server, .. }
            | Self::UnexpectedField { server, .. }
            | Self::UnresolvedVariable { server, .. }
            | Self::MalformedPlaceholder { server, .. }
            | Self::InvalidUrl { server, .. }
            | Self::InvalidHeader { server, .. } => Some(server),
            Self::InvalidName { name, .. } => Some(name),
            Self::Read { .. } | Self::Parse { .. } => None,
        }
    }
}

// ─── Raw document ────────────────────────────────────────────────────────────

/// Transport kind of a server entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Sse,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio => f.pad("stdio"),
            Self::Sse => f.pad("sse"),
        }
    }
}

/// One server entry exactly as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawServerConfig {
    /// Inferred from the fields present when omitted.
    #[serde(default)]
    pub transport: Option<TransportKind>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory for the child process.
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Overrides `defaults.startup_timeout_secs` for this server.
    #[serde(default)]
    pub startup_timeout_secs: Option<u64>,
    /// Overrides `defaults.call_timeout_secs` for this server.
    #[serde(default)]
    pub call_timeout_secs: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl RawServerConfig {
    /// A stdio entry with no args or env.
    pub fn stdio(command: impl Into<String>) -> Self {
        Self {
            transport: Some(TransportKind::Stdio),
            command: Some(command.into()),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            url: None,
            headers: BTreeMap::new(),
            enabled: true,
            startup_timeout_secs: None,
            call_timeout_secs: None,
        }
    }

    /// An SSE entry with no headers.
    pub fn sse(url: impl Into<String>) -> Self {
        Self {
            transport: Some(TransportKind::Sse),
            command: None,
            url: Some(url.into()),
            ..Self::stdio("")
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    fn kind(&self, server: &str) -> Result<TransportKind, ConfigError> {
        match (self.transport, &self.command, &self.url) {
            (Some(kind), _, _) => Ok(kind),
            (None, Some(_), _) => Ok(TransportKind::Stdio),
            (None, None, Some(_)) => Ok(TransportKind::Sse),
            (None, None, None) => Err(ConfigError::MissingField {
                server: server.to_string(),
                field: "transport",
            }),
        }
    }
}

/// Restart/backoff settings as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Timeouts and restart policy applied to every server unless overridden.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeDefaults {
    /// Bound on spawn + handshake. 30s accommodates servers that import
    /// heavy frameworks before answering `initialize`.
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default)]
    pub restart: RestartConfig,
}

fn default_startup_timeout_secs() -> u64 {
    30
}
fn default_call_timeout_secs() -> u64 {
    30
}
fn default_shutdown_grace_secs() -> u64 {
    5
}

impl Default for RuntimeDefaults {
    fn default() -> Self {
        Self {
            startup_timeout_secs: default_startup_timeout_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            restart: RestartConfig::default(),
        }
    }
}

/// Top-level servers configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServersConfig {
    /// Global switch. Absent means enabled.
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub defaults: Option<RuntimeDefaults>,
    /// Optional allowlist of server names to start.
    #[serde(default)]
    pub enabled_servers: Option<Vec<String>>,
    /// Optional allowlist of tool keys (`server.tool`) to expose.
    #[serde(default)]
    pub enabled_tools: Option<Vec<String>>,
    #[serde(default, alias = "mcpServers")]
    pub servers: BTreeMap<String, RawServerConfig>,
}

impl McpServersConfig {
    /// Parse a YAML or JSON document.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(raw).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    /// Read and parse one config file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::parse(&raw)
    }

    /// Read several files and layer them in order (later files win).
    pub fn from_paths(paths: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut merged = Self::default();
        for path in paths {
            let layer = Self::from_path(path)?;
            tracing::debug!(
                path = %path.display(),
                servers = layer.servers.len(),
                "loaded config layer"
            );
            merged = merge_configs(merged, layer);
        }
        Ok(merged)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn runtime_defaults(&self) -> RuntimeDefaults {
        self.defaults.clone().unwrap_or_default()
    }
}

// ─── Merge ──────────────────────────────────────────────────────────────────

/// Layer `overlay` on top of `base`.
///
/// Server entries in the overlay **fully replace** base entries with the
/// same name. Top-level settings are replaced only when the overlay sets them.
pub fn merge_configs(mut base: McpServersConfig, overlay: McpServersConfig) -> McpServersConfig {
    if overlay.enabled.is_some() {
        base.enabled = overlay.enabled;
    }
    if overlay.defaults.is_some() {
        base.defaults = overlay.defaults;
    }
    if overlay.enabled_servers.is_some() {
        base.enabled_servers = overlay.enabled_servers;
    }
    if overlay.enabled_tools.is_some() {
        base.enabled_tools = overlay.enabled_tools;
    }
    for (name, server) in overlay.servers {
        base.servers.insert(name, server);
    }
    base
}

// ─── Resolved descriptors ───────────────────────────────────────────────────

/// Exponential backoff policy for restarting a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RestartPolicy {
    /// Delay before restart attempt `attempt` (0-based): base, 2×base, 4×base…
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl From<&RestartConfig> for RestartPolicy {
    fn from(cfg: &RestartConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from(&RestartConfig::default())
    }
}

/// Process launch parameters, placeholders already substituted.
#[derive(Debug, Clone, PartialEq)]
pub struct StdioLaunch {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

/// Network stream parameters, placeholders already substituted.
#[derive(Debug, Clone, PartialEq)]
pub struct SseLaunch {
    pub url: reqwest::Url,
    pub headers: BTreeMap<String, String>,
}

/// How to reach a server.
#[derive(Debug, Clone, PartialEq)]
pub enum Launch {
    Stdio(StdioLaunch),
    Sse(SseLaunch),
}

/// A validated, fully-resolved server entry.
#[derive(Debug, Clone)]
pub struct ServerDescriptor {
    pub name: String,
    pub launch: Launch,
    pub startup_timeout: Duration,
    pub call_timeout: Duration,
    pub shutdown_grace: Duration,
    pub restart: RestartPolicy,
}

impl ServerDescriptor {
    pub fn transport_kind(&self) -> TransportKind {
        match self.launch {
            Launch::Stdio(_) => TransportKind::Stdio,
            Launch::Sse(_) => TransportKind::Sse,
        }
    }

    /// Validate and resolve a single raw entry.
    pub fn resolve(
        name: &str,
        raw: &RawServerConfig,
        defaults: &RuntimeDefaults,
        secrets: &dyn SecretProvider,
    ) -> Result<Self, ConfigError> {
        validate_name(name)?;
        let subst = |value: &str| substitute(value, secrets, name);

        let launch = match raw.kind(name)? {
            TransportKind::Stdio => {
                reject_field(name, TransportKind::Stdio, "url", raw.url.is_some())?;
                reject_field(
                    name,
                    TransportKind::Stdio,
                    "headers",
                    !raw.headers.is_empty(),
                )?;
                let command = raw
                    .command
                    .as_deref()
                    .map(subst)
                    .transpose()?
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| ConfigError::MissingField {
                        server: name.to_string(),
                        field: "command",
                    })?;
                let args = raw
                    .args
                    .iter()
                    .map(|a| subst(a))
                    .collect::<Result<Vec<_>, _>>()?;
                let env = raw
                    .env
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), subst(v)?)))
                    .collect::<Result<BTreeMap<_, _>, ConfigError>>()?;
                let cwd = raw.cwd.as_deref().map(subst).transpose()?.map(PathBuf::from);
                Launch::Stdio(StdioLaunch {
                    command,
                    args,
                    env,
                    cwd,
                })
            }
            TransportKind::Sse => {
                reject_field(name, TransportKind::Sse, "command", raw.command.is_some())?;
                reject_field(name, TransportKind::Sse, "args", !raw.args.is_empty())?;
                reject_field(name, TransportKind::Sse, "env", !raw.env.is_empty())?;
                reject_field(name, TransportKind::Sse, "cwd", raw.cwd.is_some())?;
                let url_raw = raw.url.as_deref().ok_or_else(|| ConfigError::MissingField {
                    server: name.to_string(),
                    field: "url",
                })?;
                let url_str = subst(url_raw)?;
                let url = parse_http_url(name, &url_str)?;
                let headers = raw
                    .headers
                    .iter()
                    .map(|(k, v)| {
                        let value = subst(v)?;
                        validate_header(name, k, &value)?;
                        Ok((k.clone(), value))
                    })
                    .collect::<Result<BTreeMap<_, _>, ConfigError>>()?;
                Launch::Sse(SseLaunch { url, headers })
            }
        };

        Ok(Self {
            name: name.to_string(),
            launch,
            startup_timeout: Duration::from_secs(
                raw.startup_timeout_secs
                    .unwrap_or(defaults.startup_timeout_secs),
            ),
            call_timeout: Duration::from_secs(
                raw.call_timeout_secs.unwrap_or(defaults.call_timeout_secs),
            ),
            shutdown_grace: Duration::from_secs(defaults.shutdown_grace_secs),
            restart: RestartPolicy::from(&defaults.restart),
        })
    }
}

fn validate_name(name: &str) -> Result<(), ConfigError> {
    let reason = if name.is_empty() {
        Some("name cannot be empty")
    } else if name.contains('.') {
        Some("'.' is reserved as the tool-key separator")
    } else if name.chars().any(char::is_whitespace) {
        Some("name cannot contain whitespace")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(ConfigError::InvalidName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

fn reject_field(
    server: &str,
    transport: TransportKind,
    field: &'static str,
    present: bool,
) -> Result<(), ConfigError> {
    if present {
        return Err(ConfigError::UnexpectedField {
            server: server.to_string(),
            field,
            transport,
        });
    }
    Ok(())
}

fn parse_http_url(server: &str, raw: &str) -> Result<reqwest::Url, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidUrl {
        server: server.to_string(),
        url: raw.to_string(),
        reason,
    };
    let url = reqwest::Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(invalid(format!("unsupported scheme '{other}'"))),
    }
}

fn validate_header(server: &str, key: &str, value: &str) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidHeader {
        server: server.to_string(),
        header: key.to_string(),
        reason,
    };
    reqwest::header::HeaderName::from_bytes(key.as_bytes()).map_err(|e| invalid(e.to_string()))?;
    reqwest::header::HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
    Ok(())
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Resolve every enabled server, failing on the first bad entry.
pub fn load(
    config: &McpServersConfig,
    secrets: &dyn SecretProvider,
) -> Result<Vec<ServerDescriptor>, ConfigError> {
    let (descriptors, errors) = load_lenient(config, secrets);
    match errors.into_iter().next() {
        Some(first) => Err(first),
        None => Ok(descriptors),
    }
}

/// Resolve every enabled server, keeping the good ones.
///
/// A bad entry only costs that server; the rest are returned alongside
/// the per-server errors.
pub fn load_lenient(
    config: &McpServersConfig,
    secrets: &dyn SecretProvider,
) -> (Vec<ServerDescriptor>, Vec<ConfigError>) {
    let defaults = config.runtime_defaults();
    let allowlist = config.enabled_servers.as_ref().filter(|l| !l.is_empty());

    let mut descriptors = Vec::new();
    let mut errors = Vec::new();

    for (name, raw) in &config.servers {
        if !raw.enabled {
            tracing::info!(server = %name, "server disabled in config, skipping");
            continue;
        }
        if let Some(list) = allowlist {
            if !list.iter().any(|n| n == name) {
                tracing::info!(server = %name, "server not in enabled_servers, skipping");
                continue;
            }
        }
        match ServerDescriptor::resolve(name, raw, &defaults, secrets) {
            Ok(descriptor) => descriptors.push(descriptor),
            Err(e) => {
                tracing::warn!(server = %name, error = %e, "rejecting server config");
                errors.push(e);
            }
        }
    }

    (descriptors, errors)
}

/// Locate the config file.
///
/// Resolution order:
/// 1. `MCPHUB_CONFIG` env var.
/// 2. `mcp-servers.yaml` / `mcp-servers.json` in `start` or any ancestor.
/// 3. `<config dir>/mcphub/mcp-servers.yaml`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, ConfigError> {
    if let Ok(path) = std::env::var("MCPHUB_CONFIG") {
        let candidate = PathBuf::from(path);
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    let mut dir = start.to_path_buf();
    loop {
        for file in ["mcp-servers.yaml", "mcp-servers.json"] {
            let candidate = dir.join(file);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        if !dir.pop() {
            break;
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let candidate = config_dir.join("mcphub").join("mcp-servers.yaml");
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(ConfigError::Read {
        path: start.display().to_string(),
        reason: "could not find mcp-servers.yaml or mcp-servers.json".into(),
    })
}

// ─── Placeholder substitution ───────────────────────────────────────────────

/// Replace every `${VAR}` / `${VAR:-default}` in `input`.
///
/// All-or-nothing: the first unresolvable name fails the whole value.
fn substitute(
    input: &str,
    secrets: &dyn SecretProvider,
    server: &str,
) -> Result<String, ConfigError> {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| ConfigError::MalformedPlaceholder {
                server: server.to_string(),
                value: input.to_string(),
            })?;
        result.push_str(&resolve_var_expr(&after[..end], secrets, server)?);
        rest = &after[end + 1..];
    }
    result.push_str(rest);

    Ok(result)
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(
    expr: &str,
    secrets: &dyn SecretProvider,
    server: &str,
) -> Result<String, ConfigError> {
    let (var_name, default) = match expr.find(":-") {
        Some(idx) => (&expr[..idx], Some(&expr[idx + 2..])),
        None => (expr, None),
    };

    match (secrets.get(var_name), default) {
        (Some(value), _) => Ok(value),
        (None, Some(default)) => Ok(expand_tilde(default)),
        (None, None) => Err(ConfigError::UnresolvedVariable {
            var: var_name.to_string(),
            server: server.to_string(),
        }),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
