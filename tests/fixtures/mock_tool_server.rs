//! Scriptable MCP tool server for the integration tests.
//!
//! Speaks newline-delimited JSON-RPC on stdio. Behaviour is driven by env:
//!
//! - `MOCK_LABEL`: prefix for `lookup` results (default `mock`)
//! - `MOCK_TOOLS`: comma-separated tool names to advertise
//!   (default `lookup,echo,slow,fail,rpc_error,crash`; `run_command`
//!   mimics a shell server)
//! - `MOCK_PAGE_SIZE`: paginate `tools/list` with this many tools per page
//! - `MOCK_INIT_DELAY_MS`: sleep before answering `initialize`
//! - `MOCK_EXIT_ON_START`: write this message to stderr and exit with code 2
//! - `MOCK_STDOUT_NOISE`: print a non-JSON line before anything else
//!
//! `tools/call` requests are answered on their own thread so slow calls do
//! not hold up fast ones.

use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn tool_names() -> Vec<String> {
    std::env::var("MOCK_TOOLS")
        .unwrap_or_else(|_| "lookup,echo,slow,fail,rpc_error,crash".to_string())
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn descriptor(name: &str) -> Value {
    let schema = match name {
        "lookup" => json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"]
        }),
        "run_command" => json!({
            "type": "object",
            "properties": {"command": {"type": "string"}},
            "required": ["command"]
        }),
        "slow" => json!({
            "type": "object",
            "properties": {"ms": {"type": "integer"}, "tag": {"type": "string"}},
            "required": ["ms"]
        }),
        _ => json!({"type": "object", "properties": {}}),
    };
    json!({"name": name, "description": format!("mock {name} tool"), "inputSchema": schema})
}

fn text(s: impl Into<String>) -> Value {
    json!({"content": [{"type": "text", "text": s.into()}]})
}

struct Out(Arc<Mutex<std::io::Stdout>>);

impl Out {
    fn send(&self, msg: Value) {
        let mut out = self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let _ = writeln!(out, "{msg}");
        let _ = out.flush();
    }

    fn reply(&self, id: &Value, result: Value) {
        self.send(json!({"jsonrpc": "2.0", "id": id, "result": result}));
    }

    fn error(&self, id: &Value, code: i64, message: &str) {
        self.send(json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}}));
    }
}

fn call_tool(out: &Out, id: &Value, params: &Value, label: &str) {
    let name = params["name"].as_str().unwrap_or_default();
    let args = &params["arguments"];
    match name {
        "lookup" => out.reply(
            id,
            text(format!("{label}:{}", args["query"].as_str().unwrap_or_default())),
        ),
        "echo" => out.reply(id, text(args.to_string())),
        "slow" => {
            std::thread::sleep(Duration::from_millis(args["ms"].as_u64().unwrap_or(0)));
            out.reply(id, text(args["tag"].as_str().unwrap_or("done").to_string()));
        }
        "fail" => out.reply(
            id,
            json!({"content": [{"type": "text", "text": "tool failed"}], "isError": true}),
        ),
        "rpc_error" => out.error(id, -32602, "bad params"),
        // `echo <text>` prints, `true` prints nothing, anything else fails.
        "run_command" => match args["command"].as_str().unwrap_or_default() {
            "true" => out.reply(id, json!({"content": []})),
            cmd => match cmd.strip_prefix("echo ") {
                Some(rest) => out.reply(id, text(rest)),
                None => out.reply(
                    id,
                    json!({
                        "content": [{"type": "text", "text": format!("{cmd}: command not found")}],
                        "isError": true
                    }),
                ),
            },
        },
        "crash" => {
            eprintln!("mock server crashing on request");
            std::process::exit(3);
        }
        other => out.error(id, -32601, &format!("unknown tool {other}")),
    }
}

fn main() {
    if let Ok(message) = std::env::var("MOCK_EXIT_ON_START") {
        eprintln!("{message}");
        std::process::exit(2);
    }

    let label = std::env::var("MOCK_LABEL").unwrap_or_else(|_| "mock".to_string());
    let tools: Vec<Value> = tool_names().iter().map(|n| descriptor(n)).collect();
    let page_size = env_u64("MOCK_PAGE_SIZE").map(|n| n.max(1) as usize);
    let out = Arc::new(Mutex::new(std::io::stdout()));

    if std::env::var("MOCK_STDOUT_NOISE").is_ok() {
        let mut o = out.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let _ = writeln!(o, "mock server booting (not json)");
        let _ = o.flush();
    }

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let Ok(msg) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let Some(method) = msg["method"].as_str() else {
            continue;
        };
        let id = msg["id"].clone();
        if id.is_null() {
            // Notification.
            continue;
        }
        let responder = Out(out.clone());

        match method {
            "initialize" => {
                if let Some(ms) = env_u64("MOCK_INIT_DELAY_MS") {
                    std::thread::sleep(Duration::from_millis(ms));
                }
                responder.reply(
                    &id,
                    json!({
                        "protocolVersion": "2024-11-05",
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": format!("mock-{label}"), "version": "0.0.1"}
                    }),
                );
            }
            "tools/list" => {
                let start: usize = msg["params"]["cursor"]
                    .as_str()
                    .and_then(|c| c.parse().ok())
                    .unwrap_or(0);
                let end = page_size.map_or(tools.len(), |n| (start + n).min(tools.len()));
                let mut result = json!({"tools": tools[start.min(end)..end]});
                if end < tools.len() {
                    result["nextCursor"] = json!(end.to_string());
                }
                responder.reply(&id, result);
            }
            "tools/call" => {
                let params = msg["params"].clone();
                let label = label.clone();
                std::thread::spawn(move || call_tool(&responder, &id, &params, &label));
            }
            "ping" => responder.reply(&id, json!({})),
            other => responder.error(&id, -32601, &format!("method not found: {other}")),
        }
    }
}
