//! Reference MCP server speaking line-delimited JSON-RPC on stdio.
//!
//! Used by the integration tests and for smoke-testing a `toolmesh.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const ALL_TOOLS: &[&str] = &["echo", "ping", "add", "fail", "sleep"];

#[derive(Debug, Parser)]
#[command(name = "tm-echo-server", version, about = "Reference MCP server over stdio")]
struct Args {
    /// Name reported in `serverInfo`.
    #[arg(long, default_value = "tm-echo-server")]
    name: String,

    /// Refuse to start when this file exists; create it otherwise.
    #[arg(long)]
    lock_file: Option<PathBuf>,

    /// Comma-separated subset of tools to advertise.
    #[arg(long, value_delimiter = ',')]
    tools: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let args = Args::parse();
    if let Some(path) = &args.lock_file {
        acquire_lock(path)?;
    }

    let tools: Vec<String> = if args.tools.is_empty() {
        ALL_TOOLS.iter().map(|t| t.to_string()).collect()
    } else {
        args.tools.clone()
    };
    tracing::info!(name = %args.name, tools = ?tools, pid = std::process::id(), "echo server ready");

    // A single writer keeps concurrent replies from interleaving.
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let message: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed line");
                continue;
            }
        };
        let Some(id) = message.get("id").cloned() else {
            tracing::debug!(method = ?message.get("method"), "notification");
            continue;
        };

        let name = args.name.clone();
        let tools = tools.clone();
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            let method = message["method"].as_str().unwrap_or_default();
            let reply = match handle(&name, &tools, method, &message["params"]).await {
                Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
                Err((code, msg)) => json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": code, "message": msg }
                }),
            };
            let _ = out_tx.send(reply.to_string()).await;
        });
    }

    tracing::info!("stdin closed, exiting");
    drop(out_tx);
    let _ = writer.await;
    if let Some(path) = &args.lock_file {
        let _ = std::fs::remove_file(path);
    }
    Ok(())
}

fn acquire_lock(path: &Path) -> anyhow::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("lock file {} already exists", path.display()))?;
    use std::io::Write;
    writeln!(file, "{}", std::process::id())?;
    Ok(())
}

async fn handle(
    name: &str,
    tools: &[String],
    method: &str,
    params: &Value,
) -> Result<Value, (i64, String)> {
    match method {
        "initialize" => Ok(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": { "tools": {} },
            "serverInfo": { "name": name, "version": env!("CARGO_PKG_VERSION") }
        })),
        "ping" => Ok(json!({})),
        "tools/list" => {
            let defs: Vec<Value> = tools.iter().filter_map(|t| tool_def(t)).collect();
            Ok(json!({ "tools": defs }))
        }
        "tools/call" => {
            let tool = params["name"].as_str().unwrap_or_default();
            if !tools.iter().any(|t| t == tool) {
                return Err((-32602, format!("unknown tool: {tool}")));
            }
            call(tool, &params["arguments"]).await
        }
        other => Err((-32601, format!("method not found: {other}"))),
    }
}

fn tool_def(name: &str) -> Option<Value> {
    let (description, properties, required) = match name {
        "echo" => (
            "Return the input text verbatim",
            json!({ "text": { "type": "string", "description": "Text to echo" } }),
            json!(["text"]),
        ),
        "ping" => ("Reply with pong", json!({}), json!([])),
        "add" => (
            "Add two numbers",
            json!({ "a": { "type": "number" }, "b": { "type": "number" } }),
            json!(["a", "b"]),
        ),
        "fail" => ("Always report a tool error", json!({}), json!([])),
        "sleep" => (
            "Wait before answering",
            json!({ "ms": { "type": "integer", "description": "Delay in milliseconds" } }),
            json!([]),
        ),
        _ => return None,
    };
    Some(json!({
        "name": name,
        "description": description,
        "inputSchema": { "type": "object", "properties": properties, "required": required }
    }))
}

fn text(s: impl Into<String>) -> Value {
    json!({ "content": [{ "type": "text", "text": s.into() }] })
}

async fn call(tool: &str, args: &Value) -> Result<Value, (i64, String)> {
    match tool {
        "echo" => {
            let t = args["text"]
                .as_str()
                .ok_or((-32602, "missing required argument: text".to_owned()))?;
            Ok(text(t))
        }
        "ping" => Ok(text("pong")),
        "add" => {
            let (Some(a), Some(b)) = (args["a"].as_f64(), args["b"].as_f64()) else {
                return Err((-32602, "a and b must be numbers".into()));
            };
            Ok(text(json!({ "sum": a + b }).to_string()))
        }
        "fail" => Ok(json!({
            "content": [{ "type": "text", "text": "deliberate failure" }],
            "isError": true
        })),
        "sleep" => {
            let ms = args["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(text(format!("slept {ms}ms")))
        }
        _ => Err((-32602, format!("unknown tool: {tool}"))),
    }
}
