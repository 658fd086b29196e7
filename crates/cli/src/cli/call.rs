//! `toolmesh call`: one-shot tool invocation.
//!
//! Text results are printed verbatim, structured results as pretty JSON.
//! Failures print the user-facing outcome on stderr. The exit code is 1,
//! except 124 for a timeout and 130 for an interrupted call.

use anyhow::Context;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use tm_domain::config::Config;
use tm_domain::error::Error;
use tm_mcp_client::{CompositeClient, ToolOutput};

pub async fn run(config: Config, tool: String, args: Option<String>) -> anyhow::Result<i32> {
    let arguments = parse_args(args.as_deref())?;

    let client = CompositeClient::from_config(config.mcp);
    let cancel = CancellationToken::new();

    // Ctrl-C cancels the in-flight call instead of killing the process, so
    // servers still get a clean shutdown.
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    client.initialize_all(&cancel).await;
    let result = client.call_tool(&tool, arguments, &cancel).await;
    client.shutdown().await;

    match result {
        Ok(out) => {
            println!("{}", render(&out)?);
            Ok(0)
        }
        Err(e) => {
            eprintln!("{}", e.user_message());
            let err = Error::from(e);
            tracing::debug!(tool = %tool, error = %err, "tool call failed");
            Ok(exit_code(&err))
        }
    }
}

fn parse_args(raw: Option<&str>) -> anyhow::Result<Value> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(Value::Object(Default::default()));
    };
    let value: Value = serde_json::from_str(raw).context("arguments must be a JSON object")?;
    anyhow::ensure!(value.is_object(), "arguments must be a JSON object, got {value}");
    Ok(value)
}

fn exit_code(err: &Error) -> i32 {
    match err {
        Error::Timeout(_) => 124,
        Error::Cancelled => 130,
        _ => 1,
    }
}

fn render(out: &ToolOutput) -> anyhow::Result<String> {
    Ok(match out {
        ToolOutput::Text(text) => text.clone(),
        ToolOutput::Structured(value) => serde_json::to_string_pretty(value)?,
    })
}
