//! `toolmesh servers`: connect and print per-server status.

use tokio_util::sync::CancellationToken;

use tm_domain::config::Config;
use tm_mcp_client::{CompositeClient, ServerStatus};

pub async fn run(config: Config) -> anyhow::Result<()> {
    let client = CompositeClient::from_config(config.mcp);
    let report = client.initialize_all(&CancellationToken::new()).await;

    for failure in &report.failed {
        eprintln!("{}: {}", failure.server, failure.reason);
    }
    for status in client.status() {
        println!("{}", format_status(&status));
    }

    client.shutdown().await;
    Ok(())
}

fn format_status(s: &ServerStatus) -> String {
    let tools = s
        .tool_count
        .map_or_else(|| "-".to_owned(), |n| n.to_string());
    let since = s
        .connected_at
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default();
    format!(
        "{:<20} {:<6} {:<13} tools={:<4} {}",
        s.id, s.transport, s.state, tools, since
    )
    .trim_end()
    .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tm_mcp_client::ConnectionState;

    #[test]
    fn disconnected_server_has_no_tool_count() {
        let line = format_status(&ServerStatus {
            id: "fs".into(),
            transport: "stdio".into(),
            state: ConnectionState::Disconnected,
            tool_count: None,
            connected_at: None,
            reconnect_count: 0,
            last_probe_at: None,
        });
        assert!(line.starts_with("fs "));
        assert!(line.contains("disconnected"));
        assert!(line.ends_with("tools=-"));
    }
}
