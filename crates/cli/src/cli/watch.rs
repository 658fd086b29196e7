//! `toolmesh watch`: keep servers connected under the health monitor.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use tm_domain::config::Config;
use tm_mcp_client::{CompositeClient, HealthMonitor};

pub async fn run(config: Config) -> anyhow::Result<()> {
    let client = Arc::new(CompositeClient::from_config(config.mcp));
    let cancel = CancellationToken::new();

    let report = client.initialize_all(&cancel).await;
    for failure in &report.failed {
        tracing::warn!(server_id = %failure.server, reason = %failure.reason, "server not started");
    }
    tracing::info!(connected = ?report.connected, "watching MCP servers, Ctrl-C to stop");

    let monitor = HealthMonitor::new(client.clone()).spawn(cancel.clone());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    cancel.cancel();
    if let Err(e) = monitor.await {
        tracing::warn!(error = %e, "health monitor task failed");
    }
    client.shutdown().await;
    Ok(())
}
