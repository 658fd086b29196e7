//! Builds connections from declarative server descriptors.

use std::sync::Arc;

use async_trait::async_trait;

use tm_domain::config::{McpConfig, McpServerConfig, McpTransportKind};

use crate::connection::{Connection, ConnectionOptions};
use crate::error::McpError;
use crate::sink::EventSink;
use crate::transport::{HttpTransport, McpTransport, StdioTransport};

/// Turns a [`McpServerConfig`] into a live (not yet initialized)
/// [`Connection`]. The composite client uses it for the initial build and
/// for every reconnect.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn build(&self, descriptor: &McpServerConfig) -> Result<Arc<Connection>, McpError>;
}

/// Spawns stdio servers and builds HTTP clients.
pub struct DefaultConnectionFactory {
    options: ConnectionOptions,
    sink: Arc<dyn EventSink>,
}

impl DefaultConnectionFactory {
    pub fn new(options: ConnectionOptions, sink: Arc<dyn EventSink>) -> Self {
        Self { options, sink }
    }

    pub fn from_config(config: &McpConfig, sink: Arc<dyn EventSink>) -> Self {
        Self::new(
            ConnectionOptions {
                request_timeout: config.request_timeout(),
                shutdown_grace: config.shutdown_grace(),
            },
            sink,
        )
    }
}

#[async_trait]
impl ConnectionFactory for DefaultConnectionFactory {
    async fn build(&self, descriptor: &McpServerConfig) -> Result<Arc<Connection>, McpError> {
        let launch_failed = |reason: String| McpError::Launch {
            server: descriptor.id.clone(),
            reason,
        };

        let transport: Arc<dyn McpTransport> = match descriptor.transport {
            McpTransportKind::Stdio => {
                tracing::debug!(
                    server_id = %descriptor.id,
                    command = %descriptor.command,
                    args = ?descriptor.args,
                    "launching MCP server"
                );
                let t = StdioTransport::spawn(descriptor, self.sink.clone())
                    .map_err(|e| launch_failed(format!("{}: {e}", descriptor.command)))?;
                Arc::new(t)
            }
            McpTransportKind::Http => {
                let t = HttpTransport::new(descriptor).map_err(|e| launch_failed(e.to_string()))?;
                tracing::debug!(server_id = %descriptor.id, url = %t.url(), "connecting to MCP endpoint");
                Arc::new(t)
            }
        };

        Ok(Arc::new(Connection::new(
            descriptor.clone(),
            transport,
            self.options,
            self.sink.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::TracingSink;

    #[tokio::test]
    async fn missing_binary_is_a_launch_failure() {
        let factory = DefaultConnectionFactory::new(ConnectionOptions::default(), Arc::new(TracingSink));
        let cfg = McpServerConfig::stdio("ghost", "definitely-not-a-real-binary-7f3a", vec![]);
        let err = factory.build(&cfg).await.unwrap_err();
        assert!(matches!(err, McpError::Launch { ref server, .. } if server == "ghost"), "got {err}");
    }

    #[tokio::test]
    async fn http_descriptor_builds_without_io() {
        let factory = DefaultConnectionFactory::new(ConnectionOptions::default(), Arc::new(TracingSink));
        let cfg = McpServerConfig::http("remote", "http://127.0.0.1:9");
        let conn = factory.build(&cfg).await.unwrap();
        assert_eq!(conn.name(), "remote");
        assert_eq!(conn.kind(), McpTransportKind::Http);
        assert!(conn.is_alive());
    }
}
