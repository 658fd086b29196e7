//! `tm-mcp-client`: client layer for MCP (Model Context Protocol) tool
//! servers.
//!
//! This crate provides:
//! - JSON-RPC 2.0 envelope and MCP payload types.
//! - Stdio (spawned child process) and HTTP transports behind one trait.
//! - A [`Connection`] per server that correlates concurrent requests, caches
//!   the server's tool catalog and enforces timeouts and cancellation.
//! - A [`CompositeClient`] that merges catalogs across servers, routes tool
//!   calls to their owner and falls back to an alternate provider once.
//! - A [`HealthMonitor`] that probes servers and reconnects or removes them.
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tm_mcp_client::{CompositeClient, HealthMonitor, McpConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let config: McpConfig = /* from TOML */;
//! let client = Arc::new(CompositeClient::from_config(config));
//! let cancel = CancellationToken::new();
//!
//! let report = client.initialize_all(&cancel).await;
//! HealthMonitor::new(client.clone()).spawn(cancel.clone());
//!
//! for tool in client.list_tools(&cancel).await?.iter() {
//!     println!("{}", tool.name);
//! }
//! let out = client.call_tool("read_file", json!({"path": "/tmp/a"}), &cancel).await?;
//! ```

pub mod composite;
pub mod config;
pub mod connection;
pub mod error;
pub mod factory;
pub mod health;
pub mod protocol;
pub mod sink;
pub mod tool;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-exports for convenience.
pub use composite::{CompositeClient, InitFailure, InitReport, ServerStatus};
pub use config::{DuplicatePolicy, McpConfig, McpServerConfig, McpTransportKind};
pub use connection::{Connection, ConnectionOptions, ConnectionState};
pub use error::McpError;
pub use factory::{ConnectionFactory, DefaultConnectionFactory};
pub use health::{HealthMonitor, HealthReport};
pub use protocol::McpToolDef;
pub use sink::{EventSink, RecordingSink, TracingSink};
pub use tool::{ToolDefinition, ToolOutput, ToolParameter};
pub use transport::{HttpTransport, McpTransport, StdioTransport, TransportError};
