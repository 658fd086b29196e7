//! MCP transport layer.
//!
//! Each MCP server communicates over a transport. Currently supported:
//! - **Stdio**: spawn a child process, exchange line-delimited JSON over
//!   stdin/stdout. Replies arrive on an inbound channel fed by a reader task.
//! - **Http**: one POST per message; the reply is the response body.
//!
//! Transports only move bytes. Envelopes, ids and correlation live in
//! [`crate::connection`].

mod http;
mod stdio;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use tm_domain::config::McpTransportKind;

pub use http::HttpTransport;
pub use stdio::StdioTransport;

/// Trait for MCP server transports.
#[async_trait]
pub trait McpTransport: Send + Sync {
    fn kind(&self) -> McpTransportKind;

    /// Send one serialized JSON-RPC message.
    ///
    /// Request/response transports return the reply body (`None` when the
    /// body was empty). Streaming transports always return `None`; their
    /// replies arrive through [`McpTransport::take_inbound`].
    async fn send(&self, message: &str) -> Result<Option<String>, TransportError>;

    /// Hand over the stream of raw inbound messages. Yields `Some` at most
    /// once, and only for transports with a receive loop.
    fn take_inbound(&self) -> Option<mpsc::Receiver<String>> {
        None
    }

    /// Check if the transport is still alive.
    fn is_alive(&self) -> bool;

    /// OS process id of a spawned server.
    fn process_id(&self) -> Option<u32> {
        None
    }

    /// Shut down the transport, allowing `grace` for a clean exit before
    /// forcing it.
    async fn shutdown(&self, grace: Duration);
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MCP server process has exited")]
    ProcessExited,

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("HTTP request timed out")]
    Timeout,

    #[error("transport is closed")]
    Closed,
}
