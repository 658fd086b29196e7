use std::time::Duration;

use serde_json::Value;

use crate::transport::TransportError;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Typed outcome of every failing client-layer operation.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("failed to launch MCP server '{server}': {reason}")]
    Launch { server: String, reason: String },

    #[error("MCP handshake with '{server}' failed: {reason}")]
    Handshake { server: String, reason: String },

    /// A well-formed JSON-RPC error object from the server.
    #[error("MCP server '{server}' returned error {code}: {message}")]
    Protocol {
        server: String,
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// The server said nothing within the bound.
    #[error("MCP request '{method}' to '{server}' timed out after {}ms", timeout.as_millis())]
    Timeout {
        server: String,
        method: String,
        timeout: Duration,
    },

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// The tool ran and reported `isError: true`.
    #[error("tool execution failed: {message}")]
    ToolFailed {
        tool: String,
        server: String,
        message: String,
    },

    #[error("MCP transport error on '{server}': {source}")]
    Transport {
        server: String,
        #[source]
        source: TransportError,
    },

    #[error("MCP request to '{server}' was cancelled")]
    Cancelled { server: String },

    #[error("malformed response from '{server}': {reason}")]
    Malformed { server: String, reason: String },

    #[error("MCP server not found: {0}")]
    ServerNotFound(String),

    #[error("MCP is disabled")]
    Disabled,
}

impl McpError {
    pub fn transport(server: impl Into<String>, source: TransportError) -> Self {
        Self::Transport {
            server: server.into(),
            source,
        }
    }

    /// I/O-level failure that should wake the health monitor.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Server the failure is attributed to, when there is one.
    pub fn server(&self) -> Option<&str> {
        match self {
            Self::Launch { server, .. }
            | Self::Handshake { server, .. }
            | Self::Protocol { server, .. }
            | Self::Timeout { server, .. }
            | Self::ToolFailed { server, .. }
            | Self::Transport { server, .. }
            | Self::Cancelled { server }
            | Self::Malformed { server, .. } => Some(server),
            Self::ServerNotFound(id) => Some(id),
            Self::ToolNotFound(_) | Self::Disabled => None,
        }
    }

    /// Short caller-facing phrasing: the tool's own message for execution
    /// failures, "tool unavailable" for everything else.
    pub fn user_message(&self) -> String {
        match self {
            Self::ToolFailed { message, .. } => format!("tool execution failed: {message}"),
            Self::Cancelled { .. } => "cancelled".into(),
            _ => "tool unavailable".into(),
        }
    }
}

impl From<McpError> for tm_domain::error::Error {
    fn from(e: McpError) -> Self {
        use tm_domain::error::Error;
        match e {
            McpError::ToolNotFound(name) => Error::ToolNotFound(name),
            McpError::ToolFailed { message, .. } => Error::ToolFailed(message),
            McpError::Cancelled { .. } => Error::Cancelled,
            e @ McpError::Timeout { .. } => Error::Timeout(e.to_string()),
            e => Error::ToolUnavailable(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_messages() {
        let failed = McpError::ToolFailed {
            tool: "fail".into(),
            server: "one".into(),
            message: "boom".into(),
        };
        assert_eq!(failed.user_message(), "tool execution failed: boom");
        assert_eq!(
            McpError::ToolNotFound("x".into()).user_message(),
            "tool unavailable"
        );
    }

    #[test]
    fn timeout_and_protocol_are_distinct() {
        let timeout = McpError::Timeout {
            server: "one".into(),
            method: "tools/call".into(),
            timeout: Duration::from_millis(1500),
        };
        assert!(timeout.is_timeout());
        assert_eq!(
            timeout.to_string(),
            "MCP request 'tools/call' to 'one' timed out after 1500ms"
        );

        let protocol = McpError::Protocol {
            server: "one".into(),
            code: -32602,
            message: "bad params".into(),
            data: None,
        };
        assert!(!protocol.is_timeout());
        assert_eq!(protocol.server(), Some("one"));
    }

    #[test]
    fn converts_into_domain_error() {
        let e: tm_domain::error::Error = McpError::ToolNotFound("nope".into()).into();
        assert!(matches!(e, tm_domain::error::Error::ToolNotFound(ref n) if n == "nope"));

        let e: tm_domain::error::Error =
            McpError::transport("one", TransportError::ProcessExited).into();
        assert!(matches!(e, tm_domain::error::Error::ToolUnavailable(_)));
    }
}
