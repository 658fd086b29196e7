use serde::Serialize;

/// Structured trace events emitted by the toolmesh client layer.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event")]
pub enum TraceEvent {
    ServerConnected {
        server_id: String,
        transport: String,
        server_name: Option<String>,
        server_version: Option<String>,
    },
    ServerInitFailed {
        server_id: String,
        reason: String,
    },
    ServerStderr {
        server_id: String,
        line: String,
    },
    ServerNotification {
        server_id: String,
        method: String,
    },
    RequestCompleted {
        server_id: String,
        request_id: u64,
        method: String,
        duration_ms: u64,
        ok: bool,
    },
    CatalogBuilt {
        servers: usize,
        tools: usize,
        duplicates: usize,
    },
    DuplicateTool {
        tool: String,
        owner: String,
        skipped: String,
    },
    ToolCall {
        tool: String,
        server_id: String,
        duration_ms: u64,
        ok: bool,
    },
    ToolFallback {
        tool: String,
        from_server: String,
        to_server: String,
        reason: String,
    },
    HealthProbeFailed {
        server_id: String,
        reason: String,
    },
    ServerReconnected {
        server_id: String,
        attempts: u32,
    },
    ServerRemoved {
        server_id: String,
        reason: String,
    },
}

impl TraceEvent {
    /// Short machine name of the variant (`"tool_call"`, ...).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ServerConnected { .. } => "server_connected",
            Self::ServerInitFailed { .. } => "server_init_failed",
            Self::ServerStderr { .. } => "server_stderr",
            Self::ServerNotification { .. } => "server_notification",
            Self::RequestCompleted { .. } => "request_completed",
            Self::CatalogBuilt { .. } => "catalog_built",
            Self::DuplicateTool { .. } => "duplicate_tool",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolFallback { .. } => "tool_fallback",
            Self::HealthProbeFailed { .. } => "health_probe_failed",
            Self::ServerReconnected { .. } => "server_reconnected",
            Self::ServerRemoved { .. } => "server_removed",
        }
    }

    /// High-volume events that belong at debug level.
    pub fn is_chatty(&self) -> bool {
        matches!(
            self,
            Self::ServerStderr { .. }
                | Self::ServerNotification { .. }
                | Self::RequestCompleted { .. }
        )
    }

    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        if self.is_chatty() {
            tracing::debug!(trace_event = %json, "tm_event");
        } else {
            tracing::info!(trace_event = %json, "tm_event");
        }
    }
}
