//! One runtime connection to one MCP server.
//!
//! A [`Connection`] turns "send a request, get the matching response" into an
//! awaitable call over any [`McpTransport`]. For streaming transports (stdio)
//! every request registers a pending entry keyed by its id before it is
//! written, and a background receive loop resolves entries as responses
//! arrive in any order. Request/response transports (HTTP) return the reply
//! directly from `send`, so no entry is registered.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tm_domain::config::{McpServerConfig, McpTransportKind};
use tm_domain::trace::TraceEvent;

use crate::error::McpError;
use crate::protocol::{
    self, error_codes, IncomingMessage, InitializeResult, JsonRpcError, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, ServerInfo, ToolCallResult, ToolsListResult,
    METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
};
use crate::sink::EventSink;
use crate::tool::{ToolDefinition, ToolOutput};
use crate::transport::{McpTransport, TransportError};

/// Bound on waiting for the receive loop to finish during shutdown.
const RECEIVE_LOOP_JOIN_BOUND: Duration = Duration::from_secs(1);

/// Guard against servers that hand out cursors forever.
const MAX_TOOL_PAGES: usize = 100;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Initializing,
    Connected,
    Unhealthy,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Disconnected => "disconnected",
            Self::Initializing => "initializing",
            Self::Connected => "connected",
            Self::Unhealthy => "unhealthy",
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    /// Ceiling for every request on this connection.
    pub request_timeout: Duration,
    /// Passed to [`McpTransport::shutdown`].
    pub shutdown_grace: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// How a pending request was settled by someone other than its caller.
#[derive(Debug)]
enum Settled {
    Response(JsonRpcResponse),
    Cancelled,
    Closed,
}

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<Settled>>>;

/// State shared between callers and the receive loop.
struct Shared {
    server_id: String,
    transport: Arc<dyn McpTransport>,
    pending: PendingMap,
    state: Mutex<ConnectionState>,
    sink: Arc<dyn EventSink>,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        if *state != next {
            tracing::debug!(server_id = %self.server_id, from = %*state, to = %next, "connection state change");
            *state = next;
        }
    }

    /// Resolve every pending request. Only the first remover of an entry
    /// wins; callers that already timed out have removed theirs.
    fn settle_all(&self, outcome: fn() -> Settled) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let n = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(outcome());
        }
        n
    }

    async fn dispatch(&self, raw: &str) {
        match IncomingMessage::parse(raw) {
            Ok(IncomingMessage::Response(resp)) => {
                let Some(id) = resp.id.as_ref().and_then(|id| id.as_u64()) else {
                    tracing::warn!(server_id = %self.server_id, error = ?resp.error, "MCP response without a usable id");
                    return;
                };
                let waiter = self.pending.lock().remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Settled::Response(resp));
                    }
                    None => {
                        tracing::debug!(server_id = %self.server_id, id, "response for unknown or expired request");
                    }
                }
            }
            Ok(IncomingMessage::Notification { method, .. }) => {
                self.sink.emit(TraceEvent::ServerNotification {
                    server_id: self.server_id.clone(),
                    method,
                });
            }
            Ok(IncomingMessage::Request { id, method }) => {
                tracing::debug!(server_id = %self.server_id, %id, method = %method, "rejecting server-initiated request");
                let reply = JsonRpcResponse::failure(
                    id,
                    JsonRpcError::new(
                        error_codes::METHOD_NOT_FOUND,
                        format!("method not supported by client: {method}"),
                    ),
                );
                match serde_json::to_string(&reply) {
                    Ok(json) => {
                        if let Err(e) = self.transport.send(&json).await {
                            tracing::debug!(server_id = %self.server_id, error = %e, "failed to answer server request");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(server_id = %self.server_id, error = %e, "failed to encode reply");
                    }
                }
            }
            Err(e) => {
                tracing::debug!(server_id = %self.server_id, error = %e, "ignoring unparseable message from MCP server");
            }
        }
    }
}

/// Removes its pending entry when the request future completes or is
/// dropped (timeout, caller cancellation).
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl<'a> PendingGuard<'a> {
    fn register(pending: &'a PendingMap, id: u64) -> (Self, oneshot::Receiver<Settled>) {
        let (tx, rx) = oneshot::channel();
        pending.lock().insert(id, tx);
        (Self { pending, id }, rx)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

async fn receive_loop(
    shared: Arc<Shared>,
    mut inbound: mpsc::Receiver<String>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            next = inbound.recv() => next,
        };
        match next {
            Some(raw) => shared.dispatch(&raw).await,
            None => break,
        }
    }

    if shutdown.is_cancelled() {
        return;
    }
    shared.set_state(ConnectionState::Unhealthy);
    let failed = shared.settle_all(|| Settled::Closed);
    tracing::warn!(
        server_id = %shared.server_id,
        failed_requests = failed,
        "MCP server stream closed, connection marked unhealthy"
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Connection {
    descriptor: McpServerConfig,
    shared: Arc<Shared>,
    options: ConnectionOptions,
    /// Starts at 1, never reused.
    next_id: AtomicU64,
    /// Replies arrive through the receive loop rather than from `send`.
    streaming: bool,
    /// `None` means "must refetch".
    tools: Mutex<Option<Arc<[ToolDefinition]>>>,
    /// Bumped on every invalidation; a fetch that raced one is not cached.
    tools_epoch: AtomicU64,
    server_info: Mutex<Option<ServerInfo>>,
    connected_at: Mutex<Option<DateTime<Utc>>>,
    shutdown: CancellationToken,
    receive_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Wrap a transport. Starts the receive loop when the transport has an
    /// inbound stream, so this must be called inside a Tokio runtime.
    pub fn new(
        descriptor: McpServerConfig,
        transport: Arc<dyn McpTransport>,
        options: ConnectionOptions,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let shared = Arc::new(Shared {
            server_id: descriptor.id.clone(),
            transport,
            pending: Mutex::new(HashMap::new()),
            state: Mutex::new(ConnectionState::Disconnected),
            sink,
        });
        let shutdown = CancellationToken::new();

        let inbound = shared.transport.take_inbound();
        let streaming = inbound.is_some();
        let receive_loop = inbound.map(|rx| {
            tokio::spawn(receive_loop(shared.clone(), rx, shutdown.clone()))
        });

        Self {
            descriptor,
            shared,
            options,
            next_id: AtomicU64::new(1),
            streaming,
            tools: Mutex::new(None),
            tools_epoch: AtomicU64::new(0),
            server_info: Mutex::new(None),
            connected_at: Mutex::new(None),
            shutdown,
            receive_loop: Mutex::new(receive_loop),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &McpServerConfig {
        &self.descriptor
    }

    pub fn kind(&self) -> McpTransportKind {
        self.shared.transport.kind()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    pub fn mark_unhealthy(&self) {
        let mut state = self.shared.state.lock();
        if *state != ConnectionState::Disconnected {
            *state = ConnectionState::Unhealthy;
        }
    }

    /// Clear an `Unhealthy` mark after a successful probe. Returns whether
    /// the mark was set.
    pub fn restore_connected(&self) -> bool {
        let mut state = self.shared.state.lock();
        if *state == ConnectionState::Unhealthy {
            *state = ConnectionState::Connected;
            return true;
        }
        false
    }

    pub fn is_alive(&self) -> bool {
        self.shared.transport.is_alive()
    }

    pub fn process_id(&self) -> Option<u32> {
        self.shared.transport.process_id()
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.lock().clone()
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        *self.connected_at.lock()
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// The cached catalog, without fetching.
    pub fn cached_tools(&self) -> Option<Arc<[ToolDefinition]>> {
        self.tools.lock().clone()
    }

    /// Whether the cached catalog contains `tool`.
    pub fn advertises(&self, tool: &str) -> bool {
        self.tools
            .lock()
            .as_ref()
            .is_some_and(|tools| tools.iter().any(|t| t.name == tool))
    }

    pub fn invalidate_tools(&self) {
        self.tools_epoch.fetch_add(1, Ordering::SeqCst);
        *self.tools.lock() = None;
    }

    // ── handshake ───────────────────────────────────────────────────

    /// Perform the `initialize` / `notifications/initialized` handshake.
    ///
    /// A failed handshake tears down a stdio server and returns
    /// [`McpError::Handshake`]. HTTP servers stay usable: their requests
    /// simply fail until the backend answers.
    pub async fn initialize(&self, cancel: &CancellationToken) -> Result<(), McpError> {
        self.shared.set_state(ConnectionState::Initializing);

        match self.handshake(cancel).await {
            Ok(init) => {
                let info = init.server_info;
                self.shared.sink.emit(TraceEvent::ServerConnected {
                    server_id: self.name().to_owned(),
                    transport: self.kind().as_str().to_owned(),
                    server_name: info.as_ref().map(|i| i.name.clone()),
                    server_version: info.as_ref().map(|i| i.version.clone()),
                });
                *self.server_info.lock() = info;
                self.mark_connected();
                Ok(())
            }
            Err(e) if e.is_cancelled() => {
                self.shutdown().await;
                Err(e)
            }
            Err(e) => match self.kind() {
                McpTransportKind::Stdio => {
                    self.shutdown().await;
                    Err(McpError::Handshake {
                        server: self.name().to_owned(),
                        reason: e.to_string(),
                    })
                }
                McpTransportKind::Http => {
                    tracing::warn!(
                        server_id = %self.name(),
                        error = %e,
                        "MCP handshake failed, keeping HTTP server registered"
                    );
                    self.mark_connected();
                    Ok(())
                }
            },
        }
    }

    async fn handshake(&self, cancel: &CancellationToken) -> Result<InitializeResult, McpError> {
        let params = serde_json::to_value(protocol::initialize_params())
            .map_err(|e| self.malformed(format!("failed to serialize initialize params: {e}")))?;

        let result = self.request(METHOD_INITIALIZE, Some(params), cancel).await?;
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| self.malformed(format!("invalid initialize result: {e}")))?;

        tracing::debug!(
            server_id = %self.name(),
            protocol_version = %init.protocol_version,
            "MCP initialize response received"
        );

        self.notify(METHOD_INITIALIZED, None).await?;
        Ok(init)
    }

    fn mark_connected(&self) {
        *self.connected_at.lock() = Some(Utc::now());
        self.shared.set_state(ConnectionState::Connected);
    }

    // ── tools ───────────────────────────────────────────────────────

    /// The server's catalog, served from cache when present.
    pub async fn list_tools(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<[ToolDefinition]>, McpError> {
        if let Some(tools) = self.cached_tools() {
            return Ok(tools);
        }
        let epoch = self.tools_epoch.load(Ordering::SeqCst);
        let tools = self.fetch_tools(cancel).await?;

        let mut cache = self.tools.lock();
        if self.tools_epoch.load(Ordering::SeqCst) == epoch {
            *cache = Some(tools.clone());
        }
        Ok(tools)
    }

    /// Fetch the full catalog, following `nextCursor`, bypassing the cache.
    pub async fn fetch_tools(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<[ToolDefinition]>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TOOL_PAGES {
            let params = match &cursor {
                Some(c) => serde_json::json!({ "cursor": c }),
                None => serde_json::json!({}),
            };
            let result = self.request(METHOD_TOOLS_LIST, Some(params), cancel).await?;
            let page: ToolsListResult = serde_json::from_value(result)
                .map_err(|e| self.malformed(format!("invalid tools/list result: {e}")))?;

            tools.extend(page.tools.into_iter().map(ToolDefinition::from));
            match page.next_cursor.filter(|c| !c.is_empty()) {
                Some(next) => cursor = Some(next),
                None => {
                    cursor = None;
                    break;
                }
            }
        }
        if cursor.is_some() {
            tracing::warn!(server_id = %self.name(), pages = MAX_TOOL_PAGES, "tools/list pagination truncated");
        }

        tracing::debug!(server_id = %self.name(), tool_count = tools.len(), "fetched MCP tool catalog");
        Ok(tools.into())
    }

    /// Call a tool and decode its primary text result.
    pub async fn invoke(
        &self,
        tool: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, McpError> {
        let params = protocol::tool_call_params(tool, arguments);
        let result = self.request(METHOD_TOOLS_CALL, Some(params), cancel).await?;
        let result: ToolCallResult = serde_json::from_value(result)
            .map_err(|e| self.malformed(format!("invalid tools/call result: {e}")))?;

        let text = result.primary_text().unwrap_or_default().to_owned();
        if result.is_error {
            return Err(McpError::ToolFailed {
                tool: tool.to_owned(),
                server: self.name().to_owned(),
                message: if text.is_empty() {
                    "tool reported an error".into()
                } else {
                    text
                },
            });
        }
        Ok(ToolOutput::decode(text))
    }

    /// Lightweight liveness check: a real `tools/list` bounded by `timeout`.
    ///
    /// Any well-formed reply counts, including a JSON-RPC error. A transport
    /// that is already dead fails without sending anything.
    pub async fn probe(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), McpError> {
        if !self.is_alive() {
            let source = match self.kind() {
                McpTransportKind::Stdio => TransportError::ProcessExited,
                McpTransportKind::Http => TransportError::Closed,
            };
            self.mark_unhealthy();
            return Err(McpError::transport(self.name(), source));
        }

        let probe = self.request(METHOD_TOOLS_LIST, Some(serde_json::json!({})), cancel);
        match tokio::time::timeout(timeout, probe).await {
            Ok(Ok(_)) | Ok(Err(McpError::Protocol { .. })) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(McpError::Timeout {
                server: self.name().to_owned(),
                method: METHOD_TOOLS_LIST.into(),
                timeout,
            }),
        }
    }

    // ── envelope ────────────────────────────────────────────────────

    /// Send a request and wait for its result, bounded by the request
    /// timeout, the caller's `cancel` and connection shutdown.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let json = serde_json::to_string(&JsonRpcRequest::new(id, method, params))
            .map_err(|e| McpError::transport(self.name(), e.into()))?;

        let started = Instant::now();
        let outcome = if self.streaming {
            self.exchange_streaming(id, method, &json, cancel).await
        } else {
            self.exchange_direct(method, &json, cancel).await
        };

        self.shared.sink.emit(TraceEvent::RequestCompleted {
            server_id: self.name().to_owned(),
            request_id: id,
            method: method.to_owned(),
            duration_ms: started.elapsed().as_millis() as u64,
            ok: outcome.is_ok(),
        });

        let response = outcome?;
        response.into_result().map_err(|e| McpError::Protocol {
            server: self.name().to_owned(),
            code: e.code,
            message: e.message,
            data: e.data,
        })
    }

    async fn exchange_streaming(
        &self,
        id: u64,
        method: &str,
        json: &str,
        cancel: &CancellationToken,
    ) -> Result<JsonRpcResponse, McpError> {
        let (_guard, rx) = PendingGuard::register(&self.shared.pending, id);

        let exchange = async {
            self.shared
                .transport
                .send(json)
                .await
                .map_err(|e| self.transport_failure(method, e))?;
            match rx.await {
                Ok(Settled::Response(resp)) => Ok(resp),
                Ok(Settled::Closed) => Err(McpError::transport(
                    self.name(),
                    TransportError::ProcessExited,
                )),
                Ok(Settled::Cancelled) | Err(_) => Err(self.cancelled()),
            }
        };

        self.bounded(method, exchange, cancel).await
    }

    async fn exchange_direct(
        &self,
        method: &str,
        json: &str,
        cancel: &CancellationToken,
    ) -> Result<JsonRpcResponse, McpError> {
        let exchange = async {
            let body = self
                .shared
                .transport
                .send(json)
                .await
                .map_err(|e| self.transport_failure(method, e))?
                .ok_or_else(|| self.malformed(format!("empty response body for {method}")))?;

            match IncomingMessage::parse(&body) {
                Ok(IncomingMessage::Response(resp)) => Ok(resp),
                Ok(_) => Err(self.malformed(format!("expected a response to {method}"))),
                Err(e) => Err(self.malformed(format!("invalid JSON-RPC body: {e}"))),
            }
        };

        self.bounded(method, exchange, cancel).await
    }

    async fn bounded<F>(
        &self,
        method: &str,
        exchange: F,
        cancel: &CancellationToken,
    ) -> Result<JsonRpcResponse, McpError>
    where
        F: std::future::Future<Output = Result<JsonRpcResponse, McpError>>,
    {
        let timeout = self.options.request_timeout;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(self.cancelled()),
            _ = self.shutdown.cancelled() => Err(self.cancelled()),
            res = tokio::time::timeout(timeout, exchange) => match res {
                Ok(res) => res,
                Err(_) => {
                    tracing::debug!(server_id = %self.name(), method, timeout_ms = timeout.as_millis() as u64, "MCP request timed out");
                    Err(McpError::Timeout {
                        server: self.name().to_owned(),
                        method: method.to_owned(),
                        timeout,
                    })
                }
            },
        }
    }

    /// Send a one-way notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let json = serde_json::to_string(&JsonRpcNotification::new(method, params))
            .map_err(|e| McpError::transport(self.name(), e.into()))?;
        self.shared
            .transport
            .send(&json)
            .await
            .map(|_| ())
            .map_err(|e| self.transport_failure(method, e))
    }

    /// Classify a transport error. I/O-level failures mark the connection
    /// unhealthy; a client-side HTTP timeout is reported as a timeout.
    fn transport_failure(&self, method: &str, e: TransportError) -> McpError {
        if let TransportError::Timeout = e {
            return McpError::Timeout {
                server: self.name().to_owned(),
                method: method.to_owned(),
                timeout: self.descriptor.http_timeout(),
            };
        }
        tracing::warn!(server_id = %self.name(), method, error = %e, "MCP transport failure");
        self.mark_unhealthy();
        McpError::transport(self.name(), e)
    }

    fn cancelled(&self) -> McpError {
        McpError::Cancelled {
            server: self.name().to_owned(),
        }
    }

    fn malformed(&self, reason: String) -> McpError {
        McpError::Malformed {
            server: self.name().to_owned(),
            reason,
        }
    }

    // ── teardown ────────────────────────────────────────────────────

    /// Stop the receive loop, shut the transport down and resolve every
    /// still-pending request as cancelled. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        tracing::info!(server_id = %self.name(), "shutting down MCP server");
        self.shutdown.cancel();

        let cancelled = self.shared.settle_all(|| Settled::Cancelled);
        if cancelled > 0 {
            tracing::debug!(server_id = %self.name(), cancelled, "cancelled pending MCP requests");
        }

        let handle = self.receive_loop.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(RECEIVE_LOOP_JOIN_BOUND, handle).await.is_err() {
                tracing::warn!(server_id = %self.name(), "receive loop did not stop in time");
            }
        }

        self.shared.transport.shutdown(self.options.shutdown_grace).await;
        self.invalidate_tools();
        self.shared.set_state(ConnectionState::Disconnected);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name())
            .field("transport", &self.kind())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::RecordingSink;
    use crate::testing::{MockTransport, Reply};
    use serde_json::json;

    fn options(timeout_ms: u64) -> ConnectionOptions {
        ConnectionOptions {
            request_timeout: Duration::from_millis(timeout_ms),
            shutdown_grace: Duration::from_millis(50),
        }
    }

    fn connect(mock: &Arc<MockTransport>, timeout_ms: u64) -> Connection {
        Connection::new(
            McpServerConfig::stdio("mock", "mock-server", vec![]),
            mock.clone(),
            options(timeout_ms),
            Arc::new(RecordingSink::new()),
        )
    }

    #[tokio::test]
    async fn handshake_marks_connected() {
        let mock = MockTransport::serving("mock", &["echo"]);
        let conn = connect(&mock, 1000);
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        conn.initialize(&CancellationToken::new()).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.server_info().unwrap().name, "mock");
        assert!(conn.connected_at().is_some());
        assert_eq!(
            mock.sent_methods(),
            vec!["initialize", "notifications/initialized"]
        );
    }

    #[tokio::test]
    async fn request_ids_are_monotonic_from_one() {
        let mock = MockTransport::serving("mock", &["echo"]);
        let conn = connect(&mock, 1000);
        let cancel = CancellationToken::new();
        conn.request("tools/list", None, &cancel).await.unwrap();
        conn.request("tools/list", None, &cancel).await.unwrap();
        assert_eq!(mock.sent_ids(), vec![1, 2]);
    }

    #[tokio::test]
    async fn out_of_order_responses_reach_their_callers() {
        let mock = MockTransport::new(McpTransportKind::Stdio, |method, params| {
            match (method, params["name"].as_str()) {
                ("tools/call", Some("slow")) => Reply::after(
                    Duration::from_millis(150),
                    Reply::text("slow"),
                ),
                ("tools/call", Some(name)) => Reply::text(name),
                _ => Reply::Silent,
            }
        });
        let conn = Arc::new(connect(&mock, 2000));
        let cancel = CancellationToken::new();

        let slow = {
            let conn = conn.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { conn.invoke("slow", json!({}), &cancel).await })
        };
        // Let the slow request go out first.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let fast = conn.invoke("fast", json!({}), &cancel).await.unwrap();
        assert_eq!(fast, ToolOutput::Text("fast".into()));
        assert!(!slow.is_finished());

        let slow = slow.await.unwrap().unwrap();
        assert_eq!(slow, ToolOutput::Text("slow".into()));
        assert_eq!(conn.pending_requests(), 0);
    }

    #[tokio::test]
    async fn timeout_removes_pending_entry_and_connection_keeps_working() {
        let mock = MockTransport::new(McpTransportKind::Stdio, |method, params| {
            match (method, params["name"].as_str()) {
                ("tools/call", Some("hang")) => Reply::Silent,
                ("tools/call", Some(name)) => Reply::text(name),
                _ => Reply::Silent,
            }
        });
        let conn = connect(&mock, 100);
        let cancel = CancellationToken::new();

        let err = conn.invoke("hang", json!({}), &cancel).await.unwrap_err();
        assert!(err.is_timeout(), "got {err}");
        assert_eq!(conn.pending_requests(), 0);
        assert_ne!(conn.state(), ConnectionState::Unhealthy);

        let ok = conn.invoke("after", json!({}), &cancel).await.unwrap();
        assert_eq!(ok, ToolOutput::Text("after".into()));
    }

    #[tokio::test]
    async fn caller_cancellation_leaves_other_requests_alone() {
        let mock = MockTransport::new(McpTransportKind::Stdio, |method, params| {
            match (method, params["name"].as_str()) {
                ("tools/call", Some("hang")) => Reply::Silent,
                ("tools/call", Some(name)) => {
                    Reply::after(Duration::from_millis(100), Reply::text(name))
                }
                _ => Reply::Silent,
            }
        });
        let conn = Arc::new(connect(&mock, 2000));

        let doomed = CancellationToken::new();
        let hanging = {
            let conn = conn.clone();
            let doomed = doomed.clone();
            tokio::spawn(async move { conn.invoke("hang", json!({}), &doomed).await })
        };
        let survivor = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.invoke("other", json!({}), &CancellationToken::new())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        doomed.cancel();

        let err = hanging.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        let ok = survivor.await.unwrap().unwrap();
        assert_eq!(ok, ToolOutput::Text("other".into()));
        assert_eq!(conn.pending_requests(), 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_every_pending_request() {
        let mock = MockTransport::new(McpTransportKind::Stdio, |_, _| Reply::Silent);
        let conn = Arc::new(connect(&mock, 10_000));

        let waiters: Vec<_> = (0..5)
            .map(|i| {
                let conn = conn.clone();
                tokio::spawn(async move {
                    conn.invoke(&format!("t{i}"), json!({}), &CancellationToken::new())
                        .await
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(conn.pending_requests(), 5);

        tokio::time::timeout(Duration::from_secs(2), conn.shutdown())
            .await
            .expect("shutdown is bounded");

        for waiter in waiters {
            let err = waiter.await.unwrap().unwrap_err();
            assert!(err.is_cancelled(), "got {err}");
        }
        assert_eq!(conn.pending_requests(), 0);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(mock.shutdowns(), 1);

        // Idempotent.
        conn.shutdown().await;
        assert_eq!(mock.shutdowns(), 1);
    }

    #[tokio::test]
    async fn stream_close_fails_pending_and_marks_unhealthy() {
        let mock = MockTransport::new(McpTransportKind::Stdio, |_, _| Reply::Silent);
        let conn = Arc::new(connect(&mock, 10_000));

        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.invoke("x", json!({}), &CancellationToken::new()).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        mock.close_inbound();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_transport(), "got {err}");
        assert_eq!(conn.state(), ConnectionState::Unhealthy);
    }

    #[tokio::test]
    async fn stdio_handshake_failure_tears_down() {
        let mock = MockTransport::new(McpTransportKind::Stdio, |method, _| match method {
            "initialize" => Reply::error(-32603, "boom"),
            _ => Reply::Silent,
        });
        let conn = connect(&mock, 1000);
        let err = conn.initialize(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, McpError::Handshake { .. }), "got {err}");
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(mock.shutdowns(), 1);
    }

    #[tokio::test]
    async fn http_handshake_failure_is_not_fatal() {
        let mock = MockTransport::new(McpTransportKind::Http, |method, _| match method {
            "initialize" => Reply::error(-32603, "warming up"),
            "tools/list" => Reply::tools(&["search"]),
            _ => Reply::Silent,
        });
        let conn = Connection::new(
            McpServerConfig::http("remote", "http://localhost:1"),
            mock.clone(),
            options(1000),
            Arc::new(RecordingSink::new()),
        );
        conn.initialize(&CancellationToken::new()).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);

        let tools = conn.list_tools(&CancellationToken::new()).await.unwrap();
        assert_eq!(tools[0].name, "search");
    }

    #[tokio::test]
    async fn list_tools_is_cached_until_invalidated() {
        let mock = MockTransport::serving("mock", &["a", "b"]);
        let conn = connect(&mock, 1000);
        let cancel = CancellationToken::new();

        let first = conn.list_tools(&cancel).await.unwrap();
        assert_eq!(first.len(), 2);
        let sends = mock.sent_count();

        let second = conn.list_tools(&cancel).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(mock.sent_count(), sends);
        assert!(conn.advertises("a"));

        conn.invalidate_tools();
        assert!(conn.cached_tools().is_none());
        conn.list_tools(&cancel).await.unwrap();
        assert_eq!(mock.sent_count(), sends + 1);
    }

    #[tokio::test]
    async fn list_tools_follows_cursor() {
        let mock = MockTransport::new(McpTransportKind::Stdio, |method, params| {
            match (method, params["cursor"].as_str()) {
                ("tools/list", None) => Reply::Result(json!({
                    "tools": [{ "name": "one" }],
                    "nextCursor": "p2"
                })),
                ("tools/list", Some("p2")) => Reply::Result(json!({
                    "tools": [{ "name": "two" }]
                })),
                _ => Reply::Silent,
            }
        });
        let conn = connect(&mock, 1000);
        let tools = conn.fetch_tools(&CancellationToken::new()).await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn invoke_surfaces_is_error_as_tool_failure() {
        let mock = MockTransport::new(McpTransportKind::Stdio, |method, _| match method {
            "tools/call" => Reply::Result(json!({
                "content": [{ "type": "text", "text": "disk full" }],
                "isError": true
            })),
            _ => Reply::Silent,
        });
        let conn = connect(&mock, 1000);
        let err = conn
            .invoke("write", json!({}), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            McpError::ToolFailed { tool, message, .. } => {
                assert_eq!(tool, "write");
                assert_eq!(message, "disk full");
            }
            other => panic!("expected ToolFailed, got {other}"),
        }
    }

    #[tokio::test]
    async fn protocol_errors_keep_code_and_message() {
        let mock = MockTransport::new(McpTransportKind::Stdio, |_, _| {
            Reply::error(-32602, "bad params")
        });
        let conn = connect(&mock, 1000);
        let err = conn
            .invoke("x", json!({}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(
            matches!(err, McpError::Protocol { code: -32602, ref message, .. } if message == "bad params")
        );
    }

    #[tokio::test]
    async fn server_requests_are_rejected_and_notifications_reported() {
        let mock = MockTransport::serving("mock", &["a"]);
        let sink = Arc::new(RecordingSink::new());
        let _conn = Connection::new(
            McpServerConfig::stdio("mock", "mock-server", vec![]),
            mock.clone(),
            options(1000),
            sink.clone(),
        );

        mock.push_inbound(r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#);
        mock.push_inbound(r#"{"jsonrpc":"2.0","id":"srv-1","method":"sampling/createMessage"}"#);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(sink.of_kind("server_notification").len(), 1);
        let reply: Value = serde_json::from_str(&mock.sent()[0]).unwrap();
        assert_eq!(reply["id"], "srv-1");
        assert_eq!(reply["error"]["code"], error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn probe_fails_without_io_when_transport_is_dead() {
        let mock = MockTransport::serving("mock", &["a"]);
        let conn = connect(&mock, 1000);
        conn.initialize(&CancellationToken::new()).await.unwrap();
        let sends = mock.sent_count();

        mock.kill();
        let err = conn
            .probe(Duration::from_millis(100), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert_eq!(mock.sent_count(), sends);
        assert_eq!(conn.state(), ConnectionState::Unhealthy);
    }
}
