//! Composite client: many connections presented as one tool surface.
//!
//! Owns the active connection set (kept in configuration order), the merged
//! catalog and the tool-owner map. Routing never re-queries servers: a call
//! looks up its owner in the cached map and only falls back to another
//! provider of the same name when the owner fails.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use tm_domain::config::{ConfigSeverity, DuplicatePolicy, McpConfig, McpServerConfig};
use tm_domain::trace::TraceEvent;

use crate::connection::{Connection, ConnectionState};
use crate::error::McpError;
use crate::factory::{ConnectionFactory, DefaultConnectionFactory};
use crate::sink::{EventSink, TracingSink};
use crate::tool::{ToolDefinition, ToolOutput};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reports
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Outcome of [`CompositeClient::initialize_all`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct InitReport {
    pub connected: Vec<String>,
    pub failed: Vec<InitFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InitFailure {
    pub server: String,
    pub reason: String,
}

impl InitReport {
    /// No server is usable. Reported, never fatal.
    pub fn is_empty(&self) -> bool {
        self.connected.is_empty()
    }
}

/// Point-in-time view of one configured server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub id: String,
    pub transport: String,
    pub state: ConnectionState,
    /// `None` when the server's catalog is not cached.
    pub tool_count: Option<usize>,
    pub connected_at: Option<DateTime<Utc>>,
    pub reconnect_count: u32,
    pub last_probe_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
struct ServerStats {
    reconnect_count: u32,
    last_probe_at: Option<DateTime<Utc>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Catalog
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Merged catalog plus routing tables. Replaced wholesale, never patched,
/// except for owner promotion after a successful fallback.
#[derive(Debug, Clone)]
struct Catalog {
    tools: Arc<[ToolDefinition]>,
    /// Tool name → owning server.
    owners: HashMap<String, String>,
    /// Tool name → every server advertising it, in configuration order.
    providers: HashMap<String, Vec<String>>,
    /// Active servers whose `tools/list` failed during the build.
    omitted: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
struct Duplicate {
    tool: String,
    owner: String,
    skipped: String,
}

impl Catalog {
    /// Merge per-server catalogs given in configuration order.
    fn merge(
        per_server: &[(String, Arc<[ToolDefinition]>)],
        policy: DuplicatePolicy,
    ) -> (Self, Vec<Duplicate>) {
        let mut providers: HashMap<String, Vec<String>> = HashMap::new();
        for (server, tools) in per_server {
            for tool in tools.iter() {
                let list = providers.entry(tool.name.clone()).or_default();
                if !list.contains(server) {
                    list.push(server.clone());
                }
            }
        }

        let mut owners = HashMap::new();
        let mut duplicates = Vec::new();
        for (name, servers) in &providers {
            let owner = match policy {
                DuplicatePolicy::FirstWins => servers.first(),
                DuplicatePolicy::LastWins => servers.last(),
            };
            let Some(owner) = owner else { continue };
            for other in servers.iter().filter(|s| *s != owner) {
                duplicates.push(Duplicate {
                    tool: name.clone(),
                    owner: owner.clone(),
                    skipped: other.clone(),
                });
            }
            owners.insert(name.clone(), owner.clone());
        }
        duplicates.sort_by(|a, b| a.tool.cmp(&b.tool).then(a.skipped.cmp(&b.skipped)));

        // Each name once, taken from its owner, in server-then-advertised order.
        let mut seen = HashSet::new();
        let mut tools = Vec::new();
        for (server, list) in per_server {
            for tool in list.iter() {
                if owners.get(&tool.name) == Some(server) && seen.insert(tool.name.clone()) {
                    tools.push(tool.clone());
                }
            }
        }

        (
            Self {
                tools: tools.into(),
                owners,
                providers,
                omitted: Vec::new(),
            },
            duplicates,
        )
    }

    /// Owner of `tool` plus every provider, for fallback.
    fn route(&self, tool: &str) -> Option<(String, Vec<String>)> {
        let owner = self.owners.get(tool)?.clone();
        let providers = self.providers.get(tool).cloned().unwrap_or_default();
        Some((owner, providers))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CompositeClient
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CompositeClient {
    config: McpConfig,
    factory: Arc<dyn ConnectionFactory>,
    sink: Arc<dyn EventSink>,
    /// Configuration order.
    active: RwLock<Vec<Arc<Connection>>>,
    catalog: Mutex<Option<Arc<Catalog>>>,
    /// Bumped by every invalidation; stale fetches are not cached.
    generation: AtomicU64,
    stats: Mutex<HashMap<String, ServerStats>>,
    /// Wakes the health monitor early after a transport failure.
    health_signal: Notify,
    /// Stops background work (the health monitor) on shutdown.
    lifetime: Mutex<CancellationToken>,
}

impl CompositeClient {
    pub fn new(
        config: McpConfig,
        factory: Arc<dyn ConnectionFactory>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            factory,
            sink,
            active: RwLock::new(Vec::new()),
            catalog: Mutex::new(None),
            generation: AtomicU64::new(0),
            stats: Mutex::new(HashMap::new()),
            health_signal: Notify::new(),
            lifetime: Mutex::new(CancellationToken::new()),
        }
    }

    /// Client with the default factory reporting to `tracing`.
    pub fn from_config(config: McpConfig) -> Self {
        let sink: Arc<dyn EventSink> = Arc::new(TracingSink);
        let factory = Arc::new(DefaultConnectionFactory::from_config(&config, sink.clone()));
        Self::new(config, factory, sink)
    }

    pub fn config(&self) -> &McpConfig {
        &self.config
    }

    pub(crate) fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    // ── lifecycle ───────────────────────────────────────────────────

    /// Initialize every configured server concurrently and build the
    /// tool-owner map. Servers that fail are dropped; the rest carry on.
    pub async fn initialize_all(&self, cancel: &CancellationToken) -> InitReport {
        let mut report = InitReport::default();

        let restarting = !self.active.read().is_empty();
        if restarting {
            self.shutdown().await;
        }
        {
            let mut lifetime = self.lifetime.lock();
            if lifetime.is_cancelled() {
                *lifetime = CancellationToken::new();
            }
        }

        if !self.config.enabled {
            tracing::info!("MCP disabled, no servers started");
            return report;
        }

        let client_errors: Vec<String> = self
            .config
            .client_issues()
            .into_iter()
            .filter(|issue| issue.severity == ConfigSeverity::Error)
            .map(|issue| format!("{}: {}", issue.field, issue.message))
            .collect();
        if !client_errors.is_empty() {
            let reason = format!("invalid MCP configuration ({})", client_errors.join("; "));
            tracing::error!(reason = %reason, "MCP client not started");
            for server in self.config.usable_servers() {
                report.failed.push(InitFailure {
                    server: server.id.clone(),
                    reason: reason.clone(),
                });
            }
            return report;
        }

        for (i, server) in self.config.servers.iter().enumerate() {
            let errors: Vec<String> = server
                .issues()
                .into_iter()
                .filter(|issue| issue.severity == ConfigSeverity::Error)
                .map(|issue| format!("{}: {}", issue.field, issue.message))
                .collect();
            if !errors.is_empty() {
                let id = if server.id.is_empty() {
                    format!("servers[{i}]")
                } else {
                    server.id.clone()
                };
                report.failed.push(InitFailure {
                    server: id,
                    reason: format!("invalid configuration ({})", errors.join("; ")),
                });
            }
        }

        let descriptors: Vec<McpServerConfig> =
            self.config.usable_servers().into_iter().cloned().collect();
        for d in &descriptors {
            tracing::info!(server_id = %d.id, transport = d.transport.as_str(), "initializing MCP server");
        }

        let results = join_all(descriptors.iter().map(|d| self.connect(d, cancel))).await;

        let mut connected = Vec::new();
        for (descriptor, result) in descriptors.iter().zip(results) {
            match result {
                Ok(conn) => {
                    report.connected.push(descriptor.id.clone());
                    connected.push(conn);
                }
                Err(e) => {
                    tracing::warn!(
                        server_id = %descriptor.id,
                        error = %e,
                        "failed to initialize MCP server, skipping"
                    );
                    self.sink.emit(TraceEvent::ServerInitFailed {
                        server_id: descriptor.id.clone(),
                        reason: e.to_string(),
                    });
                    report.failed.push(InitFailure {
                        server: descriptor.id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        *self.active.write() = connected;
        self.invalidate_catalog();

        if report.is_empty() {
            tracing::warn!(
                configured = self.config.servers.len(),
                "no MCP server could be initialized"
            );
            return report;
        }

        match self.list_tools(cancel).await {
            Ok(tools) => tracing::info!(
                servers = report.connected.len(),
                tools = tools.len(),
                "MCP client ready"
            ),
            Err(e) => tracing::warn!(error = %e, "failed to build MCP tool catalog"),
        }
        report
    }

    /// Build and initialize one connection.
    async fn connect(
        &self,
        descriptor: &McpServerConfig,
        cancel: &CancellationToken,
    ) -> Result<Arc<Connection>, McpError> {
        let conn = self.factory.build(descriptor).await?;
        conn.initialize(cancel).await?;
        Ok(conn)
    }

    /// Shut every connection down concurrently, then clear the active set
    /// and all caches.
    pub async fn shutdown(&self) {
        self.lifetime.lock().cancel();

        let connections = std::mem::take(&mut *self.active.write());
        join_all(connections.iter().map(|c| c.shutdown())).await;

        self.invalidate_catalog();
        if !connections.is_empty() {
            tracing::info!(count = connections.len(), "MCP client shut down");
        }
    }

    /// Token cancelled when the client shuts down.
    pub fn lifetime(&self) -> CancellationToken {
        self.lifetime.lock().clone()
    }

    // ── catalog ─────────────────────────────────────────────────────

    /// The merged catalog, from cache when present; otherwise fetched from
    /// every active connection, merged by the duplicate policy and cached.
    pub async fn list_tools(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<[ToolDefinition]>, McpError> {
        if !self.config.enabled {
            return Ok(Arc::from(Vec::new()));
        }
        Ok(self.current_catalog(cancel).await?.tools.clone())
    }

    /// The cached catalog, or a freshly built one. A build that raced with
    /// an invalidation is returned to the caller but not cached.
    async fn current_catalog(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<Catalog>, McpError> {
        if let Some(catalog) = self.catalog.lock().as_ref() {
            return Ok(catalog.clone());
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let connections = self.connections();
        let results = join_all(connections.iter().map(|c| c.list_tools(cancel))).await;

        let mut per_server = Vec::with_capacity(connections.len());
        let mut omitted = Vec::new();
        for (conn, result) in connections.iter().zip(results) {
            match result {
                Ok(tools) => per_server.push((conn.name().to_owned(), tools)),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::warn!(server_id = %conn.name(), error = %e, "tools/list failed, server omitted from catalog");
                    if e.is_transport() {
                        self.health_signal.notify_one();
                    }
                    omitted.push(conn.name().to_owned());
                }
            }
        }

        let (mut catalog, duplicates) = Catalog::merge(&per_server, self.config.duplicate_policy);
        catalog.omitted = omitted;
        for dup in &duplicates {
            tracing::warn!(
                tool = %dup.tool,
                owner = %dup.owner,
                skipped = %dup.skipped,
                "duplicate MCP tool name"
            );
            self.sink.emit(TraceEvent::DuplicateTool {
                tool: dup.tool.clone(),
                owner: dup.owner.clone(),
                skipped: dup.skipped.clone(),
            });
        }
        self.sink.emit(TraceEvent::CatalogBuilt {
            servers: per_server.len(),
            tools: catalog.tools.len(),
            duplicates: duplicates.len(),
        });

        let catalog = Arc::new(catalog);
        let mut slot = self.catalog.lock();
        if self.generation.load(Ordering::SeqCst) == generation {
            *slot = Some(catalog.clone());
        } else {
            tracing::debug!("catalog invalidated during fetch, not caching");
        }
        Ok(catalog)
    }

    /// Drop the merged catalog only; per-connection catalogs stay cached.
    fn drop_merged_catalog(&self) {
        let mut slot = self.catalog.lock();
        self.generation.fetch_add(1, Ordering::SeqCst);
        *slot = None;
    }

    /// Atomically drop the merged catalog, the owner map and every
    /// connection's cached catalog.
    pub fn invalidate_catalog(&self) {
        self.drop_merged_catalog();
        for conn in self.active.read().iter() {
            conn.invalidate_tools();
        }
    }

    /// Current owner of `tool` in the cached map.
    pub fn tool_owner(&self, tool: &str) -> Option<String> {
        self.catalog
            .lock()
            .as_ref()
            .and_then(|c| c.owners.get(tool).cloned())
    }

    fn promote(&self, tool: &str, from: &str, to: &str) {
        let mut catalog = self.catalog.lock();
        if let Some(catalog) = catalog.as_mut() {
            if catalog.owners.get(tool).map(String::as_str) == Some(from) {
                Arc::make_mut(catalog)
                    .owners
                    .insert(tool.to_owned(), to.to_owned());
            }
        }
    }

    // ── routing ─────────────────────────────────────────────────────

    /// Route a call to the tool's owner, falling back once to another
    /// provider of the same name if the owner fails.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, McpError> {
        if !self.config.enabled {
            return Err(McpError::Disabled);
        }
        let (owner_id, providers) = self
            .current_catalog(cancel)
            .await?
            .route(tool)
            .ok_or_else(|| McpError::ToolNotFound(tool.to_owned()))?;

        let first = match self.connection(&owner_id) {
            Some(owner) => self.invoke_on(&owner, tool, arguments.clone(), cancel).await,
            None => Err(McpError::ServerNotFound(owner_id.clone())),
        };
        let err = match first {
            Ok(out) => return Ok(out),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => e,
        };

        let alternate = providers
            .iter()
            .filter(|id| **id != owner_id)
            .filter_map(|id| self.connection(id))
            .find(|c| c.state() == ConnectionState::Connected);
        let Some(alternate) = alternate else {
            tracing::warn!(tool = %tool, server_id = %owner_id, error = %err, "MCP tool call failed, no alternate provider");
            return Err(err);
        };

        tracing::warn!(
            tool = %tool,
            from = %owner_id,
            to = %alternate.name(),
            error = %err,
            "MCP tool call failed, retrying on alternate provider"
        );
        match self.invoke_on(&alternate, tool, arguments, cancel).await {
            Ok(out) => {
                self.promote(tool, &owner_id, alternate.name());
                self.sink.emit(TraceEvent::ToolFallback {
                    tool: tool.to_owned(),
                    from_server: owner_id,
                    to_server: alternate.name().to_owned(),
                    reason: err.to_string(),
                });
                Ok(out)
            }
            Err(retry) if retry.is_cancelled() => Err(retry),
            Err(retry) => {
                tracing::warn!(tool = %tool, server_id = %alternate.name(), error = %retry, "fallback call failed");
                Err(err)
            }
        }
    }

    async fn invoke_on(
        &self,
        conn: &Connection,
        tool: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, McpError> {
        let started = Instant::now();
        let result = conn.invoke(tool, arguments, cancel).await;
        self.sink.emit(TraceEvent::ToolCall {
            tool: tool.to_owned(),
            server_id: conn.name().to_owned(),
            duration_ms: started.elapsed().as_millis() as u64,
            ok: result.is_ok(),
        });
        if let Err(e) = &result {
            if e.is_transport() {
                self.health_signal.notify_one();
            }
        }
        result
    }

    // ── connections ─────────────────────────────────────────────────

    /// Snapshot of the active set, in configuration order.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.active.read().clone()
    }

    pub fn connection(&self, id: &str) -> Option<Arc<Connection>> {
        self.active.read().iter().find(|c| c.name() == id).cloned()
    }

    /// Names of servers whose connection is currently `Connected`.
    pub fn get_connected_server_names(&self) -> Vec<String> {
        self.active
            .read()
            .iter()
            .filter(|c| c.state() == ConnectionState::Connected)
            .map(|c| c.name().to_owned())
            .collect()
    }

    pub fn status(&self) -> Vec<ServerStatus> {
        let stats = self.stats.lock().clone();
        let active = self.connections();
        self.config
            .usable_servers()
            .into_iter()
            .map(|server| {
                let conn = active.iter().find(|c| c.name() == server.id);
                let stats = stats.get(&server.id).cloned().unwrap_or_default();
                ServerStatus {
                    id: server.id.clone(),
                    transport: server.transport.as_str().to_owned(),
                    state: conn.map_or(ConnectionState::Disconnected, |c| c.state()),
                    tool_count: conn.and_then(|c| c.cached_tools()).map(|t| t.len()),
                    connected_at: conn.and_then(|c| c.connected_at()),
                    reconnect_count: stats.reconnect_count,
                    last_probe_at: stats.last_probe_at,
                }
            })
            .collect()
    }

    pub(crate) fn record_probe(&self, id: &str) {
        self.stats.lock().entry(id.to_owned()).or_default().last_probe_at = Some(Utc::now());
    }

    /// A probe of `conn` succeeded. `recovered` is set when it was marked
    /// unhealthy before. Drops the merged catalog when it is missing this
    /// server's tools, so the next lookup fetches them.
    pub(crate) fn note_healthy(&self, conn: &Connection, recovered: bool) {
        if recovered {
            conn.invalidate_tools();
        }
        let stale = {
            let catalog = self.catalog.lock();
            match catalog.as_ref() {
                Some(c) => recovered || c.omitted.iter().any(|id| id == conn.name()),
                None => false,
            }
        };
        if stale {
            tracing::info!(server_id = %conn.name(), "MCP server healthy again, rebuilding catalog");
            self.drop_merged_catalog();
        }
    }

    /// Resolves after a transport failure was observed on the call path.
    pub async fn transport_failure(&self) {
        self.health_signal.notified().await;
    }

    fn detach(&self, id: &str) -> Option<Arc<Connection>> {
        let mut active = self.active.write();
        let idx = active.iter().position(|c| c.name() == id)?;
        Some(active.remove(idx))
    }

    fn insert_in_order(&self, conn: Arc<Connection>) {
        let rank = |id: &str| {
            self.config
                .servers
                .iter()
                .position(|s| s.id == id)
                .unwrap_or(usize::MAX)
        };
        let mut active = self.active.write();
        active.retain(|c| c.name() != conn.name());
        let at = active
            .iter()
            .position(|c| rank(c.name()) > rank(conn.name()))
            .unwrap_or(active.len());
        active.insert(at, conn);
    }

    /// Drop a server from the active set and shut it down.
    pub async fn remove(&self, id: &str, reason: &str) -> bool {
        let Some(conn) = self.detach(id) else {
            return false;
        };
        self.invalidate_catalog();
        conn.shutdown().await;
        tracing::warn!(server_id = %id, reason, "MCP server removed");
        self.sink.emit(TraceEvent::ServerRemoved {
            server_id: id.to_owned(),
            reason: reason.to_owned(),
        });
        true
    }

    /// Replace a server's connection with a freshly built one, retrying
    /// with back-off. On final failure the server stays out of the active
    /// set. Invalidates the catalog either way.
    pub async fn reconnect(&self, id: &str, cancel: &CancellationToken) -> Result<(), McpError> {
        let descriptor = self
            .config
            .server(id)
            .cloned()
            .ok_or_else(|| McpError::ServerNotFound(id.to_owned()))?;

        if let Some(old) = self.detach(id) {
            self.invalidate_catalog();
            old.shutdown().await;
        }

        let policy = &self.config.reconnect;
        let attempts = policy.max_attempts.max(1);
        let lifetime = self.lifetime();
        let mut last_err = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = policy.delay_for_attempt(attempt - 1);
                tracing::debug!(server_id = %id, attempt, delay_ms = delay.as_millis() as u64, "waiting before reconnect");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(McpError::Cancelled { server: id.to_owned() }),
                    _ = lifetime.cancelled() => return Err(McpError::Cancelled { server: id.to_owned() }),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match self.connect(&descriptor, cancel).await {
                Ok(conn) => {
                    if lifetime.is_cancelled() {
                        conn.shutdown().await;
                        return Err(McpError::Cancelled { server: id.to_owned() });
                    }
                    self.insert_in_order(conn);
                    self.invalidate_catalog();
                    self.stats.lock().entry(id.to_owned()).or_default().reconnect_count += 1;
                    tracing::info!(server_id = %id, attempts = attempt + 1, "MCP server reconnected");
                    self.sink.emit(TraceEvent::ServerReconnected {
                        server_id: id.to_owned(),
                        attempts: attempt + 1,
                    });
                    return Ok(());
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::warn!(server_id = %id, attempt = attempt + 1, max_attempts = attempts, error = %e, "reconnect attempt failed");
                    last_err = Some(e);
                }
            }
        }

        let err = last_err.unwrap_or_else(|| McpError::Launch {
            server: id.to_owned(),
            reason: "no reconnect attempt was made".into(),
        });
        tracing::warn!(server_id = %id, error = %err, "giving up on MCP server");
        self.sink.emit(TraceEvent::ServerRemoved {
            server_id: id.to_owned(),
            reason: err.to_string(),
        });
        Err(err)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
