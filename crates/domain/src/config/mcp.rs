//! MCP (Model Context Protocol) configuration types.
//!
//! These are the declarative server descriptors consumed by the connection
//! factory in `tm-mcp-client`. They are never mutated by the client layer.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use super::{ConfigIssue, ConfigSeverity};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level MCP config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Top-level MCP configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    /// Global gate: when false no server is instantiated.
    #[serde(default = "d_true")]
    pub enabled: bool,

    /// Server definitions. Order is the registration order used to resolve
    /// duplicate tool names.
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,

    /// Ceiling for every protocol request (seconds).
    #[serde(default = "d_30")]
    pub request_timeout_secs: u64,

    /// How to resolve a tool name advertised by more than one server.
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Grace period between closing a child's stdin and killing it (ms).
    #[serde(default = "d_2000")]
    pub shutdown_grace_ms: u64,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            servers: Vec::new(),
            request_timeout_secs: 30,
            duplicate_policy: DuplicatePolicy::default(),
            health: HealthConfig::default(),
            reconnect: ReconnectConfig::default(),
            shutdown_grace_ms: 2000,
        }
    }
}

impl McpConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Look up a server descriptor by id.
    pub fn server(&self, id: &str) -> Option<&McpServerConfig> {
        self.servers.iter().find(|s| s.id == id)
    }

    /// Servers that pass validation, in configuration order.
    ///
    /// Servers with an error-severity issue are dropped; for duplicate ids
    /// the first entry is kept.
    pub fn usable_servers(&self) -> Vec<&McpServerConfig> {
        let mut seen = HashSet::new();
        self.servers
            .iter()
            .filter(|s| s.issues().iter().all(|i| i.severity != ConfigSeverity::Error))
            .filter(|s| seen.insert(s.id.as_str()))
            .collect()
    }

    /// Issues with the client-wide settings, ignoring the server list.
    /// An error here means no server can be used.
    pub fn client_issues(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.request_timeout_secs == 0 {
            issues.push(ConfigIssue::error(
                "mcp.request_timeout_secs",
                "request timeout must be greater than 0",
            ));
        }

        if self.health.enabled && self.health.probe_timeout_secs == 0 {
            issues.push(ConfigIssue::error(
                "mcp.health.probe_timeout_secs",
                "probe timeout must be greater than 0",
            ));
        }

        issues
    }

    /// Validate the MCP section and return a list of issues.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = self.client_issues();

        if self.enabled && self.servers.is_empty() {
            issues.push(ConfigIssue::warning("mcp.servers", "no MCP servers configured"));
        }

        let mut seen = HashSet::new();
        for (i, server) in self.servers.iter().enumerate() {
            if !server.id.is_empty() && !seen.insert(server.id.as_str()) {
                issues.push(ConfigIssue::error(
                    format!("mcp.servers[{i}].id"),
                    format!("duplicate server id '{}' (first definition wins)", server.id),
                ));
            }
            for mut issue in server.issues() {
                issue.field = format!("mcp.servers[{i}].{}", issue.field);
                issues.push(issue);
            }
        }

        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-server config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Configuration for a single MCP server connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpServerConfig {
    /// Unique identifier for this server.
    pub id: String,

    /// Transport type (`"stdio"` or `"http"`).
    #[serde(default)]
    pub transport: McpTransportKind,

    /// The command to spawn (e.g. `"npx"`). Stdio only.
    #[serde(default)]
    pub command: String,

    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment overrides for the spawned process.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the spawned process.
    #[serde(default)]
    pub cwd: Option<String>,

    /// Base endpoint URL. HTTP only.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Path appended to `endpoint` for every POST.
    #[serde(default = "d_mcp_path")]
    pub path: String,

    /// Bearer token sent as `Authorization: Bearer <api_key>`.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Extra headers sent verbatim with every HTTP request.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// HTTP request timeout (seconds).
    #[serde(default = "d_30")]
    pub timeout_secs: u64,

    /// Rebuild the connection when a health probe fails (default: true).
    #[serde(default = "d_true")]
    pub auto_reconnect: bool,

    /// Per-server probe interval override. `0` disables probing.
    #[serde(default)]
    pub health_check_interval_secs: Option<u64>,
}

impl McpServerConfig {
    /// Descriptor for a spawned stdio server.
    pub fn stdio(id: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            id: id.into(),
            transport: McpTransportKind::Stdio,
            command: command.into(),
            args,
            ..Self::empty()
        }
    }

    /// Descriptor for an HTTP endpoint.
    pub fn http(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            transport: McpTransportKind::Http,
            endpoint: Some(endpoint.into()),
            ..Self::empty()
        }
    }

    fn empty() -> Self {
        Self {
            id: String::new(),
            transport: McpTransportKind::default(),
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            endpoint: None,
            path: d_mcp_path(),
            api_key: None,
            headers: HashMap::new(),
            timeout_secs: 30,
            auto_reconnect: true,
            health_check_interval_secs: None,
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Full URL the HTTP transport posts to.
    pub fn http_url(&self) -> Option<String> {
        let base = self.endpoint.as_deref()?.trim_end_matches('/');
        let path = self.path.trim();
        if path.is_empty() || base.ends_with(path.trim_end_matches('/')) {
            return Some(base.to_owned());
        }
        if path.starts_with('/') {
            Some(format!("{base}{path}"))
        } else {
            Some(format!("{base}/{path}"))
        }
    }

    /// Whether the health monitor should probe this server.
    pub fn probing_enabled(&self) -> bool {
        self.health_check_interval_secs != Some(0)
    }

    /// Field-relative validation issues for this server.
    pub fn issues(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.id.trim().is_empty() {
            issues.push(ConfigIssue::error("id", "server id must not be empty"));
        }

        match self.transport {
            McpTransportKind::Stdio => {
                if self.command.trim().is_empty() {
                    issues.push(ConfigIssue::error(
                        "command",
                        "stdio server requires a command",
                    ));
                }
            }
            McpTransportKind::Http => match self.endpoint.as_deref() {
                None | Some("") => issues.push(ConfigIssue::error(
                    "endpoint",
                    "http server requires an endpoint",
                )),
                Some(url) if !(url.starts_with("http://") || url.starts_with("https://")) => {
                    issues.push(ConfigIssue::error(
                        "endpoint",
                        format!("endpoint must be an http(s) URL, got '{url}'"),
                    ));
                }
                Some(_) => {}
            },
        }

        if self.transport == McpTransportKind::Http && self.timeout_secs == 0 {
            issues.push(ConfigIssue::error(
                "timeout_secs",
                "timeout must be greater than 0",
            ));
        }

        for name in self.headers.keys() {
            if !is_header_name(name) {
                issues.push(ConfigIssue::error(
                    "headers",
                    format!("'{name}' is not a valid HTTP header name"),
                ));
            }
        }

        issues
    }
}

/// RFC 7230 token characters.
fn is_header_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b))
}

/// Transport kind for connecting to an MCP server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum McpTransportKind {
    #[default]
    #[serde(alias = "process")]
    Stdio,
    Http,
}

impl McpTransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
        }
    }
}

/// Resolution strategy for a tool name advertised by several servers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// The server registered first (configuration order) owns the name.
    #[default]
    FirstWins,
    /// The server registered last owns the name.
    LastWins,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Health + reconnect
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Default probe interval (seconds).
    #[serde(default = "d_60")]
    pub interval_secs: u64,
    /// Bound on a single liveness probe (seconds).
    #[serde(default = "d_5")]
    pub probe_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            probe_timeout_secs: 5,
        }
    }
}

impl HealthConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Effective probe interval: the shortest non-zero per-server override,
    /// or the global default.
    pub fn effective_interval(&self, servers: &[McpServerConfig]) -> Duration {
        let secs = servers
            .iter()
            .filter_map(|s| s.health_check_interval_secs)
            .filter(|&s| s > 0)
            .min()
            .unwrap_or(self.interval_secs)
            .max(1);
        Duration::from_secs(secs)
    }
}

/// Back-off policy used when rebuilding a failed connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Attempts per reconnect cycle (at least one attempt is always made).
    #[serde(default = "d_3")]
    pub max_attempts: u32,
    #[serde(default = "d_500")]
    pub initial_delay_ms: u64,
    #[serde(default = "d_30000")]
    pub max_delay_ms: u64,
    #[serde(default = "d_backoff_factor")]
    pub backoff_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Delay before the given retry (0-indexed), with ~25% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay_ms as f64;
        let delay_ms = base_ms * self.backoff_factor.powi(attempt as i32);
        let capped_ms = delay_ms.min(self.max_delay_ms as f64);

        let jitter = capped_ms * 0.25 * pseudo_random_fraction(attempt);
        Duration::from_millis((capped_ms + jitter) as u64)
    }
}

/// Cheap deterministic "random" fraction [0, 1) based on attempt number.
fn pseudo_random_fraction(attempt: u32) -> f64 {
    let hash = attempt.wrapping_mul(2654435761); // Knuth multiplicative hash
    (hash as f64) / (u32::MAX as f64)
}

// ── serde default helpers ───────────────────────────────────────────

fn d_true() -> bool {
    true
}
fn d_3() -> u32 {
    3
}
fn d_5() -> u64 {
    5
}
fn d_30() -> u64 {
    30
}
fn d_60() -> u64 {
    60
}
fn d_500() -> u64 {
    500
}
fn d_2000() -> u64 {
    2000
}
fn d_30000() -> u64 {
    30_000
}
fn d_backoff_factor() -> f64 {
    2.0
}
fn d_mcp_path() -> String {
    "/mcp".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
