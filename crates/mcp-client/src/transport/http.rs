use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;

use tm_domain::config::{McpServerConfig, McpTransportKind};

use super::{McpTransport, TransportError};

const SESSION_HEADER: &str = "mcp-session-id";

/// Longest error body kept in a [`TransportError::Status`].
const MAX_ERROR_BODY: usize = 512;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// HTTP transport: one POST per JSON-RPC message.
///
/// Requests are independent, so any number may be in flight. The bearer
/// token and custom headers are installed as client defaults.
#[derive(Debug)]
pub struct HttpTransport {
    server_id: String,
    http: Client,
    url: String,
    session_id: parking_lot::Mutex<Option<String>>,
    closed: AtomicBool,
}

impl HttpTransport {
    pub fn new(config: &McpServerConfig) -> Result<Self, TransportError> {
        let url = config
            .http_url()
            .ok_or_else(|| TransportError::Http(format!("server '{}' has no endpoint", config.id)))?;

        let http = Client::builder()
            .timeout(config.http_timeout())
            .default_headers(default_headers(config)?)
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;

        Ok(Self {
            server_id: config.id.clone(),
            http,
            url,
            session_id: parking_lot::Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Session id assigned by the server, if any.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }
}

fn default_headers(config: &McpServerConfig) -> Result<HeaderMap, TransportError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("application/json, text/event-stream"),
    );

    if let Some(key) = config.api_key.as_deref().filter(|k| !k.is_empty()) {
        let mut value = HeaderValue::from_str(&format!("Bearer {key}"))
            .map_err(|e| TransportError::Http(format!("invalid api key: {e}")))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }

    for (name, value) in &config.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::Http(format!("invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| TransportError::Http(format!("invalid value for header '{name}': {e}")))?;
        headers.insert(name, value);
    }

    Ok(headers)
}

fn truncate(mut s: String, max: usize) -> String {
    if s.len() > max {
        let cut = (0..=max).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0);
        s.truncate(cut);
    }
    s
}

/// Extract the JSON-RPC message from a `text/event-stream` body: the data of
/// the last non-empty event.
fn last_sse_event(body: &str) -> Option<String> {
    let mut last = None;
    let mut current: Vec<&str> = Vec::new();

    for line in body.lines() {
        if line.is_empty() {
            if !current.is_empty() {
                last = Some(current.join("\n"));
                current.clear();
            }
            continue;
        }
        if let Some(data) = line.strip_prefix("data:") {
            current.push(data.strip_prefix(' ').unwrap_or(data));
        }
    }
    if !current.is_empty() {
        last = Some(current.join("\n"));
    }
    last.filter(|data| !data.trim().is_empty())
}

#[async_trait]
impl McpTransport for HttpTransport {
    fn kind(&self) -> McpTransportKind {
        McpTransportKind::Http
    }

    async fn send(&self, message: &str) -> Result<Option<String>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let mut rb = self
            .http
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(message.to_owned());
        if let Some(session) = self.session_id() {
            rb = rb.header(SESSION_HEADER, session);
        }

        let resp = rb.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Http(e.to_string())
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: truncate(body, MAX_ERROR_BODY),
            });
        }

        if let Some(session) = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock() = Some(session.to_owned());
        }

        let is_sse = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let body = resp.text().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Http(e.to_string())
            }
        })?;

        if is_sse {
            return Ok(last_sse_event(&body));
        }
        if body.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(body))
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn shutdown(&self, _grace: Duration) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(server_id = %self.server_id, "HTTP transport closed");
        }
    }
}
